// src/budget/mod.rs
//! Token budgeting for prompt construction
//!
//! - `estimator`: byte-based token estimate
//! - `compressor`: compression cascade (summarize / semantic / truncate)
//! - `context`: fixed-order context serialization
//! - `allocator`: splits the budget across base, guideline and context

pub mod allocator;
pub mod compressor;
pub mod context;
pub mod estimator;

pub use allocator::{
    render_base, BuiltPrompt, CompressionRecord, PromptAllocator, PromptSection, SectionSizes,
    TokenBudget,
};
pub use compressor::{CompressionStrategy, Compressed, Compressor, TRUNCATION_MARKER};
pub use context::{serialize_within, ContextData, ContextField, SerializedContext};
pub use estimator::estimate_tokens;
