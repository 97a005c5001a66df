// src/budget/allocator.rs
//! Prompt budget allocator
//!
//! Builds a model prompt from three sections under a hard token ceiling:
//!
//! ```text
//! total_limit
//! ├─ safety margin            (never allocated)
//! └─ usable
//!    ├─ base                  (measured, never compressed)
//!    ├─ separators            (reserved)
//!    └─ available
//!       ├─ guideline          min(guideline_limit, available × ratio)
//!       └─ context            min(context_limit, available − guideline used)
//! ```
//!
//! Invariant: `base + guideline + context <= total_limit × (1 − safety_margin)`
//! whenever the base section itself fits inside that allowance.

use crate::budget::compressor::{CompressionStrategy, Compressor};
use crate::budget::context::{serialize_within, ContextData, ContextField};
use crate::budget::estimator::estimate_tokens;
use crate::signal::Signal;
use crate::utils::config::BudgetConfig;
use crate::utils::errors::BudgetError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Separator between prompt sections
pub const SECTION_SEPARATOR: &str = "\n\n";

const GUIDELINE_HEADER: &str = "## Guidelines\n";
const CONTEXT_HEADER: &str = "## Context\n";

/// Token budget for a single prompt build
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBudget {
    /// Hard ceiling on the whole prompt
    pub total_limit: usize,

    /// Fraction of `total_limit` reserved and never allocated
    pub safety_margin: f64,

    /// Absolute cap on the guideline section
    pub guideline_limit: usize,

    /// Absolute cap on the context section
    pub context_limit: usize,

    /// Share of the available budget offered to the guideline section
    pub guideline_ratio: f64,

    /// Fraction of a sub-budget that compression aims for
    pub compression_threshold: f64,

    /// Preferred compression strategy
    pub strategy: CompressionStrategy,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::from(&BudgetConfig::default())
    }
}

impl From<&BudgetConfig> for TokenBudget {
    fn from(config: &BudgetConfig) -> Self {
        Self {
            total_limit: config.total_limit,
            safety_margin: config.safety_margin,
            guideline_limit: config.guideline_limit,
            context_limit: config.context_limit,
            guideline_ratio: config.guideline_ratio,
            compression_threshold: config.compression_threshold,
            strategy: config.strategy,
        }
    }
}

impl TokenBudget {
    /// Tokens that may be allocated across all sections
    pub fn usable(&self) -> usize {
        (self.total_limit as f64 * (1.0 - self.safety_margin)).floor() as usize
    }

    pub fn validate(&self) -> Result<(), BudgetError> {
        if self.total_limit == 0 {
            return Err(BudgetError::InvalidBudget("total_limit is zero".into()));
        }
        if !(0.0..1.0).contains(&self.safety_margin) {
            return Err(BudgetError::InvalidBudget(format!(
                "safety_margin {} outside [0, 1)",
                self.safety_margin
            )));
        }
        if !(0.0..=1.0).contains(&self.guideline_ratio) {
            return Err(BudgetError::InvalidBudget(format!(
                "guideline_ratio {} outside [0, 1]",
                self.guideline_ratio
            )));
        }
        if !(self.compression_threshold > 0.0 && self.compression_threshold <= 1.0) {
            return Err(BudgetError::InvalidBudget(format!(
                "compression_threshold {} outside (0, 1]",
                self.compression_threshold
            )));
        }
        Ok(())
    }

    fn compression_target(&self, sub_budget: usize) -> usize {
        (sub_budget as f64 * self.compression_threshold).floor() as usize
    }
}

/// Prompt sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSection {
    Base,
    Guideline,
    Context,
}

/// Estimated token size of each section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSizes {
    pub base: usize,
    pub guideline: usize,
    pub context: usize,
    /// Estimate of the assembled prompt, separators included
    pub total: usize,
}

/// A section that had to be compressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompressionRecord {
    pub section: PromptSection,
    pub strategy: CompressionStrategy,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
}

/// An assembled prompt with its accounting
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub prompt: String,
    pub sections: SectionSizes,
    pub compressed: Vec<CompressionRecord>,
    pub dropped_fields: Vec<ContextField>,
    /// Recoverable problems hit while building
    pub warnings: Vec<String>,
}

impl BuiltPrompt {
    pub fn was_compressed(&self) -> bool {
        !self.compressed.is_empty()
    }
}

/// Builds budgeted prompts
#[derive(Debug, Clone, Default)]
pub struct PromptAllocator;

impl PromptAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Build a prompt for `signal` within `budget`
    pub fn build(
        &self,
        signal: &Signal,
        guideline: &str,
        context: &ContextData,
        budget: &TokenBudget,
    ) -> Result<BuiltPrompt, BudgetError> {
        budget.validate()?;

        let mut warnings = Vec::new();
        let mut compressed = Vec::new();
        let compressor = Compressor::new(budget.strategy).with_focus_terms(focus_terms(signal));

        // Step 1: base section, measured not budgeted
        let base = render_base(signal);
        let base_tokens = estimate_tokens(&base);
        if base_tokens > budget.total_limit {
            return Err(BudgetError::BaseExceedsLimit {
                base: base_tokens,
                limit: budget.total_limit,
            });
        }

        // Step 2: what is left once base, margin and separators are paid for
        let usable = budget.usable();
        let separator_reserve = 2 * estimate_tokens(SECTION_SEPARATOR);
        let available = usable.saturating_sub(base_tokens + separator_reserve);
        if base_tokens > usable {
            let msg = format!(
                "base section ({} tokens) exceeds the usable budget ({} tokens); guideline and context omitted",
                base_tokens, usable
            );
            warn!("{}", msg);
            warnings.push(msg);
        }

        // Step 3: guideline sub-budget
        let guideline_budget = budget
            .guideline_limit
            .min((available as f64 * budget.guideline_ratio).floor() as usize);

        // Step 4: guideline section, verbatim or compressed
        let guideline_section = build_guideline_section(
            guideline,
            guideline_budget,
            budget,
            &compressor,
            &mut compressed,
        );
        let guideline_tokens = estimate_tokens(&guideline_section);

        // Unused guideline share rolls over to context
        let context_budget = budget
            .context_limit
            .min(available.saturating_sub(guideline_tokens));

        // Step 5: context section in fixed field order
        let (context_section, dropped_fields) =
            build_context_section(context, context_budget, budget, &compressor, &mut compressed);

        // Step 6: last-resort pass if the ceiling is still exceeded
        let (prompt, context_section) = enforce_ceiling(
            &base,
            &guideline_section,
            context_section,
            budget.total_limit,
            &mut warnings,
        );

        let sections = SectionSizes {
            base: base_tokens,
            guideline: guideline_tokens,
            context: estimate_tokens(&context_section),
            total: estimate_tokens(&prompt),
        };

        debug!(
            "Built prompt for signal {}: base={} guideline={} context={} total={} (limit {})",
            signal.id,
            sections.base,
            sections.guideline,
            sections.context,
            sections.total,
            budget.total_limit
        );

        Ok(BuiltPrompt {
            prompt,
            sections,
            compressed,
            dropped_fields,
            warnings,
        })
    }
}

/// Signal metadata, payload and the response contract
pub fn render_base(signal: &Signal) -> String {
    let payload = if signal.data.is_null() {
        "(none)".to_string()
    } else {
        serde_json::to_string(&signal.data).unwrap_or_else(|_| signal.data.to_string())
    };

    format!(
        "# Signal Classification\n\
         \n\
         ## Signal\n\
         - id: {id}\n\
         - type: {signal_type}\n\
         - source: {source}\n\
         - priority: {priority}\n\
         - timestamp: {timestamp}\n\
         \n\
         ## Payload\n\
         {payload}\n\
         \n\
         ## Task\n\
         Classify the signal above following the guidelines. Use the context only as supporting evidence.\n\
         Respond with a single JSON object and nothing else:\n\
         {{\"classification\": {{...}}, \"recommendations\": [\"...\"], \"confidence\": <number between 0 and 1>}}",
        id = signal.id,
        signal_type = signal.signal_type,
        source = signal.source,
        priority = signal.priority,
        timestamp = signal.timestamp.to_rfc3339(),
        payload = payload,
    )
}

/// Terms the semantic strategy ranks guideline paragraphs by
fn focus_terms(signal: &Signal) -> Vec<String> {
    let mut terms = vec![signal.signal_type.clone()];
    if let Some(obj) = signal.data.as_object() {
        for value in obj.values() {
            if let Some(text) = value.as_str() {
                terms.extend(
                    text.split(|c: char| !c.is_alphanumeric())
                        .filter(|w| w.len() > 4)
                        .take(8)
                        .map(str::to_string),
                );
            }
        }
    }
    terms
}

fn build_guideline_section(
    guideline: &str,
    sub_budget: usize,
    budget: &TokenBudget,
    compressor: &Compressor,
    compressed: &mut Vec<CompressionRecord>,
) -> String {
    let guideline = guideline.trim();
    if guideline.is_empty() {
        return String::new();
    }

    let header_tokens = estimate_tokens(GUIDELINE_HEADER);
    let verbatim = format!("{}{}", GUIDELINE_HEADER, guideline);
    if estimate_tokens(&verbatim) <= sub_budget {
        return verbatim;
    }

    let target = budget
        .compression_target(sub_budget)
        .saturating_sub(header_tokens);
    if target == 0 {
        return String::new();
    }

    let out = compressor.compress(guideline, target);
    compressed.push(CompressionRecord {
        section: PromptSection::Guideline,
        strategy: out.strategy,
        original_tokens: out.original_tokens,
        compressed_tokens: out.tokens,
    });
    format!("{}{}", GUIDELINE_HEADER, out.text)
}

fn build_context_section(
    context: &ContextData,
    sub_budget: usize,
    budget: &TokenBudget,
    compressor: &Compressor,
    compressed: &mut Vec<CompressionRecord>,
) -> (String, Vec<ContextField>) {
    if context.is_empty() {
        return (String::new(), Vec::new());
    }

    let header_tokens = estimate_tokens(CONTEXT_HEADER);
    let full_tokens: usize = context
        .rendered_fields()
        .iter()
        .map(|(_, text)| estimate_tokens(text) + 1)
        .sum();

    // Fits as-is: no threshold scaling
    let body_budget = if full_tokens + header_tokens <= sub_budget {
        sub_budget.saturating_sub(header_tokens)
    } else {
        budget
            .compression_target(sub_budget)
            .saturating_sub(header_tokens)
    };

    let serialized = serialize_within(context, body_budget, compressor);
    if let Some((_, strategy)) = serialized.compressed {
        compressed.push(CompressionRecord {
            section: PromptSection::Context,
            strategy,
            original_tokens: full_tokens,
            compressed_tokens: estimate_tokens(&serialized.text),
        });
    }

    if serialized.text.is_empty() {
        return (String::new(), serialized.dropped);
    }
    (
        format!("{}{}", CONTEXT_HEADER, serialized.text),
        serialized.dropped,
    )
}

/// Hard-truncate the context section when the assembled prompt is over
/// `total_limit`. The sub-budgets keep `build` under the ceiling, so this only
/// guards against estimation drift; it never fails.
fn enforce_ceiling(
    base: &str,
    guideline_section: &str,
    context_section: String,
    total_limit: usize,
    warnings: &mut Vec<String>,
) -> (String, String) {
    let prompt = assemble(base, guideline_section, &context_section);
    let total = estimate_tokens(&prompt);
    if total <= total_limit {
        return (prompt, context_section);
    }

    let separator_reserve = 2 * estimate_tokens(SECTION_SEPARATOR);
    let allowance = total_limit.saturating_sub(
        estimate_tokens(base) + estimate_tokens(guideline_section) + separator_reserve,
    );
    let msg = format!(
        "assembled prompt ({} tokens) exceeds total limit ({}); hard-truncating context to {} tokens",
        total, total_limit, allowance
    );
    warn!("{}", msg);
    warnings.push(msg);

    let context_section = crate::budget::compressor::truncate(&context_section, allowance);
    (assemble(base, guideline_section, &context_section), context_section)
}

fn assemble(base: &str, guideline: &str, context: &str) -> String {
    [base, guideline, context]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn signal() -> Signal {
        Signal::new(
            "sig_1",
            "blocker",
            "docs/roadmap.md",
            json!({"text": "release blocked on scheduler rewrite"}),
        )
        .with_priority(5)
    }

    fn budget_40k() -> TokenBudget {
        TokenBudget::default()
    }

    fn budget_1m() -> TokenBudget {
        TokenBudget {
            total_limit: 1_000_000,
            guideline_limit: 20_000,
            context_limit: 200_000,
            ..TokenBudget::default()
        }
    }

    fn assert_invariant(built: &BuiltPrompt, budget: &TokenBudget) {
        let s = built.sections;
        assert!(
            s.base + s.guideline + s.context <= budget.usable(),
            "sections {:?} exceed usable {}",
            s,
            budget.usable()
        );
        assert!(s.total <= budget.total_limit);
    }

    #[test]
    fn test_small_inputs_are_verbatim() {
        let ctx = ContextData {
            identifiers: Some(json!({"project": "sentra"})),
            ..Default::default()
        };
        let built = PromptAllocator::new()
            .build(&signal(), "Escalate blockers.", &ctx, &budget_40k())
            .unwrap();

        assert!(built.prompt.contains("- type: blocker"));
        assert!(built.prompt.contains("Escalate blockers."));
        assert!(built.prompt.contains("### identifiers"));
        assert!(!built.was_compressed());
        assert!(built.warnings.is_empty());
        assert_invariant(&built, &budget_40k());
    }

    #[test]
    fn test_empty_guideline_and_context() {
        let sig = signal();
        let built = PromptAllocator::new()
            .build(&sig, "", &ContextData::default(), &budget_40k())
            .unwrap();

        assert_eq!(built.sections.guideline, 0);
        assert_eq!(built.sections.context, 0);
        assert_eq!(built.prompt, render_base(&sig));
    }

    #[test]
    fn test_base_over_limit_is_fatal() {
        let mut sig = signal();
        sig.data = json!({"text": "x".repeat(10_000)});
        let budget = TokenBudget {
            total_limit: 1_000,
            ..TokenBudget::default()
        };

        let err = PromptAllocator::new()
            .build(&sig, "rules", &ContextData::default(), &budget)
            .unwrap_err();
        assert!(matches!(err, BudgetError::BaseExceedsLimit { limit: 1_000, .. }));
    }

    #[test]
    fn test_base_in_margin_omits_other_sections() {
        let mut sig = signal();
        sig.data = json!({"text": "y".repeat(3_600)});
        // base ≈ 1000 tokens: above usable (900), below total (1100)
        let budget = TokenBudget {
            total_limit: 1_100,
            safety_margin: 0.18,
            ..TokenBudget::default()
        };

        let built = PromptAllocator::new()
            .build(&sig, "rules", &ContextData::default(), &budget)
            .unwrap();
        assert_eq!(built.sections.guideline, 0);
        assert_eq!(built.warnings.len(), 1);
        assert!(built.sections.total <= budget.total_limit);
    }

    #[test]
    fn test_huge_guideline_compressed_into_sub_budget() {
        let paragraph = "## Rule\nBlockers must be escalated within one day. Other detail continues here.";
        let guideline = vec![paragraph; 5_000].join("\n\n");
        assert!(estimate_tokens(&guideline) >= 100_000);

        for budget in [budget_40k(), budget_1m()] {
            let built = PromptAllocator::new()
                .build(&signal(), &guideline, &ContextData::default(), &budget)
                .unwrap();

            assert!(built.sections.guideline <= 20_000);
            assert_eq!(built.compressed.len(), 1);
            assert_eq!(built.compressed[0].section, PromptSection::Guideline);
            assert_invariant(&built, &budget);
        }
    }

    #[test]
    fn test_guideline_share_rolls_over_to_context() {
        let ctx = ContextData {
            history: Some(json!("h ".repeat(60_000))),
            ..Default::default()
        };
        let budget = TokenBudget {
            context_limit: 100_000,
            ..TokenBudget::default()
        };

        let built = PromptAllocator::new()
            .build(&signal(), "short rules", &ctx, &budget)
            .unwrap();

        // Context gets far more than a 50% share because the guideline is tiny
        assert!(built.sections.context > budget.usable() / 2);
        assert_invariant(&built, &budget);
    }

    #[test]
    fn test_context_fields_dropped_after_overflow() {
        let ctx = ContextData {
            identifiers: Some(json!({"project": "sentra"})),
            history: Some(json!("commit ".repeat(50_000))),
            environment: Some(json!({"ci": "red"})),
            ..Default::default()
        };

        let built = PromptAllocator::new()
            .build(&signal(), "rules", &ctx, &budget_40k())
            .unwrap();

        assert_eq!(built.dropped_fields, vec![ContextField::Environment]);
        assert!(built.prompt.contains("### identifiers"));
        assert!(!built.prompt.contains("### environment"));
        assert!(built
            .compressed
            .iter()
            .any(|c| c.section == PromptSection::Context));
        assert_invariant(&built, &budget_40k());
    }

    #[test]
    fn test_invalid_budget_rejected() {
        let budget = TokenBudget {
            safety_margin: 1.5,
            ..TokenBudget::default()
        };
        let err = PromptAllocator::new()
            .build(&signal(), "rules", &ContextData::default(), &budget)
            .unwrap_err();
        assert!(matches!(err, BudgetError::InvalidBudget(_)));
    }

    #[test]
    fn test_ceiling_pass_truncates_context() {
        let base = "# Signal\nbase section";
        let guideline = "## Guidelines\nbe brief";
        let context = format!("## Context\n{}", "history entry ".repeat(400));
        let mut warnings = Vec::new();

        let (prompt, context_section) =
            enforce_ceiling(base, guideline, context.clone(), 200, &mut warnings);

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("hard-truncating context"));
        assert!(estimate_tokens(&prompt) <= 200);
        assert!(context_section.len() < context.len());
        assert!(prompt.starts_with(base));
    }

    #[test]
    fn test_ceiling_pass_leaves_fitting_prompt_alone() {
        let mut warnings = Vec::new();
        let (prompt, context_section) =
            enforce_ceiling("base", "guideline", "context".to_string(), 200, &mut warnings);

        assert!(warnings.is_empty());
        assert_eq!(context_section, "context");
        assert_eq!(prompt, "base\n\nguideline\n\ncontext");
    }

    proptest! {
        #[test]
        fn prop_budget_invariant_holds(
            guideline_words in 0usize..40_000,
            history_words in 0usize..40_000,
            total_limit in 2_000usize..60_000,
            margin in 0.0f64..0.5,
            ratio in 0.0f64..=1.0,
            threshold in 0.5f64..=1.0,
            strategy in prop_oneof![
                Just(CompressionStrategy::Truncate),
                Just(CompressionStrategy::Summarize),
                Just(CompressionStrategy::Semantic),
            ],
        ) {
            let guideline = "rule. ".repeat(guideline_words);
            let ctx = ContextData {
                identifiers: Some(json!({"id": 1})),
                history: Some(json!("event ".repeat(history_words))),
                ..Default::default()
            };
            let budget = TokenBudget {
                total_limit,
                safety_margin: margin,
                guideline_limit: total_limit / 2,
                context_limit: total_limit / 2,
                guideline_ratio: ratio,
                compression_threshold: threshold,
                strategy,
            };

            let built = PromptAllocator::new().build(&signal(), &guideline, &ctx, &budget).unwrap();
            let s = built.sections;
            prop_assert!(s.base + s.guideline + s.context <= budget.usable());
            prop_assert!(s.total <= budget.total_limit);
        }
    }
}
