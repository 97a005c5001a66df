// src/budget/compressor.rs
//! Prompt section compression
//!
//! Sections that overflow their sub-budget go through a cascade: the
//! configured strategy first, then a hard truncation at a word boundary, which
//! always succeeds. Every path guarantees `estimate_tokens(output) <= target`.

use crate::budget::estimator::{estimate_tokens, max_bytes_for};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Appended to truncated text
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

/// Compression strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Hard cut at a word boundary (always available)
    Truncate,

    /// Keep headings and the lead sentence of every paragraph
    Summarize,

    /// Keep the paragraphs most related to the signal being classified
    Semantic,
}

impl CompressionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionStrategy::Truncate => "truncate",
            CompressionStrategy::Summarize => "summarize",
            CompressionStrategy::Semantic => "semantic",
        }
    }
}

/// Output of a compression run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub text: String,

    /// Strategy that produced the final text
    pub strategy: CompressionStrategy,

    pub original_tokens: usize,
    pub tokens: usize,
}

/// Section compressor
#[derive(Debug, Clone)]
pub struct Compressor {
    strategy: CompressionStrategy,

    /// Lower-cased terms that make a paragraph relevant (semantic strategy)
    focus_terms: Vec<String>,
}

impl Compressor {
    /// Create a new compressor
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            focus_terms: Vec::new(),
        }
    }

    /// Set the terms the semantic strategy ranks paragraphs by
    pub fn with_focus_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.focus_terms = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn strategy(&self) -> CompressionStrategy {
        self.strategy
    }

    /// Compress `text` to at most `target_tokens`
    pub fn compress(&self, text: &str, target_tokens: usize) -> Compressed {
        let original_tokens = estimate_tokens(text);

        if original_tokens <= target_tokens {
            return Compressed {
                text: text.to_string(),
                strategy: self.strategy,
                original_tokens,
                tokens: original_tokens,
            };
        }

        let preferred = match self.strategy {
            CompressionStrategy::Truncate => None,
            CompressionStrategy::Summarize => summarize(text, target_tokens),
            CompressionStrategy::Semantic => semantic(text, target_tokens, &self.focus_terms),
        };

        let (text, strategy) = match preferred {
            Some(out) if estimate_tokens(&out) <= target_tokens => (out, self.strategy),
            Some(out) => {
                // Denser than the original, so truncate the reduced text
                debug!(
                    "{} left {} tokens (target {}), truncating",
                    self.strategy.as_str(),
                    estimate_tokens(&out),
                    target_tokens
                );
                (truncate(&out, target_tokens), CompressionStrategy::Truncate)
            }
            None => {
                if self.strategy != CompressionStrategy::Truncate {
                    warn!(
                        "{} compression unavailable for this section, falling back to truncation",
                        self.strategy.as_str()
                    );
                }
                (truncate(text, target_tokens), CompressionStrategy::Truncate)
            }
        };

        let tokens = estimate_tokens(&text);
        debug!(
            "Compressed section {} -> {} tokens via {}",
            original_tokens,
            tokens,
            strategy.as_str()
        );

        Compressed {
            text,
            strategy,
            original_tokens,
            tokens,
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionStrategy::Truncate)
    }
}

/// Hard cut to `target_tokens`, backing off to the previous word boundary
pub fn truncate(text: &str, target_tokens: usize) -> String {
    if estimate_tokens(text) <= target_tokens {
        return text.to_string();
    }

    let max_bytes = max_bytes_for(target_tokens);
    let with_marker = max_bytes > TRUNCATION_MARKER.len() * 2;
    let budget = if with_marker {
        max_bytes - TRUNCATION_MARKER.len()
    } else {
        max_bytes
    };

    let head = cut_at_word(text, budget);
    if with_marker {
        format!("{}{}", head, TRUNCATION_MARKER)
    } else {
        head.to_string()
    }
}

/// Longest prefix of `text` within `max_bytes` that ends on a word boundary
fn cut_at_word(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }

    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }

    let head = &text[..cut];
    let next_is_space = text[cut..].starts_with(char::is_whitespace);
    if next_is_space {
        return head.trim_end();
    }

    match head.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => head[..idx].trim_end(),
        // A single word longer than the budget: cut mid-word
        _ => head,
    }
}

/// Split on blank lines
fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_heading(paragraph: &str) -> bool {
    paragraph.starts_with('#')
}

/// First sentence (or first line) of a paragraph
fn lead_sentence(paragraph: &str) -> &str {
    let first_line = paragraph.lines().next().unwrap_or("");
    match first_line.find(". ") {
        Some(idx) => &first_line[..=idx],
        None => first_line,
    }
}

/// Extractive summary: headings plus the lead sentence of each paragraph.
///
/// Returns `None` when the text has no paragraph structure to exploit.
pub fn summarize(text: &str, target_tokens: usize) -> Option<String> {
    let paras = paragraphs(text);
    if paras.len() < 2 {
        return None;
    }

    let mut out: Vec<String> = Vec::with_capacity(paras.len());
    for para in paras {
        if is_heading(para) {
            // Heading line plus the lead of its body, if the body shares the block
            let mut lines = para.lines();
            let heading = lines.next().unwrap_or("");
            out.push(heading.to_string());
            let body: Vec<&str> = lines.collect();
            if !body.is_empty() {
                out.push(lead_sentence(&body.join(" ")).to_string());
            }
        } else {
            out.push(lead_sentence(para).to_string());
        }
    }

    let summary = out.join("\n");
    if estimate_tokens(&summary) >= estimate_tokens(text) {
        return None;
    }
    if estimate_tokens(&summary) > target_tokens {
        debug!("Summary still above target ({} tokens)", estimate_tokens(&summary));
    }
    Some(summary)
}

/// Relevance-ranked paragraph selection.
///
/// Paragraphs are scored by focus-term hits (headings and the opening
/// paragraph get a small bonus), then greedily kept in score order while they
/// fit, and emitted in their original order. Returns `None` when no paragraph
/// fits or there are no focus terms to rank by.
pub fn semantic(text: &str, target_tokens: usize, focus_terms: &[String]) -> Option<String> {
    if focus_terms.is_empty() {
        return None;
    }

    let paras = paragraphs(text);
    let mut scored: Vec<(usize, usize, &str)> = paras
        .iter()
        .enumerate()
        .map(|(idx, para)| {
            let lower = para.to_lowercase();
            let hits: usize = focus_terms.iter().map(|t| lower.matches(t.as_str()).count()).sum();
            let bonus = usize::from(is_heading(para)) + usize::from(idx == 0);
            (hits * 2 + bonus, idx, *para)
        })
        .collect();

    // Highest score first, earlier paragraphs win ties
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let separator_tokens = estimate_tokens("\n\n");
    let mut used = 0usize;
    let mut kept: Vec<(usize, &str)> = Vec::new();

    for (_, idx, para) in scored {
        let cost = estimate_tokens(para) + if kept.is_empty() { 0 } else { separator_tokens };
        if used + cost <= target_tokens {
            used += cost;
            kept.push((idx, para));
        }
    }

    if kept.is_empty() {
        return None;
    }

    kept.sort_by_key(|(idx, _)| *idx);
    Some(kept.into_iter().map(|(_, p)| p).collect::<Vec<_>>().join("\n\n"))
}
