// src/budget/estimator.rs
//! Cheap token estimation
//!
//! Approximation: one token per four UTF-8 bytes, rounded up. Not a real
//! tokenizer, but stable and monotonic, which is all the allocator needs.

/// Bytes per estimated token
pub const BYTES_PER_TOKEN: usize = 4;

/// Estimate the token count of `text`
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(BYTES_PER_TOKEN)
}

/// Largest byte length whose estimate stays within `tokens`
pub fn max_bytes_for(tokens: usize) -> usize {
    tokens.saturating_mul(BYTES_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_estimate_counts_bytes_not_chars() {
        // 4 bytes each
        assert_eq!(estimate_tokens("🦀🦀"), 2);
        // 2 bytes each
        assert_eq!(estimate_tokens("éééé"), 2);
    }

    #[test]
    fn test_max_bytes_matches_estimate() {
        let text = "x".repeat(max_bytes_for(25));
        assert_eq!(estimate_tokens(&text), 25);
        assert_eq!(estimate_tokens(&format!("{}y", text)), 26);
    }
}
