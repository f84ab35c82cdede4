//! Token estimation.
//!
//! Uses a character-based heuristic: ~4 characters per token. Good enough
//! for budgeting when no model-specific tokenizer is wired in.

use async_trait::async_trait;
use planctx_core::collaborator::Tokenizer;
use planctx_core::error::UpstreamError;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// [`Tokenizer`] backed by [`estimate_tokens`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

#[async_trait]
impl Tokenizer for HeuristicTokenizer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn count(&self, text: &str) -> Result<usize, UpstreamError> {
        Ok(estimate_tokens(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[tokio::test]
    async fn tokenizer_uses_heuristic() {
        let tokenizer = HeuristicTokenizer;
        assert_eq!(tokenizer.count(&"a".repeat(100)).await.unwrap(), 25);
    }
}
