use std::sync::Arc;

use anyhow::{Context, Result};
use tiktoken_rs::CoreBPE;

/// Token counting capability used for context budgeting.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Returns the text covered by the last `max_tokens` tokens of `text`,
    /// or `text` unchanged when it already fits.
    fn truncate_to_last(&self, text: &str, max_tokens: usize) -> String;
}

/// BPE token counter (`o200k_base`, the GPT-4o family encoding).
#[derive(Clone)]
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::o200k_base().context("failed to load o200k_base encoding")?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    fn truncate_to_last(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.bpe.encode_ordinary(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }

        let mut start = tokens.len() - max_tokens;
        while start < tokens.len() {
            // A slice may begin inside a multi-byte character; skip forward until it decodes.
            if let Ok(decoded) = self.bpe.decode(tokens[start..].to_vec()) {
                return decoded;
            }
            start += 1;
        }

        String::new()
    }
}

/// Counts whitespace-separated words. Deterministic stand-in for tests and tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceCounter;

impl TokenCounter for WhitespaceCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn truncate_to_last(&self, text: &str, max_tokens: usize) -> String {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() <= max_tokens {
            return text.to_string();
        }
        words[words.len() - max_tokens..].join(" ")
    }
}
