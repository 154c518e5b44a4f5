//! Pre-recorded responses replayed when a provider reports a quota or rate limit.

use crate::models::{ModelId, Usage};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

pub const DEFAULT_CHUNK_WORDS: usize = 3;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Share of a sample's token count attributed to the prompt.
///
/// This is an accounting approximation, not a real tokenization of the prompt.
pub const PROMPT_TOKEN_SHARE: f64 = 0.2;

/// A recorded response for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSample {
    pub text: String,
    /// Total tokens the recorded call consumed
    pub tokens: u32,
    /// Cost the recorded call was billed, in USD
    pub cost: f64,
}

impl FallbackSample {
    pub fn new(text: impl Into<String>, tokens: u32, cost: f64) -> Self {
        Self {
            text: text.into(),
            tokens,
            cost,
        }
    }

    /// Approximate 20/80 prompt/completion split of the recorded token count
    pub fn token_split(&self) -> Usage {
        let prompt_tokens = (self.tokens as f64 * PROMPT_TOKEN_SHARE).round() as u32;
        Usage::new(prompt_tokens, self.tokens - prompt_tokens)
    }
}

fn builtin_samples() -> Vec<(&'static str, FallbackSample)> {
    vec![
        (
            "openai/gpt-4o",
            FallbackSample::new(
                "Here is a concise answer. The question touches on a few distinct ideas, so I will take them in turn: first the core definition, then a short example, and finally the main trade-off worth keeping in mind when applying it in practice.",
                180,
                0.00135,
            ),
        ),
        (
            "openai/gpt-4o-mini",
            FallbackSample::new(
                "Short answer: it depends on context, but the usual approach is to start from the simplest correct solution, measure it, and only then refine the parts that matter.",
                120,
                0.000058,
            ),
        ),
        (
            "anthropic/claude-3-5-sonnet",
            FallbackSample::new(
                "I'd approach this in three steps. Start by clarifying what a good outcome looks like, then weigh the realistic options against it, and close by naming the assumptions that would change the recommendation.",
                200,
                0.00258,
            ),
        ),
        (
            "anthropic/claude-3-5-haiku",
            FallbackSample::new(
                "In brief: the key point is to separate what is known from what is assumed. Once that is clear the answer usually follows directly.",
                110,
                0.00037,
            ),
        ),
        (
            "google/gemini-1.5-pro",
            FallbackSample::new(
                "Let's break this down. The topic has a standard explanation and a few common misconceptions; the explanation is short, and the misconceptions mostly come from mixing up cause and correlation.",
                170,
                0.00073,
            ),
        ),
        (
            "google/gemini-1.5-flash",
            FallbackSample::new(
                "Quick take: yes, with caveats. The general rule holds, but edge cases exist and are worth checking before relying on it.",
                90,
                0.000023,
            ),
        ),
    ]
}

/// Recorded samples keyed by model, plus the pacing used to replay them
#[derive(Debug, Clone)]
pub struct FallbackCatalogue {
    samples: HashMap<ModelId, FallbackSample>,
    chunk_words: usize,
    chunk_delay: Duration,
}

impl Default for FallbackCatalogue {
    fn default() -> Self {
        Self {
            samples: HashMap::new(),
            chunk_words: DEFAULT_CHUNK_WORDS,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

impl FallbackCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut catalogue = Self::new();
        for (id, sample) in builtin_samples() {
            catalogue.insert(ModelId::from(id), sample);
        }
        catalogue
    }

    pub fn with_pacing(mut self, chunk_words: usize, chunk_delay: Duration) -> Self {
        self.chunk_words = chunk_words.max(1);
        self.chunk_delay = chunk_delay;
        self
    }

    pub fn insert(&mut self, model: ModelId, sample: FallbackSample) {
        self.samples.insert(model, sample);
    }

    pub fn get(&self, model: &ModelId) -> Option<&FallbackSample> {
        self.samples.get(model)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Replay a sample as a paced stream of word chunks
    pub fn replay(&self, sample: &FallbackSample) -> BoxStream<'static, String> {
        let delay = self.chunk_delay;
        let chunks = chunk_words(&sample.text, self.chunk_words);
        stream::iter(chunks.into_iter().enumerate())
            .then(move |(index, chunk)| async move {
                if index > 0 && !delay.is_zero() {
                    sleep(delay).await;
                }
                chunk
            })
            .boxed()
    }
}

/// Split text into chunks of `words_per_chunk` words.
///
/// Whitespace stays attached to the preceding word, so the chunks concatenate
/// back to the original text.
pub fn chunk_words(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words_per_chunk = words_per_chunk.max(1);
    let words: Vec<&str> = text.split_inclusive(char::is_whitespace).collect();
    words
        .chunks(words_per_chunk)
        .map(|group| group.concat())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_words_groups_words() {
        let chunks = chunk_words("a b c d e", 2);
        assert_eq!(chunks, vec!["a b ", "c d ", "e"]);
    }

    #[test]
    fn test_chunks_concatenate_to_original() {
        let text = "Line one\nline two  with spacing.";
        let chunks = chunk_words(text, 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_chunk_words_empty_text() {
        assert!(chunk_words("", 3).is_empty());
    }

    #[test]
    fn test_token_split_is_twenty_eighty() {
        let sample = FallbackSample::new("mock-B", 100, 0.01);
        assert_eq!(sample.token_split(), Usage::new(20, 80));

        let odd = FallbackSample::new("mock", 7, 0.0);
        let split = odd.token_split();
        assert_eq!(split.prompt_tokens + split.completion_tokens, 7);
        assert_eq!(split.prompt_tokens, 1);
    }

    #[test]
    fn test_builtin_catalogue_covers_known_models() {
        let catalogue = FallbackCatalogue::builtin();
        assert!(!catalogue.is_empty());
        let sample = catalogue.get(&"openai/gpt-4o".into()).unwrap();
        assert!(!sample.text.is_empty());
        assert!(sample.tokens > 0);
    }

    #[tokio::test]
    async fn test_replay_reproduces_text() {
        let catalogue = FallbackCatalogue::new().with_pacing(2, Duration::ZERO);
        let sample = FallbackSample::new("one two three four five", 10, 0.0);
        let chunks: Vec<String> = catalogue.replay(&sample).collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), sample.text);
    }

    #[tokio::test]
    async fn test_replay_is_paced() {
        let catalogue = FallbackCatalogue::new().with_pacing(1, Duration::from_millis(10));
        let sample = FallbackSample::new("a b c", 3, 0.0);
        let start = tokio::time::Instant::now();
        let chunks: Vec<String> = catalogue.replay(&sample).collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(start.elapsed() >= Duration::from_millis(18));
    }
}
