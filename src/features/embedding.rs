//! Language-feature providers
//!
//! The extractor only needs "text in, fixed-size vector and tagged tokens
//! out". The default provider hashes tokens into a normalised vector so
//! it needs no model download and is stable across runs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{LazyLock, Mutex};

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[~/.]?[\w][\w./~-]*|[^\w\s]"#).unwrap()
});

/// Coarse token tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenTag {
    Word,
    Number,
    Path,
    Symbol,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub text: String,
    pub tag: TokenTag,
}

/// Embedding and tokenization provider used by the feature extractor
#[cfg_attr(test, mockall::automock)]
pub trait LanguageProvider: Send + Sync {
    fn name(&self) -> String;

    /// Length of every vector returned by [`LanguageProvider::embed`]
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Vec<f32>;

    fn tokenize(&self, text: &str) -> Vec<Token>;
}

/// Hash-based embedding provider
pub struct HashEmbedding {
    dim: usize,
    cache: Mutex<lru::LruCache<String, Vec<f32>>>,
}

impl HashEmbedding {
    pub fn new(dim: usize, cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            dim: dim.max(1),
            cache: Mutex::new(lru::LruCache::new(cap)),
        }
    }

    fn embed_uncached(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dim];

        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut seed = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3],
                digest[4], digest[5], digest[6], digest[7],
            ]);

            for val in embedding.iter_mut() {
                seed = splitmix64(seed);
                let normalized = (seed as f64 / u64::MAX as f64) * 2.0 - 1.0;
                *val += normalized as f32;
            }
        }

        // Normalize the embedding
        let mag: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for val in embedding.iter_mut() {
                *val /= mag;
            }
        }

        embedding
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new(128, 256)
    }
}

impl LanguageProvider for HashEmbedding {
    fn name(&self) -> String {
        "hash".to_string()
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(cached) = cache.get(text) {
                return cached.clone();
            }
        }

        let embedding = self.embed_uncached(text);

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_string(), embedding.clone());
        }
        embedding
    }

    fn tokenize(&self, text: &str) -> Vec<Token> {
        TOKEN_RE
            .find_iter(text)
            .map(|m| {
                let raw = m.as_str();
                Token { text: raw.to_string(), tag: tag_for(raw) }
            })
            .collect()
    }
}

fn tag_for(raw: &str) -> TokenTag {
    if raw.chars().all(|c| c.is_ascii_digit()) {
        TokenTag::Number
    } else if !raw.chars().any(|c| c.is_alphanumeric() || c == '_') {
        TokenTag::Symbol
    } else if raw.contains('/') || raw.starts_with('~') || has_extension(raw) {
        TokenTag::Path
    } else {
        TokenTag::Word
    }
}

fn has_extension(raw: &str) -> bool {
    match raw.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=10).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic())
        }
        None => false,
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Truncate to at most `max_chars` characters without splitting a code point
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedding_deterministic() {
        let provider = HashEmbedding::new(64, 8);
        let a = provider.embed("show memory usage");
        let b = HashEmbedding::new(64, 8).embed("show memory usage");
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_embedding_normalized() {
        let provider = HashEmbedding::default();
        let v = provider.embed("list the files in my home directory");
        let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_text_gives_zero_vector() {
        let provider = HashEmbedding::default();
        let v = provider.embed("");
        assert_eq!(v.len(), 128);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_similar_texts_are_closer() {
        let provider = HashEmbedding::default();
        let a = provider.embed("show memory usage");
        let b = provider.embed("show memory usage now");
        let c = provider.embed("delete the backup folder");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_tokenize_tags() {
        let provider = HashEmbedding::default();
        let tokens = provider.tokenize("write notes.txt with 'hello' 42 times to /tmp/x");
        let find = |t: &str| tokens.iter().find(|tok| tok.text == t).map(|tok| tok.tag);
        assert_eq!(find("write"), Some(TokenTag::Word));
        assert_eq!(find("notes.txt"), Some(TokenTag::Path));
        assert_eq!(find("42"), Some(TokenTag::Number));
        assert_eq!(find("/tmp/x"), Some(TokenTag::Path));
        assert_eq!(find("'"), Some(TokenTag::Symbol));
    }

    #[test]
    fn test_tokenize_non_ascii() {
        let provider = HashEmbedding::default();
        let tokens = provider.tokenize("zeige Speicherverbrauch für 日本語");
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("日本語", 1), "日");
    }
}
