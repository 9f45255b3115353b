//! Feature extraction
//!
//! Turns a raw directive into a deterministic [`FeatureRecord`]. Extraction
//! never fails: empty, oversized or non-ASCII input degrades to empty
//! feature values.

pub mod embedding;
pub mod lexicon;

pub use embedding::{cosine_similarity, HashEmbedding, LanguageProvider, Token, TokenTag};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};

use crate::config::FeatureConfig;
use embedding::truncate_chars;
use lexicon::contains;

static FILE_EXTENSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\w(\.[A-Za-z0-9]{1,10})(?:\s|$|[,)\]}'\x22])").unwrap()
});

static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]+").unwrap());

static SHELL_OPERATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\|\||&&|;|\$\(|`|\s-{1,2}[a-zA-Z])").unwrap()
});

/// Caller-supplied context. Absent fields are defaulted by
/// [`RequestContext::resolved`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestContext {
    /// Hour of day, 0-23
    #[serde(default)]
    pub time_of_day: Option<u8>,
    #[serde(default)]
    pub recent_operation_count: Option<u32>,
    #[serde(default)]
    pub recent_success_rate: Option<f64>,
    /// Requester skill estimate in 0.0..=1.0
    #[serde(default)]
    pub skill_estimate: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RequestContext {
    /// Copy with every optional field filled in
    pub fn resolved(&self) -> Self {
        Self {
            time_of_day: Some(self.time_of_day.unwrap_or(12).min(23)),
            recent_operation_count: Some(self.recent_operation_count.unwrap_or(0)),
            recent_success_rate: Some(self.recent_success_rate.unwrap_or(0.0).clamp(0.0, 1.0)),
            skill_estimate: Some(self.skill_estimate.unwrap_or(0.5).clamp(0.0, 1.0)),
            extra: self.extra.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionCategory {
    Code,
    Document,
    Config,
    Data,
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LexicalFeatures {
    /// Lower-cased word tokens in order
    pub words: Vec<String>,
    pub token_count: usize,
    pub char_count: usize,
    pub avg_word_length: f64,
    pub sentence_count: usize,
    pub verbs: Vec<String>,
    pub nouns: Vec<String>,
    pub file_extension: Option<String>,
    pub extension_category: Option<ExtensionCategory>,
    /// Tokens the provider tagged as paths, original case
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyntacticFeatures {
    pub is_imperative: bool,
    pub is_interrogative: bool,
    pub has_conditional: bool,
    pub has_negation: bool,
    pub has_quoted_text: bool,
    pub has_pipe: bool,
    pub has_redirect: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DomainFeatures {
    pub code_languages: Vec<String>,
    pub mentions_code: bool,
    pub mentions_system_resource: bool,
    pub file_operation_verbs: Vec<String>,
    pub immediate_read_verbs: Vec<String>,
    pub is_urgent: bool,
    pub mentions_test: bool,
    pub mentions_vcs: bool,
    /// First word, when it names a known shell command
    pub shell_command: Option<String>,
    /// Flags, chaining, substitution or separators
    pub has_shell_operators: bool,
    pub looks_like_shell: bool,
}

/// Everything the classifier and verifiers know about a directive.
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureRecord {
    pub request_hash: String,
    pub lexical: LexicalFeatures,
    pub syntactic: SyntacticFeatures,
    pub domain: DomainFeatures,
    pub embedding: Vec<f32>,
    pub provider: String,
    pub context: RequestContext,
}

impl FeatureRecord {
    pub fn is_empty(&self) -> bool {
        self.lexical.token_count == 0
    }
}

pub struct FeatureExtractor {
    provider: Arc<dyn LanguageProvider>,
    max_chars: usize,
}

impl FeatureExtractor {
    pub fn new(provider: Arc<dyn LanguageProvider>, max_chars: usize) -> Self {
        Self { provider, max_chars }
    }

    pub fn from_config(config: &FeatureConfig) -> Self {
        let provider = HashEmbedding::new(config.embedding_dim, config.cache_size);
        Self::new(Arc::new(provider), config.max_chars)
    }

    pub fn provider(&self) -> &Arc<dyn LanguageProvider> {
        &self.provider
    }

    pub fn extract(&self, text: &str, context: Option<&RequestContext>) -> FeatureRecord {
        let text = truncate_chars(text.trim(), self.max_chars);
        let lower = text.to_lowercase();
        let context = context.cloned().unwrap_or_default().resolved();

        let tokens = self.provider.tokenize(text);
        let mut embedding = self.provider.embed(text);
        embedding.resize(self.provider.dimension(), 0.0);

        let lexical = lexical_features(text, &tokens);
        let syntactic = syntactic_features(text, &lower, &lexical);
        let domain = domain_features(&lower, &lexical);

        FeatureRecord {
            request_hash: request_hash(text),
            lexical,
            syntactic,
            domain,
            embedding,
            provider: self.provider.name(),
            context,
        }
    }
}

/// First 16 hex chars of SHA-256 over the trimmed, lower-cased directive
pub fn request_hash(text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn lexical_features(text: &str, tokens: &[Token]) -> LexicalFeatures {
    let words: Vec<String> = tokens
        .iter()
        .filter(|t| matches!(t.tag, TokenTag::Word | TokenTag::Path | TokenTag::Number))
        .map(|t| t.text.to_lowercase())
        .collect();

    let mut verbs = Vec::new();
    let mut nouns = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if token.tag != TokenTag::Word {
            continue;
        }
        let word = token.text.to_lowercase();
        if contains(lexicon::IMPERATIVE_VERBS, &word) {
            push_unique(&mut verbs, word);
        } else if contains(lexicon::CODE_KEYWORDS, &word)
            || contains(lexicon::SYSTEM_KEYWORDS, &word)
            || contains(lexicon::GIT_KEYWORDS, &word)
            || lexicon::NOUN_SUFFIXES.iter().any(|s| word.len() > s.len() + 1 && word.ends_with(s))
            || (i > 0 && token.text.chars().next().is_some_and(|c| c.is_uppercase()))
        {
            push_unique(&mut nouns, word);
        }
    }

    let file_extension = FILE_EXTENSION_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase());
    let extension_category = file_extension.as_deref().map(categorize_extension);

    let paths = tokens
        .iter()
        .filter(|t| t.tag == TokenTag::Path)
        .map(|t| t.text.clone())
        .collect();

    let avg_word_length = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / words.len() as f64
    };

    let sentence_count = if text.is_empty() {
        0
    } else {
        SENTENCE_END_RE.find_iter(text).count().max(1)
    };

    LexicalFeatures {
        token_count: tokens.len(),
        char_count: text.chars().count(),
        avg_word_length,
        sentence_count,
        verbs,
        nouns,
        file_extension,
        extension_category,
        paths,
        words,
    }
}

fn syntactic_features(text: &str, lower: &str, lexical: &LexicalFeatures) -> SyntacticFeatures {
    let first = lexical.words.first().map(String::as_str).unwrap_or("");
    let word_set = &lexical.words;

    SyntacticFeatures {
        is_imperative: contains(lexicon::IMPERATIVE_VERBS, first)
            && !lexicon::INTERROGATIVE_PREFIXES.iter().any(|p| p.trim() == first),
        is_interrogative: text.ends_with('?')
            || lexicon::INTERROGATIVE_PREFIXES.iter().any(|p| {
                if p.ends_with(' ') {
                    lower.starts_with(p)
                } else {
                    first == *p
                }
            }),
        has_conditional: word_set.iter().any(|w| contains(lexicon::CONDITIONAL_WORDS, w)),
        has_negation: lower
            .split_whitespace()
            .any(|w| contains(lexicon::NEGATION_WORDS, w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\''))),
        has_quoted_text: text.matches('\'').count() >= 2 || text.matches('"').count() >= 2,
        has_pipe: text.contains('|') && !text.contains("||"),
        has_redirect: text.contains('>') || text.contains(" < "),
    }
}

fn domain_features(lower: &str, lexical: &LexicalFeatures) -> DomainFeatures {
    let words = &lexical.words;
    let any_of = |table: &[&str]| words.iter().any(|w| contains(table, w));
    let all_of = |table: &[&str]| -> Vec<String> {
        let mut out = Vec::new();
        for w in words {
            if contains(table, w) {
                push_unique(&mut out, w.clone());
            }
        }
        out
    };

    let padded = format!(" {} ", lower);
    let code_languages = lexicon::LANGUAGE_MARKERS
        .iter()
        .filter(|(_, markers)| markers.iter().any(|m| padded.contains(m)))
        .map(|(lang, _)| lang.to_string())
        .collect();

    let first = words.first().map(String::as_str).unwrap_or("");
    let shell_command = contains(lexicon::SHELL_COMMANDS, first).then(|| first.to_string());
    let has_shell_operators = SHELL_OPERATOR_RE.is_match(lower);

    DomainFeatures {
        code_languages,
        mentions_code: any_of(lexicon::CODE_KEYWORDS),
        mentions_system_resource: any_of(lexicon::SYSTEM_KEYWORDS),
        file_operation_verbs: all_of(lexicon::FILE_OPERATION_VERBS),
        immediate_read_verbs: all_of(lexicon::IMMEDIATE_READ_VERBS),
        is_urgent: any_of(lexicon::URGENCY_WORDS) || lower.contains('!'),
        mentions_test: any_of(lexicon::TEST_KEYWORDS),
        mentions_vcs: any_of(lexicon::GIT_KEYWORDS),
        looks_like_shell: shell_command.is_some() || has_shell_operators,
        shell_command,
        has_shell_operators,
    }
}

fn categorize_extension(ext: &str) -> ExtensionCategory {
    if contains(lexicon::CODE_EXTENSIONS, ext) {
        ExtensionCategory::Code
    } else if contains(lexicon::DOC_EXTENSIONS, ext) {
        ExtensionCategory::Document
    } else if contains(lexicon::CONFIG_EXTENSIONS, ext) {
        ExtensionCategory::Config
    } else if contains(lexicon::DATA_EXTENSIONS, ext) {
        ExtensionCategory::Data
    } else {
        ExtensionCategory::Other
    }
}

fn push_unique(list: &mut Vec<String>, word: String) {
    if !list.contains(&word) {
        list.push(word);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedding::MockLanguageProvider;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::from_config(&FeatureConfig::default())
    }

    #[test]
    fn test_show_memory_usage() {
        let f = extractor().extract("show memory usage", None);
        assert_eq!(f.lexical.token_count, 3);
        assert!(f.syntactic.is_imperative);
        assert!(!f.syntactic.is_interrogative);
        assert!(f.domain.mentions_system_resource);
        assert_eq!(f.domain.immediate_read_verbs, vec!["show".to_string()]);
        assert!(!f.domain.looks_like_shell);
        assert_eq!(f.embedding.len(), 128);
    }

    #[test]
    fn test_file_extension_detection() {
        let f = extractor().extract("write notes.txt with 'hello'", None);
        assert_eq!(f.lexical.file_extension.as_deref(), Some(".txt"));
        assert_eq!(f.lexical.extension_category, Some(ExtensionCategory::Document));
        assert_eq!(f.lexical.paths, vec!["notes.txt".to_string()]);
        assert!(f.syntactic.has_quoted_text);
        assert_eq!(f.domain.file_operation_verbs, vec!["write".to_string()]);
    }

    #[test]
    fn test_shell_detection() {
        let f = extractor().extract("rm -rf /", None);
        assert!(f.domain.looks_like_shell);
        assert_eq!(f.domain.shell_command.as_deref(), Some("rm"));
        assert!(f.domain.has_shell_operators);
        let f = extractor().extract("ls -la | grep foo", None);
        assert!(f.syntactic.has_pipe);
        assert!(f.domain.looks_like_shell);
    }

    #[test]
    fn test_interrogative_and_negation() {
        let f = extractor().extract("what is using my cpu?", None);
        assert!(f.syntactic.is_interrogative);
        assert!(!f.syntactic.is_imperative);

        let f = extractor().extract("don't delete anything", None);
        assert!(f.syntactic.has_negation);
    }

    #[test]
    fn test_empty_and_huge_input_degrade() {
        let f = extractor().extract("", None);
        assert!(f.is_empty());
        assert_eq!(f.lexical.sentence_count, 0);
        assert_eq!(f.lexical.avg_word_length, 0.0);
        assert!(f.lexical.verbs.is_empty());

        let huge = "word ".repeat(10_000);
        let f = extractor().extract(&huge, None);
        assert!(f.lexical.char_count <= 8192);
    }

    #[test]
    fn test_non_ascii_input() {
        let f = extractor().extract("zeige Speicherverbrauch für 日本語 ünd ß", None);
        assert!(f.lexical.token_count > 0);
        assert_eq!(f.request_hash.len(), 16);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let ctx = RequestContext { time_of_day: Some(9), ..Default::default() };
        let a = extractor().extract("list files in ~/projects", Some(&ctx));
        let b = extractor().extract("list files in ~/projects", Some(&ctx));
        assert_eq!(a, b);
    }

    #[test]
    fn test_context_defaults() {
        let f = extractor().extract("show uptime", None);
        assert_eq!(f.context.recent_operation_count, Some(0));
        assert_eq!(f.context.time_of_day, Some(12));
        assert_eq!(f.context.skill_estimate, Some(0.5));
    }

    #[test]
    fn test_request_hash_normalizes() {
        assert_eq!(request_hash("  Show Memory  "), request_hash("show memory"));
        assert_ne!(request_hash("show memory"), request_hash("show disk"));
    }

    #[test]
    fn test_uses_injected_provider() {
        let mut provider = MockLanguageProvider::new();
        provider.expect_name().return_const("mock".to_string());
        provider.expect_dimension().return_const(4usize);
        provider.expect_embed().returning(|_| vec![1.0, 0.0]);
        provider.expect_tokenize().returning(|text| {
            text.split_whitespace()
                .map(|w| Token { text: w.to_string(), tag: TokenTag::Word })
                .collect()
        });

        let extractor = FeatureExtractor::new(Arc::new(provider), 100);
        let f = extractor.extract("show disk", None);
        assert_eq!(f.provider, "mock");
        assert_eq!(f.embedding, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(f.lexical.words, vec!["show".to_string(), "disk".to_string()]);
    }
}
