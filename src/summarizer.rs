//! Structural JSON/text summarization under a token-aware options budget.

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::estimator::estimate_str_tokens;

/// Fixed, case-insensitive metadata key set. Dropped from objects when
/// `include_metadata = false`. Kept fixed.
const METADATA_KEYS: &[&str] = &[
    "timestamp",
    "createdat",
    "updatedat",
    "lastmodified",
    "id",
    "guid",
    "uuid",
    "url",
    "documentationurl",
    "metadata",
    "version",
];

/// Fixed, case-insensitive code-example key set. Preserved verbatim when
/// `preserve_code_examples = true`.
const CODE_EXAMPLE_KEYS: &[&str] = &["codeexamples", "code", "example", "snippet", "sample"];

/// Tokens whose presence (>= 3 distinct matches) classifies text content as code.
const CODE_HEURISTIC_TOKENS: &[&str] = &[
    "using ", "namespace ", "class ", "public ", "private ", "void ", "return ", "if (", "for (",
    "while (", "{", "}", "//", "/*",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizationMode {
    Minimal,
    Balanced,
    Aggressive,
}

#[derive(Debug, Clone)]
pub struct SummarizationOptions {
    pub mode: SummarizationMode,
    pub max_length: usize,
    pub max_list_items: usize,
    pub max_depth: usize,
    pub preserve_code_examples: bool,
    pub include_metadata: bool,
}

impl SummarizationOptions {
    pub fn minimal() -> Self {
        Self {
            mode: SummarizationMode::Minimal,
            max_length: 2_000,
            max_list_items: 50,
            max_depth: 10,
            preserve_code_examples: true,
            include_metadata: true,
        }
    }

    pub fn balanced() -> Self {
        Self {
            mode: SummarizationMode::Balanced,
            max_length: 500,
            max_list_items: 5,
            max_depth: 3,
            preserve_code_examples: true,
            include_metadata: false,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            mode: SummarizationMode::Aggressive,
            max_length: 200,
            max_list_items: 3,
            max_depth: 2,
            preserve_code_examples: true,
            include_metadata: false,
        }
    }

    /// Pick a preset from a target/current token ratio.
    pub fn choose_for_budget(target_tokens: u32, current_tokens: u32) -> Self {
        if current_tokens == 0 {
            return Self::minimal();
        }
        let ratio = target_tokens as f64 / current_tokens as f64;
        if ratio >= 0.8 {
            Self::minimal()
        } else if ratio >= 0.5 {
            Self::balanced()
        } else {
            Self::aggressive()
        }
    }
}

impl Default for SummarizationOptions {
    fn default() -> Self {
        Self::balanced()
    }
}

/// One of the technique tags recorded whenever the corresponding transform fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SummarizationTechnique {
    ListTruncation,
    TextTruncation,
    SentenceTruncation,
    MetadataRemoval,
    DepthLimiting,
}

impl SummarizationTechnique {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListTruncation => "list_truncation",
            Self::TextTruncation => "text_truncation",
            Self::SentenceTruncation => "sentence_truncation",
            Self::MetadataRemoval => "metadata_removal",
            Self::DepthLimiting => "depth_limiting",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummarizationResult {
    pub content: String,
    pub original_length: usize,
    pub summarized_length: usize,
    pub techniques: Vec<SummarizationTechnique>,
}

impl SummarizationResult {
    pub fn compression_ratio(&self) -> f64 {
        if self.original_length == 0 {
            return 1.0;
        }
        self.summarized_length as f64 / self.original_length as f64
    }

    pub fn estimated_tokens_saved(&self) -> u32 {
        ((self.original_length as u32) / 4).saturating_sub(estimate_str_tokens(&self.content))
    }
}

#[derive(Default)]
pub struct ResultSummarizer;

impl ResultSummarizer {
    pub fn new() -> Self {
        Self
    }

    pub fn summarize(&self, content: &str, options: &SummarizationOptions) -> Result<SummarizationResult> {
        if content.is_empty() {
            return Err(CoreError::InvalidInput("content must not be empty".into()));
        }

        let original_length = content.len();
        let mut techniques = Vec::new();

        let summarized = match serde_json::from_str::<Value>(content) {
            Ok(value) => {
                let mut out = String::new();
                summarize_value(&value, options, 0, &mut techniques, &mut out);
                out
            }
            Err(_) => summarize_text(content, options, &mut techniques),
        };

        Ok(SummarizationResult {
            summarized_length: summarized.len(),
            content: summarized,
            original_length,
            techniques: dedup_techniques(techniques),
        })
    }

    /// Summarize several named payloads, combining them in insertion order
    /// under `=== name ===` headers.
    pub fn summarize_multiple(
        &self,
        contents: &[(String, String)],
        options: &SummarizationOptions,
    ) -> Result<SummarizationResult> {
        if contents.is_empty() {
            return Err(CoreError::InvalidInput("contents must not be empty".into()));
        }

        let mut combined = String::new();
        let mut all_techniques = Vec::new();
        let mut original_total = 0usize;

        for (name, content) in contents {
            original_total += content.len();
            let result = self.summarize(content, options)?;
            all_techniques.extend(result.techniques);
            combined.push_str(&format!("=== {name} ===\n{}\n\n", result.content));
        }

        Ok(SummarizationResult {
            summarized_length: combined.len(),
            content: combined,
            original_length: original_total,
            techniques: dedup_techniques(all_techniques),
        })
    }
}

fn dedup_techniques(mut techniques: Vec<SummarizationTechnique>) -> Vec<SummarizationTechnique> {
    let mut seen = std::collections::HashSet::new();
    techniques.retain(|t| seen.insert(*t));
    techniques
}

fn is_metadata_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    METADATA_KEYS.contains(&lower.as_str())
}

fn is_code_example_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    CODE_EXAMPLE_KEYS.contains(&lower.as_str())
}

fn summarize_value(
    value: &Value,
    options: &SummarizationOptions,
    depth: usize,
    techniques: &mut Vec<SummarizationTechnique>,
    out: &mut String,
) {
    if depth > options.max_depth {
        techniques.push(SummarizationTechnique::DepthLimiting);
        out.push_str("[...truncated]");
        return;
    }

    match value {
        Value::Object(map) => {
            out.push('{');
            let mut first = true;
            for (key, val) in map {
                if !options.include_metadata && is_metadata_key(key) {
                    techniques.push(SummarizationTechnique::MetadataRemoval);
                    continue;
                }
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&format!("{key:?}:"));

                if options.preserve_code_examples && is_code_example_key(key) {
                    out.push_str(&val.to_string());
                    continue;
                }

                summarize_value(val, options, depth + 1, techniques, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            let n = items.len();
            if n > options.max_list_items {
                techniques.push(SummarizationTechnique::ListTruncation);
                for (i, item) in items.iter().take(options.max_list_items).enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    summarize_value(item, options, depth + 1, techniques, out);
                }
                out.push_str(&format!(",\"...and {} more\"", n - options.max_list_items));
            } else {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    summarize_value(item, options, depth + 1, techniques, out);
                }
            }
            out.push(']');
        }
        Value::String(s) => {
            if is_code(s, options) {
                out.push_str(&format!("{s:?}"));
            } else if s.len() > options.max_length {
                techniques.push(SummarizationTechnique::TextTruncation);
                out.push_str(&format!("{:?}", truncate_at_word_boundary(s, options.max_length)));
            } else {
                out.push_str(&format!("{s:?}"));
            }
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Truncate at a word boundary: prefer the last whitespace in the truncated
/// prefix if it lies in the second half, else hard-cut at `max_length`.
fn truncate_at_word_boundary(s: &str, max_length: usize) -> String {
    let prefix: String = s.chars().take(max_length).collect();
    let half = max_length / 2;
    let cut = prefix
        .char_indices()
        .rev()
        .find(|(i, c)| *i >= half && c.is_whitespace())
        .map(|(i, _)| i)
        .unwrap_or(prefix.len());
    format!("{}...", prefix[..cut].trim_end())
}

/// Code heuristic: classified as code iff `preserve_code_examples`
/// AND at least three of the fixed tokens are present.
fn is_code(text: &str, options: &SummarizationOptions) -> bool {
    if !options.preserve_code_examples {
        return false;
    }
    CODE_HEURISTIC_TOKENS
        .iter()
        .filter(|tok| text.contains(*tok))
        .count()
        >= 3
}

fn summarize_text(
    text: &str,
    options: &SummarizationOptions,
    techniques: &mut Vec<SummarizationTechnique>,
) -> String {
    if is_code(text, options) {
        return text.to_string();
    }

    let sentences = split_sentences(text);
    let mut acc = String::new();
    let mut truncated = false;

    for sentence in &sentences {
        if acc.len() + sentence.len() > options.max_length && !acc.is_empty() {
            truncated = true;
            break;
        }
        acc.push_str(sentence);
    }

    if truncated {
        techniques.push(SummarizationTechnique::SentenceTruncation);
        acc.push_str("...");
    }

    if acc.is_empty() {
        // Single sentence longer than max_length: fall back to word-boundary cut.
        techniques.push(SummarizationTechnique::SentenceTruncation);
        return format!("{}...", truncate_at_word_boundary(text, options.max_length));
    }

    acc
}

/// Split into sentences on `. `, `! `, `? ` boundaries, keeping the
/// terminator and following whitespace attached to each sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') && chars.get(i + 1).is_some_and(|c| c.is_whitespace()) {
            let end = (i + 2).min(chars.len());
            sentences.push(chars[start..end].iter().collect());
            start = end;
            i = end;
        } else {
            i += 1;
        }
    }
    if start < chars.len() {
        sentences.push(chars[start..].iter().collect());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_is_invalid() {
        let s = ResultSummarizer::new();
        assert!(matches!(
            s.summarize("", &SummarizationOptions::balanced()),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn list_truncation_reports_remainder() {
        let s = ResultSummarizer::new();
        let items: Vec<i32> = (0..20).collect();
        let content = serde_json::json!({"items": items}).to_string();
        let mut opts = SummarizationOptions::balanced();
        opts.max_list_items = 5;
        let result = s.summarize(&content, &opts).unwrap();
        assert!(result.content.contains("...and 15 more"));
        assert!(result.techniques.contains(&SummarizationTechnique::ListTruncation));
        assert!(result.summarized_length < result.original_length);
    }

    #[test]
    fn metadata_removed_when_disabled() {
        let s = ResultSummarizer::new();
        let content = serde_json::json!({"id": "abc", "name": "keep me"}).to_string();
        let mut opts = SummarizationOptions::balanced();
        opts.include_metadata = false;
        let result = s.summarize(&content, &opts).unwrap();
        assert!(!result.content.contains("abc"));
        assert!(result.content.contains("keep me"));
        assert!(result.techniques.contains(&SummarizationTechnique::MetadataRemoval));
    }

    #[test]
    fn metadata_kept_when_enabled() {
        let s = ResultSummarizer::new();
        let content = serde_json::json!({"id": "abc"}).to_string();
        let mut opts = SummarizationOptions::balanced();
        opts.include_metadata = true;
        let result = s.summarize(&content, &opts).unwrap();
        assert!(result.content.contains("abc"));
    }

    #[test]
    fn depth_limiting_truncates_beyond_max_depth() {
        let s = ResultSummarizer::new();
        let content = serde_json::json!({"a": {"b": {"c": {"d": 1}}}}).to_string();
        let mut opts = SummarizationOptions::balanced();
        opts.max_depth = 1;
        let result = s.summarize(&content, &opts).unwrap();
        assert!(result.content.contains("[...truncated]"));
        assert!(result.techniques.contains(&SummarizationTechnique::DepthLimiting));
    }

    #[test]
    fn long_string_is_word_boundary_truncated() {
        let s = ResultSummarizer::new();
        let long = "word ".repeat(200);
        let content = serde_json::json!({"text": long}).to_string();
        let mut opts = SummarizationOptions::balanced();
        opts.max_length = 50;
        opts.include_metadata = true;
        let result = s.summarize(&content, &opts).unwrap();
        assert!(result.techniques.contains(&SummarizationTechnique::TextTruncation));
        assert!(result.summarized_length < result.original_length);
    }

    #[test]
    fn code_is_preserved_verbatim_in_text_path() {
        let s = ResultSummarizer::new();
        let code = "namespace Foo { public class Bar { void Baz() { return; } } }";
        let opts = SummarizationOptions::balanced();
        let result = s.summarize(code, &opts).unwrap();
        assert_eq!(result.content, code);
        assert!(result.techniques.is_empty());
    }

    #[test]
    fn code_example_keys_preserved_verbatim() {
        let s = ResultSummarizer::new();
        let content = serde_json::json!({"codeExamples": "let x = 1; // keep exactly"}).to_string();
        let opts = SummarizationOptions::balanced();
        let result = s.summarize(&content, &opts).unwrap();
        assert!(result.content.contains("let x = 1; // keep exactly"));
    }

    #[test]
    fn plain_text_sentence_truncation() {
        let s = ResultSummarizer::new();
        let text = "One. Two. Three. Four. Five. Six. Seven. Eight. Nine. Ten.";
        let mut opts = SummarizationOptions::balanced();
        opts.max_length = 15;
        let result = s.summarize(text, &opts).unwrap();
        assert!(result.content.ends_with("..."));
        assert!(result.techniques.contains(&SummarizationTechnique::SentenceTruncation));
    }

    #[test]
    fn summarized_length_never_exceeds_original_for_non_empty() {
        let s = ResultSummarizer::new();
        let content = serde_json::json!({"a": "short"}).to_string();
        let result = s.summarize(&content, &SummarizationOptions::balanced()).unwrap();
        assert!(result.summarized_length > 0);
    }

    #[test]
    fn choose_for_budget_picks_presets() {
        assert_eq!(
            SummarizationOptions::choose_for_budget(90, 100).mode,
            SummarizationMode::Minimal
        );
        assert_eq!(
            SummarizationOptions::choose_for_budget(60, 100).mode,
            SummarizationMode::Balanced
        );
        assert_eq!(
            SummarizationOptions::choose_for_budget(10, 100).mode,
            SummarizationMode::Aggressive
        );
    }

    #[test]
    fn summarize_multiple_combines_in_order() {
        let s = ResultSummarizer::new();
        let contents = vec![
            ("first".to_string(), serde_json::json!({"a": 1}).to_string()),
            ("second".to_string(), serde_json::json!({"b": 2}).to_string()),
        ];
        let result = s.summarize_multiple(&contents, &SummarizationOptions::balanced()).unwrap();
        let first_pos = result.content.find("=== first ===").unwrap();
        let second_pos = result.content.find("=== second ===").unwrap();
        assert!(first_pos < second_pos);
    }
}
