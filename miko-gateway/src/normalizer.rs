//! Sentence normalization for synthesis-ready chunks.
//!
//! Rules are data, not code: an ordered `(pattern, replacement)` list comes
//! from configuration so the cleanup behavior can be tuned without a rebuild.

use regex::Regex;
use tracing::warn;

/// A completed sentence after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedChunk {
    pub text: String,
    pub emotion: Option<String>,
}

/// One compiled replacement rule.
struct NormalizerRule {
    pattern: Regex,
    replacement: String,
}

/// Stateless sentence normalizer.
///
/// Processing order: replacement rules, emotion-tag extraction, whitespace
/// collapse. A sentence that trims to nothing yields no emission.
pub struct TextNormalizer {
    rules: Vec<NormalizerRule>,
    emotion_pattern: Regex,
    whitespace: Regex,
}

/// Built-in rules applied when configuration supplies none: stage directions
/// wrapped in asterisks are not speakable.
pub fn default_rules() -> Vec<(String, String)> {
    vec![(r"\*[^*]*\*".to_string(), String::new())]
}

impl TextNormalizer {
    /// Compile an ordered rule list. Invalid patterns are skipped with a
    /// warning rather than failing the whole set.
    pub fn new(rules: &[(String, String)]) -> Self {
        let compiled = rules
            .iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(regex) => Some(NormalizerRule {
                    pattern: regex,
                    replacement: replacement.clone(),
                }),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Skipping invalid normalizer rule");
                    None
                }
            })
            .collect();

        Self {
            rules: compiled,
            emotion_pattern: Regex::new(r"\[([A-Za-z][A-Za-z0-9 _-]*)\]").expect("static pattern"),
            whitespace: Regex::new(r"\s+").expect("static pattern"),
        }
    }

    pub fn with_default_rules() -> Self {
        Self::new(&default_rules())
    }

    /// Normalize one sentence. Returns `None` when nothing speakable remains.
    pub fn process(&self, sentence: &str) -> Option<NormalizedChunk> {
        if sentence.trim().is_empty() {
            return None;
        }

        let mut text = sentence.to_string();
        for rule in &self.rules {
            text = rule
                .pattern
                .replace_all(&text, rule.replacement.as_str())
                .into_owned();
        }

        let mut emotion = None;
        if let Some(captures) = self.emotion_pattern.captures(&text) {
            emotion = Some(captures[1].to_string());
            let tag_range = captures.get(0).expect("whole match").range();
            text.replace_range(tag_range, "");
        }

        let text = self.whitespace.replace_all(&text, " ").trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(NormalizedChunk { text, emotion })
        }
    }
}
