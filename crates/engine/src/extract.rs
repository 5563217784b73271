//! Defensive parsing of structured model output.
//!
//! Models are asked for bare JSON but do not always comply. Parsing tries
//! the whole text, then a fenced block, then the outermost brace (or
//! bracket) region, and finally yields the type's empty value.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;

static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("fence pattern is valid")
});

/// Which strategy produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    Whole,
    Fenced,
    Region,
    Empty,
}

impl Extraction {
    pub fn is_parsed(&self) -> bool {
        !matches!(self, Self::Empty)
    }
}

fn outer_region(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse `T` out of free-form model text.
pub fn parse_lenient<T>(text: &str) -> (T, Extraction)
where
    T: DeserializeOwned + Default,
{
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return (value, Extraction::Whole);
    }

    for captures in FENCED_RE.captures_iter(trimmed) {
        if let Some(body) = captures.get(1) {
            if let Ok(value) = serde_json::from_str(body.as_str().trim()) {
                return (value, Extraction::Fenced);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(region) = outer_region(trimmed, open, close) {
            if let Ok(value) = serde_json::from_str(region) {
                return (value, Extraction::Region);
            }
        }
    }

    tracing::debug!("No parseable JSON in model output ({} chars)", text.len());
    (T::default(), Extraction::Empty)
}

/// Text before the first fenced JSON block, trimmed.
pub fn narrative_before_json(text: &str) -> String {
    match text.find("```json").or_else(|| text.find("```JSON")) {
        Some(index) => text[..index].trim().to_string(),
        None => text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Verdict {
        #[serde(default)]
        winner: String,
    }

    #[test]
    fn test_fenced_block() {
        let text = "Here you go:\n```json\n{\"winner\": \"B\"}\n```\nThanks";
        let (verdict, how): (Verdict, _) = parse_lenient(text);
        assert_eq!(verdict.winner, "B");
        assert_eq!(how, Extraction::Fenced);
    }

    #[test]
    fn test_brace_region() {
        let text = "Verdict follows {\"winner\": \"A\"} as requested";
        let (verdict, how): (Verdict, _) = parse_lenient(text);
        assert_eq!(verdict.winner, "A");
        assert_eq!(how, Extraction::Region);
    }

    #[test]
    fn test_garbage_gives_empty() {
        let (verdict, how): (Verdict, _) = parse_lenient("no structure {here");
        assert_eq!(verdict, Verdict::default());
        assert!(!how.is_parsed());
    }

    #[test]
    fn test_array_region() {
        let (items, how): (Vec<u32>, _) = parse_lenient("values: [1, 2, 3].");
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(how, Extraction::Region);
    }

    #[test]
    fn test_narrative_split() {
        let text = "Use a 4007ES panel.\n\n```json\n[]\n```";
        assert_eq!(narrative_before_json(text), "Use a 4007ES panel.");
        assert_eq!(narrative_before_json("  plain  "), "plain");
    }
}
