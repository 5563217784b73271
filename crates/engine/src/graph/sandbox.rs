//! Read-only sandbox for declarative graph queries.
//!
//! Model-written queries are screened before they reach the store: any
//! mutating keyword rejects the query outright, and queries that do not
//! end in a result cap get one appended.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Keywords that may change graph state, matched as whole words.
pub const MUTATING_KEYWORDS: &[&str] = &[
    "create", "merge", "delete", "remove", "set", "detach", "insert", "update", "drop", "alter",
    "attach", "pragma", "vacuum",
];

static MUTATING_RE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(r"(?i)\b({})\b", MUTATING_KEYWORDS.join("|"));
    Regex::new(&pattern).expect("keyword pattern is valid")
});

/// A cap on the outer statement: `LIMIT n`, `LIMIT n OFFSET m` or
/// `LIMIT m, n` at the very end.
static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\blimit\s+\d+(?:\s*(?:,|\boffset\b)\s*\d+)?\s*$")
        .expect("limit pattern is valid")
});

/// Why a query was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxViolation {
    Empty,
    MutatingKeyword(String),
}

impl fmt::Display for SandboxViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty query"),
            Self::MutatingKeyword(keyword) => {
                write!(f, "mutating keyword '{}' is not allowed", keyword)
            }
        }
    }
}

/// Result-cap policy applied to accepted queries.
#[derive(Debug, Clone, Copy)]
pub struct SandboxPolicy {
    pub default_limit: usize,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self { default_limit: 100 }
    }
}

impl SandboxPolicy {
    /// Screen `text` and return the query to execute.
    pub fn prepare(&self, text: &str) -> Result<String, SandboxViolation> {
        let trimmed = text.trim().trim_end_matches(';').trim_end();
        if trimmed.is_empty() {
            return Err(SandboxViolation::Empty);
        }

        if let Some(found) = MUTATING_RE.find(trimmed) {
            return Err(SandboxViolation::MutatingKeyword(
                found.as_str().to_uppercase(),
            ));
        }

        if LIMIT_RE.is_match(trimmed) {
            Ok(trimmed.to_string())
        } else {
            Ok(format!("{} LIMIT {}", trimmed, self.default_limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_rejected_in_any_case() {
        let policy = SandboxPolicy::default();
        for text in [
            "DELETE FROM nodes",
            "delete from nodes",
            "SELECT 1; DeLeTe FROM edges",
        ] {
            assert_eq!(
                policy.prepare(text),
                Err(SandboxViolation::MutatingKeyword("DELETE".to_string()))
            );
        }
    }

    #[test]
    fn test_keywords_match_whole_words_only() {
        let policy = SandboxPolicy::default();
        let accepted = policy
            .prepare("SELECT identifier AS dataset, created_at FROM nodes LIMIT 5")
            .unwrap();
        assert!(accepted.ends_with("LIMIT 5"));
    }

    #[test]
    fn test_limit_appended_when_missing() {
        let policy = SandboxPolicy { default_limit: 100 };
        assert_eq!(
            policy.prepare("SELECT * FROM nodes WHERE node_type = 'Panel';").unwrap(),
            "SELECT * FROM nodes WHERE node_type = 'Panel' LIMIT 100"
        );
    }

    #[test]
    fn test_limit_word_elsewhere_is_not_a_cap() {
        let policy = SandboxPolicy { default_limit: 100 };
        for text in [
            "SELECT identifier FROM nodes WHERE name <> 'no limit'",
            "SELECT * FROM (SELECT identifier FROM nodes LIMIT 5) AS inner_rows",
            "SELECT identifier AS limit_note FROM nodes",
        ] {
            assert_eq!(policy.prepare(text).unwrap(), format!("{} LIMIT 100", text));
        }
    }

    #[test]
    fn test_trailing_limit_is_kept() {
        let policy = SandboxPolicy::default();
        for text in [
            "SELECT identifier FROM nodes LIMIT 5",
            "SELECT identifier FROM nodes limit 5 offset 10",
            "SELECT identifier FROM nodes LIMIT 10, 5",
        ] {
            assert_eq!(policy.prepare(text).unwrap(), text);
        }
    }

    #[test]
    fn test_empty_query_rejected() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.prepare("  ;  "), Err(SandboxViolation::Empty));
    }

    #[test]
    fn test_set_in_update_statement() {
        let policy = SandboxPolicy::default();
        assert!(policy
            .prepare("UPDATE nodes SET name = 'x'")
            .is_err());
    }
}
