//! Relevance scoring and session-wide deduplication.
//!
//! Relevance blends four lexical signals against the original query:
//! term-frequency cosine, keyword Jaccard, domain taxonomy coverage and
//! domain phrase overlap (weights 0.35 / 0.25 / 0.25 / 0.15).

use crate::session::Session;
use crate::types::{Evidence, EvidenceItem};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will", "would",
    "could", "should", "may", "might", "can", "this", "that", "these", "those",
];

const PHRASE_PATTERNS: &[&str] = &[
    r"smoke\s+detector",
    r"heat\s+detector",
    r"fire\s+alarm",
    r"control\s+panel",
    r"detector\s+base",
    r"sounder\s+base",
    r"manual\s+station",
    r"pull\s+station",
    r"notification\s+appliance",
    r"speaker\s+strobe",
    r"horn\s+strobe",
    r"power\s+supply",
    r"battery\s+backup",
    r"loop\s+powered",
    r"addressable\s+device",
    r"conventional\s+detector",
    r"analog\s+detector",
];

static PHRASES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PHRASE_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("phrase pattern is valid"))
        .collect()
});

/// Keyword categories with their weight in the domain score.
#[derive(Debug, Clone)]
pub struct DomainTaxonomy {
    categories: Vec<(f64, Vec<String>)>,
}

impl Default for DomainTaxonomy {
    fn default() -> Self {
        let category = |weight: f64, words: &[&str]| {
            (weight, words.iter().map(|w| w.to_string()).collect())
        };
        Self {
            categories: vec![
                category(
                    0.4,
                    &[
                        "detector", "panel", "alarm", "smoke", "heat", "fire", "simplex", "module",
                        "base",
                    ],
                ),
                category(
                    0.3,
                    &[
                        "sku", "model", "voltage", "current", "capacity", "loop", "channel", "zone",
                    ],
                ),
                category(
                    0.2,
                    &[
                        "compatible",
                        "requires",
                        "supports",
                        "operating",
                        "installation",
                        "wiring",
                    ],
                ),
                category(
                    0.1,
                    &["with", "to", "for", "in", "on", "by", "from", "using"],
                ),
            ],
        }
    }
}

impl DomainTaxonomy {
    /// Weighted share of each category's terms present in `text`.
    pub fn score(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        let mut total = 0.0;
        let mut weights = 0.0;
        for (weight, words) in &self.categories {
            if words.is_empty() {
                continue;
            }
            let matches = words.iter().filter(|w| lower.contains(w.as_str())).count();
            total += (matches as f64 / words.len() as f64).min(1.0) * weight;
            weights += weight;
        }
        if weights > 0.0 {
            total / weights
        } else {
            0.0
        }
    }
}

/// Lowercase, non-alphanumerics to spaces, collapsed whitespace.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tokens longer than two characters that are not stop words.
pub fn keywords(normalized: &str) -> Vec<&str> {
    normalized
        .split_whitespace()
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w))
        .collect()
}

pub fn cosine(a: &[&str], b: &[&str]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut freq_a: HashMap<&str, f64> = HashMap::new();
    let mut freq_b: HashMap<&str, f64> = HashMap::new();
    for word in a {
        *freq_a.entry(word).or_default() += 1.0;
    }
    for word in b {
        *freq_b.entry(word).or_default() += 1.0;
    }

    let dot: f64 = freq_a
        .iter()
        .filter_map(|(word, x)| freq_b.get(word).map(|y| x * y))
        .sum();
    let norm_a = freq_a.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = freq_b.values().map(|y| y * y).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn jaccard(a: &[&str], b: &[&str]) -> f64 {
    let set_a: HashSet<&str> = a.iter().copied().collect();
    let set_b: HashSet<&str> = b.iter().copied().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let union = set_a.union(&set_b).count();
    set_a.intersection(&set_b).count() as f64 / union as f64
}

/// Phrase overlap: neutral 0.5 when the query has no domain phrase.
pub fn phrase_overlap(query: &str, item: &str) -> f64 {
    let query_lower = query.to_lowercase();
    let item_lower = item.to_lowercase();

    let in_query: Vec<&Regex> = PHRASES.iter().filter(|re| re.is_match(&query_lower)).collect();
    if in_query.is_empty() {
        return 0.5;
    }
    let shared = in_query.iter().filter(|re| re.is_match(&item_lower)).count();
    let pattern_score = (shared as f64 / in_query.len() as f64).min(1.0);

    let query_terms: HashSet<&str> = query_lower.split_whitespace().collect();
    let item_terms: HashSet<&str> = item_lower.split_whitespace().collect();
    let term_overlap = if query_terms.is_empty() {
        0.0
    } else {
        query_terms.intersection(&item_terms).count() as f64 / query_terms.len() as f64
    };

    0.6 * pattern_score + 0.4 * term_overlap
}

/// Scores evidence against the query and drops what the session has seen.
#[derive(Debug, Clone)]
pub struct ScoringFilter {
    min_relevance: f64,
    taxonomy: DomainTaxonomy,
}

impl ScoringFilter {
    pub fn new(min_relevance: f64) -> Self {
        Self {
            min_relevance,
            taxonomy: DomainTaxonomy::default(),
        }
    }

    pub fn relevance(&self, query: &str, item_text: &str) -> f64 {
        let query_norm = normalize(query);
        let item_norm = normalize(item_text);
        let query_keywords = keywords(&query_norm);
        let item_keywords = keywords(&item_norm);

        let score = 0.35 * cosine(&query_keywords, &item_keywords)
            + 0.25 * jaccard(&query_keywords, &item_keywords)
            + 0.25 * self.taxonomy.score(item_text)
            + 0.15 * phrase_overlap(query, &item_norm);
        score.clamp(0.0, 1.0)
    }

    /// Score `candidates` (each with its confidence), keep the relevant
    /// ones not yet seen, record them in the session and return them
    /// ranked.
    pub fn filter(
        &self,
        query: &str,
        candidates: Vec<(Evidence, f64)>,
        session: &mut Session,
        iteration: usize,
    ) -> Vec<EvidenceItem> {
        let total = candidates.len();
        let mut duplicates = 0;
        let mut irrelevant = 0;
        let mut admitted = Vec::new();

        for (evidence, confidence) in candidates {
            let signature = evidence.signature();
            if session.is_seen(&signature) {
                duplicates += 1;
                continue;
            }

            let relevance = self.relevance(query, &evidence.text());
            if relevance < self.min_relevance {
                irrelevant += 1;
                continue;
            }

            let item = EvidenceItem {
                evidence,
                confidence,
                relevance,
                iteration,
                signature,
            };
            if session.admit(item.clone()) {
                admitted.push(item);
            } else {
                duplicates += 1;
            }
        }

        admitted.sort_by(|a, b| b.rank().total_cmp(&a.rank()));

        tracing::debug!(
            "Filter kept {} of {} ({} duplicate, {} below relevance {:.2})",
            admitted.len(),
            total,
            duplicates,
            irrelevant,
            self.min_relevance
        );
        admitted
    }
}
