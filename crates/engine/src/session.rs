//! Per-query state: accumulated evidence and the seen-fact set.

use crate::types::{EvidenceItem, IterationRecord};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

/// State owned by one `process_query` run. Evidence is append-only and
/// the seen set only grows.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    seen: HashSet<String>,
    evidence: Vec<EvidenceItem>,
    records: Vec<IterationRecord>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            seen: HashSet::new(),
            evidence: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_seen(&self, signature: &str) -> bool {
        self.seen.contains(signature)
    }

    /// Append `item` unless its signature was already recorded.
    /// Returns whether the item was new.
    pub fn admit(&mut self, item: EvidenceItem) -> bool {
        if !self.seen.insert(item.signature.clone()) {
            return false;
        }
        self.evidence.push(item);
        true
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        &self.evidence
    }

    pub fn into_evidence(self) -> Vec<EvidenceItem> {
        self.evidence
    }

    pub fn unique_facts(&self) -> usize {
        self.seen.len()
    }

    pub fn push_record(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Context handed to the analyzer: the latest `high_limit` items above
    /// `high_confidence`, then everything found in the most recent round.
    pub fn progressive_context(&self, high_confidence: f64, high_limit: usize) -> Option<String> {
        let high: Vec<&EvidenceItem> = self
            .evidence
            .iter()
            .filter(|item| item.confidence > high_confidence)
            .collect();
        let high = &high[high.len().saturating_sub(high_limit)..];

        let latest_round = self.records.last().map(|record| record.iteration);
        let recent: Vec<&EvidenceItem> = self
            .evidence
            .iter()
            .filter(|item| Some(item.iteration) == latest_round)
            .filter(|item| !high.iter().any(|h| h.signature == item.signature))
            .collect();

        if high.is_empty() && recent.is_empty() {
            return None;
        }

        let mut sections = Vec::new();
        if !high.is_empty() {
            let mut lines = vec!["=== HIGH CONFIDENCE FINDINGS ===".to_string()];
            lines.extend(high.iter().map(|item| {
                format!(
                    "- [{}] {} (confidence {:.2})",
                    item.method(),
                    item.evidence.render(),
                    item.confidence
                )
            }));
            sections.push(lines.join("\n"));
        }
        if !recent.is_empty() {
            let mut lines = vec!["=== RECENT DISCOVERIES ===".to_string()];
            lines.extend(
                recent
                    .iter()
                    .map(|item| format!("- [{}] {}", item.method(), item.evidence.render())),
            );
            sections.push(lines.join("\n"));
        }

        Some(sections.join("\n\n"))
    }
}
