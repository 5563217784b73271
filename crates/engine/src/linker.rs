//! Resolves entity mentions to graph nodes.

use crate::config::LinkingConfig;
use crate::graph::{GraphNode, GraphStore, NodeField};
use crate::types::{EntityMention, LinkedEntity, MatchType};
use futures::future::join_all;
use kgqa_core::AppResult;
use std::collections::HashSet;
use std::sync::Arc;

/// Exact lookups are tried in this order; the name never beats an identifier.
const EXACT_FIELDS: [NodeField; 3] = [NodeField::Identifier, NodeField::SecondaryId, NodeField::Name];

/// String similarity in [0, 1]: 1.0 for case-insensitive equality, 0.8 when
/// one contains the other, else shared distinct characters over the longer
/// length.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let mut score: f64 = 0.0;
    if a.contains(&b) || b.contains(&a) {
        score = 0.8;
    }

    let chars_a: HashSet<char> = a.chars().collect();
    let chars_b: HashSet<char> = b.chars().collect();
    let common = chars_a.intersection(&chars_b).count();
    let longest = a.chars().count().max(b.chars().count());
    score.max(common as f64 / longest as f64)
}

fn node_similarity(mention: &str, node: &GraphNode) -> f64 {
    [Some(node.identifier.as_str()), node.secondary_id.as_deref(), Some(node.name.as_str())]
        .into_iter()
        .flatten()
        .map(|value| similarity(mention, value))
        .fold(0.0, f64::max)
}

pub struct EntityLinker {
    store: Arc<dyn GraphStore>,
    config: LinkingConfig,
}

impl EntityLinker {
    pub fn new(store: Arc<dyn GraphStore>, config: LinkingConfig) -> Self {
        Self { store, config }
    }

    async fn exact(&self, mention: &EntityMention) -> AppResult<Option<GraphNode>> {
        for field in EXACT_FIELDS {
            let found = self
                .store
                .lookup(&mention.entity_type, field, mention.identifier.trim())
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn fuzzy(&self, mention: &EntityMention) -> AppResult<Option<(GraphNode, f64)>> {
        let candidates = self
            .store
            .nodes_of_type(&mention.entity_type, self.config.fuzzy_candidates)
            .await?;

        let mut best: Option<(GraphNode, f64)> = None;
        for node in candidates {
            let score = node_similarity(&mention.identifier, &node);
            if best.as_ref().map_or(true, |(_, top)| score > *top) {
                best = Some((node, score));
            }
        }

        Ok(best.filter(|(_, score)| *score > self.config.fuzzy_threshold))
    }

    /// Resolve one mention: exact first, then fuzzy.
    pub async fn link_one(&self, mention: &EntityMention) -> AppResult<Option<LinkedEntity>> {
        if let Some(node) = self.exact(mention).await? {
            return Ok(Some(LinkedEntity {
                mention: mention.clone(),
                node,
                match_type: MatchType::Exact,
                score: None,
            }));
        }

        Ok(self.fuzzy(mention).await?.map(|(node, score)| LinkedEntity {
            mention: mention.clone(),
            node,
            match_type: MatchType::Fuzzy,
            score: Some(score),
        }))
    }

    /// Resolve every mention; failures for one mention are logged and skipped.
    pub async fn link(&self, mentions: &[EntityMention]) -> Vec<LinkedEntity> {
        let results = join_all(mentions.iter().map(|mention| self.link_one(mention))).await;

        let mut linked = Vec::new();
        for (mention, result) in mentions.iter().zip(results) {
            match result {
                Ok(Some(entity)) => linked.push(entity),
                Ok(None) => tracing::debug!(
                    "No node for {} '{}'",
                    mention.entity_type,
                    mention.identifier
                ),
                Err(e) => tracing::warn!(
                    "Linking {} '{}' failed: {}",
                    mention.entity_type,
                    mention.identifier,
                    e
                ),
            }
        }

        tracing::info!("Linked {} of {} entities", linked.len(), mentions.len());
        linked
    }
}
