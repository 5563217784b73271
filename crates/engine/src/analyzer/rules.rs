//! Deterministic extraction from the raw query text.
//!
//! Quantity + device patterns, total addressable points, system class
//! selection by capacity, detector base requirements and circuit counts.
//! No external calls.

use crate::config::{RulesConfig, SystemTier};
use crate::graph::GraphQuery;
use crate::types::{EntityMention, Provenance};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static DEVICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(smoke\s*detector|heat\s*detector|manual\s*station|speaker|strobe)")
        .expect("device pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    SmokeDetector,
    HeatDetector,
    ManualStation,
    Speaker,
    Strobe,
}

impl DeviceKind {
    fn from_match(text: &str) -> Option<Self> {
        let compact: String = text
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        match compact.as_str() {
            "smokedetector" => Some(Self::SmokeDetector),
            "heatdetector" => Some(Self::HeatDetector),
            "manualstation" => Some(Self::ManualStation),
            "speaker" => Some(Self::Speaker),
            "strobe" => Some(Self::Strobe),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SmokeDetector => "smoke detector",
            Self::HeatDetector => "heat detector",
            Self::ManualStation => "manual station",
            Self::Speaker => "speaker",
            Self::Strobe => "strobe",
        }
    }

    /// Graph node type the device is stored under.
    pub fn node_type(&self) -> &'static str {
        match self {
            Self::SmokeDetector | Self::HeatDetector => "Detector",
            Self::ManualStation => "ManualStation",
            Self::Speaker | Self::Strobe => "Notification",
        }
    }

    pub fn is_detector(&self) -> bool {
        matches!(self, Self::SmokeDetector | Self::HeatDetector)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCount {
    pub kind: DeviceKind,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSelection {
    pub name: String,
    pub capacity: u32,
    pub required_points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseRequirement {
    pub detector: DeviceKind,
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitKind {
    Speaker,
    Notification,
}

impl CircuitKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Speaker => "speaker",
            Self::Notification => "notification appliance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitEstimate {
    pub kind: CircuitKind,
    pub devices: u32,
    pub circuits: u32,
}

/// Everything the rules found in one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleFindings {
    pub devices: Vec<DeviceCount>,
    pub total_points: u32,
    pub tier: Option<TierSelection>,
    pub bases: Vec<BaseRequirement>,
    pub circuits: Vec<CircuitEstimate>,
}

impl RuleFindings {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn has_detectors(&self) -> bool {
        self.devices.iter().any(|d| d.kind.is_detector())
    }

    pub fn mentions(&self) -> Vec<EntityMention> {
        let mut mentions: Vec<EntityMention> = self
            .devices
            .iter()
            .map(|device| {
                EntityMention::new(device.kind.node_type(), device.kind.label(), Provenance::Rule)
                    .with_quantity(device.quantity)
            })
            .collect();

        if let Some(tier) = &self.tier {
            mentions.push(
                EntityMention::new("Panel", tier.name.clone(), Provenance::Rule).with_quantity(1),
            );
        }

        for base in &self.bases {
            mentions.push(
                EntityMention::new("Base", base.sku.clone(), Provenance::Rule)
                    .with_quantity(base.quantity)
                    .with_role(format!("base-for:{}", base.detector.label())),
            );
        }

        mentions
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if self.has_detectors() {
            paths.push("Detector->REQUIRES_BASE->Base".to_string());
            paths.push("Detector->COMPATIBLE_WITH->Panel".to_string());
        }
        if self.tier.is_some() {
            paths.push("Panel->HAS_MODULE->Module".to_string());
        }
        paths
    }

    pub fn queries(&self) -> Vec<GraphQuery> {
        let mut queries = Vec::new();

        if let Some(tier) = &self.tier {
            queries.push(
                GraphQuery::new(
                    "system class with enough capacity",
                    "SELECT identifier, name, json_extract(attributes, '$.capacity') AS capacity \
                     FROM nodes WHERE node_type = 'Panel' \
                     AND json_extract(attributes, '$.capacity') >= :points \
                     ORDER BY capacity LIMIT 3",
                )
                .with_param("points", tier.required_points),
            );
            queries.push(
                GraphQuery::new(
                    "modules for the selected panel",
                    "SELECT m.identifier, m.name, e.rel_type FROM edges e \
                     JOIN nodes m ON m.node_type = e.to_type AND m.identifier = e.to_id \
                     WHERE e.rel_type = 'HAS_MODULE' AND e.from_id = :panel",
                )
                .with_param("panel", tier.name.clone()),
            );
        }

        for base in &self.bases {
            let pattern = match base.detector {
                DeviceKind::HeatDetector => "%heat%",
                _ => "%smoke%",
            };
            queries.push(
                GraphQuery::new(
                    format!("base required for {}", base.detector.label()),
                    "SELECT d.identifier AS detector_sku, d.name AS detector_name, \
                     b.identifier AS base_sku, b.name AS base_name, e.properties AS requirement \
                     FROM edges e \
                     JOIN nodes d ON d.node_type = e.from_type AND d.identifier = e.from_id \
                     JOIN nodes b ON b.node_type = e.to_type AND b.identifier = e.to_id \
                     WHERE e.rel_type = 'REQUIRES_BASE' AND d.name LIKE :pattern",
                )
                .with_param("pattern", pattern),
            );
        }

        queries
    }

    /// Short narrative used when the model gives no draft.
    pub fn summary(&self) -> String {
        if self.devices.is_empty() {
            return String::new();
        }

        let devices: Vec<String> = self
            .devices
            .iter()
            .map(|d| format!("{} x {}", d.quantity, d.kind.label()))
            .collect();
        let mut text = format!(
            "Requested devices: {} ({} addressable points).",
            devices.join(", "),
            self.total_points
        );
        if let Some(tier) = &self.tier {
            text.push_str(&format!(
                " Suggested system class: {} (capacity {}).",
                tier.name, tier.capacity
            ));
        }
        for base in &self.bases {
            text.push_str(&format!(
                " Each {} needs base {} ({} total).",
                base.detector.label(),
                base.sku,
                base.quantity
            ));
        }
        for circuit in &self.circuits {
            text.push_str(&format!(
                " {} {} devices need {} circuit(s).",
                circuit.devices,
                circuit.kind.label(),
                circuit.circuits
            ));
        }
        text
    }
}

fn circuits_needed(devices: u32, draw: f64, capacity: f64) -> u32 {
    if capacity <= 0.0 {
        return 0;
    }
    (f64::from(devices) * draw / capacity).ceil() as u32
}

/// Pattern rules over the query text.
#[derive(Debug, Clone)]
pub struct RuleExtractor {
    rules: RulesConfig,
}

impl RuleExtractor {
    pub fn new(rules: RulesConfig) -> Self {
        Self { rules }
    }

    /// Smallest class whose capacity covers `points`, else the largest.
    pub fn select_tier(&self, points: u32) -> Option<&SystemTier> {
        self.rules
            .tiers
            .iter()
            .find(|tier| tier.capacity >= points)
            .or_else(|| self.rules.tiers.last())
    }

    pub fn extract(&self, query: &str) -> RuleFindings {
        let mut findings = RuleFindings::default();

        for captures in DEVICE_RE.captures_iter(query) {
            let quantity = captures.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
            let kind = captures.get(2).and_then(|m| DeviceKind::from_match(m.as_str()));
            let (Some(quantity), Some(kind)) = (quantity, kind) else {
                continue;
            };

            findings.total_points = findings.total_points.saturating_add(quantity);
            findings.devices.push(DeviceCount { kind, quantity });

            if kind.is_detector() {
                findings.bases.push(BaseRequirement {
                    detector: kind,
                    sku: self.rules.detector_base_sku.clone(),
                    quantity,
                });
            }

            match kind {
                DeviceKind::Speaker => findings.circuits.push(CircuitEstimate {
                    kind: CircuitKind::Speaker,
                    devices: quantity,
                    circuits: circuits_needed(
                        quantity,
                        self.rules.speaker_draw_amps,
                        self.rules.speaker_circuit_amps,
                    ),
                }),
                DeviceKind::Strobe => findings.circuits.push(CircuitEstimate {
                    kind: CircuitKind::Notification,
                    devices: quantity,
                    circuits: circuits_needed(
                        quantity,
                        self.rules.strobe_draw_amps,
                        self.rules.nac_circuit_amps,
                    ),
                }),
                _ => {}
            }
        }

        if findings.total_points > 0 {
            if let Some(tier) = self.select_tier(findings.total_points) {
                findings.tier = Some(TierSelection {
                    name: tier.name.clone(),
                    capacity: tier.capacity,
                    required_points: findings.total_points,
                });
            }
        }

        tracing::debug!(
            "Rules found {} device group(s), {} points",
            findings.devices.len(),
            findings.total_points
        );
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> RuleExtractor {
        RuleExtractor::new(RulesConfig::default())
    }

    #[test]
    fn test_smoke_detectors_small_office() {
        let findings = extractor().extract("I need 10 smoke detectors for a small office");

        assert_eq!(
            findings.devices,
            vec![DeviceCount {
                kind: DeviceKind::SmokeDetector,
                quantity: 10
            }]
        );
        let tier = findings.tier.as_ref().unwrap();
        assert_eq!(tier.name, "4007ES");
        assert_eq!(tier.required_points, 10);
        assert_eq!(findings.bases[0].sku, "4098-9792");
        assert_eq!(findings.bases[0].quantity, 10);

        let mentions = findings.mentions();
        assert_eq!(mentions.len(), 3);
        assert!(mentions.iter().all(|m| m.provenance == Provenance::Rule));
        assert_eq!(mentions[2].merge_key(), "base-for:smoke detector");
    }

    #[test]
    fn test_tier_boundaries() {
        let rules = extractor();
        assert_eq!(rules.select_tier(159).unwrap().name, "4007ES");
        assert_eq!(rules.select_tier(160).unwrap().name, "4010ES");
        assert_eq!(rules.select_tier(318).unwrap().name, "4010ES");
        assert_eq!(rules.select_tier(5000).unwrap().name, "4100ES");
    }

    #[test]
    fn test_points_sum_across_devices() {
        let findings =
            extractor().extract("200 smoke detectors, 100 heat detectors and 20 manual stations");
        assert_eq!(findings.total_points, 320);
        assert_eq!(findings.tier.unwrap().name, "4100ES");
        assert_eq!(findings.bases.len(), 2);
    }

    #[test]
    fn test_circuit_estimates() {
        let findings = extractor().extract("Add 100 speakers and 50 strobes");
        assert_eq!(
            findings.circuits,
            vec![
                CircuitEstimate {
                    kind: CircuitKind::Speaker,
                    devices: 100,
                    circuits: 3,
                },
                CircuitEstimate {
                    kind: CircuitKind::Notification,
                    devices: 50,
                    circuits: 3,
                },
            ]
        );
    }

    #[test]
    fn test_summary_uses_circuit_labels() {
        let summary = extractor().extract("Add 100 speakers and 50 strobes").summary();
        assert!(summary.contains("100 speaker devices need 3 circuit(s)."));
        assert!(summary.contains("50 notification appliance devices need 3 circuit(s)."));
        assert!(!summary.contains("Speaker"));
        assert!(!summary.contains("Notification"));
    }

    #[test]
    fn test_no_devices() {
        let findings = extractor().extract("Which panel supports networking?");
        assert!(findings.is_empty());
        assert!(findings.tier.is_none());
        assert!(findings.queries().is_empty());
        assert!(findings.summary().is_empty());
    }
}
