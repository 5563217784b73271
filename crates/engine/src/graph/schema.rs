//! Graph schema description handed to the query analyzer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node types with their notable properties, and relationship types with
/// a short description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSchema {
    pub nodes: BTreeMap<String, Vec<String>>,
    pub relationships: BTreeMap<String, String>,
}

impl Default for GraphSchema {
    fn default() -> Self {
        let nodes = [
            ("Panel", &["sku", "name", "capacity", "loop_capacity", "description"][..]),
            ("Module", &["sku", "name", "type", "channels"]),
            ("Detector", &["sku", "name", "detector_type", "sensitivity", "operating_voltage"]),
            ("Base", &["sku", "name", "type", "compatibility", "sounder_capability"]),
            ("ManualStation", &["sku", "name", "type", "mounting"]),
            ("Notification", &["sku", "name", "type", "current_draw", "wattage"]),
            ("License", &["license_sku", "name", "description", "duration"]),
            ("Annunciator", &["sku", "name", "display_type", "zones"]),
            ("PowerSupply", &["sku", "name", "voltage", "current_rating"]),
            ("Battery", &["sku", "name", "voltage", "amp_hours"]),
            ("Accessory", &["sku", "name", "type", "compatibility"]),
        ]
        .into_iter()
        .map(|(name, props)| {
            (
                name.to_string(),
                props.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect();

        let relationships = [
            ("COMPATIBLE_WITH", "Indicates two products can work together"),
            ("REQUIRES_BASE", "Detector must be mounted on the given base"),
            ("HAS_BASE", "Detector can use the given base"),
            ("HAS_MODULE", "Panel or system includes a specific module"),
            ("REQUIRES_MODULE", "System requires a specific module for operation"),
            ("REQUIRES_LICENSE", "Product requires a specific license"),
            ("ALTERNATIVE_TO", "Product can be used as an alternative to another"),
            ("PART_OF", "Component is part of a larger system"),
            ("REQUIRES_POWER_SUPPLY", "Component requires a specific power supply"),
            ("USES_BATTERY", "Device uses a specific battery for backup"),
            ("POWERED_BY", "Device is powered by another component"),
        ]
        .into_iter()
        .map(|(name, desc)| (name.to_string(), desc.to_string()))
        .collect();

        Self {
            nodes,
            relationships,
        }
    }
}

impl GraphSchema {
    /// Text block for the analyzer prompt, including the storage layout the
    /// model writes SQL against.
    pub fn describe(&self) -> String {
        let mut lines = vec!["Node Types:".to_string()];
        for (node_type, props) in &self.nodes {
            lines.push(format!("  - {}: {}", node_type, props.join(", ")));
        }

        lines.push(String::new());
        lines.push("Relationship Types:".to_string());
        for (rel_type, description) in &self.relationships {
            lines.push(format!("  - {}: {}", rel_type, description));
        }

        lines.push(String::new());
        lines.push("Storage (SQLite, read-only):".to_string());
        lines.push(
            "  nodes(node_type, identifier, secondary_id, name, attributes JSON, source)"
                .to_string(),
        );
        lines.push(
            "  edges(id, rel_type, from_type, from_id, to_type, to_id, properties JSON, weight)"
                .to_string(),
        );
        lines.push(
            "  The sku is stored in nodes.identifier; other properties live in \
             nodes.attributes (use json_extract(attributes, '$.capacity'))."
                .to_string(),
        );

        lines.join("\n")
    }

    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.nodes
            .keys()
            .any(|known| known.eq_ignore_ascii_case(node_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_description() {
        let schema = GraphSchema::default();
        let text = schema.describe();
        assert!(text.contains("  - Detector: sku, name"));
        assert!(text.contains("REQUIRES_BASE"));
        assert!(text.contains("json_extract"));
        assert!(schema.has_node_type("panel"));
    }
}
