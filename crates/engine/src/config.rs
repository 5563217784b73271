//! Engine configuration.
//!
//! Read from the `engine:` section of `.kgqa/config.yaml`; every field has
//! a default so the section (or the file) may be absent.

use crate::types::RetrievalMethod;
use kgqa_core::{AppConfig, AppError, AppResult};
use kgqa_llm::LlmRequest;
use kgqa_prompt::BuiltPrompt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base confidence per retrieval method plus boosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfidenceTable {
    pub entity_link: f64,
    pub query: f64,
    pub triplet: f64,
    pub path: f64,
    /// Added when the payload carries identifier fields
    pub identifier_boost: f64,
    /// Added when the payload carries a long description
    pub description_boost: f64,
    pub description_min_len: usize,
}

impl Default for ConfidenceTable {
    fn default() -> Self {
        Self {
            entity_link: 0.9,
            query: 0.8,
            triplet: 0.7,
            path: 0.6,
            identifier_boost: 0.1,
            description_boost: 0.1,
            description_min_len: 50,
        }
    }
}

impl ConfidenceTable {
    pub fn base(&self, method: RetrievalMethod) -> f64 {
        match method {
            RetrievalMethod::EntityLink => self.entity_link,
            RetrievalMethod::Query => self.query,
            RetrievalMethod::Triplet => self.triplet,
            RetrievalMethod::Path => self.path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkingConfig {
    /// Fuzzy matches must score strictly above this
    pub fuzzy_threshold: f64,
    /// Candidate nodes scanned per mention
    pub fuzzy_candidates: usize,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.7,
            fuzzy_candidates: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrievalLimits {
    pub max_paths: usize,
    pub path_rows: usize,
    pub max_triplet_entities: usize,
    pub triplets_per_entity: usize,
    /// Cap appended to queries that have none
    pub query_row_cap: usize,
    pub method_timeout_secs: u64,
}

impl Default for RetrievalLimits {
    fn default() -> Self {
        Self {
            max_paths: 15,
            path_rows: 50,
            max_triplet_entities: 25,
            triplets_per_entity: 50,
            query_row_cap: 100,
            method_timeout_secs: 30,
        }
    }
}

impl RetrievalLimits {
    pub fn method_timeout(&self) -> Duration {
        Duration::from_secs(self.method_timeout_secs)
    }
}

/// Model and sampling for one kind of completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSettings {
    #[serde(default)]
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CallSettings {
    fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            model: None,
            temperature,
            max_tokens,
        }
    }

    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default)
    }

    /// Completion request for a rendered prompt.
    pub fn request(&self, prompt: &BuiltPrompt, default_model: &str) -> LlmRequest {
        let request = LlmRequest::new(prompt.user.clone(), self.model_or(default_model))
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        match &prompt.system {
            Some(system) => request.with_system(system.clone()),
            None => request,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallsConfig {
    pub analyzer: CallSettings,
    pub baseline: CallSettings,
    pub grounded: CallSettings,
    pub judge: CallSettings,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            analyzer: CallSettings::new(0.1, 2000),
            baseline: CallSettings::new(0.1, 500),
            grounded: CallSettings::new(0.05, 3000),
            judge: CallSettings::new(0.1, 1000),
        }
    }
}

/// A system class and how many addressable points it supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemTier {
    pub name: String,
    pub capacity: u32,
}

/// Deterministic sizing rules used by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RulesConfig {
    /// Ordered smallest first
    pub tiers: Vec<SystemTier>,
    pub detector_base_sku: String,
    pub speaker_circuit_amps: f64,
    pub speaker_draw_amps: f64,
    pub nac_circuit_amps: f64,
    pub strobe_draw_amps: f64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                SystemTier {
                    name: "4007ES".to_string(),
                    capacity: 159,
                },
                SystemTier {
                    name: "4010ES".to_string(),
                    capacity: 318,
                },
                SystemTier {
                    name: "4100ES".to_string(),
                    capacity: 636,
                },
            ],
            detector_base_sku: "4098-9792".to_string(),
            speaker_circuit_amps: 2.0,
            speaker_draw_amps: 0.042,
            nac_circuit_amps: 3.0,
            strobe_draw_amps: 0.135,
        }
    }
}

/// Settings for one `process_query` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Default model for every call without its own
    pub model: String,
    pub max_iterations: usize,
    /// Items above this confidence are always carried in the context
    pub high_confidence: f64,
    pub high_context_limit: usize,
    pub min_relevance: f64,
    /// Drop itemized lines whose sku is not in the evidence
    pub restrict_items_to_evidence: bool,
    pub confidence: ConfidenceTable,
    pub linking: LinkingConfig,
    pub limits: RetrievalLimits,
    pub calls: CallsConfig,
    pub rules: RulesConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            max_iterations: 2,
            high_confidence: 0.8,
            high_context_limit: 5,
            min_relevance: 0.1,
            restrict_items_to_evidence: true,
            confidence: ConfidenceTable::default(),
            linking: LinkingConfig::default(),
            limits: RetrievalLimits::default(),
            calls: CallsConfig::default(),
            rules: RulesConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EngineSection {
    #[serde(default)]
    engine: Option<EngineConfig>,
}

impl EngineConfig {
    /// Load the `engine:` section of a YAML config file, or defaults when
    /// the file or section is missing.
    pub fn load(config_path: &Path) -> AppResult<Self> {
        if !config_path.exists() {
            tracing::debug!("No config file at {:?}; using engine defaults", config_path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path).map_err(|e| {
            AppError::Config(format!("Failed to read config at {:?}: {}", config_path, e))
        })?;

        let section: EngineSection = serde_yaml::from_str(&content).map_err(|e| {
            AppError::Config(format!("Failed to parse engine config at {:?}: {}", config_path, e))
        })?;

        Ok(section.engine.unwrap_or_default())
    }

    /// Engine settings for an application config; the application model is
    /// used unless the engine section names its own.
    pub fn for_app(app: &AppConfig) -> AppResult<Self> {
        let path: PathBuf = app
            .config_file
            .clone()
            .unwrap_or_else(|| app.state_dir().join("config.yaml"));

        let has_model = Self::section_sets_model(&path);
        let mut config = Self::load(&path)?;
        if !has_model {
            config.model = app.model.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn section_sets_model(path: &Path) -> bool {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| {
                serde_yaml::from_str::<HashMap<String, serde_yaml::Value>>(&content).ok()
            })
            .and_then(|root| root.get("engine").cloned())
            .and_then(|engine| engine.get("model").cloned())
            .is_some()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_iterations == 0 {
            return Err(AppError::Config(
                "engine.maxIterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(AppError::Config(
                "engine.minRelevance must be within [0, 1]".to_string(),
            ));
        }
        if self.rules.tiers.is_empty() {
            return Err(AppError::Config(
                "engine.rules.tiers must not be empty".to_string(),
            ));
        }
        if self
            .rules
            .tiers
            .windows(2)
            .any(|pair| pair[0].capacity > pair[1].capacity)
        {
            return Err(AppError::Config(
                "engine.rules.tiers must be ordered by capacity".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_file_missing() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::load(&temp.path().join("config.yaml")).unwrap();
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.calls.grounded.max_tokens, 3000);
        assert_eq!(config.rules.tiers[0].capacity, 159);
        assert_eq!(config.confidence.base(RetrievalMethod::Path), 0.6);
    }

    #[test]
    fn test_partial_engine_section() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
llm:
  activeProvider: ollama
engine:
  maxIterations: 3
  confidence:
    identifierBoost: 0.05
  calls:
    judge:
      model: judge-model
      temperature: 0.0
      maxTokens: 800
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.confidence.identifier_boost, 0.05);
        assert_eq!(config.confidence.entity_link, 0.9);
        assert_eq!(config.calls.judge.model_or("llama3.2"), "judge-model");
        assert_eq!(config.calls.analyzer.max_tokens, 2000);
    }

    #[test]
    fn test_for_app_uses_app_model() {
        let temp = TempDir::new().unwrap();
        let app = AppConfig {
            workspace: temp.path().to_path_buf(),
            model: "mistral".to_string(),
            ..Default::default()
        };
        let config = EngineConfig::for_app(&app).unwrap();
        assert_eq!(config.model, "mistral");
    }

    #[test]
    fn test_unordered_tiers_rejected() {
        let mut config = EngineConfig::default();
        config.rules.tiers.reverse();
        assert!(config.validate().is_err());
    }
}
