//! Configuration management for KGQA.
//!
//! Configuration is merged from several sources, later ones winning:
//! - Built-in defaults
//! - The workspace config file (`.kgqa/config.yaml`)
//! - Environment variables (`KGQA_*`)
//! - Command-line flags
//!
//! The configuration is workspace-centric: the graph file, the response
//! cache and prompt overrides live under `.kgqa/`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

/// Name of the per-workspace state directory.
pub const STATE_DIR: &str = ".kgqa";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the workspace root (contains .kgqa/)
    pub workspace: PathBuf,

    /// Optional config file path
    pub config_file: Option<PathBuf>,

    /// Completion provider ("ollama", "openai")
    pub provider: String,

    /// Default model identifier
    pub model: String,

    /// Endpoint override for the active provider
    pub endpoint: Option<String>,

    /// API key for the completion provider
    pub api_key: Option<String>,

    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,

    /// Log level override
    pub log_level: Option<String>,

    /// Log format ("pretty" or "json")
    pub log_format: String,

    /// Verbose mode (enables debug logging)
    pub verbose: bool,

    /// Disable colored output
    pub no_color: bool,

    /// Graph database file; relative paths resolve against the workspace
    pub graph_path: PathBuf,

    /// Response cache settings
    pub cache: CacheSettings,

    /// Provider-specific configurations from config.yaml
    pub providers: HashMap<String, ProviderConfig>,
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    /// Whether completion calls are cached
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory; relative paths resolve against the workspace
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Entry lifetime in hours
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Byte budget in megabytes
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Minimum seconds between eager expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(STATE_DIR).join("cache")
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            ttl_hours: default_ttl_hours(),
            max_size_mb: default_max_size_mb(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Provider-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderConfig {
    OpenAI {
        #[serde(rename = "apiKeyEnv")]
        api_key_env: String,
        model: String,
        endpoint: Option<String>,
    },
    Ollama {
        endpoint: String,
        model: String,
        timeout: Option<u64>,
    },
}

impl ProviderConfig {
    /// Model configured for this provider.
    pub fn model(&self) -> &str {
        match self {
            Self::OpenAI { model, .. } | Self::Ollama { model, .. } => model,
        }
    }

    /// Endpoint configured for this provider, if any.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::OpenAI { endpoint, .. } => endpoint.as_deref(),
            Self::Ollama { endpoint, .. } => Some(endpoint),
        }
    }
}

/// Full configuration file structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    llm: Option<LlmSection>,
    graph: Option<GraphSection>,
    cache: Option<CacheSettings>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LlmSection {
    #[serde(rename = "activeProvider")]
    active_provider: String,
    #[serde(rename = "timeoutSecs")]
    timeout_secs: Option<u64>,
    #[serde(default)]
    providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphSection {
    path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggingSection {
    level: Option<String>,
    color: Option<bool>,
    format: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            provider: "ollama".to_string(), // Local-first default
            model: "llama3.2".to_string(),
            endpoint: None,
            api_key: None,
            request_timeout_secs: 60,
            log_level: None,
            log_format: "pretty".to_string(),
            verbose: false,
            no_color: false,
            graph_path: PathBuf::from(STATE_DIR).join("graph.sqlite"),
            cache: CacheSettings::default(),
            providers: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, the workspace config file and
    /// environment variables.
    ///
    /// Environment variables:
    /// - `KGQA_WORKSPACE`: Override workspace path
    /// - `KGQA_CONFIG`: Path to config file
    /// - `KGQA_PROVIDER`: Completion provider
    /// - `KGQA_MODEL`: Model identifier
    /// - `KGQA_API_KEY`: API key
    /// - `KGQA_GRAPH`: Graph database file
    /// - `RUST_LOG`: Log level
    /// - `NO_COLOR`: Disable colored output
    ///
    /// # Example
    /// ```no_run
    /// use kgqa_core::config::AppConfig;
    ///
    /// let config = AppConfig::load().expect("Failed to load config");
    /// println!("Graph: {:?}", config.graph_file());
    /// ```
    pub fn load() -> AppResult<Self> {
        let mut config = Self::default();

        if let Ok(workspace) = std::env::var("KGQA_WORKSPACE") {
            config.workspace = PathBuf::from(workspace);
        }

        if let Ok(config_file) = std::env::var("KGQA_CONFIG") {
            config.config_file = Some(PathBuf::from(config_file));
        }

        if !config.workspace.exists() {
            return Err(AppError::Config(format!(
                "Workspace directory does not exist: {:?}",
                config.workspace
            )));
        }

        let config_path = config
            .config_file
            .clone()
            .unwrap_or_else(|| config.state_dir().join("config.yaml"));

        if config_path.exists() {
            config = config.merge_yaml(&config_path)?;
        }

        // Environment variables override YAML config
        if let Ok(provider) = std::env::var("KGQA_PROVIDER") {
            config.provider = provider;
        }

        if let Ok(model) = std::env::var("KGQA_MODEL") {
            config.model = model;
        }

        if let Ok(graph) = std::env::var("KGQA_GRAPH") {
            config.graph_path = PathBuf::from(graph);
        }

        config.api_key = std::env::var("KGQA_API_KEY").ok();

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.log_level = Some(level);
        }

        if std::env::var("NO_COLOR").is_ok() {
            config.no_color = true;
        }

        Ok(config)
    }

    /// Merge a YAML configuration file into a copy of this config.
    fn merge_yaml(&self, path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config_file: ConfigFile = serde_yaml::from_str(&contents).map_err(|e| {
            AppError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        let mut result = self.clone();

        if let Some(logging) = config_file.logging {
            if let Some(level) = logging.level {
                result.log_level = Some(level);
            }
            if let Some(color) = logging.color {
                result.no_color = !color;
            }
            if let Some(format) = logging.format {
                result.log_format = format;
            }
        }

        if let Some(graph) = config_file.graph {
            if let Some(path) = graph.path {
                result.graph_path = PathBuf::from(path);
            }
        }

        if let Some(cache) = config_file.cache {
            result.cache = cache;
        }

        if let Some(llm) = config_file.llm {
            result.provider = llm.active_provider.clone();

            if let Some(timeout) = llm.timeout_secs {
                result.request_timeout_secs = timeout;
            }

            if let Some(provider_config) = llm.providers.get(&llm.active_provider) {
                result.model = provider_config.model().to_string();
                result.endpoint = provider_config.endpoint().map(str::to_string);
                if let ProviderConfig::Ollama {
                    timeout: Some(timeout),
                    ..
                } = provider_config
                {
                    result.request_timeout_secs = *timeout;
                }
            }

            result.providers = llm.providers;
        }

        tracing::debug!("Merged config file {:?}", path);
        Ok(result)
    }

    /// Apply CLI overrides to the configuration.
    ///
    /// Command-line flags take precedence over environment variables and
    /// the config file.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        workspace: Option<PathBuf>,
        config_file: Option<PathBuf>,
        provider: Option<String>,
        model: Option<String>,
        graph: Option<PathBuf>,
        log_level: Option<String>,
        verbose: bool,
        no_color: bool,
    ) -> Self {
        if let Some(workspace) = workspace {
            self.workspace = workspace;
        }

        if let Some(config_file) = config_file {
            self.config_file = Some(config_file);
        }

        if let Some(provider) = provider {
            self.provider = provider;
        }

        if let Some(model) = model {
            self.model = model;
        }

        if let Some(graph) = graph {
            self.graph_path = graph;
        }

        if let Some(log_level) = log_level {
            self.log_level = Some(log_level);
        }

        if verbose {
            self.verbose = true;
            // Verbose mode implies debug logging
            if self.log_level.is_none() {
                self.log_level = Some("debug".to_string());
            }
        }

        if no_color {
            self.no_color = true;
        }

        self
    }

    /// Get the path to the .kgqa directory.
    pub fn state_dir(&self) -> PathBuf {
        self.workspace.join(STATE_DIR)
    }

    /// Ensure the .kgqa directory exists.
    pub fn ensure_state_dir(&self) -> AppResult<()> {
        let state_dir = self.state_dir();
        if !state_dir.exists() {
            std::fs::create_dir_all(&state_dir).map_err(|e| {
                AppError::Config(format!("Failed to create {} directory: {}", STATE_DIR, e))
            })?;
        }
        Ok(())
    }

    /// Absolute path of the graph database file.
    pub fn graph_file(&self) -> PathBuf {
        self.resolve(&self.graph_path)
    }

    /// Absolute path of the response cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(&self.cache.dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Resolve the API key for the active provider.
    ///
    /// `KGQA_API_KEY` wins; otherwise the provider's `apiKeyEnv` variable
    /// is consulted.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            return Some(key.clone());
        }

        match self.providers.get(&self.provider) {
            Some(ProviderConfig::OpenAI { api_key_env, .. }) => std::env::var(api_key_env).ok(),
            _ => None,
        }
    }

    /// Validate configuration for the active provider.
    pub fn validate(&self) -> AppResult<()> {
        let known_providers = ["openai", "ollama"];

        if !known_providers.contains(&self.provider.as_str()) {
            return Err(AppError::Config(format!(
                "Unknown provider: {}. Supported: {}",
                self.provider,
                known_providers.join(", ")
            )));
        }

        if self.provider == "openai" && self.resolve_api_key().is_none() {
            return Err(AppError::Config(
                "OpenAI provider requires an API key (KGQA_API_KEY or apiKeyEnv)".to_string(),
            ));
        }

        if self.cache.max_size_mb == 0 {
            return Err(AppError::Config(
                "cache.maxSizeMb must be greater than zero".to_string(),
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
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.model, "llama3.2");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl_hours, 24);
        assert!(!config.verbose);
    }

    #[test]
    fn test_state_paths() {
        let mut config = AppConfig::default();
        config.workspace = PathBuf::from("/tmp/ws");
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/ws/.kgqa"));
        assert_eq!(
            config.graph_file(),
            PathBuf::from("/tmp/ws/.kgqa/graph.sqlite")
        );
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/ws/.kgqa/cache"));

        config.graph_path = PathBuf::from("/data/graph.sqlite");
        assert_eq!(config.graph_file(), PathBuf::from("/data/graph.sqlite"));
    }

    #[test]
    fn test_with_overrides() {
        let config = AppConfig::default();
        let overridden = config.with_overrides(
            None,
            None,
            Some("openai".to_string()),
            Some("gpt-4o-mini".to_string()),
            Some(PathBuf::from("g.sqlite")),
            None,
            true,
            false,
        );

        assert_eq!(overridden.provider, "openai");
        assert_eq!(overridden.model, "gpt-4o-mini");
        assert_eq!(overridden.graph_path, PathBuf::from("g.sqlite"));
        assert!(overridden.verbose);
        assert_eq!(overridden.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_merge_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
llm:
  activeProvider: ollama
  providers:
    ollama:
      endpoint: "http://gpu-box:11434"
      model: "qwen2.5"
      timeout: 90
graph:
  path: "catalog.sqlite"
cache:
  ttlHours: 2
  maxSizeMb: 5
logging:
  level: debug
  format: json
"#,
        )
        .unwrap();

        let config = AppConfig::default().merge_yaml(&path).unwrap();
        assert_eq!(config.model, "qwen2.5");
        assert_eq!(config.endpoint.as_deref(), Some("http://gpu-box:11434"));
        assert_eq!(config.request_timeout_secs, 90);
        assert_eq!(config.graph_path, PathBuf::from("catalog.sqlite"));
        assert_eq!(config.cache.ttl_hours, 2);
        assert_eq!(config.cache.max_size_mb, 5);
        assert!(config.cache.enabled);
        assert_eq!(config.log_format, "json");
    }

    #[test]
    fn test_validate_unknown_provider() {
        let mut config = AppConfig::default();
        config.provider = "unknown".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ollama() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }
}
