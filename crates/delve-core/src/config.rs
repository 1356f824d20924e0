use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DelveError, Result};

/// Top-level Delve configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Engine limits applied to every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on loop iterations, applied on top of each edge's own ceiling.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
    /// Per-invocation timeout for a step executor call (0 = none).
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Wall-clock bound on a single start/resume call (0 = none).
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Node ids at which a run suspends before executing.
    #[serde(default)]
    pub pause_before: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            node_timeout_secs: default_node_timeout(),
            run_timeout_secs: default_run_timeout(),
            pause_before: vec![],
        }
    }
}

fn default_max_loop_iterations() -> usize { 10 }
fn default_node_timeout() -> u64 { 300 }
fn default_run_timeout() -> u64 { 1800 }

/// Where run snapshots live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite database path (`~` is expanded).
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

fn default_store_path() -> String { "~/.delve/runs.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    /// Interval of the SSE keep-alive comment frame.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Events buffered per stream before the producer waits.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: vec![],
            heartbeat_secs: default_heartbeat_secs(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

/// Gateway role of an API key. Variants are ordered by privilege.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read run snapshots only
    Viewer,
    /// Read + start, resume and cancel runs
    #[default]
    Operator,
    /// Full access, including deleting runs
    Admin,
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }
fn default_heartbeat_secs() -> u64 { 15 }
fn default_stream_buffer() -> usize { 256 }

/// Caller-side quota gate checked before a run may begin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Allowance shared by every run hosted by this process.
    #[serde(default = "default_allowance")]
    pub allowance: u64,
    /// Cost deducted when a run completes.
    #[serde(default = "default_run_cost")]
    pub run_cost: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowance: default_allowance(),
            run_cost: default_run_cost(),
        }
    }
}

fn default_allowance() -> u64 { 100 }
fn default_run_cost() -> u64 { 1 }

/// Shape of the deep-search workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Ceiling for the search/coordinator loop.
    #[serde(default = "default_max_search_rounds")]
    pub max_search_rounds: usize,
    /// Phrase in the searcher's output that ends the loop early.
    #[serde(default = "default_stop_phrase")]
    pub stop_phrase: String,
    /// Executor reference used by every research node.
    #[serde(default = "default_research_executor")]
    pub executor: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_search_rounds: default_max_search_rounds(),
            stop_phrase: default_stop_phrase(),
            executor: default_research_executor(),
        }
    }
}

fn default_max_search_rounds() -> usize { 3 }
fn default_stop_phrase() -> String { "enough information".to_string() }
fn default_research_executor() -> String { "agent".to_string() }

/// Which step executor backs node invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub kind: ExecutorKind,
    /// Endpoint for the remote executor.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            endpoint: None,
            timeout_secs: default_executor_timeout(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Echo inputs back; for dry runs.
    #[default]
    Echo,
    /// POST each step to an external agent service.
    Remote,
}

fn default_executor_timeout() -> u64 { 120 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| DelveError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| DelveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_loop_iterations == 0 {
            return Err(DelveError::Config(
                "engine.max_loop_iterations must be at least 1".into(),
            ));
        }
        if self.research.max_search_rounds == 0 {
            return Err(DelveError::Config(
                "research.max_search_rounds must be at least 1".into(),
            ));
        }
        if self.executor.kind == ExecutorKind::Remote && self.executor.endpoint.is_none() {
            return Err(DelveError::Config(
                "executor.endpoint is required for the remote executor".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_DELVE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_DELVE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_DELVE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_DELVE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_DELVE_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_loop_iterations, 10);
        assert_eq!(config.engine.node_timeout_secs, 300);
        assert!(config.engine.pause_before.is_empty());
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert_eq!(config.gateway.heartbeat_secs, 15);
        assert!(!config.admission.enabled);
        assert_eq!(config.research.max_search_rounds, 3);
        assert_eq!(config.executor.kind, ExecutorKind::Echo);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_key_roles() {
        let toml_str = r#"
[gateway]
token = "legacy"

[[gateway.api_keys]]
name = "ui"
key = "dk_ui"
role = "viewer"

[[gateway.api_keys]]
name = "ci"
key = "dk_ci"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateway.api_keys.len(), 2);
        assert_eq!(config.gateway.api_keys[0].role, ApiKeyRole::Viewer);
        assert_eq!(config.gateway.api_keys[1].role, ApiKeyRole::Operator);
        assert_eq!(config.gateway.token.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_validate_rejects_zero_ceilings() {
        let mut config = AppConfig::default();
        config.engine.max_loop_iterations = 0;
        assert!(matches!(config.validate(), Err(DelveError::Config(_))));

        let mut config = AppConfig::default();
        config.research.max_search_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_remote_needs_endpoint() {
        let mut config = AppConfig::default();
        config.executor.kind = ExecutorKind::Remote;
        assert!(config.validate().is_err());
        config.executor.endpoint = Some("http://127.0.0.1:9000/step".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_path_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        let store = StoreConfig::default();
        assert_eq!(
            store.resolved_path(),
            PathBuf::from("/home/tester/.delve/runs.db")
        );
    }
}
