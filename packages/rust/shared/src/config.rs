//! Application configuration for cartograph.
//!
//! User config lives at `~/.cartograph/cartograph.toml`.
//! CLI flags override config file values, which override defaults.
//! Provider credentials are never stored here, only the names of the
//! environment variables that hold them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CartographError, Result};
use crate::types::AgentType;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "cartograph.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".cartograph";

const DAY_SECS: u64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Config structs (matching cartograph.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub change_detection: ChangeDetectionConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    /// Configured data providers.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            change_detection: ChangeDetectionConfig::default(),
            agents: AgentsConfig::default(),
            providers: default_providers(),
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seconds between scheduler ticks in `run` mode.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Database location (`~/` is expanded).
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Applied idempotency keys retained per entity.
    #[serde(default = "default_applied_key_retention")]
    pub applied_key_retention: usize,

    /// How long an idle worker waits before looking at its queue again.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Number of rotating keyword batches.
    #[serde(default = "default_keyword_batches")]
    pub keyword_batches: u32,

    /// Upper bound on keywords generated per batch.
    #[serde(default = "default_max_keywords")]
    pub max_keywords_per_batch: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            db_path: default_db_path(),
            applied_key_retention: default_applied_key_retention(),
            idle_poll_ms: default_idle_poll_ms(),
            keyword_batches: default_keyword_batches(),
            max_keywords_per_batch: default_max_keywords(),
        }
    }
}

fn default_tick_interval() -> u64 {
    60
}
fn default_db_path() -> String {
    "~/.cartograph/cartograph.db".into()
}
fn default_applied_key_retention() -> usize {
    256
}
fn default_idle_poll_ms() -> u64 {
    250
}
fn default_keyword_batches() -> u32 {
    7
}
fn default_max_keywords() -> usize {
    100
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// A job is dead-lettered once its attempt count exceeds this.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Jitter as a fraction of the computed delay (0.0 disables it).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

fn default_base_delay() -> u64 {
    60
}
fn default_max_delay() -> u64 {
    3600
}
fn default_max_attempts() -> u32 {
    5
}
fn default_jitter() -> f64 {
    0.2
}

/// `[breaker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,

    /// Initial open-state cooldown before a probe is allowed.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window(),
            cooldown_secs: default_cooldown(),
            max_cooldown_secs: default_max_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window() -> u64 {
    300
}
fn default_cooldown() -> u64 {
    60
}
fn default_max_cooldown() -> u64 {
    3600
}

/// `[change_detection]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    #[serde(default = "default_full_pass_days")]
    pub full_pass_days: u32,

    #[serde(default = "default_sample_pass_hours")]
    pub sample_pass_hours: u32,

    /// Fraction of domain entities (highest priority first) in each sampling pass.
    #[serde(default = "default_sample_fraction")]
    pub sample_fraction: f64,

    /// Trending score at or above which an alert is raised.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    /// Snapshots kept per entity.
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            full_pass_days: default_full_pass_days(),
            sample_pass_hours: default_sample_pass_hours(),
            sample_fraction: default_sample_fraction(),
            alert_threshold: default_alert_threshold(),
            snapshot_retention: default_snapshot_retention(),
        }
    }
}

fn default_full_pass_days() -> u32 {
    30
}
fn default_sample_pass_hours() -> u32 {
    24
}
fn default_sample_fraction() -> f64 {
    0.05
}
fn default_alert_threshold() -> f64 {
    6.0
}
fn default_snapshot_retention() -> usize {
    12
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// When an agent becomes due for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cadence {
    /// Due when the agent's group is missing or older than `every_secs`.
    Interval { every_secs: u64 },
    /// One keyword batch per day, each refreshed every `every_secs`.
    RotatingBatch { every_secs: u64 },
    /// Full pass per `[change_detection]`, plus a daily sample of top entities.
    MonthlyWithSampling,
    /// Due whenever `upstream` has produced newer facts than this agent.
    AfterAgent { upstream: AgentType },
}

/// Per-agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub cadence: Cadence,

    /// Worker pool size; keep within the provider's rate limit.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Job priority (higher first).
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Provider id whose breaker gates dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Optional second provider (cross-source validation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplementary_provider: Option<String>,
}

fn default_workers() -> u32 {
    1
}
fn default_priority() -> u8 {
    5
}

impl AgentConfig {
    fn new(cadence: Cadence, workers: u32, priority: u8, provider: Option<&str>) -> Self {
        Self {
            cadence,
            workers,
            priority,
            provider: provider.map(String::from),
            supplementary_provider: None,
        }
    }
}

/// `[agents.*]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_keyword_miner")]
    pub keyword_miner: AgentConfig,
    #[serde(default = "default_serp_discovery")]
    pub serp_discovery: AgentConfig,
    #[serde(default = "default_domain_classifier")]
    pub domain_classifier: AgentConfig,
    #[serde(default = "default_seo_metrics")]
    pub seo_metrics: AgentConfig,
    #[serde(default = "default_tech_stack")]
    pub tech_stack: AgentConfig,
    #[serde(default = "default_intent_scoring")]
    pub intent_scoring: AgentConfig,
    #[serde(default = "default_change_tracking")]
    pub change_tracking: AgentConfig,
}

impl AgentsConfig {
    pub fn get(&self, agent: AgentType) -> &AgentConfig {
        match agent {
            AgentType::KeywordMiner => &self.keyword_miner,
            AgentType::SerpDiscovery => &self.serp_discovery,
            AgentType::DomainClassifier => &self.domain_classifier,
            AgentType::SeoMetrics => &self.seo_metrics,
            AgentType::TechStack => &self.tech_stack,
            AgentType::IntentScoring => &self.intent_scoring,
            AgentType::ChangeTracking => &self.change_tracking,
        }
    }

    pub fn get_mut(&mut self, agent: AgentType) -> &mut AgentConfig {
        match agent {
            AgentType::KeywordMiner => &mut self.keyword_miner,
            AgentType::SerpDiscovery => &mut self.serp_discovery,
            AgentType::DomainClassifier => &mut self.domain_classifier,
            AgentType::SeoMetrics => &mut self.seo_metrics,
            AgentType::TechStack => &mut self.tech_stack,
            AgentType::IntentScoring => &mut self.intent_scoring,
            AgentType::ChangeTracking => &mut self.change_tracking,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            keyword_miner: default_keyword_miner(),
            serp_discovery: default_serp_discovery(),
            domain_classifier: default_domain_classifier(),
            seo_metrics: default_seo_metrics(),
            tech_stack: default_tech_stack(),
            intent_scoring: default_intent_scoring(),
            change_tracking: default_change_tracking(),
        }
    }
}

fn default_keyword_miner() -> AgentConfig {
    AgentConfig::new(
        Cadence::RotatingBatch {
            every_secs: 7 * DAY_SECS,
        },
        1,
        5,
        None,
    )
}
fn default_serp_discovery() -> AgentConfig {
    AgentConfig::new(
        Cadence::AfterAgent {
            upstream: AgentType::KeywordMiner,
        },
        2,
        6,
        Some("serp"),
    )
}
fn default_domain_classifier() -> AgentConfig {
    AgentConfig::new(
        Cadence::Interval {
            every_secs: 30 * DAY_SECS,
        },
        4,
        8,
        Some("page_fetch"),
    )
}
fn default_seo_metrics() -> AgentConfig {
    let mut agent = AgentConfig::new(
        Cadence::Interval {
            every_secs: 7 * DAY_SECS,
        },
        2,
        5,
        Some("backlinks"),
    );
    agent.supplementary_provider = Some("authority".into());
    agent
}
fn default_tech_stack() -> AgentConfig {
    AgentConfig::new(
        Cadence::Interval {
            every_secs: 14 * DAY_SECS,
        },
        3,
        5,
        Some("tech"),
    )
}
fn default_intent_scoring() -> AgentConfig {
    AgentConfig::new(
        Cadence::AfterAgent {
            upstream: AgentType::TechStack,
        },
        1,
        4,
        None,
    )
}
fn default_change_tracking() -> AgentConfig {
    AgentConfig::new(Cadence::MonthlyWithSampling, 1, 3, None)
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Closed set of provider variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Deterministic in-memory fixtures.
    Fixture,
    /// Synchronous JSON request/response.
    HttpJson,
    /// Asynchronous post / ready / fetch task flow.
    HttpQueued,
    /// Direct homepage fetch.
    PageFetch,
}

/// `[[providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub kind: ProviderKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Deadline for one provider call, polling included.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// Minimum ms between calls to this provider.
    #[serde(default)]
    pub rate_limit_ms: u64,
}

impl ProviderEntry {
    pub fn fixture(id: &str) -> Self {
        Self {
            id: id.into(),
            kind: ProviderKind::Fixture,
            base_url: None,
            api_key_env: None,
            timeout_secs: default_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            rate_limit_ms: 0,
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    2000
}
fn default_max_polls() -> u32 {
    30
}

fn default_providers() -> Vec<ProviderEntry> {
    ["serp", "page_fetch", "backlinks", "authority", "tech"]
        .into_iter()
        .map(ProviderEntry::fixture)
        .collect()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.cartograph/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CartographError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.cartograph/cartograph.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CartographError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        CartographError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CartographError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CartographError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CartographError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` in the configured database path.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    let raw = &config.pipeline.db_path;
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CartographError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// Check that every provider's credential env var is set and non-empty,
/// and that agents only reference configured providers.
pub fn validate_credentials(config: &AppConfig) -> Result<()> {
    let missing: Vec<&str> = config
        .providers
        .iter()
        .filter_map(|p| p.api_key_env.as_deref())
        .filter(|var| !matches!(std::env::var(var), Ok(val) if !val.is_empty()))
        .collect();

    if !missing.is_empty() {
        return Err(CartographError::config(format!(
            "provider credentials not found. Set: {}",
            missing.join(", ")
        )));
    }

    for agent in AgentType::ALL {
        let agent_config = config.agents.get(agent);
        for id in agent_config
            .provider
            .iter()
            .chain(agent_config.supplementary_provider.iter())
        {
            if !config.providers.iter().any(|p| &p.id == id) {
                return Err(CartographError::config(format!(
                    "agent {agent} references unknown provider '{id}'"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("failure_threshold"));
        assert!(toml_str.contains("keyword_miner"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.breaker.failure_threshold, 5);
        assert_eq!(parsed.retry.max_attempts, 5);
        assert_eq!(parsed.providers.len(), 5);
        assert_eq!(
            parsed.agents.serp_discovery.cadence,
            Cadence::AfterAgent {
                upstream: AgentType::KeywordMiner
            }
        );
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[breaker]
failure_threshold = 3

[agents.tech_stack]
cadence = { kind = "interval", every_secs = 3600 }
workers = 6
provider = "wappalyzer"

[[providers]]
id = "wappalyzer"
kind = "http_json"
base_url = "https://tech.internal.example"
api_key_env = "CG_TECH_KEY"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_secs, 60);
        assert_eq!(config.agents.tech_stack.workers, 6);
        assert_eq!(config.agents.get(AgentType::TechStack).priority, 5);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::HttpJson);
        assert_eq!(config.providers[0].timeout_secs, 30);
    }

    #[test]
    fn credential_validation() {
        let mut config = AppConfig::default();
        assert!(validate_credentials(&config).is_ok());

        // Use a unique env var name to avoid interfering with other tests
        config.providers[0].api_key_env = Some("CG_TEST_NONEXISTENT_KEY_12345".into());
        let err = validate_credentials(&config).unwrap_err();
        assert!(err.to_string().contains("CG_TEST_NONEXISTENT_KEY_12345"));
    }

    #[test]
    fn unknown_provider_reference_rejected() {
        let mut config = AppConfig::default();
        config.agents.seo_metrics.provider = Some("nope".into());
        let err = validate_credentials(&config).unwrap_err();
        assert!(err.to_string().contains("unknown provider 'nope'"));
    }

    #[test]
    fn db_path_expansion() {
        let mut config = AppConfig::default();
        config.pipeline.db_path = "/tmp/cg.db".into();
        assert_eq!(resolve_db_path(&config).unwrap(), PathBuf::from("/tmp/cg.db"));
    }
}
