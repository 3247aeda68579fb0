use serde::Deserialize;

use crate::types::{PlanLimits, Tier};

/// Root application configuration. Loaded from environment variables
/// with the prefix `ADRULES__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tiers: TierConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Shared secret for operator endpoints. Unset disables them.
    #[serde(default)]
    pub operator_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "adrules-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            operator_token: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

// ─── Engine Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_pass_interval_secs")]
    pub pass_interval_secs: u64,
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,
    #[serde(default = "default_metrics_timeout_ms")]
    pub metrics_timeout_ms: u64,
    #[serde(default = "default_controller_timeout_ms")]
    pub controller_timeout_ms: u64,
    #[serde(default = "default_notifier_timeout_ms")]
    pub notifier_timeout_ms: u64,
    #[serde(default = "default_inventory_timeout_ms")]
    pub inventory_timeout_ms: u64,
    /// Horizon the savings estimate projects the current spend rate over.
    #[serde(default = "default_savings_lookahead_hours")]
    pub savings_lookahead_hours: f64,
    #[serde(default = "default_log_query_limit")]
    pub log_query_limit: usize,
}

fn default_pass_interval_secs() -> u64 { 300 }
fn default_max_concurrent_evaluations() -> usize { 16 }
fn default_metrics_timeout_ms() -> u64 { 10_000 }
fn default_controller_timeout_ms() -> u64 { 10_000 }
fn default_notifier_timeout_ms() -> u64 { 5_000 }
fn default_inventory_timeout_ms() -> u64 { 15_000 }
fn default_savings_lookahead_hours() -> f64 { 24.0 }
fn default_log_query_limit() -> usize { 500 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pass_interval_secs: default_pass_interval_secs(),
            max_concurrent_evaluations: default_max_concurrent_evaluations(),
            metrics_timeout_ms: default_metrics_timeout_ms(),
            controller_timeout_ms: default_controller_timeout_ms(),
            notifier_timeout_ms: default_notifier_timeout_ms(),
            inventory_timeout_ms: default_inventory_timeout_ms(),
            savings_lookahead_hours: default_savings_lookahead_hours(),
            log_query_limit: default_log_query_limit(),
        }
    }
}

// ─── Retry Config ───────────────────────────────────────────────────────────

/// Backoff applied by ad-platform collaborators when the platform rate-limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 8_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_jitter() -> bool { true }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

// ─── Tier Config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    #[serde(default = "default_free_limits")]
    pub free: PlanLimits,
    #[serde(default = "default_start_limits")]
    pub start: PlanLimits,
    #[serde(default = "default_pro_limits")]
    pub pro: PlanLimits,
}

fn default_free_limits() -> PlanLimits {
    PlanLimits { max_rules: 3, max_accounts: 1, auto_stop_allowed: false }
}
fn default_start_limits() -> PlanLimits {
    PlanLimits { max_rules: 10, max_accounts: 3, auto_stop_allowed: true }
}
fn default_pro_limits() -> PlanLimits {
    PlanLimits { max_rules: 100, max_accounts: 20, auto_stop_allowed: true }
}

impl TierConfig {
    pub fn limits_for(&self, tier: Tier) -> PlanLimits {
        match tier {
            Tier::Free => self.free,
            Tier::Start => self.start,
            Tier::Pro => self.pro,
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            free: default_free_limits(),
            start: default_start_limits(),
            pro: default_pro_limits(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
            tiers: TierConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ADRULES")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.pass_interval_secs, 300);
        assert_eq!(config.api.http_port, 8080);
        assert!(config.api.operator_token.is_none());
        assert_eq!(config.retry.max_retries, 3);
        assert!(!config.tiers.limits_for(Tier::Free).auto_stop_allowed);
        assert!(config.tiers.limits_for(Tier::Pro).auto_stop_allowed);
    }

    #[test]
    fn test_partial_engine_section_keeps_defaults() {
        let engine: EngineConfig =
            serde_json::from_str(r#"{"pass_interval_secs": 60}"#).unwrap();
        assert_eq!(engine.pass_interval_secs, 60);
        assert_eq!(engine.max_concurrent_evaluations, 16);
        assert!((engine.savings_lookahead_hours - 24.0).abs() < f64::EPSILON);
    }
}
