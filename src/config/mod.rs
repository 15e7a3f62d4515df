use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::error;

use crate::backoff::BackoffPolicy;
use crate::callbacks::CallbackConfig;
use crate::scheduler::SchedulerConfig;

const DEFAULT_PORT: u16 = 8440;
const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_LEASE_SECS: u64 = 60;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 900;
const DEFAULT_INSPECT_LIMIT: usize = 16;
const DEFAULT_CLEANUP_LIMIT: usize = 1000;
const DEFAULT_BLOOM_CAPACITY: usize = 1_000_000;
const DEFAULT_BLOOM_FP_RATE: f64 = 0.01;
const DEFAULT_BLOOM_ROTATE_SECS: u64 = 30 * 60;
const DEFAULT_SUB_SWEEP_SECS: u64 = 60;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// A bearer token the REST layer resolves to an [`crate::identity::Identity`].
///
/// Parsed from `[[auth_tokens]]` sections. Token validation itself is the
/// transport's concern; the core only ever sees the resolved identity.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
}

/// `codeq.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    /// REST listen port (default: 8440).
    port: Option<u16>,
    /// Store URL (default: redis://127.0.0.1:6379).
    store_url: Option<String>,
    /// Log level filter string, e.g. "debug", "info,codeq=trace".
    log: Option<String>,
    /// Logical retention window in seconds (default: 86400).
    retention_seconds: Option<u64>,
    /// Attempt budget when the producer supplies none (default: 3).
    default_max_attempts: Option<u32>,
    /// Lease when a claim supplies none (default: 60).
    default_lease_seconds: Option<u64>,
    /// fixed | linear | exponential | exp_full_jitter | exp_equal_jitter.
    backoff_policy: Option<String>,
    backoff_base_seconds: Option<u64>,
    backoff_max_seconds: Option<u64>,
    /// Claim repair / retry budget (default: 16).
    inspect_limit: Option<usize>,
    /// Retention sweep batch size (default: 1000).
    cleanup_limit: Option<usize>,
    bloom_capacity: Option<usize>,
    bloom_fp_rate: Option<f64>,
    bloom_rotate_seconds: Option<u64>,
    /// Shared secret for webhook signing; omit to send unsigned.
    webhook_secret: Option<String>,
    /// Claim URL advertised in availability notifications.
    claim_url: Option<String>,
    callback_max_attempts: Option<u32>,
    callback_base_delay_ms: Option<u64>,
    callback_max_delay_ms: Option<u64>,
    /// Global outbound callback budget; 0 disables the gate.
    callback_max_sends_per_second: Option<u32>,
    subscription_sweep_seconds: Option<u64>,
    #[serde(default)]
    auth_tokens: Vec<AuthToken>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── CodeqConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CodeqConfig {
    pub port: u16,
    pub store_url: String,
    pub log: String,
    pub retention_seconds: u64,
    pub default_max_attempts: u32,
    pub default_lease_seconds: u64,
    pub backoff_policy: BackoffPolicy,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    pub inspect_limit: usize,
    pub cleanup_limit: usize,
    pub bloom_capacity: usize,
    pub bloom_fp_rate: f64,
    pub bloom_rotate: Duration,
    pub webhook_secret: Option<String>,
    pub claim_url: String,
    pub callback_max_attempts: u32,
    pub callback_base_delay: Duration,
    pub callback_max_delay: Duration,
    pub callback_max_sends_per_second: u32,
    pub subscription_sweep: Duration,
    pub auth_tokens: Vec<AuthToken>,
}

impl CodeqConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file
    ///   3. Built-in defaults
    pub fn new(
        config_path: Option<&Path>,
        port: Option<u16>,
        store_url: Option<String>,
        log: Option<String>,
    ) -> Self {
        let toml = config_path.and_then(load_toml).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let store_url = store_url
            .or(toml.store_url)
            .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let backoff_policy = toml
            .backoff_policy
            .as_deref()
            .and_then(|raw| match raw.parse() {
                Ok(policy) => Some(policy),
                Err(e) => {
                    error!(err = %e, "bad backoff_policy in config — using exponential");
                    None
                }
            })
            .unwrap_or_default();

        let claim_url = toml
            .claim_url
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}/v1/codeq/tasks/claim"));

        Self {
            port,
            store_url,
            log,
            retention_seconds: toml.retention_seconds.unwrap_or(DEFAULT_RETENTION_SECS),
            default_max_attempts: toml.default_max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            default_lease_seconds: toml.default_lease_seconds.unwrap_or(DEFAULT_LEASE_SECS),
            backoff_policy,
            backoff_base_seconds: toml
                .backoff_base_seconds
                .unwrap_or(DEFAULT_BACKOFF_BASE_SECS),
            backoff_max_seconds: toml.backoff_max_seconds.unwrap_or(DEFAULT_BACKOFF_MAX_SECS),
            inspect_limit: toml.inspect_limit.unwrap_or(DEFAULT_INSPECT_LIMIT),
            cleanup_limit: toml.cleanup_limit.unwrap_or(DEFAULT_CLEANUP_LIMIT),
            bloom_capacity: toml.bloom_capacity.unwrap_or(DEFAULT_BLOOM_CAPACITY),
            bloom_fp_rate: toml.bloom_fp_rate.unwrap_or(DEFAULT_BLOOM_FP_RATE),
            bloom_rotate: Duration::from_secs(
                toml.bloom_rotate_seconds.unwrap_or(DEFAULT_BLOOM_ROTATE_SECS),
            ),
            webhook_secret: toml.webhook_secret.filter(|s| !s.is_empty()),
            claim_url,
            callback_max_attempts: toml.callback_max_attempts.unwrap_or(5),
            callback_base_delay: Duration::from_millis(toml.callback_base_delay_ms.unwrap_or(500)),
            callback_max_delay: Duration::from_millis(toml.callback_max_delay_ms.unwrap_or(30_000)),
            callback_max_sends_per_second: toml.callback_max_sends_per_second.unwrap_or(0),
            subscription_sweep: Duration::from_secs(
                toml.subscription_sweep_seconds.unwrap_or(DEFAULT_SUB_SWEEP_SECS),
            ),
            auth_tokens: toml.auth_tokens,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_max_attempts: self.default_max_attempts,
            default_lease_seconds: self.default_lease_seconds,
            inspect_limit: self.inspect_limit,
            backoff_policy: self.backoff_policy,
            backoff_base_seconds: self.backoff_base_seconds,
            backoff_max_seconds: self.backoff_max_seconds,
            cleanup_limit: self.cleanup_limit,
            ..SchedulerConfig::default()
        }
    }

    pub fn callback_config(&self) -> CallbackConfig {
        CallbackConfig {
            max_attempts: self.callback_max_attempts,
            base_delay: self.callback_base_delay,
            max_delay: self.callback_max_delay,
            max_sends_per_second: self.callback_max_sends_per_second,
            secret: self.webhook_secret.clone(),
        }
    }
}
