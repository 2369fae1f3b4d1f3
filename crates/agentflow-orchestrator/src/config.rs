//! Process-level configuration (spec §6.5).
//!
//! Loaded once at startup into an immutable structure, the same way
//! `RunnerConfig::from_env()` and `EncryptionService::from_env()` already do
//! it elsewhere in this workspace: read environment variables, fall back to
//! documented defaults, no config-file format.

use std::collections::HashMap;
use std::time::Duration;

use crate::risk::RiskLevel;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Agent registry heartbeat sweep base unit.
    pub heartbeat_interval: Duration,
    /// Default TTL for resource locks when the caller doesn't specify one.
    pub lock_default_ttl: Duration,
    /// Approval timeout per risk level.
    pub approval_timeout: HashMap<RiskLevel, Duration>,
    /// Engine-wide default retry policy knobs.
    pub retry_max_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    /// Snapshot cadence for the event store.
    pub snapshot_every_events: u32,
    /// role -> risk levels that role may approve.
    pub role_authorization: HashMap<String, Vec<RiskLevel>>,
    /// channel -> HMAC secret for webhook verification.
    pub webhook_secrets: HashMap<String, String>,
    /// Reject webhooks whose timestamp skews more than this.
    pub replay_reject: Duration,
    /// Optional cap on concurrently running workflows; `None` = unbounded.
    pub max_parallel_workflows: Option<usize>,
    /// Capacity of the webhook replay-protection LRU.
    pub webhook_replay_lru_capacity: usize,
    /// Number of captured insights re-injected into the next agent node on resume.
    pub insight_window: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnv { name: String, reason: String },
}

impl OrchestratorConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults documented in spec §6.5.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL_S") {
            cfg.heartbeat_interval = Duration::from_secs(parse_u64("HEARTBEAT_INTERVAL_S", &v)?);
        }
        if let Ok(v) = std::env::var("LOCK_DEFAULT_TTL_S") {
            cfg.lock_default_ttl = Duration::from_secs(parse_u64("LOCK_DEFAULT_TTL_S", &v)?);
        }
        if let Ok(v) = std::env::var("SNAPSHOT_EVERY_EVENTS") {
            cfg.snapshot_every_events = parse_u64("SNAPSHOT_EVERY_EVENTS", &v)? as u32;
        }
        if let Ok(v) = std::env::var("MAX_PARALLEL_WORKFLOWS") {
            cfg.max_parallel_workflows = Some(parse_u64("MAX_PARALLEL_WORKFLOWS", &v)? as usize);
        }
        if let Ok(v) = std::env::var("WEBHOOK_SECRETS") {
            // channel=secret,channel2=secret2
            cfg.webhook_secrets = v
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect();
        }

        Ok(cfg)
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        reason: format!("expected an integer, got '{value}'"),
    })
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut approval_timeout = HashMap::new();
        approval_timeout.insert(RiskLevel::Medium, Duration::from_secs(30 * 60));
        approval_timeout.insert(RiskLevel::High, Duration::from_secs(2 * 60 * 60));
        approval_timeout.insert(RiskLevel::Critical, Duration::from_secs(4 * 60 * 60));

        let mut role_authorization = HashMap::new();
        role_authorization.insert("developer".to_string(), vec![RiskLevel::Low]);
        role_authorization.insert(
            "team_lead".to_string(),
            vec![RiskLevel::Low, RiskLevel::Medium, RiskLevel::High],
        );
        role_authorization.insert(
            "operator".to_string(),
            vec![
                RiskLevel::Low,
                RiskLevel::Medium,
                RiskLevel::High,
                RiskLevel::Critical,
            ],
        );

        Self {
            heartbeat_interval: Duration::from_secs(10),
            lock_default_ttl: Duration::from_secs(300),
            approval_timeout,
            retry_max_attempts: 3,
            retry_backoff_base: Duration::from_millis(25),
            retry_backoff_cap: Duration::from_millis(800),
            snapshot_every_events: 10,
            role_authorization,
            webhook_secrets: HashMap::new(),
            replay_reject: Duration::from_secs(300),
            max_parallel_workflows: None,
            webhook_replay_lru_capacity: 4096,
            insight_window: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.lock_default_ttl, Duration::from_secs(300));
        assert_eq!(
            cfg.approval_timeout[&RiskLevel::High],
            Duration::from_secs(2 * 60 * 60)
        );
        assert_eq!(cfg.snapshot_every_events, 10);
        assert_eq!(cfg.insight_window, 10);
    }

    #[test]
    fn role_authorization_table_matches_example() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.role_authorization["developer"], vec![RiskLevel::Low]);
        assert!(cfg.role_authorization["operator"].contains(&RiskLevel::Critical));
    }

    #[test]
    fn webhook_secrets_parsed_from_env() {
        std::env::set_var("WEBHOOK_SECRETS", "github=abc123,linear=def456");
        let cfg = OrchestratorConfig::from_env().unwrap();
        assert_eq!(cfg.webhook_secrets.get("github"), Some(&"abc123".to_string()));
        std::env::remove_var("WEBHOOK_SECRETS");
    }
}
