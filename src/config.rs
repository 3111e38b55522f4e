//! Gateway configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{PermissionMode, TerminalPolicy};

/// Process-wide configuration, resolved once at startup from the environment
/// with conservative defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Model requested for agent sessions unless a session overrides it.
    pub default_model: String,
    /// Whether history compaction fires automatically at the threshold.
    pub auto_compact: bool,
    /// Optional override of the compaction threshold, as a percentage of the
    /// effective window (clamped so the safety margin is never lost).
    pub auto_compact_percent: Option<f64>,
    /// Coarse permission mode applied when no rule matches.
    pub permission_mode: PermissionMode,
    /// Policy for shell-like tools.
    pub terminal_policy: TerminalPolicy,
    /// Which agent CLI provider the launcher should drive.
    pub cli_provider: String,
    /// Spawn agent subprocesses under a PTY when the host allows it.
    pub prefer_pty: bool,
    /// How long a completed session stays resumable before removal.
    #[serde(with = "duration_secs")]
    pub session_grace: Duration,
    /// Wall-clock window for the first content-bearing event after spawn.
    #[serde(with = "duration_secs")]
    pub content_timeout: Duration,
    /// Keep-alive ping cadence on client streams.
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,
    /// Per-turn cap when the loop orchestrator drives a session.
    #[serde(with = "duration_secs")]
    pub agent_turn_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_model: "default".to_string(),
            auto_compact: true,
            auto_compact_percent: None,
            permission_mode: PermissionMode::Safe,
            terminal_policy: TerminalPolicy::Auto,
            cli_provider: "claude".to_string(),
            prefer_pty: true,
            session_grace: Duration::from_secs(60),
            content_timeout: Duration::from_secs(120),
            ping_interval: Duration::from_secs(15),
            agent_turn_timeout: Duration::from_secs(600),
        }
    }
}

impl GatewayConfig {
    /// Build a config from `AGENTGATE_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = std::env::var("AGENTGATE_MODEL") {
            if !model.is_empty() {
                config.default_model = model;
            }
        }
        if let Ok(v) = std::env::var("AGENTGATE_AUTO_COMPACT") {
            config.auto_compact = !matches!(v.as_str(), "0" | "false" | "off");
        }
        if let Ok(v) = std::env::var("AGENTGATE_AUTO_COMPACT_PERCENT") {
            if let Ok(pct) = v.parse::<f64>() {
                config.auto_compact_percent = Some(pct);
            }
        }
        if let Ok(v) = std::env::var("AGENTGATE_PERMISSION_MODE") {
            if let Ok(mode) = v.parse() {
                config.permission_mode = mode;
            }
        }
        if let Ok(v) = std::env::var("AGENTGATE_TERMINAL_POLICY") {
            if let Ok(policy) = v.parse() {
                config.terminal_policy = policy;
            }
        }
        if let Ok(provider) = std::env::var("AGENTGATE_CLI_PROVIDER") {
            if !provider.is_empty() {
                config.cli_provider = provider;
            }
        }
        if let Ok(v) = std::env::var("AGENTGATE_PREFER_PTY") {
            config.prefer_pty = !matches!(v.as_str(), "0" | "false" | "off");
        }
        if let Ok(v) = std::env::var("AGENTGATE_SESSION_GRACE_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.session_grace = Duration::from_secs(secs);
            }
        }

        config
    }
}

mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
