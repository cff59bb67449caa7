// Copyright 2026 The LLM Relay Project
// SPDX-License-Identifier: Apache-2.0

// Process-wide relay configuration.
//
// Resolved once at startup from environment variables (the variable names are
// part of the external contract) and shared read-only behind an Arc for the
// lifetime of the process.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;

/// Errors raised while resolving configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Immutable process-wide settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream base URL for the OpenAI-compatible chat completions API.
    pub openai_base_url: String,
    /// Upstream base URL for the Gemini generate-content API.
    pub gemini_base_url: String,
    /// Upstream base URL for the Claude messages API.
    pub claude_base_url: String,

    /// Enable the anti-truncation engine for every streaming request, without
    /// requiring a per-request trigger.
    pub anti_truncation_default: bool,
    /// Upper bound on upstream requests per anti-truncation run. Always >= 1.
    pub max_attempts: u32,
    /// Completion sentinel the model is instructed to emit. Non-empty.
    pub done_marker: String,
    /// Model-name prefix that activates anti-truncation. Non-empty.
    pub model_prefix: String,
    /// Interval without downstream writes after which a no-op SSE comment is
    /// emitted to keep the client connection alive. Zero disables keepalive.
    pub keepalive_interval: Duration,
    /// Time without upstream bytes (after the first byte of an attempt) after
    /// which the attempt is treated as prematurely closed. Zero disables it.
    pub idle_timeout: Duration,

    /// Whether forwarding headers from trusted peers are honored at all.
    pub trust_proxy_headers: bool,
    /// Peers inside these networks are believed when they present
    /// forwarding headers.
    pub trusted_proxy_cidrs: Vec<IpNet>,

    /// Total cap on a buffered (non-streaming) upstream call.
    pub request_timeout: Duration,
    /// Cap on each upstream dial.
    pub connect_timeout: Duration,
    /// Inbound request body cap in bytes. Always > 0.
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            claude_base_url: "https://api.anthropic.com".to_string(),
            anti_truncation_default: false,
            max_attempts: 3,
            done_marker: "[done]".to_string(),
            model_prefix: "流式抗截断/".to_string(),
            keepalive_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(90),
            trust_proxy_headers: true,
            trusted_proxy_cidrs: parse_cidr_list(DEFAULT_TRUSTED_CIDRS),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_body_bytes: 50 * 1024 * 1024,
        }
    }
}

const DEFAULT_TRUSTED_CIDRS: &str =
    "127.0.0.0/8,::1/128,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

impl RelayConfig {
    /// Resolve the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration from an arbitrary variable lookup.
    ///
    /// Separated from `from_env` so tests can exercise parsing without
    /// mutating process-global environment state.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = get("UPSTREAM_OPENAI_BASE_URL") {
            cfg.openai_base_url = v;
        }
        if let Some(v) = get("UPSTREAM_GEMINI_BASE_URL") {
            cfg.gemini_base_url = v;
        }
        if let Some(v) = get("UPSTREAM_CLAUDE_BASE_URL") {
            cfg.claude_base_url = v;
        }
        if let Some(v) = get("ANTI_TRUNCATION_ENABLED_DEFAULT") {
            cfg.anti_truncation_default = parse_bool(&v);
        }
        if let Some(v) = get("ANTI_TRUNCATION_MAX_ATTEMPTS") {
            cfg.max_attempts = parse_number("ANTI_TRUNCATION_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("ANTI_TRUNCATION_DONE_MARKER") {
            cfg.done_marker = v;
        }
        if let Some(v) = get("ANTI_TRUNCATION_MODEL_PREFIX") {
            cfg.model_prefix = v;
        }
        if let Some(v) = get("ANTI_TRUNCATION_KEEPALIVE_INTERVAL_SECONDS") {
            cfg.keepalive_interval = Duration::from_secs(parse_number(
                "ANTI_TRUNCATION_KEEPALIVE_INTERVAL_SECONDS",
                &v,
            )?);
        }
        if let Some(v) = get("ANTI_TRUNCATION_UPSTREAM_IDLE_TIMEOUT_SECONDS") {
            cfg.idle_timeout = Duration::from_secs(parse_number(
                "ANTI_TRUNCATION_UPSTREAM_IDLE_TIMEOUT_SECONDS",
                &v,
            )?);
        }
        if let Some(v) = get("TRUST_PROXY_HEADERS") {
            cfg.trust_proxy_headers = parse_bool(&v);
        }
        if let Some(v) = get("TRUSTED_PROXY_CIDRS") {
            cfg.trusted_proxy_cidrs = parse_cidr_list(&v);
        }
        if let Some(v) = get("UPSTREAM_TIMEOUT_SECONDS") {
            cfg.request_timeout =
                Duration::from_secs(parse_number("UPSTREAM_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = get("UPSTREAM_CONNECT_TIMEOUT_SECONDS") {
            cfg.connect_timeout =
                Duration::from_secs(parse_number("UPSTREAM_CONNECT_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = get("MAX_BODY_SIZE_MB") {
            let mb: usize = parse_number("MAX_BODY_SIZE_MB", &v)?;
            cfg.max_body_bytes = mb.saturating_mul(1024 * 1024);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                key: "ANTI_TRUNCATION_MAX_ATTEMPTS",
                value: self.max_attempts.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.done_marker.is_empty() {
            return Err(ConfigError::Invalid {
                key: "ANTI_TRUNCATION_DONE_MARKER",
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.model_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                key: "ANTI_TRUNCATION_MODEL_PREFIX",
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_BODY_SIZE_MB",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Check whether a peer address falls inside any trusted network.
    pub fn is_trusted_peer(&self, peer: IpAddr) -> bool {
        self.trusted_proxy_cidrs.iter().any(|net| net.contains(&peer))
    }

    /// Surface trust-configuration footguns at startup.
    pub fn log_startup_warnings(&self) {
        if !self.trust_proxy_headers {
            return;
        }
        if self.trusted_proxy_cidrs.is_empty() {
            tracing::warn!(
                "TRUST_PROXY_HEADERS=true but TRUSTED_PROXY_CIDRS is empty; \
                 no forwarding headers will be honored and the peer address is used"
            );
        } else {
            tracing::warn!(
                trusted_cidrs = ?self.trusted_proxy_cidrs,
                "TRUST_PROXY_HEADERS=true; forwarding headers from these networks are honored. \
                 If untrusted clients share these networks, narrow the list to your \
                 load balancer's addresses"
            );
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}

/// Parse a comma-separated CIDR list, skipping invalid entries with a warning.
pub fn parse_cidr_list(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                tracing::warn!(cidr = s, "ignoring invalid CIDR in TRUSTED_PROXY_CIDRS");
                None
            }
        })
        .collect()
}
