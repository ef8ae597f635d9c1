use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_CLOCK_SKEW_SECS: u64 = 300;

/// Per-node protocol settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a signature request waits for the counterparty.
    pub request_timeout: Duration,

    /// When set, a proposer finalizes as soon as its proposal is fully agreed.
    pub auto_finalize: bool,

    /// How far in the future a message timestamp may be before it is refused.
    pub max_clock_skew: Duration,

    pub max_subject_len: usize,
    pub max_content_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            auto_finalize: true,
            max_clock_skew: Duration::from_secs(DEFAULT_MAX_CLOCK_SKEW_SECS),
            max_subject_len: 256,
            max_content_len: 16 * 1024,
        }
    }
}

impl EngineConfig {
    /// Read overrides from `CONCORD_*` environment variables. Unset variables
    /// keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("CONCORD_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.parse().context("CONCORD_REQUEST_TIMEOUT_MS must be an integer")?;
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Ok(flag) = std::env::var("CONCORD_AUTO_FINALIZE") {
            config.auto_finalize = parse_flag(&flag).context("CONCORD_AUTO_FINALIZE must be true or false")?;
        }
        if let Ok(secs) = std::env::var("CONCORD_MAX_CLOCK_SKEW_SECS") {
            let secs: u64 = secs.parse().context("CONCORD_MAX_CLOCK_SKEW_SECS must be an integer")?;
            config.max_clock_skew = Duration::from_secs(secs);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_auto_finalize(mut self, auto_finalize: bool) -> Self {
        self.auto_finalize = auto_finalize;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
