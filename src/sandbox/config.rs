//! Sandbox configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// What happens when a single `onTick` invocation traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickErrorPolicy {
    /// Report the error and keep scheduling.
    #[default]
    Tolerate,
    /// Report the error and crash the session.
    Fatal,
}

impl FromStr for TickErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tolerate" => Ok(TickErrorPolicy::Tolerate),
            "fatal" => Ok(TickErrorPolicy::Fatal),
            other => Err(anyhow!("unknown tick error policy `{other}` (expected tolerate|fatal)")),
        }
    }
}

impl fmt::Display for TickErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickErrorPolicy::Tolerate => f.write_str("tolerate"),
            TickErrorPolicy::Fatal => f.write_str("fatal"),
        }
    }
}

/// Configuration shared by every sandbox a registry spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Delay between the end of one tick and the start of the next
    pub cadence: Duration,

    /// Policy for traps raised by `onTick`
    pub tick_error_policy: TickErrorPolicy,

    /// Fuel budget per strategy call (evaluation, each tick, teardown).
    /// `None` disables metering, so a non-terminating tick is not preemptible.
    pub fuel_per_tick: Option<u64>,

    /// Number of log lines the host keeps per session view
    pub log_history: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(1),
            tick_error_policy: TickErrorPolicy::Tolerate,
            fuel_per_tick: None,
            log_history: 200,
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `STRATBOX_*` variables (a `.env` file is honoured).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(ms) = std::env::var("STRATBOX_CADENCE_MS") {
            let ms: u64 = ms.parse().context("STRATBOX_CADENCE_MS must be an integer")?;
            config.cadence = Duration::from_millis(ms);
        }
        if let Ok(policy) = std::env::var("STRATBOX_TICK_ERRORS") {
            config.tick_error_policy = policy.parse()?;
        }
        if let Ok(fuel) = std::env::var("STRATBOX_FUEL_PER_TICK") {
            config.fuel_per_tick =
                Some(fuel.parse().context("STRATBOX_FUEL_PER_TICK must be an integer")?);
        }
        if let Ok(lines) = std::env::var("STRATBOX_LOG_HISTORY") {
            config.log_history = lines
                .parse()
                .context("STRATBOX_LOG_HISTORY must be an integer")?;
        }

        Ok(config)
    }
}
