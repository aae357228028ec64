use std::env;
use std::time::Duration;

/// Timer windows driving presence decay, message expiry, and typing
/// timeout. Defaults suit an interactive session; tests shrink them.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// How often the roster is swept for silent participants.
    pub presence_sweep_interval: Duration,
    /// Silence after which a participant (other than self) is dropped.
    pub inactive_threshold: Duration,
    /// How often the message log is swept for expired entries.
    pub expiry_sweep_interval: Duration,
    /// Keyboard silence after which an end-typing broadcast fires.
    pub typing_timeout: Duration,
}

impl Tuning {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            presence_sweep_interval: env_ms("CAMPFIRE_PRESENCE_SWEEP_MS")
                .unwrap_or(defaults.presence_sweep_interval),
            inactive_threshold: env_ms("CAMPFIRE_INACTIVE_AFTER_MS")
                .unwrap_or(defaults.inactive_threshold),
            expiry_sweep_interval: env_ms("CAMPFIRE_EXPIRY_SWEEP_MS")
                .unwrap_or(defaults.expiry_sweep_interval),
            typing_timeout: env_ms("CAMPFIRE_TYPING_TIMEOUT_MS")
                .unwrap_or(defaults.typing_timeout),
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            presence_sweep_interval: Duration::from_secs(5),
            inactive_threshold: Duration::from_secs(30),
            expiry_sweep_interval: Duration::from_millis(250),
            typing_timeout: Duration::from_secs(1),
        }
    }
}

fn env_ms(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
}
