use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Per-process settings of the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Minimum size of each thread's signal stack. The host's `MINSIGSTKSZ`
    /// still applies if larger.
    #[serde(default = "default_signal_stack_min_size")]
    pub signal_stack_min_size: usize,

    /// Native stack size of threads created without an explicit reserve.
    #[serde(default = "default_stack_reserve")]
    pub default_stack_reserve: usize,

    /// How context access to another thread retries while the target hasn't
    /// parked yet.
    #[serde(default)]
    pub context_retry: ContextRetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextRetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    /// Pause between attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_signal_stack_min_size() -> usize {
    100 * 1024
}

fn default_stack_reserve() -> usize {
    1 << 20
}

fn default_retry_attempts() -> u32 {
    100
}

fn default_retry_delay_ms() -> u64 {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            signal_stack_min_size: default_signal_stack_min_size(),
            default_stack_reserve: default_stack_reserve(),
            context_retry: ContextRetryConfig::default(),
        }
    }
}

impl Default for ContextRetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.context_retry.attempts.max(1),
            delay: Duration::from_millis(self.context_retry.delay_ms),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.signal_stack_min_size, 102_400);
        assert_eq!(config.default_stack_reserve, 1 << 20);
        let policy = config.retry_policy();
        assert_eq!(policy.attempts, 100);
        assert_eq!(policy.delay, Duration::from_millis(1));
    }

    #[test]
    fn test_partial_retry_section() {
        let config: RuntimeConfig =
            serde_yaml::from_str("context_retry:\n  attempts: 0\n").unwrap();
        assert_eq!(config.context_retry.delay_ms, 1);
        // At least one attempt is always made.
        assert_eq!(config.retry_policy().attempts, 1);
    }

    #[test]
    fn test_unknown_field() {
        assert!(serde_yaml::from_str::<RuntimeConfig>("stack_size: 8").is_err());
    }
}
