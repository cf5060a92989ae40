use std::time::Duration;
use crate::config::TransportConfig;

/// The delays between an initiator's reconnect attempts, growing exponentially:
///
/// With `conn_retry_initial_delay = 500ms`, `conn_retry_backoff_multiplier = 2.0` and
///  `conn_retry_attempts = 4`, the attempts happen
/// * immediately (when the loss is detected)
/// * 0.5s after the first attempt failed
/// * 1.0s after the second attempt failed
/// * 2.0s after the third attempt failed
///
/// and the channel is declared lost 4.0s after the fourth attempt failed.
///
/// The iterator yields one delay per attempt, i.e. exactly `conn_retry_attempts` delays.
pub struct RetryBackoff {
    attempts_made: u32,
    next_delay: Duration,

    config_max_attempts: u32,
    config_multiplier: f64,
}

impl RetryBackoff {
    pub fn new(initial_delay: Duration, multiplier: f64, max_attempts: u32) -> RetryBackoff {
        assert!(multiplier >= 1.0);

        RetryBackoff {
            attempts_made: 0,
            next_delay: initial_delay,
            config_max_attempts: max_attempts,
            config_multiplier: multiplier,
        }
    }

    pub fn from_config(config: &TransportConfig) -> RetryBackoff {
        Self::new(config.conn_retry_initial_delay, config.conn_retry_backoff_multiplier, config.conn_retry_attempts)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }
}

impl Iterator for RetryBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempts_made >= self.config_max_attempts {
            return None;
        }
        self.attempts_made += 1;

        let result = self.next_delay;
        self.next_delay = Duration::try_from_secs_f64(self.next_delay.as_secs_f64() * self.config_multiplier)
            .unwrap_or(Duration::MAX);
        Some(result)
    }
}
