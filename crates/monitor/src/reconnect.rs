//! Exponential-backoff reconnection policy for push channels.
//!
//! When a channel closes without being asked to, its owner calls
//! [`decide`] with the close details and the number of attempts already
//! made. The policy either schedules another attempt after a bounded
//! delay or tells the owner to stop.

use std::time::Duration;

use crate::transport::CloseInfo;

/// Backoff schedule for push-channel reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base delay; attempt `n` waits `initial_delay * multiplier^n`.
    pub initial_delay: Duration,
    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,
    /// Growth factor applied per failed attempt.
    pub multiplier: f64,
    /// Attempts allowed before giving up on the channel.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reopen the channel after `delay`. `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// The server closed the channel cleanly; it is done with us.
    CleanClose,
    /// `max_attempts` reconnects have already been made.
    Exhausted { attempts: u32 },
}

/// Delay before the 1-based `attempt`, clamped to
/// [`ReconnectConfig::max_delay`].
pub fn delay_for_attempt(attempt: u32, config: &ReconnectConfig) -> Duration {
    let factor = config.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let millis = config.initial_delay.as_millis() as f64 * factor;
    if !millis.is_finite() || millis >= config.max_delay.as_millis() as f64 {
        return config.max_delay;
    }
    Duration::from_millis(millis.max(0.0) as u64)
}

/// Decide what to do after an unrequested close.
///
/// `attempts_made` counts reconnects since the channel last opened
/// successfully.
pub fn decide(close: &CloseInfo, attempts_made: u32, config: &ReconnectConfig) -> ReconnectDecision {
    if attempts_made >= config.max_attempts {
        return ReconnectDecision::Exhausted {
            attempts: attempts_made,
        };
    }
    if close.is_normal() {
        return ReconnectDecision::CleanClose;
    }
    let attempt = attempts_made + 1;
    ReconnectDecision::Retry {
        attempt,
        delay: delay_for_attempt(attempt, config),
    }
}
