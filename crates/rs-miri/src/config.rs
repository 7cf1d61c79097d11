//! Streaming engine tunables.

use std::time::Duration;

/// Timing and resynchronization settings of a streaming session.
///
/// The defaults reproduce the behaviour of libmirisdr. The bulk
/// resynchronization values are empirical and may need adjusting for other
/// host controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Upper bound of one event pump.
    pub event_timeout: Duration,
    /// Busy-poll period of `cancel_and_wait`, `pause` and `resume`.
    pub poll_interval: Duration,
    /// Delay before the streaming-stop request, lets the last completions land.
    pub settle_delay: Duration,
    /// Sample-loss events tolerated before a bulk resync; `None` uses the
    /// number of transfers in the pool.
    pub sync_loss_threshold: Option<u32>,
    /// Bytes removed from the next bulk request when resynchronizing.
    pub resync_margin: usize,
    /// Cancel-and-pump rounds used to reclaim in-flight transfers after a failure.
    pub failure_drain_rounds: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
            settle_delay: Duration::from_millis(20),
            sync_loss_threshold: None,
            resync_margin: 512,
            failure_drain_rounds: 3,
        }
    }
}

impl StreamConfig {
    /// Configuration with every delay shortened, for tests and simulations.
    pub fn fast() -> Self {
        Self {
            event_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Sample-loss events tolerated for a pool of `buffer_count` transfers.
    pub fn loss_threshold(&self, buffer_count: usize) -> i64 {
        self.sync_loss_threshold
            .map_or(buffer_count as i64, i64::from)
    }
}
