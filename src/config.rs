//! Tunable protocol parameters.
//!
//! Every deadline and ceiling in the signaling protocol lives here so the
//! retry policy is injectable; components never read globals. Tests use
//! shortened values, production uses `Default`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// How long the client waits for the server to ack an outbound event.
    pub ack_timeout: Duration,
    /// How long the server waits for a relayed `call_initiate` to be acked
    /// by the recipient's client.
    pub relay_ack_timeout: Duration,
    /// Send attempts per queued event before it is dropped.
    pub max_retries: u32,
    /// Backoff between retries grows as `retry_base_delay * attempts`.
    pub retry_base_delay: Duration,
    /// Outbound queue capacity; aged entries are pruned when full.
    pub queue_capacity: usize,
    /// Queued entries older than this are prunable.
    pub queue_max_age: Duration,
    /// Unanswered calls auto-expire after this long.
    pub ring_timeout: Duration,
    /// A call sitting in a non-terminal phase longer than this is stuck.
    pub stuck_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Window within which a second call between the same pair is refused,
    /// and past which an active record counts as stale.
    pub active_call_window: Duration,
    /// Interval between quality samples while connected.
    pub quality_interval: Duration,
    /// Interval between keepalive pings while connected.
    pub keepalive_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(3),
            relay_ack_timeout: Duration::from_secs(45),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            queue_capacity: 100,
            queue_max_age: Duration::from_secs(60),
            ring_timeout: Duration::from_secs(30),
            stuck_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            active_call_window: Duration::from_secs(60),
            quality_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(25),
        }
    }
}
