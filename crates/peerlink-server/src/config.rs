//! Server-side connection management constants.

use std::time::Duration;

/// Tuning knobs for sessions accepted by the hub.
///
/// The defaults keep the liveness invariant `ping_period < pong_wait`
/// (ping at 90% of the pong wait): a session whose client stops answering
/// is torn down by its read pump one pong-wait after the last traffic.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// How long a write (frame or ping) may take before the session is
    /// considered dead.
    pub write_deadline: Duration,

    /// How long the read pump waits for any traffic (frames or pongs)
    /// before tearing the session down.
    pub pong_wait: Duration,

    /// Interval between protocol-level pings. Must stay below `pong_wait`.
    pub ping_period: Duration,

    /// Maximum inbound message size in bytes. One byte over terminates
    /// the session with a read error.
    pub max_message_size: usize,

    /// Capacity of each session's outbound queue. Broadcasts to a full
    /// queue are dropped for that session, never blocked on.
    pub send_queue_capacity: usize,

    /// WebSocket write buffer size handed to the upgrade.
    pub write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_deadline: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait.mul_f64(0.9),
            max_message_size: 4096,
            send_queue_capacity: 256,
            write_buffer_size: 1024,
        }
    }
}
