use std::time::Duration;

/// Every bounded wait in the scheduler. The defaults are the protocol
/// values; tests compress them so a timeout path runs in milliseconds.
#[derive(Debug, Clone)]
pub struct SchedTimings {
    /// Waiting for the stick's transmit callback.
    pub trans_ack: Duration,
    /// Waiting for a specific CC reply to a Query-priority message.
    pub reply_query: Duration,
    /// Waiting for a specific CC reply to a Command-priority message.
    pub reply_command: Duration,
    /// Waiting for a Nonce Report after a Nonce Get.
    pub nonce_wait: Duration,
    /// How often the writer thread sweeps for due polls and timers.
    pub sweep: Duration,
}

impl Default for SchedTimings {
    fn default() -> Self {
        Self {
            trans_ack: Duration::from_secs(4),
            reply_query: Duration::from_secs(4),
            reply_command: Duration::from_secs(2),
            nonce_wait: Duration::from_secs(10),
            sweep: Duration::from_secs(1),
        }
    }
}

impl SchedTimings {
    /// Compressed values for scheduler tests.
    pub fn fast() -> Self {
        Self {
            trans_ack: Duration::from_millis(150),
            reply_query: Duration::from_millis(150),
            reply_command: Duration::from_millis(100),
            nonce_wait: Duration::from_millis(250),
            sweep: Duration::from_millis(20),
        }
    }
}
