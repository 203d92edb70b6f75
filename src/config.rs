// ABOUTME: Tunable parameters for a connection, as a plain config struct rather than a global
// ABOUTME: or environment-driven config

use std::time::Duration;

/// Default socket-buffer threshold `T` above which a message is fragmented
/// into a `LargeMessageWrapper`. 32 KiB.
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 32 * 1024;

/// Default responsiveness period `R` for the liveness watchdog: 3000 ms.
pub const DEFAULT_RESPONSIVENESS_PERIOD: Duration = Duration::from_millis(3000);

/// Tunable parameters for one [`crate::connection::Connection`]: a plain
/// struct of knobs with a `Default` impl and `with_*` setters, constructed
/// once up front rather than read from the environment at call time.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Messages whose encoded size exceeds this are wrapped in a
    /// `LargeMessageWrapper` before being queued for send.
    pub socket_buffer_size: usize,

    /// How long the connection may go without inbound bytes, after posting
    /// outbound traffic, before `may_have_become_unresponsive` fires.
    pub responsiveness_period: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            responsiveness_period: DEFAULT_RESPONSIVENESS_PERIOD,
        }
    }
}

impl ConnectionConfig {
    /// Create a config with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the oversize-message threshold `T`.
    pub fn with_socket_buffer_size(mut self, size: usize) -> Self {
        self.socket_buffer_size = size;
        self
    }

    /// Override the responsiveness period `R`.
    pub fn with_responsiveness_period(mut self, period: Duration) -> Self {
        self.responsiveness_period = period;
        self
    }
}
