use crate::result::{QuicError, QuicResult, TransportError};

pub const DEFAULT_CONNECTION_WINDOW: u64 = 1_048_576;
const DEFAULT_UPDATE_THRESHOLD: f64 = 0.5;

/// Connection-level flow control (RFC 9000 Section 4). Tracks the peer's
/// MAX_DATA limit on our sending and our advertised limit on the peer,
/// generating MAX_DATA / DATA_BLOCKED frames as credit moves.
#[derive(Debug, Clone)]
pub struct FlowController {
    // send side: the peer's limits on us
    send_limit: u64,
    bytes_sent: u64,
    data_blocked_sent: bool,

    // receive side: our limits on the peer
    receive_limit: u64,
    bytes_received: u64,
    bytes_consumed: u64,

    window_size: u64,
    update_threshold: f64,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_WINDOW)
    }
}

impl FlowController {
    /// `initial_window` sizes our receive side. The send limit starts at
    /// zero; only the peer's transport parameters or MAX_DATA raise it.
    pub fn new(initial_window: u64) -> Self {
        Self {
            send_limit: 0,
            bytes_sent: 0,
            data_blocked_sent: false,
            receive_limit: initial_window,
            bytes_received: 0,
            bytes_consumed: 0,
            window_size: initial_window,
            update_threshold: DEFAULT_UPDATE_THRESHOLD,
        }
    }

    pub fn available_send_window(&self) -> u64 {
        self.send_limit.saturating_sub(self.bytes_sent)
    }

    /// Claim send credit for outgoing stream data.
    pub fn consume_send_window(&mut self, bytes: u64) -> QuicResult<()> {
        if self.bytes_sent + bytes > self.send_limit {
            return Err(QuicError::SendBlocked);
        }
        self.bytes_sent += bytes;
        Ok(())
    }

    /// Peer raised MAX_DATA. Limits never move backwards.
    pub fn update_send_limit(&mut self, max_data: u64) {
        if max_data > self.send_limit {
            self.send_limit = max_data;
            self.data_blocked_sent = false;
        }
    }

    pub fn is_send_blocked(&self) -> bool {
        self.bytes_sent >= self.send_limit
    }

    pub fn send_limit(&self) -> u64 {
        self.send_limit
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Account for received stream data. Exceeding our advertised limit is
    /// a connection error.
    pub fn record_received(&mut self, bytes: u64) -> QuicResult<()> {
        if self.bytes_received + bytes > self.receive_limit {
            return Err(QuicError::transport(
                TransportError::FlowControlError,
                "peer exceeded connection flow-control limit",
            ));
        }
        self.bytes_received += bytes;
        Ok(())
    }

    pub fn record_consumed(&mut self, bytes: u64) {
        self.bytes_consumed += bytes;
    }

    pub fn receive_limit(&self) -> u64 {
        self.receive_limit
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// MAX_DATA is due once the unconsumed portion of the window falls
    /// under `(1 - threshold) * window_size`.
    pub fn should_send_max_data(&self) -> bool {
        let remaining = self.receive_limit.saturating_sub(self.bytes_consumed);
        (remaining as f64) <= (1.0 - self.update_threshold) * self.window_size as f64
    }

    /// New MAX_DATA value, or None if no update is due.
    pub fn generate_max_data(&mut self) -> Option<u64> {
        if !self.should_send_max_data() {
            return None;
        }
        self.receive_limit = self.bytes_consumed + self.window_size;
        Some(self.receive_limit)
    }

    /// DATA_BLOCKED is sent once per stall; the flag clears when the peer
    /// grants credit.
    pub fn should_send_data_blocked(&self) -> bool {
        self.is_send_blocked() && !self.data_blocked_sent
    }

    pub fn mark_data_blocked_sent(&mut self) {
        self.data_blocked_sent = true;
    }

    pub fn set_window_size(&mut self, window: u64) {
        self.window_size = window;
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn set_update_threshold(&mut self, threshold: f64) {
        self.update_threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn reset(&mut self, initial_window: u64) {
        *self = Self::new(initial_window);
    }
}
