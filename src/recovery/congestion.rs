use std::time::Instant;

use tracing::debug;

use crate::recovery::loss::SentPacket;
use crate::recovery::rtt::RttEstimator;

pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1200;
const INITIAL_WINDOW_PACKETS: usize = 10;
const MINIMUM_WINDOW_PACKETS: usize = 2;
const LOSS_REDUCTION_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    Recovery,
}

/// NewReno congestion control (RFC 9002 Section 7).
#[derive(Debug)]
pub struct CongestionController {
    state: CongestionState,
    cwnd: usize,
    ssthresh: usize,
    bytes_in_flight: usize,
    max_datagram_size: usize,
    initial_window: usize,
    minimum_window: usize,
    recovery_start: Option<Instant>,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATAGRAM_SIZE)
    }
}

impl CongestionController {
    pub fn new(max_datagram_size: usize) -> Self {
        let initial_window = INITIAL_WINDOW_PACKETS * max_datagram_size;
        let minimum_window = MINIMUM_WINDOW_PACKETS * max_datagram_size;
        Self {
            state: CongestionState::SlowStart,
            cwnd: initial_window,
            ssthresh: usize::MAX,
            bytes_in_flight: 0,
            max_datagram_size,
            initial_window,
            minimum_window,
            recovery_start: None,
        }
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn can_send(&self, bytes: usize) -> bool {
        if bytes == 0 {
            return self.bytes_in_flight < self.cwnd;
        }
        self.bytes_in_flight + bytes <= self.cwnd
    }

    pub fn available_window(&self) -> usize {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    pub fn on_packet_acked(&mut self, packet: &SentPacket) {
        if packet.in_flight {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.sent_bytes);
        }

        // no window growth for packets sent during the recovery period
        if self.in_recovery(packet.sent_time) {
            return;
        }
        if self.state == CongestionState::Recovery {
            // an ack for a post-recovery packet exits recovery
            self.state = CongestionState::CongestionAvoidance;
        }

        match self.state {
            CongestionState::SlowStart => {
                self.cwnd += packet.sent_bytes;
                if self.cwnd >= self.ssthresh {
                    self.state = CongestionState::CongestionAvoidance;
                }
            }
            CongestionState::CongestionAvoidance => {
                let increment = (self.max_datagram_size * packet.sent_bytes) / self.cwnd;
                self.cwnd += increment.max(1);
            }
            CongestionState::Recovery => unreachable!(),
        }
    }

    pub fn on_packet_lost(&mut self, packet: &SentPacket, now: Instant) {
        if packet.in_flight {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.sent_bytes);
        }
        self.on_congestion_event(packet.sent_time, now);
    }

    /// Loss or ECN-CE for a packet sent at `sent_time`. Only the first
    /// event per RTT shrinks the window (RFC 9002 Section 7.3.2).
    pub fn on_congestion_event(&mut self, sent_time: Instant, now: Instant) {
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start = Some(now);
        self.state = CongestionState::Recovery;
        self.ssthresh = ((self.cwnd as f64) * LOSS_REDUCTION_FACTOR) as usize;
        self.ssthresh = self.ssthresh.max(self.minimum_window);
        self.cwnd = self.ssthresh;
        debug!(cwnd = self.cwnd, "congestion event, entering recovery");
    }

    /// ECN-CE feedback responds exactly like loss (RFC 9002 Section 7.1).
    pub fn on_ecn_congestion(&mut self, sent_time: Instant, now: Instant) {
        self.on_congestion_event(sent_time, now);
    }

    /// Collapse to the minimum window (RFC 9002 Section 7.6.2).
    pub fn on_persistent_congestion(&mut self) {
        self.cwnd = self.minimum_window;
        self.ssthresh = self.cwnd;
        self.state = CongestionState::SlowStart;
        self.recovery_start = None;
        debug!("persistent congestion, window collapsed");
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        if self.state != CongestionState::Recovery {
            return false;
        }
        match self.recovery_start {
            Some(start) => sent_time <= start,
            None => false,
        }
    }

    pub fn set_max_datagram_size(&mut self, size: usize) {
        self.max_datagram_size = size;
        self.initial_window = INITIAL_WINDOW_PACKETS * size;
        self.minimum_window = MINIMUM_WINDOW_PACKETS * size;
        self.cwnd = self.cwnd.max(self.minimum_window);
    }

    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    pub fn reset(&mut self) {
        self.state = CongestionState::SlowStart;
        self.cwnd = self.initial_window;
        self.ssthresh = usize::MAX;
        self.bytes_in_flight = 0;
        self.recovery_start = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::types::EncryptionLevel;
    use std::time::Duration;

    fn sent(bytes: usize, at: Instant) -> SentPacket {
        SentPacket {
            packet_number: 0,
            sent_time: at,
            sent_bytes: bytes,
            ack_eliciting: true,
            in_flight: true,
            level: EncryptionLevel::Application,
            frames: vec![],
        }
    }

    #[test]
    fn test_initial_window() {
        let cc = CongestionController::new(1200);
        assert_eq!(cc.cwnd(), 12_000);
        assert_eq!(cc.state(), CongestionState::SlowStart);
        assert!(cc.can_send(12_000));
        assert!(!cc.can_send(12_001));
    }

    #[test]
    fn test_slow_start_growth() {
        let mut cc = CongestionController::new(1200);
        let now = Instant::now();
        cc.on_packet_sent(3600);
        for _ in 0..3 {
            cc.on_packet_acked(&sent(1200, now));
        }
        // cwnd grows by the number of bytes acked
        assert_eq!(cc.cwnd(), 12_000 + 3600);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_loss_halves_window_once_per_rtt() {
        let mut cc = CongestionController::new(1200);
        let t0 = Instant::now();
        cc.on_packet_sent(2400);

        cc.on_packet_lost(&sent(1200, t0), t0 + Duration::from_millis(5));
        assert_eq!(cc.state(), CongestionState::Recovery);
        assert_eq!(cc.cwnd(), 6000);
        assert_eq!(cc.ssthresh(), 6000);

        // a second loss for a packet sent before recovery began is ignored
        cc.on_packet_lost(&sent(1200, t0), t0 + Duration::from_millis(6));
        assert_eq!(cc.cwnd(), 6000);
    }

    #[test]
    fn test_window_floor() {
        let mut cc = CongestionController::new(1200);
        let mut now = Instant::now();
        // repeated congestion events cannot shrink below 2 datagrams
        for _ in 0..8 {
            now += Duration::from_millis(100);
            let pkt_time = now + Duration::from_millis(1);
            cc.on_congestion_event(pkt_time, pkt_time + Duration::from_millis(1));
        }
        assert_eq!(cc.cwnd(), 2400);
    }

    #[test]
    fn test_recovery_exit_then_avoidance() {
        let mut cc = CongestionController::new(1200);
        let t0 = Instant::now();
        cc.on_congestion_event(t0, t0 + Duration::from_millis(1));
        assert_eq!(cc.state(), CongestionState::Recovery);

        // ack for a packet sent after recovery started exits to avoidance
        let later = t0 + Duration::from_millis(10);
        cc.on_packet_acked(&sent(1200, later));
        assert_eq!(cc.state(), CongestionState::CongestionAvoidance);

        // AIMD growth: mdsz * acked / cwnd
        let cwnd_before = cc.cwnd();
        cc.on_packet_acked(&sent(1200, later));
        assert_eq!(cc.cwnd(), cwnd_before + (1200 * 1200) / cwnd_before);
    }

    #[test]
    fn test_persistent_congestion() {
        let mut cc = CongestionController::new(1200);
        let t0 = Instant::now();
        cc.on_congestion_event(t0, t0);
        cc.on_persistent_congestion();
        assert_eq!(cc.cwnd(), 2400);
        assert_eq!(cc.ssthresh(), 2400);
        assert_eq!(cc.state(), CongestionState::SlowStart);
    }
}
