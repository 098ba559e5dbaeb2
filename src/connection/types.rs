use std::time::{Duration, Instant};

use crate::flow::DEFAULT_CONNECTION_WINDOW;
use crate::packet::frame::{AckFrame, AckRange, EcnCounts};
use crate::packet::types::EcnCodepoint;
use crate::stream::stream::DEFAULT_STREAM_WINDOW;
use crate::tparams::TransportParams;

/// Connection lifecycle. A client enters `Handshaking` on
/// `start_handshake`; a server on its first Initial packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Established,
    Closing,
    Draining,
    Closed,
}

/// Events drained through `poll_event`, replacing per-event callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// Reassembled data is readable on the stream.
    StreamData { stream_id: u64, fin: bool },
    StreamReset { stream_id: u64, error_code: u64 },
    Disconnected { error_code: u64, reason: String },
}

/// Tunables bound into the transport parameters and the engine's timers.
#[derive(Debug, Clone)]
pub struct Config {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi: u64,
    pub initial_max_stream_data_uni: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
    pub max_udp_payload_size: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: Duration,
    pub active_connection_id_limit: u64,
    pub cid_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_max_data: DEFAULT_CONNECTION_WINDOW,
            initial_max_stream_data_bidi: DEFAULT_STREAM_WINDOW,
            initial_max_stream_data_uni: DEFAULT_STREAM_WINDOW,
            max_streams_bidi: 100,
            max_streams_uni: 100,
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: None,
            max_udp_payload_size: 65_527,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            active_connection_id_limit: 4,
            cid_len: 8,
        }
    }
}

impl Config {
    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            max_idle_timeout: self.idle_timeout.as_millis() as u64,
            max_udp_payload_size: self.max_udp_payload_size,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.max_streams_bidi,
            initial_max_streams_uni: self.max_streams_uni,
            ack_delay_exponent: self.ack_delay_exponent,
            max_ack_delay: self.max_ack_delay.as_millis() as u64,
            active_connection_id_limit: self.active_connection_id_limit,
            ..TransportParams::default()
        }
    }
}

/// Snapshot for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Received-packet bookkeeping for one packet-number space: duplicate
/// rejection, ACK-range maintenance and delayed-ACK scheduling.
#[derive(Debug, Default)]
pub struct AckTracker {
    /// Inclusive received ranges, kept merged, highest first.
    ranges: Vec<(u64, u64)>,
    largest_recv_time: Option<Instant>,
    ack_pending: bool,
    ack_deadline: Option<Instant>,
    ecn_counts: EcnCounts,
}

impl AckTracker {
    pub fn largest(&self) -> Option<u64> {
        self.ranges.first().map(|&(_, hi)| hi)
    }

    pub fn is_duplicate(&self, pn: u64) -> bool {
        self.ranges.iter().any(|&(lo, hi)| pn >= lo && pn <= hi)
    }

    /// Record a received packet number. Returns false on duplicates.
    pub fn on_packet_received(
        &mut self,
        pn: u64,
        now: Instant,
        ack_eliciting: bool,
        ecn: EcnCodepoint,
        max_ack_delay: Duration,
    ) -> bool {
        if self.is_duplicate(pn) {
            return false;
        }
        self.insert(pn);
        if self.largest() == Some(pn) {
            self.largest_recv_time = Some(now);
        }
        match ecn {
            EcnCodepoint::Ect0 => self.ecn_counts.ect0 += 1,
            EcnCodepoint::Ect1 => self.ecn_counts.ect1 += 1,
            EcnCodepoint::Ce => self.ecn_counts.ecn_ce += 1,
            EcnCodepoint::NotEct => {}
        }
        if ack_eliciting {
            self.ack_pending = true;
            if self.ack_deadline.is_none() {
                self.ack_deadline = Some(now + max_ack_delay);
            }
        }
        true
    }

    fn insert(&mut self, pn: u64) {
        self.ranges.push((pn, pn));
        self.ranges.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        // merge adjacent and overlapping ranges
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for &(lo, hi) in &self.ranges {
            if let Some(last) = merged.last_mut() {
                // ranges are sorted descending by lo
                if last.0 <= hi + 1 {
                    last.0 = last.0.min(lo);
                    last.1 = last.1.max(hi);
                    continue;
                }
            }
            merged.push((lo, hi));
        }
        self.ranges = merged;
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        if self.ack_pending {
            self.ack_deadline
        } else {
            None
        }
    }

    pub fn has_ecn_counts(&self) -> bool {
        self.ecn_counts.total() > 0
    }

    /// Build an ACK frame for everything received so far and clear the
    /// pending state.
    pub fn build_ack(&mut self, now: Instant, ack_delay_exponent: u64) -> Option<AckFrame> {
        let &(first_lo, largest) = self.ranges.first()?;
        let delay_micros = self
            .largest_recv_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        let ack_delay = delay_micros >> ack_delay_exponent;

        let mut ranges = Vec::with_capacity(self.ranges.len().saturating_sub(1));
        let mut prev_lo = first_lo;
        for &(lo, hi) in self.ranges.iter().skip(1) {
            ranges.push(AckRange {
                gap: prev_lo - hi - 2,
                length: hi - lo,
            });
            prev_lo = lo;
        }

        self.ack_pending = false;
        self.ack_deadline = None;

        Some(AckFrame {
            largest_acknowledged: largest,
            ack_delay,
            first_range: largest - first_lo,
            ranges,
            ecn: if self.has_ecn_counts() {
                Some(self.ecn_counts)
            } else {
                None
            },
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn recv(tracker: &mut AckTracker, pn: u64, now: Instant) -> bool {
        tracker.on_packet_received(
            pn,
            now,
            true,
            EcnCodepoint::NotEct,
            Duration::from_millis(25),
        )
    }

    #[test]
    fn test_duplicate_detection() {
        let mut t = AckTracker::default();
        let now = Instant::now();
        assert!(recv(&mut t, 5, now));
        assert!(!recv(&mut t, 5, now));
        assert!(recv(&mut t, 6, now));
        assert_eq!(t.largest(), Some(6));
    }

    #[test]
    fn test_range_merging_and_ack_build() {
        let mut t = AckTracker::default();
        let now = Instant::now();
        for pn in [0u64, 1, 2, 5, 6, 9] {
            recv(&mut t, pn, now);
        }
        let ack = t.build_ack(now, 3).unwrap();
        assert_eq!(ack.largest_acknowledged, 9);
        assert_eq!(ack.first_range, 0);
        // 9, then gap to 5..=6, then gap to 0..=2
        assert_eq!(
            ack.ranges,
            vec![AckRange { gap: 1, length: 1 }, AckRange { gap: 1, length: 2 }]
        );
        assert!(!t.ack_pending());
        // the frame's own span arithmetic agrees
        assert_eq!(ack.spans().unwrap(), vec![(9, 9), (5, 6), (0, 2)]);
    }

    #[test]
    fn test_ecn_counts_ride_along() {
        let mut t = AckTracker::default();
        let now = Instant::now();
        t.on_packet_received(0, now, true, EcnCodepoint::Ect0, Duration::ZERO);
        t.on_packet_received(1, now, true, EcnCodepoint::Ce, Duration::ZERO);
        let ack = t.build_ack(now, 3).unwrap();
        assert_eq!(
            ack.ecn,
            Some(EcnCounts {
                ect0: 1,
                ect1: 0,
                ecn_ce: 1
            })
        );
    }

    #[test]
    fn test_ack_delay_scaling() {
        let mut t = AckTracker::default();
        let t0 = Instant::now();
        recv(&mut t, 0, t0);
        let ack = t.build_ack(t0 + Duration::from_micros(800), 3).unwrap();
        assert_eq!(ack.ack_delay, 100);
    }
}
