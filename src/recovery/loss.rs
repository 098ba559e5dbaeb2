use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::packet::frame::{AckFrame, Frame};
use crate::packet::types::{EncryptionLevel, SpaceId};
use crate::recovery::ecn::{EcnResult, EcnTracker};
use crate::recovery::rtt::{RttEstimator, GRANULARITY};

/// Reordering threshold in packets (RFC 9002 Section 6.1.1).
const PACKET_THRESHOLD: u64 = 3;
/// Time threshold multiplier, 9/8 (RFC 9002 Section 6.1.2).
const TIME_THRESHOLD_NUM: u32 = 9;
const TIME_THRESHOLD_DEN: u32 = 8;
/// Persistent congestion threshold (RFC 9002 Section 7.6.1).
const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// Per-packet bookkeeping (RFC 9002 Appendix A.1.1). The carried frames are
/// kept until acknowledgment so lost contents can be rebundled.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: u64,
    pub sent_time: Instant,
    pub sent_bytes: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub level: EncryptionLevel,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossEvent {
    None,
    PacketLost,
    PtoExpired,
}

/// Outcome of ACK processing or a timer expiry.
#[derive(Debug)]
pub struct LossResult {
    pub event: LossEvent,
    pub acked_packets: Vec<SentPacket>,
    pub lost_packets: Vec<SentPacket>,
    pub ecn_signal: EcnResult,
    pub ecn_congestion_sent_time: Option<Instant>,
    pub persistent_congestion: bool,
}

impl LossResult {
    fn new() -> Self {
        Self {
            event: LossEvent::None,
            acked_packets: Vec::new(),
            lost_packets: Vec::new(),
            ecn_signal: EcnResult::None,
            ecn_congestion_sent_time: None,
            persistent_congestion: false,
        }
    }
}

/// Per packet-number-space state (RFC 9002 Appendix A.1).
#[derive(Debug, Default)]
struct SpaceState {
    largest_acked: Option<u64>,
    time_of_last_ack_eliciting: Option<Instant>,
    sent_packets: BTreeMap<u64, SentPacket>,
    loss_time: Option<Instant>,
    bytes_in_flight: usize,
}

impl SpaceState {
    fn has_ack_eliciting(&self) -> bool {
        self.sent_packets.values().any(|p| p.ack_eliciting)
    }
}

/// QUIC loss detection (RFC 9002 Section 6): packet-threshold and
/// time-threshold loss plus the PTO machinery. Owns the RTT estimator and
/// the ECN tracker; the connection reads both through accessors.
#[derive(Debug)]
pub struct LossDetector {
    rtt: RttEstimator,
    ecn: EcnTracker,
    spaces: [SpaceState; 3],
    pto_count: u32,
    handshake_confirmed: bool,
    timer: Option<Instant>,
}

impl LossDetector {
    pub fn new(rtt: RttEstimator) -> Self {
        Self {
            rtt,
            ecn: EcnTracker::new(),
            spaces: Default::default(),
            pto_count: 0,
            handshake_confirmed: false,
            timer: None,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn rtt_mut(&mut self) -> &mut RttEstimator {
        &mut self.rtt
    }

    pub fn ecn(&self) -> &EcnTracker {
        &self.ecn
    }

    pub fn ecn_mut(&mut self) -> &mut EcnTracker {
        &mut self.ecn
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    pub fn set_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        let space = &mut self.spaces[packet.level.space().index()];
        if packet.in_flight {
            space.bytes_in_flight += packet.sent_bytes;
        }
        if packet.ack_eliciting {
            space.time_of_last_ack_eliciting = Some(packet.sent_time);
        }
        space.sent_packets.insert(packet.packet_number, packet);
        self.set_loss_detection_timer();
    }

    /// Process a received ACK (RFC 9002 Section 6). `ack_delay` is already
    /// scaled by the peer's ack_delay_exponent.
    pub fn on_ack_received(
        &mut self,
        ack: &AckFrame,
        level: EncryptionLevel,
        ack_delay: Duration,
        recv_time: Instant,
    ) -> LossResult {
        let mut result = LossResult::new();
        let idx = level.space().index();
        let spans = match ack.spans() {
            Ok(spans) => spans,
            Err(_) => return result,
        };

        // older ACKs that would shrink the view are ignored
        let space = &mut self.spaces[idx];
        if space
            .largest_acked
            .map_or(true, |l| ack.largest_acknowledged > l)
        {
            space.largest_acked = Some(ack.largest_acknowledged);
        }

        for &(lo, hi) in &spans {
            // collect the acknowledged packets we actually have
            let in_span: Vec<u64> = space
                .sent_packets
                .range(lo..=hi)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in in_span {
                let pkt = space.sent_packets.remove(&pn).expect("present");
                if pkt.in_flight {
                    space.bytes_in_flight -= pkt.sent_bytes;
                }
                result.acked_packets.push(pkt);
            }
        }

        if !result.acked_packets.is_empty() {
            // RTT sample only when the largest acknowledged packet is newly
            // acked and the ack is ack-eliciting (RFC 9002 Section 5.1)
            if let Some(largest) = result
                .acked_packets
                .iter()
                .find(|p| p.packet_number == ack.largest_acknowledged)
            {
                if largest.ack_eliciting {
                    let latest = recv_time.saturating_duration_since(largest.sent_time);
                    self.rtt.update(latest, ack_delay, self.handshake_confirmed);
                }
            }
            self.pto_count = 0;
        }

        result.lost_packets = self.detect_lost_packets(level, recv_time);
        if !result.lost_packets.is_empty() {
            result.event = LossEvent::PacketLost;
            result.persistent_congestion =
                self.in_persistent_congestion(&result.lost_packets);
        }

        // ECN counts ride along with the ACK (RFC 9000 Section 13.4)
        if let Some(counts) = ack.ecn {
            if !result.acked_packets.is_empty() {
                let earliest = result
                    .acked_packets
                    .iter()
                    .map(|p| p.sent_time)
                    .min()
                    .expect("non-empty");
                let signal =
                    self.ecn
                        .process_ecn_counts(counts, result.acked_packets.len() as u64, earliest);
                result.ecn_signal = signal;
                if signal == EcnResult::CongestionSignal {
                    result.ecn_congestion_sent_time = self.ecn.last_congestion_sent_time();
                }
            }
        }

        self.set_loss_detection_timer();
        result
    }

    /// Loss delay: max(9/8 · max(smoothed, latest), min_rtt, granularity).
    fn loss_delay(&self) -> Duration {
        let smoothed = self.rtt.smoothed_rtt();
        let latest = self.rtt.latest_rtt();
        let min_rtt = if self.rtt.min_rtt() == Duration::MAX {
            smoothed
        } else {
            self.rtt.min_rtt()
        };
        let base = smoothed.max(latest);
        (base * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN)
            .max(min_rtt)
            .max(GRANULARITY)
    }

    fn detect_lost_packets(&mut self, level: EncryptionLevel, now: Instant) -> Vec<SentPacket> {
        let loss_delay = self.loss_delay();
        let space = &mut self.spaces[level.space().index()];
        let mut lost = Vec::new();

        let largest_acked = match space.largest_acked {
            Some(l) => l,
            None => return lost,
        };

        space.loss_time = None;
        let lost_send_time = now.checked_sub(loss_delay);
        let mut keep = BTreeMap::new();
        for (pn, packet) in std::mem::take(&mut space.sent_packets) {
            if pn > largest_acked {
                keep.insert(pn, packet);
                continue;
            }
            let time_lost = lost_send_time.map_or(false, |t| packet.sent_time <= t);
            let reorder_lost = largest_acked >= pn + PACKET_THRESHOLD;
            if time_lost || reorder_lost {
                if packet.in_flight {
                    space.bytes_in_flight -= packet.sent_bytes;
                }
                trace!(pn, time_lost, reorder_lost, "packet declared lost");
                lost.push(packet);
            } else {
                // may yet be lost by the time threshold
                let when = packet.sent_time + loss_delay;
                if space.loss_time.map_or(true, |t| when < t) {
                    space.loss_time = Some(when);
                }
                keep.insert(pn, packet);
            }
        }
        space.sent_packets = keep;
        lost
    }

    /// All packets over a span of at least 3 PTO durations lost, with a
    /// valid RTT sample (RFC 9002 Section 7.6).
    fn in_persistent_congestion(&self, lost: &[SentPacket]) -> bool {
        if !self.rtt.has_sample() {
            return false;
        }
        let eliciting: Vec<&SentPacket> = lost.iter().filter(|p| p.ack_eliciting).collect();
        if eliciting.len() < 2 {
            return false;
        }
        let earliest = eliciting.iter().map(|p| p.sent_time).min().expect("some");
        let latest = eliciting.iter().map(|p| p.sent_time).max().expect("some");
        let duration = (self.rtt.smoothed_rtt()
            + (self.rtt.rttvar() * 4).max(GRANULARITY)
            + self.rtt.max_ack_delay())
            * PERSISTENT_CONGESTION_THRESHOLD;
        latest.saturating_duration_since(earliest) >= duration
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.timer
    }

    /// Timer expiry (RFC 9002 Section 6.2): run time-threshold loss if the
    /// earliest loss time is due, otherwise fire a PTO.
    pub fn on_timeout(&mut self, now: Instant) -> LossResult {
        let mut result = LossResult::new();

        if let Some((loss_time, level)) = self.earliest_loss_time() {
            if loss_time <= now {
                result.lost_packets = self.detect_lost_packets(level, now);
                if !result.lost_packets.is_empty() {
                    result.event = LossEvent::PacketLost;
                    result.persistent_congestion =
                        self.in_persistent_congestion(&result.lost_packets);
                }
                self.set_loss_detection_timer();
                return result;
            }
        }

        self.pto_count += 1;
        result.event = LossEvent::PtoExpired;
        debug!(pto_count = self.pto_count, "probe timeout expired");
        self.set_loss_detection_timer();
        result
    }

    fn earliest_loss_time(&self) -> Option<(Instant, EncryptionLevel)> {
        let mut earliest: Option<(Instant, EncryptionLevel)> = None;
        for (i, space) in self.spaces.iter().enumerate() {
            if let Some(t) = space.loss_time {
                if earliest.map_or(true, |(e, _)| t < e) {
                    earliest = Some((t, level_for_space(i)));
                }
            }
        }
        earliest
    }

    fn pto_time(&self) -> Option<Instant> {
        // exponential backoff on consecutive expiries without an ACK
        let pto = self.rtt.pto() * (1u32 << self.pto_count.min(16));
        let mut earliest: Option<Instant> = None;
        for (i, space) in self.spaces.iter().enumerate() {
            if !space.has_ack_eliciting() {
                continue;
            }
            // the application space does not arm the PTO until the
            // handshake is confirmed (RFC 9002 Section 6.2.1)
            if i == SpaceId::Application.index() && !self.handshake_confirmed {
                continue;
            }
            if let Some(base) = space.time_of_last_ack_eliciting {
                let when = base + pto;
                if earliest.map_or(true, |e| when < e) {
                    earliest = Some(when);
                }
            }
        }
        earliest
    }

    fn set_loss_detection_timer(&mut self) {
        if let Some((loss_time, _)) = self.earliest_loss_time() {
            self.timer = Some(loss_time);
            return;
        }
        if !self.spaces.iter().any(|s| s.has_ack_eliciting()) {
            self.timer = None;
            return;
        }
        self.timer = self.pto_time();
    }

    pub fn largest_acked(&self, level: EncryptionLevel) -> Option<u64> {
        self.spaces[level.space().index()].largest_acked
    }

    pub fn has_unacked(&self, level: EncryptionLevel) -> bool {
        !self.spaces[level.space().index()].sent_packets.is_empty()
    }

    pub fn bytes_in_flight(&self, level: EncryptionLevel) -> usize {
        self.spaces[level.space().index()].bytes_in_flight
    }

    pub fn total_bytes_in_flight(&self) -> usize {
        self.spaces.iter().map(|s| s.bytes_in_flight).sum()
    }

    /// Pull the 0-RTT packet records out of the application space after the
    /// server rejected early data; their frames move to 1-RTT.
    pub fn take_zero_rtt_packets(&mut self) -> Vec<SentPacket> {
        let space = &mut self.spaces[SpaceId::Application.index()];
        let mut zero_rtt = Vec::new();
        let mut keep = BTreeMap::new();
        for (pn, packet) in std::mem::take(&mut space.sent_packets) {
            if packet.level == EncryptionLevel::ZeroRtt {
                if packet.in_flight {
                    space.bytes_in_flight -= packet.sent_bytes;
                }
                zero_rtt.push(packet);
            } else {
                keep.insert(pn, packet);
            }
        }
        space.sent_packets = keep;
        self.set_loss_detection_timer();
        zero_rtt
    }

    /// Drop all state for a space whose keys were discarded. Returns the
    /// abandoned records so the congestion controller can forget them.
    pub fn discard_space(&mut self, level: EncryptionLevel) -> Vec<SentPacket> {
        let space = &mut self.spaces[level.space().index()];
        let packets: Vec<SentPacket> =
            std::mem::take(&mut space.sent_packets).into_values().collect();
        *space = SpaceState::default();
        self.set_loss_detection_timer();
        packets
    }
}

fn level_for_space(index: usize) -> EncryptionLevel {
    match index {
        0 => EncryptionLevel::Initial,
        1 => EncryptionLevel::Handshake,
        _ => EncryptionLevel::Application,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn detector() -> LossDetector {
        LossDetector::new(RttEstimator::default())
    }

    fn packet(pn: u64, at: Instant) -> SentPacket {
        SentPacket {
            packet_number: pn,
            sent_time: at,
            sent_bytes: 1200,
            ack_eliciting: true,
            in_flight: true,
            level: EncryptionLevel::Application,
            frames: vec![Frame::Ping],
        }
    }

    fn ack_largest(largest: u64, first_range: u64) -> AckFrame {
        AckFrame {
            largest_acknowledged: largest,
            ack_delay: 0,
            first_range,
            ranges: vec![],
            ecn: None,
        }
    }

    #[test]
    fn test_ack_removes_and_samples_rtt() {
        let mut ld = detector();
        ld.set_handshake_confirmed();
        let t0 = Instant::now();
        for pn in 0..3 {
            ld.on_packet_sent(packet(pn, t0));
        }
        assert_eq!(ld.bytes_in_flight(EncryptionLevel::Application), 3600);

        let recv = t0 + Duration::from_millis(40);
        let result = ld.on_ack_received(
            &ack_largest(2, 2),
            EncryptionLevel::Application,
            Duration::ZERO,
            recv,
        );
        assert_eq!(result.acked_packets.len(), 3);
        assert!(result.lost_packets.is_empty());
        assert_eq!(ld.bytes_in_flight(EncryptionLevel::Application), 0);
        assert_eq!(ld.rtt().latest_rtt(), Duration::from_millis(40));
        assert!(!ld.has_unacked(EncryptionLevel::Application));
    }

    #[test]
    fn test_packet_threshold_loss() {
        let mut ld = detector();
        let t0 = Instant::now();
        // 97 is left unacked; acking 100 with gap 3 declares it lost
        ld.on_packet_sent(packet(97, t0));
        ld.on_packet_sent(packet(100, t0));

        let result = ld.on_ack_received(
            &ack_largest(100, 0),
            EncryptionLevel::Application,
            Duration::ZERO,
            t0 + Duration::from_millis(1),
        );
        assert_eq!(result.event, LossEvent::PacketLost);
        assert_eq!(result.lost_packets.len(), 1);
        assert_eq!(result.lost_packets[0].packet_number, 97);
    }

    #[test]
    fn test_gap_two_needs_time_threshold() {
        let mut ld = detector();
        ld.set_handshake_confirmed();
        let t0 = Instant::now();
        ld.on_packet_sent(packet(98, t0));
        ld.on_packet_sent(packet(100, t0));

        // young packet with gap 2: not lost, but a loss timer is armed
        let result = ld.on_ack_received(
            &ack_largest(100, 0),
            EncryptionLevel::Application,
            Duration::ZERO,
            t0 + Duration::from_millis(1),
        );
        assert!(result.lost_packets.is_empty());
        assert!(ld.has_unacked(EncryptionLevel::Application));
        let timer = ld.next_timeout().expect("loss timer armed");

        // firing the timer after the loss delay declares it lost
        let result = ld.on_timeout(timer);
        assert_eq!(result.event, LossEvent::PacketLost);
        assert_eq!(result.lost_packets[0].packet_number, 98);
    }

    #[test]
    fn test_gap_two_old_packet_is_lost_immediately() {
        let mut ld = detector();
        ld.set_handshake_confirmed();
        let t0 = Instant::now();
        ld.on_packet_sent(packet(98, t0));
        let t_late = t0 + Duration::from_secs(2);
        ld.on_packet_sent(packet(100, t_late));

        // by the time the ack arrives, 98 exceeds the time threshold
        let result = ld.on_ack_received(
            &ack_largest(100, 0),
            EncryptionLevel::Application,
            Duration::ZERO,
            t_late + Duration::from_millis(30),
        );
        assert_eq!(result.lost_packets.len(), 1);
        assert_eq!(result.lost_packets[0].packet_number, 98);
    }

    #[test]
    fn test_pto_fires_and_backs_off() {
        let mut ld = detector();
        ld.set_handshake_confirmed();
        let t0 = Instant::now();
        ld.on_packet_sent(packet(1, t0));

        let first = ld.next_timeout().expect("pto armed");
        assert_eq!(first, t0 + ld.rtt().pto());

        let result = ld.on_timeout(first);
        assert_eq!(result.event, LossEvent::PtoExpired);
        assert_eq!(ld.pto_count(), 1);

        // doubled after the first expiry
        let second = ld.next_timeout().expect("still armed");
        assert_eq!(second, t0 + ld.rtt().pto() * 2);

        // a new ack resets the backoff
        ld.on_ack_received(
            &ack_largest(1, 0),
            EncryptionLevel::Application,
            Duration::ZERO,
            t0 + Duration::from_millis(10),
        );
        assert_eq!(ld.pto_count(), 0);
        assert!(ld.next_timeout().is_none(), "nothing left in flight");
    }

    #[test]
    fn test_handshake_space_gates_pto() {
        let mut ld = detector();
        let t0 = Instant::now();
        // application packet before handshake confirmation does not arm
        ld.on_packet_sent(packet(0, t0));
        assert!(ld.next_timeout().is_none());
        ld.set_handshake_confirmed();
        ld.on_packet_sent(packet(1, t0));
        assert!(ld.next_timeout().is_some());
    }

    #[test]
    fn test_persistent_congestion_span() {
        let mut ld = detector();
        ld.set_handshake_confirmed();
        let t0 = Instant::now();
        ld.on_packet_sent(packet(0, t0));
        // establish an rtt sample
        ld.on_ack_received(
            &ack_largest(0, 0),
            EncryptionLevel::Application,
            Duration::ZERO,
            t0 + Duration::from_millis(30),
        );

        // a long run of packets, all lost: span far exceeds 3 PTOs
        let start = t0 + Duration::from_millis(100);
        for i in 0..10u64 {
            ld.on_packet_sent(packet(10 + i, start + Duration::from_millis(500 * i as u64)));
        }
        ld.on_packet_sent(packet(40, start + Duration::from_secs(6)));
        let result = ld.on_ack_received(
            &ack_largest(40, 0),
            EncryptionLevel::Application,
            Duration::ZERO,
            start + Duration::from_secs(6) + Duration::from_millis(30),
        );
        assert_eq!(result.event, LossEvent::PacketLost);
        assert!(result.persistent_congestion);
    }

    #[test]
    fn test_discard_space() {
        let mut ld = detector();
        let t0 = Instant::now();
        let mut init = packet(0, t0);
        init.level = EncryptionLevel::Initial;
        ld.on_packet_sent(init);
        assert!(ld.has_unacked(EncryptionLevel::Initial));

        let discarded = ld.discard_space(EncryptionLevel::Initial);
        assert_eq!(discarded.len(), 1);
        assert!(!ld.has_unacked(EncryptionLevel::Initial));
        assert_eq!(ld.bytes_in_flight(EncryptionLevel::Initial), 0);
        assert!(ld.next_timeout().is_none());
    }
}
