use std::time::Instant;

use tracing::{debug, warn};

use crate::packet::frame::EcnCounts;
use crate::packet::types::EcnCodepoint;

/// Cumulative marks required before the path is declared ECN-capable
/// (RFC 9000 Section 13.4.2).
const VALIDATION_THRESHOLD: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcnResult {
    None,
    /// ECN-CE increased; congestion controller must react. Carries the
    /// earliest send time of the newly acknowledged packets for
    /// recovery-window gating.
    CongestionSignal,
    /// Validation failed; ECN is permanently disabled on this path.
    Failure,
}

/// ECN capability tracking and ACK-count validation (RFC 9000 Section 13.4,
/// RFC 9002 Section 7.1).
#[derive(Debug)]
pub struct EcnTracker {
    testing: bool,
    capable: bool,
    failed: bool,
    counts: EcnCounts,
    packets_sent_with_ect: u64,
    last_congestion_sent_time: Option<Instant>,
}

impl Default for EcnTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EcnTracker {
    pub fn new() -> Self {
        Self {
            testing: true,
            capable: false,
            failed: false,
            counts: EcnCounts::default(),
            packets_sent_with_ect: 0,
            last_congestion_sent_time: None,
        }
    }

    pub fn is_testing(&self) -> bool {
        self.testing
    }

    pub fn is_capable(&self) -> bool {
        self.capable
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Marking to apply to outgoing packets.
    pub fn outgoing_marking(&self) -> EcnCodepoint {
        if self.failed {
            EcnCodepoint::NotEct
        } else {
            EcnCodepoint::Ect0
        }
    }

    pub fn on_packets_sent(&mut self, count: u64) {
        if !self.failed {
            self.packets_sent_with_ect += count;
        }
    }

    pub fn last_congestion_sent_time(&self) -> Option<Instant> {
        self.last_congestion_sent_time
    }

    /// Process the ECN counts from an ACK_ECN frame. `packets_acked` is the
    /// number of newly acknowledged packets; `earliest_sent_time` the
    /// oldest send time among them.
    pub fn process_ecn_counts(
        &mut self,
        counts: EcnCounts,
        packets_acked: u64,
        earliest_sent_time: Instant,
    ) -> EcnResult {
        if self.failed {
            return EcnResult::Failure;
        }

        // counts are cumulative; any decrease is invalid
        if counts.ect0 < self.counts.ect0
            || counts.ect1 < self.counts.ect1
            || counts.ecn_ce < self.counts.ecn_ce
        {
            warn!("ecn counts decreased, disabling ecn");
            self.disable();
            return EcnResult::Failure;
        }

        if self.testing {
            if !self.validate(counts, packets_acked) {
                warn!("ecn validation failed, path strips marks");
                self.disable();
                return EcnResult::Failure;
            }
            if counts.total() >= VALIDATION_THRESHOLD {
                self.testing = false;
                self.capable = true;
                debug!("ecn validated, path is capable");
            }
        }

        let mut result = EcnResult::None;
        if counts.ecn_ce > self.counts.ecn_ce {
            result = EcnResult::CongestionSignal;
            self.last_congestion_sent_time = Some(earliest_sent_time);
        }

        self.counts = counts;
        result
    }

    /// The total count increase must cover every newly acknowledged packet
    /// that was sent with an ECT codepoint (RFC 9000 Section 13.4.2.1).
    fn validate(&self, counts: EcnCounts, packets_acked: u64) -> bool {
        let total_increase = (counts.ect0 - self.counts.ect0)
            + (counts.ect1 - self.counts.ect1)
            + (counts.ecn_ce - self.counts.ecn_ce);
        !(total_increase < packets_acked && self.packets_sent_with_ect > 0)
    }

    pub fn disable(&mut self) {
        self.failed = true;
        self.testing = false;
        self.capable = false;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
