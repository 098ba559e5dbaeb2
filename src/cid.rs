use std::fmt;

use rand::RngCore;

use crate::result::{QuicError, QuicResult, TransportError};

pub const MAX_CID_LEN: usize = 20;

/// Connection identifier, 0-20 bytes (RFC 9000 Section 5.1). Stored inline;
/// ordering is lexicographic over the used bytes so CIDs can key maps at the
/// network edge.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    pub fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; MAX_CID_LEN],
        }
    }

    pub fn from_bytes(data: &[u8]) -> QuicResult<Self> {
        if data.len() > MAX_CID_LEN {
            return Err(QuicError::InvalidArgument("connection id exceeds 20 bytes"));
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            len: data.len() as u8,
            bytes,
        })
    }

    /// Random CID of the given length.
    pub fn generate(len: usize) -> QuicResult<Self> {
        if len > MAX_CID_LEN {
            return Err(QuicError::InvalidArgument("connection id exceeds 20 bytes"));
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes[..len]);
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl Ord for ConnectionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl PartialOrd for ConnectionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:")?;
        for b in self.as_slice() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One issued or received CID with its sequence number and reset token.
#[derive(Debug, Clone)]
pub struct CidEntry {
    pub sequence: u64,
    pub cid: ConnectionId,
    pub reset_token: [u8; 16],
}

/// CIDs we have issued to the peer. Issuance stays within the peer's
/// `active_connection_id_limit`; the peer retires entries with
/// RETIRE_CONNECTION_ID.
#[derive(Debug)]
pub struct LocalCidRegistry {
    cid_len: usize,
    entries: Vec<CidEntry>,
    next_sequence: u64,
    peer_active_limit: u64,
}

impl LocalCidRegistry {
    pub fn new(initial: ConnectionId) -> Self {
        let mut reset_token = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut reset_token);
        Self {
            cid_len: initial.len(),
            entries: vec![CidEntry {
                sequence: 0,
                cid: initial,
                reset_token,
            }],
            next_sequence: 1,
            peer_active_limit: 2,
        }
    }

    pub fn set_peer_active_limit(&mut self, limit: u64) {
        self.peer_active_limit = limit.max(2);
    }

    /// The lowest-sequence CID still active; what long headers advertise.
    pub fn first_cid(&self) -> ConnectionId {
        self.entries
            .iter()
            .min_by_key(|e| e.sequence)
            .map(|e| e.cid)
            .unwrap_or_else(ConnectionId::empty)
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.entries.iter().any(|e| &e.cid == cid)
    }

    /// Issue a fresh CID if the peer still has room for one.
    pub fn issue(&mut self) -> QuicResult<Option<CidEntry>> {
        if self.entries.len() as u64 >= self.peer_active_limit {
            return Ok(None);
        }
        let cid = ConnectionId::generate(self.cid_len.max(1))?;
        let mut reset_token = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut reset_token);
        let entry = CidEntry {
            sequence: self.next_sequence,
            cid,
            reset_token,
        };
        self.next_sequence += 1;
        self.entries.push(entry.clone());
        Ok(Some(entry))
    }

    /// Peer retired one of our CIDs. `packet_dcid` is the CID the carrying
    /// packet was routed by; retiring that one is a protocol violation.
    pub fn retire(&mut self, sequence: u64, packet_dcid: &ConnectionId) -> QuicResult<()> {
        if sequence >= self.next_sequence {
            return Err(QuicError::transport(
                TransportError::ProtocolViolation,
                "retired connection id was never issued",
            ));
        }
        if let Some(pos) = self.entries.iter().position(|e| e.sequence == sequence) {
            if &self.entries[pos].cid == packet_dcid {
                return Err(QuicError::transport(
                    TransportError::ProtocolViolation,
                    "peer retired the connection id it is sending to",
                ));
            }
            self.entries.remove(pos);
        }
        Ok(())
    }
}

/// CIDs the peer has issued to us. Tracks the active routing CID and queues
/// retirements requested via `retire_prior_to`.
#[derive(Debug)]
pub struct PeerCidRegistry {
    entries: Vec<CidEntry>,
    active_limit: u64,
    retire_prior_to: u64,
    pending_retirements: Vec<u64>,
}

impl PeerCidRegistry {
    pub fn new(initial: ConnectionId, active_limit: u64) -> Self {
        Self {
            entries: vec![CidEntry {
                sequence: 0,
                cid: initial,
                reset_token: [0u8; 16],
            }],
            active_limit: active_limit.max(2),
            retire_prior_to: 0,
            pending_retirements: Vec::new(),
        }
    }

    /// The CID to put in outgoing short headers.
    pub fn current(&self) -> ConnectionId {
        self.entries
            .iter()
            .min_by_key(|e| e.sequence)
            .map(|e| e.cid)
            .unwrap_or_else(ConnectionId::empty)
    }

    /// Replace sequence 0 once the server's handshake source CID is known.
    pub fn rebind_initial(&mut self, cid: ConnectionId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == 0) {
            entry.cid = cid;
        }
    }

    pub fn on_new_cid(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    ) -> QuicResult<()> {
        if cid.is_empty() {
            return Err(QuicError::transport(
                TransportError::FrameEncodingError,
                "NEW_CONNECTION_ID with empty connection id",
            ));
        }
        if retire_prior_to > sequence {
            return Err(QuicError::transport(
                TransportError::FrameEncodingError,
                "retire_prior_to exceeds sequence number",
            ));
        }
        if let Some(existing) = self.entries.iter().find(|e| e.sequence == sequence) {
            if existing.cid != cid {
                return Err(QuicError::transport(
                    TransportError::ProtocolViolation,
                    "sequence number reused for a different connection id",
                ));
            }
            return Ok(());
        }

        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            let mut retired: Vec<u64> = Vec::new();
            self.entries.retain(|e| {
                if e.sequence < retire_prior_to {
                    retired.push(e.sequence);
                    false
                } else {
                    true
                }
            });
            self.pending_retirements.extend(retired);
        }

        if sequence < self.retire_prior_to {
            // Already retired by a prior frame; acknowledge and move on.
            self.pending_retirements.push(sequence);
            return Ok(());
        }

        self.entries.push(CidEntry {
            sequence,
            cid,
            reset_token,
        });
        if self.entries.len() as u64 > self.active_limit {
            return Err(QuicError::transport(
                TransportError::ConnectionIdLimitError,
                "peer exceeded active_connection_id_limit",
            ));
        }
        Ok(())
    }

    /// Sequence numbers that need a RETIRE_CONNECTION_ID frame.
    pub fn take_retirements(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending_retirements)
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}
