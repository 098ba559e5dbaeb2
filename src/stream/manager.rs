use std::collections::BTreeMap;

use tracing::trace;

use crate::result::{QuicError, QuicResult, TransportError};
use crate::stream::stream::{stream_id, Stream};

/// Per-direction stream concurrency and window configuration.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    pub stream_window: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_streams_bidi: 100,
            max_streams_uni: 100,
            stream_window: crate::stream::stream::DEFAULT_STREAM_WINDOW,
        }
    }
}

/// Stream creation, lookup and lifecycle (RFC 9000 Sections 2-3). Local
/// streams are allocated by lane; peer streams come into being when first
/// referenced on the wire.
#[derive(Debug)]
pub struct StreamManager {
    is_server: bool,

    streams: BTreeMap<u64, Stream>,

    next_local_bidi: u64,
    next_local_uni: u64,
    highest_peer_bidi: Option<u64>,
    highest_peer_uni: Option<u64>,

    // cumulative stream-count limits, ours and the peer's
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,

    // initial per-stream windows from the transport parameters
    send_window: u64,
    recv_window: u64,

    streams_blocked_bidi_sent: bool,
    streams_blocked_uni_sent: bool,
}

impl StreamManager {
    pub fn new(is_server: bool, limits: StreamLimits) -> Self {
        let (next_local_bidi, next_local_uni) = if is_server {
            (stream_id::SERVER_BIDI, stream_id::SERVER_UNI)
        } else {
            (stream_id::CLIENT_BIDI, stream_id::CLIENT_UNI)
        };
        Self {
            is_server,
            streams: BTreeMap::new(),
            next_local_bidi,
            next_local_uni,
            highest_peer_bidi: None,
            highest_peer_uni: None,
            local_max_streams_bidi: limits.max_streams_bidi,
            local_max_streams_uni: limits.max_streams_uni,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            // send credit comes from the peer's transport parameters
            send_window: 0,
            recv_window: limits.stream_window,
            streams_blocked_bidi_sent: false,
            streams_blocked_uni_sent: false,
        }
    }

    pub fn is_local_stream(&self, id: u64) -> bool {
        stream_id::is_server_initiated(id) == self.is_server
    }

    /// Apply the peer's transport parameters.
    pub fn set_peer_limits(&mut self, max_bidi: u64, max_uni: u64, stream_window: u64) {
        self.set_peer_max_streams(true, max_bidi);
        self.set_peer_max_streams(false, max_uni);
        self.send_window = stream_window;
    }

    pub fn set_peer_max_streams(&mut self, bidi: bool, max: u64) {
        if bidi {
            if max > self.peer_max_streams_bidi {
                self.peer_max_streams_bidi = max;
                self.streams_blocked_bidi_sent = false;
            }
        } else if max > self.peer_max_streams_uni {
            self.peer_max_streams_uni = max;
            self.streams_blocked_uni_sent = false;
        }
    }

    pub fn peer_max_streams(&self, bidi: bool) -> u64 {
        if bidi {
            self.peer_max_streams_bidi
        } else {
            self.peer_max_streams_uni
        }
    }

    pub fn local_max_streams(&self, bidi: bool) -> u64 {
        if bidi {
            self.local_max_streams_bidi
        } else {
            self.local_max_streams_uni
        }
    }

    /// Open a locally initiated stream, subject to the peer's MAX_STREAMS.
    pub fn create_stream(&mut self, bidi: bool) -> QuicResult<u64> {
        let (next, limit) = if bidi {
            (self.next_local_bidi, self.peer_max_streams_bidi)
        } else {
            (self.next_local_uni, self.peer_max_streams_uni)
        };
        if stream_id::sequence(next) >= limit {
            return Err(QuicError::StreamLimit);
        }
        let id = next;
        if bidi {
            self.next_local_bidi += 4;
        } else {
            self.next_local_uni += 4;
        }
        self.streams
            .insert(id, Stream::new(id, true, self.send_window, self.recv_window));
        trace!(id, bidi, "opened local stream");
        Ok(id)
    }

    /// STREAMS_BLOCKED is due once per stall on each lane.
    pub fn should_send_streams_blocked(&self, bidi: bool) -> bool {
        let (next, limit, sent) = if bidi {
            (
                self.next_local_bidi,
                self.peer_max_streams_bidi,
                self.streams_blocked_bidi_sent,
            )
        } else {
            (
                self.next_local_uni,
                self.peer_max_streams_uni,
                self.streams_blocked_uni_sent,
            )
        };
        stream_id::sequence(next) >= limit && !sent
    }

    pub fn mark_streams_blocked_sent(&mut self, bidi: bool) {
        if bidi {
            self.streams_blocked_bidi_sent = true;
        } else {
            self.streams_blocked_uni_sent = true;
        }
    }

    pub fn get_stream(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn has_stream(&self, id: u64) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn stream_ids(&self) -> Vec<u64> {
        self.streams.keys().copied().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Look up a stream referenced by a received frame, implicitly creating
    /// peer-initiated streams within the advertised limits.
    pub fn get_or_create_stream(&mut self, id: u64) -> QuicResult<&mut Stream> {
        if self.streams.contains_key(&id) {
            return Ok(self.streams.get_mut(&id).expect("present"));
        }
        if self.is_local_stream(id) {
            // a frame for a local stream we never opened
            return Err(QuicError::transport(
                TransportError::StreamStateError,
                "frame references an unopened local stream",
            ));
        }

        let bidi = stream_id::is_bidirectional(id);
        let limit = if bidi {
            self.local_max_streams_bidi
        } else {
            self.local_max_streams_uni
        };
        if stream_id::sequence(id) >= limit {
            return Err(QuicError::transport(
                TransportError::StreamLimitError,
                "peer exceeded the advertised stream limit",
            ));
        }

        // all lower-numbered streams of the same kind come into being too
        let kind = stream_id::kind(id);
        let highest = if bidi {
            &mut self.highest_peer_bidi
        } else {
            &mut self.highest_peer_uni
        };
        let start = match *highest {
            Some(h) => stream_id::sequence(h) + 1,
            None => 0,
        };
        if highest.map_or(true, |h| id > h) {
            *highest = Some(id);
        }
        for seq in start..=stream_id::sequence(id) {
            let sid = stream_id::make(kind, seq);
            self.streams
                .entry(sid)
                .or_insert_with(|| Stream::new(sid, false, self.send_window, self.recv_window));
        }
        // a stream below the high-water mark that is gone was closed and
        // swept; late frames for it are ignorable
        self.streams
            .get_mut(&id)
            .ok_or(QuicError::StreamNotFound(id))
    }

    /// Streams holding buffered data or a pending FIN. Buffered data was
    /// admitted under the stream's credit at write time, so it is always
    /// sendable.
    pub fn streams_with_pending_data(&self) -> Vec<u64> {
        self.streams
            .values()
            .filter(|s| s.wants_to_send())
            .map(|s| s.id())
            .collect()
    }

    /// Sweep streams whose both halves are terminal.
    pub fn remove_closed_streams(&mut self) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, s| !s.is_closed());
        before - self.streams.len()
    }

    /// Reset every open stream (connection teardown).
    pub fn close_all_streams(&mut self, error_code: u64) {
        for stream in self.streams.values_mut() {
            if stream.has_send_half() && !stream.send_state().is_terminal() {
                let _ = stream.reset(error_code);
            }
        }
    }

    pub fn local_streams_opened(&self, bidi: bool) -> u64 {
        let next = if bidi {
            self.next_local_bidi
        } else {
            self.next_local_uni
        };
        stream_id::sequence(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager(is_server: bool) -> StreamManager {
        let mut mgr = StreamManager::new(is_server, StreamLimits::default());
        mgr.set_peer_limits(100, 100, 65_536);
        mgr
    }

    #[test]
    fn test_lane_allocation() {
        let mut client = manager(false);
        assert_eq!(client.create_stream(true).unwrap(), 0);
        assert_eq!(client.create_stream(true).unwrap(), 4);
        assert_eq!(client.create_stream(false).unwrap(), 2);
        assert_eq!(client.create_stream(false).unwrap(), 6);

        let mut server = manager(true);
        assert_eq!(server.create_stream(true).unwrap(), 1);
        assert_eq!(server.create_stream(true).unwrap(), 5);
        assert_eq!(server.create_stream(false).unwrap(), 3);
        assert_eq!(server.create_stream(false).unwrap(), 7);
    }

    #[test]
    fn test_peer_limit_stalls_creation() {
        let mut mgr = StreamManager::new(false, StreamLimits::default());
        mgr.set_peer_limits(1, 0, 65_536);

        assert_eq!(mgr.create_stream(true).unwrap(), 0);
        assert_eq!(mgr.create_stream(true), Err(QuicError::StreamLimit));
        assert!(mgr.should_send_streams_blocked(true));
        mgr.mark_streams_blocked_sent(true);
        assert!(!mgr.should_send_streams_blocked(true));

        // MAX_STREAMS lifts the stall
        mgr.set_peer_max_streams(true, 2);
        assert_eq!(mgr.create_stream(true).unwrap(), 4);

        assert_eq!(mgr.create_stream(false), Err(QuicError::StreamLimit));
    }

    #[test]
    fn test_implicit_peer_streams() {
        let mut server = manager(true);
        // client bidi stream 8 implies streams 0 and 4 as well
        server.get_or_create_stream(8).unwrap();
        assert!(server.has_stream(0));
        assert!(server.has_stream(4));
        assert!(server.has_stream(8));
        assert_eq!(server.stream_count(), 3);
    }

    #[test]
    fn test_peer_stream_over_limit_rejected() {
        let mut mgr = StreamManager::new(false, StreamLimits {
            max_streams_bidi: 2,
            max_streams_uni: 0,
            stream_window: 1024,
        });
        mgr.set_peer_limits(100, 100, 65_536);

        // server bidi ids 1, 5 are within our limit of 2; 9 is not
        assert!(mgr.get_or_create_stream(1).is_ok());
        assert!(mgr.get_or_create_stream(5).is_ok());
        let err = mgr.get_or_create_stream(9).unwrap_err();
        assert_eq!(err.wire_code(), TransportError::StreamLimitError);

        // server uni id 3: our uni limit is 0
        let err = mgr.get_or_create_stream(3).unwrap_err();
        assert_eq!(err.wire_code(), TransportError::StreamLimitError);
    }

    #[test]
    fn test_unopened_local_stream_is_error() {
        let mut mgr = manager(false);
        // a frame for client-bidi 0 that we never opened
        let err = mgr.get_or_create_stream(0).unwrap_err();
        assert_eq!(err.wire_code(), TransportError::StreamStateError);
    }

    #[test]
    fn test_remove_closed_streams() {
        let mut mgr = manager(false);
        let id = mgr.create_stream(true).unwrap();
        assert_eq!(mgr.remove_closed_streams(), 0);

        let stream = mgr.get_stream(id).unwrap();
        stream.finish().unwrap();
        let frame = stream.next_stream_frame(100).unwrap();
        stream.acknowledge_data(frame.offset, frame.data.len() as u64, true);
        // recv half still open for a bidi stream
        assert_eq!(mgr.remove_closed_streams(), 0);

        let stream = mgr.get_stream(id).unwrap();
        stream.receive_data(0, b"", true).unwrap();
        stream.read(&mut [0u8; 4]).unwrap();
        assert_eq!(mgr.remove_closed_streams(), 1);
        assert!(!mgr.has_stream(id));
    }

    #[test]
    fn test_pending_data_query() {
        let mut mgr = manager(false);
        let id = mgr.create_stream(true).unwrap();
        assert!(mgr.streams_with_pending_data().is_empty());
        mgr.get_stream(id).unwrap().write(b"data").unwrap();
        assert_eq!(mgr.streams_with_pending_data(), vec![id]);
    }
}
