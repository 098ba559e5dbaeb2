use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::packet::frame::StreamFrame;
use crate::result::{QuicError, QuicResult, TransportError};

/// Stream-ID bit layout (RFC 9000 Section 2.1): bit 0 = initiator,
/// bit 1 = directionality.
pub mod stream_id {
    pub const CLIENT_BIDI: u64 = 0x00;
    pub const SERVER_BIDI: u64 = 0x01;
    pub const CLIENT_UNI: u64 = 0x02;
    pub const SERVER_UNI: u64 = 0x03;

    pub const fn is_client_initiated(id: u64) -> bool {
        id & 0x01 == 0
    }

    pub const fn is_server_initiated(id: u64) -> bool {
        id & 0x01 == 1
    }

    pub const fn is_bidirectional(id: u64) -> bool {
        id & 0x02 == 0
    }

    pub const fn is_unidirectional(id: u64) -> bool {
        id & 0x02 != 0
    }

    pub const fn kind(id: u64) -> u64 {
        id & 0x03
    }

    pub const fn sequence(id: u64) -> u64 {
        id >> 2
    }

    pub const fn make(kind: u64, sequence: u64) -> u64 {
        (sequence << 2) | (kind & 0x03)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SendState::DataRecvd | SendState::ResetRecvd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl RecvState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecvState::DataRead | RecvState::ResetRead)
    }
}

pub const DEFAULT_STREAM_WINDOW: u64 = 65_536;
const WINDOW_UPDATE_THRESHOLD: f64 = 0.5;

/// One stream's send and receive halves (RFC 9000 Section 3). Each half is
/// an independent state machine; unidirectional streams only ever use one.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    is_local: bool,

    // send half
    send_state: SendState,
    send_buffer: VecDeque<u8>,
    send_offset: u64,
    acked_offset: u64,
    acked_ranges: BTreeMap<u64, u64>,
    fin_requested: bool,
    fin_sent: bool,
    fin_acked: bool,
    max_send_offset: u64,
    blocked_sent: bool,
    reset_error_code: Option<u64>,

    // receive half
    recv_state: RecvState,
    recv_buffer: BTreeMap<u64, Vec<u8>>,
    recv_ready: VecDeque<u8>,
    recv_offset: u64,
    read_offset: u64,
    highest_recv_offset: u64,
    final_size: Option<u64>,
    max_recv_offset: u64,
    recv_window_size: u64,
    peer_reset_code: Option<u64>,
    stop_sending_code: Option<u64>,
}

impl Stream {
    pub fn new(id: u64, is_local: bool, max_send_offset: u64, recv_window: u64) -> Self {
        Self {
            id,
            is_local,
            send_state: SendState::Ready,
            send_buffer: VecDeque::new(),
            send_offset: 0,
            acked_offset: 0,
            acked_ranges: BTreeMap::new(),
            fin_requested: false,
            fin_sent: false,
            fin_acked: false,
            max_send_offset,
            blocked_sent: false,
            reset_error_code: None,
            recv_state: RecvState::Recv,
            recv_buffer: BTreeMap::new(),
            recv_ready: VecDeque::new(),
            recv_offset: 0,
            read_offset: 0,
            highest_recv_offset: 0,
            final_size: None,
            max_recv_offset: recv_window,
            recv_window_size: recv_window,
            peer_reset_code: None,
            stop_sending_code: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn is_bidirectional(&self) -> bool {
        stream_id::is_bidirectional(self.id)
    }

    pub fn send_state(&self) -> SendState {
        self.send_state
    }

    pub fn recv_state(&self) -> RecvState {
        self.recv_state
    }

    /// Both halves terminal: the stream can be swept.
    pub fn is_closed(&self) -> bool {
        let send_done = self.send_state.is_terminal() || !self.has_send_half();
        let recv_done = self.recv_state.is_terminal() || !self.has_recv_half();
        send_done && recv_done
    }

    /// Whether this endpoint sends on the stream at all.
    pub fn has_send_half(&self) -> bool {
        self.is_bidirectional() || self.is_local
    }

    pub fn has_recv_half(&self) -> bool {
        self.is_bidirectional() || !self.is_local
    }

    // ------------------------------------------------------------------
    // send half
    // ------------------------------------------------------------------

    pub fn can_send(&self) -> bool {
        matches!(self.send_state, SendState::Ready | SendState::Send)
    }

    /// Buffer outgoing data, limited by the peer's stream credit. Returns
    /// the bytes accepted; fails with `StreamBlocked` when no credit is
    /// left at all.
    pub fn write(&mut self, data: &[u8]) -> QuicResult<usize> {
        if !self.has_send_half() {
            return Err(QuicError::transport(
                TransportError::StreamStateError,
                "write on a receive-only stream",
            ));
        }
        if !self.can_send() {
            return Err(QuicError::InvalidState("stream send half closed"));
        }
        let buffered_end = self.send_offset + self.send_buffer.len() as u64;
        let window = self.max_send_offset.saturating_sub(buffered_end) as usize;
        if window == 0 && !data.is_empty() {
            return Err(QuicError::StreamBlocked(self.max_send_offset));
        }
        let n = data.len().min(window);
        self.send_buffer.extend(&data[..n]);
        Ok(n)
    }

    /// No more data will be written; a FIN rides on the last frame.
    pub fn finish(&mut self) -> QuicResult<()> {
        if !self.can_send() {
            return Err(QuicError::InvalidState("stream send half closed"));
        }
        self.fin_requested = true;
        Ok(())
    }

    /// Abruptly terminate the send half.
    pub fn reset(&mut self, error_code: u64) -> QuicResult<u64> {
        if self.send_state.is_terminal() {
            return Err(QuicError::InvalidState("stream already done"));
        }
        self.send_buffer.clear();
        self.reset_error_code = Some(error_code);
        self.send_state = SendState::ResetSent;
        // final size is the highest offset ever handed to the wire
        Ok(self.send_offset)
    }

    pub fn on_reset_acked(&mut self) {
        if self.send_state == SendState::ResetSent {
            self.send_state = SendState::ResetRecvd;
        }
    }

    pub fn reset_error_code(&self) -> Option<u64> {
        self.reset_error_code
    }

    pub fn pending_bytes(&self) -> usize {
        self.send_buffer.len()
    }

    /// True when a frame is waiting: data in the buffer, or an unsent FIN.
    pub fn wants_to_send(&self) -> bool {
        self.can_send() && (!self.send_buffer.is_empty() || (self.fin_requested && !self.fin_sent))
    }

    /// Pull the next STREAM frame, at most `max_bytes` of payload.
    pub fn next_stream_frame(&mut self, max_bytes: usize) -> Option<StreamFrame> {
        if !self.wants_to_send() {
            return None;
        }
        let n = self.send_buffer.len().min(max_bytes);
        let data: Vec<u8> = self.send_buffer.drain(..n).collect();
        let offset = self.send_offset;
        self.send_offset += n as u64;

        let fin = self.fin_requested && self.send_buffer.is_empty();
        if fin {
            self.fin_sent = true;
        }
        if self.send_state == SendState::Ready {
            self.send_state = SendState::Send;
        }
        if fin && self.send_buffer.is_empty() {
            self.send_state = SendState::DataSent;
        }
        Some(StreamFrame {
            stream_id: self.id,
            offset,
            data: Bytes::from(data),
            fin,
        })
    }

    /// Peer acknowledged `[offset, offset + length)` (and the FIN when
    /// `fin` is set). Out-of-order acknowledgments are merged; the stream
    /// completes when the contiguous frontier reaches everything sent.
    pub fn acknowledge_data(&mut self, offset: u64, length: u64, fin: bool) {
        if fin {
            self.fin_acked = true;
        }
        if length > 0 {
            let end = offset + length;
            let entry = self.acked_ranges.entry(offset).or_insert(end);
            if *entry < end {
                *entry = end;
            }
        }
        // advance the contiguous frontier through merged ranges
        loop {
            let mut advanced = false;
            let mut to_remove = Vec::new();
            for (&start, &end) in self.acked_ranges.range(..=self.acked_offset) {
                to_remove.push(start);
                if end > self.acked_offset {
                    self.acked_offset = end;
                    advanced = true;
                }
            }
            for start in to_remove {
                self.acked_ranges.remove(&start);
            }
            if !advanced {
                break;
            }
        }

        if self.send_state == SendState::DataSent
            && self.fin_sent
            && self.fin_acked
            && self.acked_offset >= self.send_offset
        {
            self.send_state = SendState::DataRecvd;
        }
    }

    pub fn acked_offset(&self) -> u64 {
        self.acked_offset
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    // send-side flow control

    pub fn max_send_offset(&self) -> u64 {
        self.max_send_offset
    }

    pub fn set_max_send_offset(&mut self, max: u64) {
        if max > self.max_send_offset {
            self.max_send_offset = max;
            self.blocked_sent = false;
        }
    }

    pub fn available_send_window(&self) -> u64 {
        self.max_send_offset
            .saturating_sub(self.send_offset + self.send_buffer.len() as u64)
    }

    pub fn should_send_stream_data_blocked(&self) -> bool {
        self.can_send() && self.available_send_window() == 0 && !self.blocked_sent
    }

    pub fn mark_stream_data_blocked_sent(&mut self) {
        self.blocked_sent = true;
    }

    // ------------------------------------------------------------------
    // receive half
    // ------------------------------------------------------------------

    pub fn has_data(&self) -> bool {
        !self.recv_ready.is_empty()
    }

    /// Ingest a STREAM frame. Returns the flow-control increment: how far
    /// the highest received offset advanced.
    pub fn receive_data(&mut self, offset: u64, data: &[u8], fin: bool) -> QuicResult<u64> {
        if !self.has_recv_half() {
            return Err(QuicError::transport(
                TransportError::StreamStateError,
                "STREAM frame on a send-only stream",
            ));
        }
        if matches!(self.recv_state, RecvState::ResetRecvd | RecvState::ResetRead) {
            // data after a reset is discarded
            return Ok(0);
        }

        let end = offset + data.len() as u64;
        if end > self.max_recv_offset {
            return Err(QuicError::transport(
                TransportError::FlowControlError,
                "peer exceeded stream flow-control limit",
            ));
        }
        // the final size is immutable once known
        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(QuicError::transport(
                    TransportError::FinalSizeError,
                    "data past the declared final size",
                ));
            }
        }
        if fin {
            if self.highest_recv_offset > end {
                return Err(QuicError::transport(
                    TransportError::FinalSizeError,
                    "final size below already-received data",
                ));
            }
            self.final_size = Some(end);
            if self.recv_state == RecvState::Recv {
                self.recv_state = RecvState::SizeKnown;
            }
        }

        let increment = end.saturating_sub(self.highest_recv_offset);
        self.highest_recv_offset = self.highest_recv_offset.max(end);

        // stash out-of-order data, trimming anything already delivered
        if end > self.recv_offset && !data.is_empty() {
            let (start, slice) = if offset < self.recv_offset {
                (
                    self.recv_offset,
                    &data[(self.recv_offset - offset) as usize..],
                )
            } else {
                (offset, data)
            };
            let entry = self.recv_buffer.entry(start).or_default();
            if entry.len() < slice.len() {
                *entry = slice.to_vec();
            }
        }
        self.reassemble();
        Ok(increment)
    }

    /// Pull contiguous data into the ready queue. Delivery never runs
    /// ahead of `recv_offset`.
    fn reassemble(&mut self) {
        loop {
            let Some((&start, _)) = self.recv_buffer.range(..=self.recv_offset).next() else {
                break;
            };
            let data = self.recv_buffer.remove(&start).expect("present");
            let end = start + data.len() as u64;
            if end > self.recv_offset {
                let skip = (self.recv_offset - start) as usize;
                self.recv_ready.extend(&data[skip..]);
                self.recv_offset = end;
            }
        }
        if self.final_size == Some(self.recv_offset)
            && matches!(self.recv_state, RecvState::Recv | RecvState::SizeKnown)
        {
            self.recv_state = RecvState::DataRecvd;
        }
    }

    /// Read reassembled data into `buf`. An empty read is not an error.
    pub fn read(&mut self, buf: &mut [u8]) -> QuicResult<usize> {
        if let Some(code) = self.peer_reset_code {
            if self.recv_state == RecvState::ResetRecvd {
                self.recv_state = RecvState::ResetRead;
            }
            return Err(QuicError::PeerClosed {
                code,
                reason: "stream reset by peer".into(),
            });
        }
        let n = self.recv_ready.len().min(buf.len());
        for (i, byte) in self.recv_ready.drain(..n).enumerate() {
            buf[i] = byte;
        }
        self.read_offset += n as u64;
        if self.recv_state == RecvState::DataRecvd && self.recv_ready.is_empty() {
            self.recv_state = RecvState::DataRead;
        }
        Ok(n)
    }

    pub fn is_fin_received(&self) -> bool {
        self.final_size.is_some()
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// RESET_STREAM from the peer. Returns the flow-control increment, as
    /// the final size still counts toward the connection-level limit.
    pub fn receive_reset(&mut self, error_code: u64, final_size: u64) -> QuicResult<u64> {
        if !self.has_recv_half() {
            return Err(QuicError::transport(
                TransportError::StreamStateError,
                "RESET_STREAM on a send-only stream",
            ));
        }
        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(QuicError::transport(
                    TransportError::FinalSizeError,
                    "reset final size conflicts with known size",
                ));
            }
        }
        if final_size < self.highest_recv_offset {
            return Err(QuicError::transport(
                TransportError::FinalSizeError,
                "reset final size below received data",
            ));
        }
        let increment = final_size.saturating_sub(self.highest_recv_offset);
        self.highest_recv_offset = final_size;
        self.final_size = Some(final_size);
        self.peer_reset_code = Some(error_code);
        if !self.recv_state.is_terminal() {
            self.recv_state = RecvState::ResetRecvd;
        }
        self.recv_buffer.clear();
        self.recv_ready.clear();
        Ok(increment)
    }

    pub fn peer_reset_code(&self) -> Option<u64> {
        self.peer_reset_code
    }

    /// STOP_SENDING from the peer: respond by resetting our send half.
    pub fn receive_stop_sending(&mut self, error_code: u64) -> QuicResult<Option<u64>> {
        if !self.has_send_half() {
            return Err(QuicError::transport(
                TransportError::StreamStateError,
                "STOP_SENDING on a receive-only stream",
            ));
        }
        self.stop_sending_code = Some(error_code);
        if !self.send_state.is_terminal() && self.send_state != SendState::ResetSent {
            return Ok(Some(self.reset(error_code)?));
        }
        Ok(None)
    }

    pub fn stop_sending_code(&self) -> Option<u64> {
        self.stop_sending_code
    }

    // recv-side flow control

    pub fn max_recv_offset(&self) -> u64 {
        self.max_recv_offset
    }

    pub fn should_send_max_stream_data(&self) -> bool {
        if !matches!(self.recv_state, RecvState::Recv) {
            return false;
        }
        let remaining = self.max_recv_offset.saturating_sub(self.read_offset);
        (remaining as f64) <= (1.0 - WINDOW_UPDATE_THRESHOLD) * self.recv_window_size as f64
    }

    pub fn generate_max_stream_data(&mut self) -> Option<u64> {
        if !self.should_send_max_stream_data() {
            return None;
        }
        self.max_recv_offset = self.read_offset + self.recv_window_size;
        Some(self.max_recv_offset)
    }
}
