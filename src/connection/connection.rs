use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::cid::{ConnectionId, LocalCidRegistry, PeerCidRegistry};
use crate::connection::types::{
    AckTracker, Config, ConnectionEvent, ConnectionState, ConnectionStats,
};
use crate::crypto::handshake::{Handshake, PlainHandshake, ResumptionOffer};
use crate::crypto::keys::{initial_keys, CipherSuite, KeyPair, Keys, Side, TAG_LEN};
use crate::flow::FlowController;
use crate::packet::frame::{ConnectionCloseFrame, Frame, NewConnectionIdFrame};
use crate::packet::header::{Header, LongHeader, LongType, PartialDecode, ShortHeader};
use crate::packet::packet::{open, seal};
use crate::packet::types::{EcnCodepoint, EncryptionLevel, SpaceId, MIN_UDP_PAYLOAD, QUIC_VERSION};
use crate::recovery::{
    CongestionController, EcnResult, LossDetector, LossEvent, LossResult, RttEstimator, SentPacket,
};
use crate::result::{QuicError, QuicResult, TransportError};
use crate::session::{ReplayFilter, SessionTicket, SessionTicketStore};
use crate::stream::{StreamLimits, StreamManager};
use crate::tparams::TransportParams;

/// How many undecryptable datagrams to hold while keys catch up.
const MAX_BUFFERED_DATAGRAMS: usize = 8;
/// Consecutive wire-decode violations tolerated before the connection
/// closes itself.
const MAX_DECODE_VIOLATIONS: u32 = 16;

const LEVELS: [EncryptionLevel; 4] = [
    EncryptionLevel::Initial,
    EncryptionLevel::ZeroRtt,
    EncryptionLevel::Handshake,
    EncryptionLevel::Application,
];

fn level_index(level: EncryptionLevel) -> usize {
    match level {
        EncryptionLevel::Initial => 0,
        EncryptionLevel::ZeroRtt => 1,
        EncryptionLevel::Handshake => 2,
        EncryptionLevel::Application => 3,
    }
}

/// In-order reassembly for one CRYPTO byte stream.
#[derive(Debug, Default)]
struct CryptoRecvBuf {
    segments: BTreeMap<u64, Vec<u8>>,
    offset: u64,
}

impl CryptoRecvBuf {
    /// Insert a segment and drain whatever became contiguous.
    fn insert(&mut self, offset: u64, data: &[u8]) -> Vec<u8> {
        let end = offset + data.len() as u64;
        if end > self.offset {
            let (start, slice) = if offset < self.offset {
                (self.offset, &data[(self.offset - offset) as usize..])
            } else {
                (offset, data)
            };
            let entry = self.segments.entry(start).or_default();
            if entry.len() < slice.len() {
                *entry = slice.to_vec();
            }
        }
        let mut out = Vec::new();
        loop {
            let Some((&start, _)) = self.segments.range(..=self.offset).next() else {
                break;
            };
            let data = self.segments.remove(&start).expect("present");
            let end = start + data.len() as u64;
            if end > self.offset {
                out.extend_from_slice(&data[(self.offset - start) as usize..]);
                self.offset = end;
            }
        }
        out
    }
}

#[derive(Debug)]
struct CloseState {
    frame: ConnectionCloseFrame,
    /// Re-send the close frame in response to incoming packets.
    resend: bool,
    closing_until: Instant,
    draining_until: Instant,
}

/// A single QUIC connection: handshake sequencing, packet pipelines,
/// recovery, flow control, streams and timers. Single-threaded; driven by
/// `receive_packet`, `generate_packets`, `next_timeout` and `on_timeout`.
pub struct Connection {
    side: Side,
    state: ConnectionState,
    config: Config,

    local_cids: LocalCidRegistry,
    peer_cids: PeerCidRegistry,
    /// The client-chosen Initial destination CID; Initial keys derive from
    /// it and the server accepts it as an alias while handshaking.
    original_dcid: ConnectionId,
    peer_initial_cid_seen: bool,

    handshake: Option<Box<dyn Handshake>>,
    keys: [Option<KeyPair>; 4],
    prev_app_read: Option<Keys>,
    key_phase: bool,
    handshake_complete: bool,
    handshake_confirmed: bool,
    pending_handshake_done: bool,

    crypto_recv: [CryptoRecvBuf; 3],
    crypto_send_buf: [VecDeque<u8>; 3],
    crypto_send_offset: [u64; 3],

    ack_trackers: [AckTracker; 3],
    next_pn: [u64; 3],

    loss: LossDetector,
    cc: CongestionController,
    flow: FlowController,
    streams: StreamManager,

    local_params: TransportParams,
    peer_params: Option<TransportParams>,
    idle_timeout: Duration,

    retransmit: [VecDeque<Frame>; 3],
    pending_control: VecDeque<Frame>,
    probe_pending: u32,
    path_response: Option<[u8; 8]>,

    close_state: Option<CloseState>,
    idle_deadline: Option<Instant>,
    keep_alive_at: Option<Instant>,

    server_name: Option<String>,
    server_port: u16,
    tickets: Option<Arc<SessionTicketStore>>,
    replay: Option<Arc<ReplayFilter>>,
    early_data_state: Option<bool>,

    buffered_datagrams: Vec<(Vec<u8>, EcnCodepoint)>,
    decode_violations: u32,

    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,
}

impl Connection {
    fn new(side: Side, config: Config) -> QuicResult<Self> {
        let local_cid = ConnectionId::generate(config.cid_len)?;
        let local_params = config.transport_params();
        let rtt = RttEstimator::new(crate::recovery::rtt::INITIAL_RTT, config.max_ack_delay);
        let limits = StreamLimits {
            max_streams_bidi: config.max_streams_bidi,
            max_streams_uni: config.max_streams_uni,
            stream_window: config.initial_max_stream_data_bidi,
        };
        let idle_timeout = config.idle_timeout;
        Ok(Self {
            side,
            state: ConnectionState::Idle,
            local_cids: LocalCidRegistry::new(local_cid),
            peer_cids: PeerCidRegistry::new(
                ConnectionId::empty(),
                config.active_connection_id_limit,
            ),
            original_dcid: ConnectionId::empty(),
            peer_initial_cid_seen: false,
            handshake: None,
            keys: [None, None, None, None],
            prev_app_read: None,
            key_phase: false,
            handshake_complete: false,
            handshake_confirmed: false,
            pending_handshake_done: false,
            crypto_recv: Default::default(),
            crypto_send_buf: Default::default(),
            crypto_send_offset: [0; 3],
            ack_trackers: Default::default(),
            next_pn: [0; 3],
            loss: LossDetector::new(rtt),
            cc: CongestionController::default(),
            flow: FlowController::new(config.initial_max_data),
            streams: StreamManager::new(side == Side::Server, limits),
            local_params,
            peer_params: None,
            idle_timeout,
            retransmit: Default::default(),
            pending_control: VecDeque::new(),
            probe_pending: 0,
            path_response: None,
            close_state: None,
            idle_deadline: None,
            keep_alive_at: None,
            server_name: None,
            server_port: 0,
            tickets: None,
            replay: None,
            early_data_state: None,
            buffered_datagrams: Vec::new(),
            decode_violations: 0,
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            config,
        })
    }

    pub fn client(config: Config) -> QuicResult<Self> {
        Self::new(Side::Client, config)
    }

    pub fn server(config: Config) -> QuicResult<Self> {
        Self::new(Side::Server, config)
    }

    /// Share a ticket store for session resumption.
    pub fn set_ticket_store(&mut self, store: Arc<SessionTicketStore>) {
        self.tickets = Some(store);
    }

    /// Server: share a replay filter to admit 0-RTT.
    pub fn set_replay_filter(&mut self, filter: Arc<ReplayFilter>) {
        self.replay = Some(filter);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn rtt(&self) -> &RttEstimator {
        self.loss.rtt()
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.cc
    }

    /// Marking the adapter should set on outgoing datagrams' IP headers.
    pub fn ecn_marking(&self) -> EcnCodepoint {
        self.loss.ecn().outgoing_marking()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// The CID the peer routes to us by (for the listener's demux table).
    pub fn local_cid_len(&self) -> usize {
        self.config.cid_len
    }

    // ==================================================================
    // handshake
    // ==================================================================

    /// Begin a client handshake toward `server_name:port`. A stored,
    /// unexpired session ticket enables 0-RTT.
    pub fn start_handshake(&mut self, server_name: &str, port: u16) -> QuicResult<()> {
        if server_name.is_empty() {
            return Err(QuicError::InvalidArgument("empty server name"));
        }
        if self.side != Side::Client || self.state != ConnectionState::Idle {
            return Err(QuicError::InvalidState("handshake already started"));
        }

        self.original_dcid = ConnectionId::generate(self.config.cid_len.max(8))?;
        self.keys[level_index(EncryptionLevel::Initial)] =
            Some(initial_keys(&self.original_dcid, Side::Client)?);
        self.peer_cids = PeerCidRegistry::new(
            self.original_dcid,
            self.config.active_connection_id_limit,
        );

        let ticket = self
            .tickets
            .as_ref()
            .and_then(|store| store.retrieve(server_name, port));
        let resumption = ticket.map(|ticket| {
            // resume with the limits the server promised last time
            self.apply_peer_params(ticket.saved_params.clone(), true);
            self.early_data_state = None;
            ResumptionOffer {
                ticket_data: ticket.ticket_data.clone(),
                obfuscated_age: ticket.obfuscated_age(),
            }
        });

        self.server_name = Some(server_name.to_string());
        self.server_port = port;
        self.handshake = Some(PlainHandshake::client(
            server_name,
            self.local_params.encode(),
            resumption,
        )?);
        self.state = ConnectionState::Handshaking;
        self.arm_idle(Instant::now());
        self.advance_handshake(Instant::now())?;
        debug!(server_name, port, "client handshake started");
        Ok(())
    }

    /// Prepare the server side; the handshake proper starts on the first
    /// Initial packet.
    pub fn init_server_handshake(&mut self, cert: Vec<u8>, key: Vec<u8>) -> QuicResult<()> {
        if self.side != Side::Server || self.state != ConnectionState::Idle {
            return Err(QuicError::InvalidState("handshake already started"));
        }
        self.handshake = Some(PlainHandshake::server(
            cert,
            key,
            self.local_params.encode(),
            self.replay.clone(),
        )?);
        Ok(())
    }

    /// Install fresh secrets, drain peer transport parameters and drive
    /// completion-edge actions.
    fn advance_handshake(&mut self, now: Instant) -> QuicResult<()> {
        let Some(handshake) = self.handshake.as_mut() else {
            return Ok(());
        };

        for secrets in handshake.take_secrets() {
            let pair = KeyPair {
                read: Keys::from_secret(CipherSuite::Aes128Gcm, secrets.read_secret)?,
                write: Keys::from_secret(CipherSuite::Aes128Gcm, secrets.write_secret)?,
            };
            debug!(level = secrets.level.as_str(), "keys installed");
            self.keys[level_index(secrets.level)] = Some(pair);
        }

        if self.peer_params.is_none() {
            if let Some(raw) = self.handshake.as_mut().and_then(|h| h.peer_transport_params()) {
                let params = TransportParams::decode(&raw)?;
                let sender = match self.side {
                    Side::Client => Side::Server,
                    Side::Server => Side::Client,
                };
                params.validate(sender)?;
                self.apply_peer_params(params, false);
            }
        }

        let handshake = self.handshake.as_mut().expect("still here");
        if let Some(accepted) = handshake.early_data_accepted() {
            if self.early_data_state.is_none() {
                self.early_data_state = Some(accepted);
                if self.side == Side::Client && !accepted {
                    self.abandon_zero_rtt();
                }
            }
        }

        if !self.handshake_complete && self.handshake.as_ref().expect("here").is_complete() {
            self.handshake_complete = true;
            if self.state == ConnectionState::Handshaking {
                self.state = ConnectionState::Established;
                self.events.push_back(ConnectionEvent::Connected);
            }
            if self.side == Side::Server {
                // HANDSHAKE_DONE confirms the handshake for the client
                self.pending_handshake_done = true;
                self.confirm_handshake();
            }
            debug!(side = ?self.side, "connection established");
        }

        if self.side == Side::Client {
            if let Some(nst) = self.handshake.as_mut().and_then(|h| h.take_session_ticket()) {
                if let (Some(store), Some(name)) = (&self.tickets, &self.server_name) {
                    let now_sys = SystemTime::now();
                    let ticket = SessionTicket {
                        ticket_data: nst.ticket_data,
                        server_name: name.clone(),
                        port: self.server_port,
                        saved_params: self.peer_params.clone().unwrap_or_default(),
                        max_early_data_size: nst.max_early_data_size,
                        ticket_age_add: nst.age_add,
                        received_time: now_sys,
                        expiry: now_sys + Duration::from_secs(nst.lifetime_secs as u64),
                    };
                    store.store(ticket);
                    trace!("session ticket stored");
                }
            }
        }

        // keys may have arrived for buffered packets
        self.replay_buffered(now);
        Ok(())
    }

    fn apply_peer_params(&mut self, params: TransportParams, provisional: bool) {
        self.flow.update_send_limit(params.initial_max_data);
        self.streams.set_peer_limits(
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
            params.initial_max_stream_data_bidi_remote,
        );
        self.loss
            .rtt_mut()
            .set_max_ack_delay(Duration::from_millis(params.max_ack_delay));
        if params.max_idle_timeout != 0 {
            let peer_idle = Duration::from_millis(params.max_idle_timeout);
            self.idle_timeout = self.idle_timeout.min(peer_idle);
        }
        self.local_cids
            .set_peer_active_limit(params.active_connection_id_limit);
        if !provisional {
            self.peer_params = Some(params);
        }
    }

    fn confirm_handshake(&mut self) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        self.loss.set_handshake_confirmed();
        if self.keys[level_index(EncryptionLevel::Initial)].is_some() {
            self.discard_level(EncryptionLevel::Initial);
        }
        self.discard_level(EncryptionLevel::Handshake);
        debug!("handshake confirmed");
    }

    fn discard_level(&mut self, level: EncryptionLevel) {
        if let Some(pair) = self.keys[level_index(level)].as_mut() {
            pair.clear();
        }
        self.keys[level_index(level)] = None;
        if level != EncryptionLevel::ZeroRtt {
            for packet in self.loss.discard_space(level) {
                if packet.in_flight {
                    // the congestion controller forgets abandoned packets
                    self.cc.on_packet_acked(&SentPacket {
                        sent_time: Instant::now(),
                        ..packet
                    });
                }
            }
            self.ack_trackers[level.space().index()].reset();
            self.retransmit[level.space().index()].clear();
        }
        debug!(level = level.as_str(), "encryption level discarded");
    }

    /// The server refused 0-RTT: early keys are dropped and every 0-RTT
    /// packet's payload is re-queued for 1-RTT.
    fn abandon_zero_rtt(&mut self) {
        warn!("0-RTT rejected by the server");
        self.keys[level_index(EncryptionLevel::ZeroRtt)] = None;
        let app = SpaceId::Application.index();
        let zero_rtt = self.loss.take_zero_rtt_packets();
        for packet in zero_rtt {
            if packet.in_flight {
                self.cc.on_packet_acked(&SentPacket {
                    sent_time: Instant::now(),
                    ..packet.clone()
                });
            }
            for frame in packet.frames {
                if frame.is_retransmittable() {
                    self.retransmit[app].push_back(frame);
                }
            }
        }
    }

    // ==================================================================
    // receive path
    // ==================================================================

    pub fn receive_packet(&mut self, datagram: &[u8], ecn: EcnCodepoint) -> QuicResult<()> {
        self.receive_packet_at(datagram, ecn, Instant::now())
    }

    pub fn receive_packet_at(
        &mut self,
        datagram: &[u8],
        ecn: EcnCodepoint,
        now: Instant,
    ) -> QuicResult<()> {
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Draining) {
            return Ok(());
        }
        self.stats.bytes_received += datagram.len() as u64;

        let mut offset = 0;
        while offset < datagram.len() {
            let rest = &datagram[offset..];
            let pd = match PartialDecode::parse(rest, self.config.cid_len) {
                Ok(pd) => pd,
                Err(err) => {
                    self.on_decode_violation(err);
                    return Ok(());
                }
            };
            let packet_len = pd.packet_len;
            if let Err(err) = self.process_packet(&rest[..packet_len], pd, ecn, now) {
                match err {
                    // tag failures and missing keys drop silently
                    QuicError::DecryptFailed => {}
                    QuicError::Transport { .. } | QuicError::Crypto(_) => {
                        self.close_on_error(&err, now);
                        return Err(err);
                    }
                    other => {
                        self.on_decode_violation(other);
                    }
                }
            }
            offset += packet_len;
        }
        Ok(())
    }

    fn on_decode_violation(&mut self, err: QuicError) {
        trace!(?err, "dropping undecodable datagram");
        self.decode_violations += 1;
        if self.decode_violations > MAX_DECODE_VIOLATIONS {
            let _ = self.close_internal(
                TransportError::ProtocolViolation.to_code(),
                "repeated malformed packets",
                false,
                Instant::now(),
            );
        }
    }

    fn close_on_error(&mut self, err: &QuicError, now: Instant) {
        let code = err.wire_code();
        warn!(?err, "closing connection on error");
        let _ = self.close_internal(code.to_code(), "protocol error", false, now);
    }

    fn process_packet(
        &mut self,
        packet: &[u8],
        pd: PartialDecode,
        ecn: EcnCodepoint,
        now: Instant,
    ) -> QuicResult<()> {
        // route: the destination CID must be ours (the client-chosen
        // Initial CID doubles as the server's alias while handshaking)
        let dcid = pd.header.dst_cid();
        let routed_dcid = *dcid;
        // long-header packets (Initial, 0-RTT coalesced behind it) may still
        // carry the client-chosen CID until the server's CID is adopted
        let ours = self.local_cids.contains(dcid)
            || (self.side == Side::Server
                && pd.header.is_long()
                && (!self.peer_initial_cid_seen || *dcid == self.original_dcid));
        if !ours && self.state != ConnectionState::Idle {
            trace!("packet for an unknown connection id");
            return Ok(());
        }

        if let Header::Long(h) = &pd.header {
            if h.ty == LongType::Retry {
                // retry handling is out of scope; drop
                return Ok(());
            }
            if h.version != QUIC_VERSION {
                return Ok(());
            }
        }
        let level = pd.header.encryption_level()?;

        // a server learns the Initial secret from the client's first packet
        if self.side == Side::Server && self.state == ConnectionState::Idle {
            if let Header::Long(h) = &pd.header {
                if h.ty == LongType::Initial {
                    if self.handshake.is_none() {
                        return Err(QuicError::InvalidState(
                            "server handshake not initialised",
                        ));
                    }
                    self.original_dcid = h.dst_cid;
                    self.keys[level_index(EncryptionLevel::Initial)] =
                        Some(initial_keys(&h.dst_cid, Side::Server)?);
                    self.peer_cids = PeerCidRegistry::new(
                        h.src_cid,
                        self.config.active_connection_id_limit,
                    );
                    self.peer_initial_cid_seen = true;
                    self.state = ConnectionState::Handshaking;
                    self.arm_idle(now);
                }
            }
        }

        let Some(pair) = self.keys[level_index(level)].as_ref() else {
            // keys not installed yet: hold the packet briefly
            if self.buffered_datagrams.len() < MAX_BUFFERED_DATAGRAMS
                && matches!(
                    level,
                    EncryptionLevel::Handshake
                        | EncryptionLevel::Application
                        | EncryptionLevel::ZeroRtt
                )
            {
                self.buffered_datagrams.push((packet.to_vec(), ecn));
            }
            return Ok(());
        };

        let space = level.space().index();
        let largest_recv = self.ack_trackers[space].largest();
        let plain = match open(packet, &pd, &pair.read, largest_recv) {
            Ok(plain) => plain,
            Err(QuicError::DecryptFailed) if level == EncryptionLevel::Application => {
                self.try_key_update(packet, &pd, largest_recv)?
            }
            Err(err) => return Err(err),
        };

        // the client pins the server's handshake source CID
        if self.side == Side::Client && !self.peer_initial_cid_seen {
            if let Header::Long(h) = &plain.header {
                self.peer_cids.rebind_initial(h.src_cid);
                self.peer_initial_cid_seen = true;
            }
        }

        if self.ack_trackers[space].is_duplicate(plain.pn) {
            trace!(pn = plain.pn, "duplicate packet");
            return Ok(());
        }

        // a server that decrypts its first Handshake packet is done with
        // Initial keys (RFC 9001 Section 4.9.1)
        if self.side == Side::Server
            && level == EncryptionLevel::Handshake
            && self.keys[level_index(EncryptionLevel::Initial)].is_some()
        {
            self.discard_level(EncryptionLevel::Initial);
        }

        let frames = Frame::parse_all(&plain.payload)?;
        if frames.is_empty() {
            return Err(QuicError::transport(
                TransportError::ProtocolViolation,
                "packet without frames",
            ));
        }
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);

        self.ack_trackers[space].on_packet_received(
            plain.pn,
            now,
            ack_eliciting,
            ecn,
            self.config.max_ack_delay,
        );
        self.stats.packets_received += 1;
        self.decode_violations = 0;

        // a valid 1-RTT packet from the peer confirms the handshake
        if level == EncryptionLevel::Application && self.handshake_complete {
            self.confirm_handshake();
        }

        for frame in frames {
            self.dispatch_frame(frame, level, &routed_dcid, now)?;
        }

        if self.state == ConnectionState::Closing {
            if let Some(close) = self.close_state.as_mut() {
                close.resend = true;
            }
        }
        self.arm_idle(now);
        self.advance_handshake(now)?;
        Ok(())
    }

    /// Application-level decrypt failure with a flipped key-phase bit may
    /// mean the peer updated keys; try the next generation, then the
    /// previous one for stragglers.
    fn try_key_update(
        &mut self,
        packet: &[u8],
        pd: &PartialDecode,
        largest_recv: Option<u64>,
    ) -> QuicResult<crate::packet::packet::PlainPacket> {
        let idx = level_index(EncryptionLevel::Application);
        let pair = self.keys[idx].as_ref().ok_or(QuicError::DecryptFailed)?;

        let next_read = pair.read.next_generation()?;
        if let Ok(plain) = open(packet, pd, &next_read, largest_recv) {
            if plain.key_phase == self.key_phase {
                // phase bit did not flip: not an update, a forgery
                return Err(QuicError::DecryptFailed);
            }
            debug!("peer initiated key update");
            let next_write = pair.write.next_generation()?;
            self.prev_app_read = Some(pair.read.clone());
            self.keys[idx] = Some(KeyPair {
                read: next_read,
                write: next_write,
            });
            self.key_phase = !self.key_phase;
            return Ok(plain);
        }
        if let Some(prev) = &self.prev_app_read {
            if let Ok(plain) = open(packet, pd, prev, largest_recv) {
                return Ok(plain);
            }
        }
        Err(QuicError::DecryptFailed)
    }

    fn replay_buffered(&mut self, now: Instant) {
        if self.buffered_datagrams.is_empty() {
            return;
        }
        let buffered = std::mem::take(&mut self.buffered_datagrams);
        for (datagram, ecn) in buffered {
            let _ = self.receive_packet_at(&datagram, ecn, now);
        }
    }

    fn dispatch_frame(
        &mut self,
        frame: Frame,
        level: EncryptionLevel,
        routed_dcid: &ConnectionId,
        now: Instant,
    ) -> QuicResult<()> {
        // while closing, only a peer close is still interesting
        if self.state == ConnectionState::Closing && !matches!(frame, Frame::ConnectionClose(_)) {
            return Ok(());
        }
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Ack(ack) => {
                let exponent = self
                    .peer_params
                    .as_ref()
                    .map(|p| p.ack_delay_exponent)
                    .unwrap_or(3);
                let delay = Duration::from_micros(
                    ack.ack_delay.saturating_mul(1u64 << exponent.min(20)),
                );
                let result = self.loss.on_ack_received(&ack, level, delay, now);
                self.on_loss_result(result, now);
            }
            Frame::Crypto { offset, data } => {
                let space = level.space().index();
                let ready = self.crypto_recv[space].insert(offset, &data);
                if !ready.is_empty() {
                    let hs_level = match level {
                        EncryptionLevel::ZeroRtt => EncryptionLevel::Application,
                        other => other,
                    };
                    if let Some(handshake) = self.handshake.as_mut() {
                        handshake.read_crypto(hs_level, &ready)?;
                    }
                }
            }
            Frame::Stream(f) => {
                if level == EncryptionLevel::ZeroRtt && self.early_data_state != Some(true) {
                    // 0-RTT data without an accepted offer is discarded
                    return Ok(());
                }
                let stream = match self.streams.get_or_create_stream(f.stream_id) {
                    Ok(stream) => stream,
                    // late frame for a swept stream
                    Err(QuicError::StreamNotFound(_)) => return Ok(()),
                    Err(err) => return Err(err),
                };
                let increment = stream.receive_data(f.offset, &f.data, f.fin)?;
                let readable = stream.has_data() || f.fin;
                self.flow.record_received(increment)?;
                if readable {
                    self.events.push_back(ConnectionEvent::StreamData {
                        stream_id: f.stream_id,
                        fin: f.fin,
                    });
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                let stream = match self.streams.get_or_create_stream(stream_id) {
                    Ok(stream) => stream,
                    Err(QuicError::StreamNotFound(_)) => return Ok(()),
                    Err(err) => return Err(err),
                };
                let increment = stream.receive_reset(error_code, final_size)?;
                self.flow.record_received(increment)?;
                self.events.push_back(ConnectionEvent::StreamReset {
                    stream_id,
                    error_code,
                });
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                let stream = match self.streams.get_or_create_stream(stream_id) {
                    Ok(stream) => stream,
                    Err(QuicError::StreamNotFound(_)) => return Ok(()),
                    Err(err) => return Err(err),
                };
                if let Some(final_size) = stream.receive_stop_sending(error_code)? {
                    self.pending_control.push_back(Frame::ResetStream {
                        stream_id,
                        error_code,
                        final_size,
                    });
                }
            }
            Frame::MaxData { max } => self.flow.update_send_limit(max),
            Frame::MaxStreamData { stream_id, max } => {
                match self.streams.get_or_create_stream(stream_id) {
                    Ok(stream) => stream.set_max_send_offset(max),
                    Err(QuicError::StreamNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            Frame::MaxStreams { bidi, max } => self.streams.set_peer_max_streams(bidi, max),
            Frame::DataBlocked { limit } => {
                trace!(limit, "peer is blocked on connection flow control");
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!(stream_id, limit, "peer is blocked on stream flow control");
            }
            Frame::StreamsBlocked { bidi, limit } => {
                trace!(bidi, limit, "peer is blocked on stream concurrency");
            }
            Frame::NewToken { .. } => {
                if self.side == Side::Server {
                    return Err(QuicError::transport(
                        TransportError::ProtocolViolation,
                        "NEW_TOKEN from a client",
                    ));
                }
                // address-validation tokens are not retained
            }
            Frame::NewConnectionId(f) => {
                self.peer_cids
                    .on_new_cid(f.sequence, f.retire_prior_to, f.cid, f.reset_token)?;
                for sequence in self.peer_cids.take_retirements() {
                    self.pending_control
                        .push_back(Frame::RetireConnectionId { sequence });
                }
            }
            Frame::RetireConnectionId { sequence } => {
                self.local_cids.retire(sequence, routed_dcid)?;
            }
            Frame::PathChallenge { data } => {
                self.path_response = Some(data);
            }
            Frame::PathResponse { .. } => {
                // we never send PATH_CHALLENGE; ignore
            }
            Frame::ConnectionClose(f) => {
                debug!(code = f.error_code, reason = %f.reason, "peer closed");
                self.events.push_back(ConnectionEvent::Disconnected {
                    error_code: f.error_code,
                    reason: f.reason.clone(),
                });
                self.enter_draining(now);
            }
            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(QuicError::transport(
                        TransportError::ProtocolViolation,
                        "HANDSHAKE_DONE from a client",
                    ));
                }
                self.confirm_handshake();
            }
        }
        Ok(())
    }

    fn on_loss_result(&mut self, result: LossResult, now: Instant) {
        for packet in &result.acked_packets {
            self.cc.on_packet_acked(packet);
            for frame in &packet.frames {
                match frame {
                    Frame::Stream(f) => {
                        if let Some(stream) = self.streams.get_stream(f.stream_id) {
                            stream.acknowledge_data(f.offset, f.data.len() as u64, f.fin);
                        }
                    }
                    Frame::ResetStream { stream_id, .. } => {
                        if let Some(stream) = self.streams.get_stream(*stream_id) {
                            stream.on_reset_acked();
                        }
                    }
                    _ => {}
                }
            }
        }
        if !result.acked_packets.is_empty() {
            self.streams.remove_closed_streams();
        }

        for packet in &result.lost_packets {
            self.cc.on_packet_lost(packet, now);
            self.stats.packets_lost += 1;
        }
        for packet in result.lost_packets {
            let space = packet.level.space().index();
            debug!(pn = packet.packet_number, "re-queueing lost frames");
            for frame in packet.frames {
                if frame.is_retransmittable() {
                    self.retransmit[space].push_back(frame);
                }
            }
        }
        if result.persistent_congestion {
            self.cc.on_persistent_congestion();
        }
        if result.ecn_signal == EcnResult::CongestionSignal {
            if let Some(sent_time) = result.ecn_congestion_sent_time {
                self.cc.on_ecn_congestion(sent_time, now);
            }
        }
    }

    // ==================================================================
    // send path
    // ==================================================================

    pub fn generate_packets(&mut self) -> QuicResult<Vec<Vec<u8>>> {
        self.generate_packets_at(Instant::now())
    }

    /// Assemble, encrypt and header-protect everything currently sendable.
    /// Each returned buffer is one datagram payload.
    pub fn generate_packets_at(&mut self, now: Instant) -> QuicResult<Vec<Vec<u8>>> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Draining | ConnectionState::Closed => {
                return Ok(Vec::new())
            }
            _ => {}
        }

        let mut datagrams = Vec::new();
        for level in LEVELS {
            if self.keys[level_index(level)].is_none() {
                continue;
            }
            if level == EncryptionLevel::ZeroRtt
                && (self.side == Side::Server || self.handshake_complete)
            {
                continue;
            }
            let mut sent_any = false;
            while let Some(datagram) = self.build_packet(level, now)? {
                datagrams.push(datagram);
                sent_any = true;
            }
            // a client that sends its first Handshake packet is done with
            // Initial keys (RFC 9001 Section 4.9.1)
            if sent_any
                && level == EncryptionLevel::Handshake
                && self.side == Side::Client
                && self.keys[level_index(EncryptionLevel::Initial)].is_some()
            {
                self.discard_level(EncryptionLevel::Initial);
            }
        }

        // a PTO probe with nothing to retransmit still elicits an ACK
        if self.probe_pending > 0 {
            if let Some(level) = self.probe_level() {
                self.probe_pending = 0;
                if let Some(datagram) = self.build_probe(level, now)? {
                    datagrams.push(datagram);
                }
            }
        }
        Ok(datagrams)
    }

    fn probe_level(&self) -> Option<EncryptionLevel> {
        // probe in the most advanced space that still has keys
        [
            EncryptionLevel::Application,
            EncryptionLevel::Handshake,
            EncryptionLevel::Initial,
        ]
        .into_iter()
        .find(|&l| self.keys[level_index(l)].is_some())
    }

    fn header_overhead(&self, level: EncryptionLevel) -> usize {
        let dcid_len = self.peer_cids.current().len();
        let scid_len = self.config.cid_len;
        match level {
            EncryptionLevel::Application => 1 + dcid_len + 4 + TAG_LEN,
            EncryptionLevel::Initial => 1 + 4 + 2 + dcid_len + scid_len + 1 + 2 + 4 + TAG_LEN,
            _ => 1 + 4 + 2 + dcid_len + scid_len + 2 + 4 + TAG_LEN,
        }
    }

    fn make_header(&self, level: EncryptionLevel) -> Header {
        let dst_cid = self.peer_cids.current();
        let src_cid = self.local_cids.first_cid();
        match level {
            EncryptionLevel::Application => Header::Short(ShortHeader {
                dst_cid,
                spin: false,
                key_phase: self.key_phase,
            }),
            EncryptionLevel::Initial => Header::Long(LongHeader {
                ty: LongType::Initial,
                version: QUIC_VERSION,
                dst_cid,
                src_cid,
                token: Bytes::new(),
            }),
            EncryptionLevel::Handshake => Header::Long(LongHeader {
                ty: LongType::Handshake,
                version: QUIC_VERSION,
                dst_cid,
                src_cid,
                token: Bytes::new(),
            }),
            EncryptionLevel::ZeroRtt => Header::Long(LongHeader {
                ty: LongType::ZeroRtt,
                version: QUIC_VERSION,
                dst_cid,
                src_cid,
                token: Bytes::new(),
            }),
        }
    }

    /// Build one packet at `level`, or None when nothing wants to go out.
    fn build_packet(
        &mut self,
        level: EncryptionLevel,
        now: Instant,
    ) -> QuicResult<Option<Vec<u8>>> {
        let space = level.space().index();
        let overhead = self.header_overhead(level);
        let budget = self
            .cc
            .max_datagram_size()
            .saturating_sub(overhead)
            .max(64);

        let mut frames: Vec<Frame> = Vec::new();
        let mut payload_len = 0usize;
        fn push(frame: Frame, payload_len: &mut usize, frames: &mut Vec<Frame>) {
            *payload_len += frame.wire_len();
            frames.push(frame);
        }

        // 1. ACK first (0-RTT packets cannot carry ACKs)
        if level != EncryptionLevel::ZeroRtt {
            let flush_due = self.ack_trackers[space]
                .ack_deadline()
                .map_or(false, |d| d <= now);
            let immediate = level != EncryptionLevel::Application;
            if self.ack_trackers[space].ack_pending()
                && (immediate || flush_due || self.has_sendable_data(level))
            {
                if let Some(ack) =
                    self.ack_trackers[space].build_ack(now, self.config.ack_delay_exponent)
                {
                    push(Frame::Ack(ack), &mut payload_len, &mut frames);
                }
            }
        }

        // 2. connection close supersedes everything else
        if let Some(close) = self.close_state.as_mut() {
            if close.resend {
                close.resend = false;
                let frame = Frame::ConnectionClose(close.frame.clone());
                push(frame, &mut payload_len, &mut frames);
                return self.finish_packet(level, frames, payload_len, now);
            }
            if !frames.is_empty() {
                return self.finish_packet(level, frames, payload_len, now);
            }
            return Ok(None);
        }

        // 3. CRYPTO bytes for this level; anything past this packet's
        // budget stays buffered for the next one
        if level != EncryptionLevel::ZeroRtt {
            if let Some(handshake) = self.handshake.as_mut() {
                if let Some(bytes) = handshake.take_crypto(level) {
                    self.crypto_send_buf[space].extend(bytes);
                }
            }
            if !self.crypto_send_buf[space].is_empty() && payload_len < budget {
                let take = (budget - payload_len).min(self.crypto_send_buf[space].len());
                let chunk: Vec<u8> = self.crypto_send_buf[space].drain(..take).collect();
                let frame = Frame::Crypto {
                    offset: self.crypto_send_offset[space],
                    data: Bytes::from(chunk),
                };
                self.crypto_send_offset[space] += take as u64;
                push(frame, &mut payload_len, &mut frames);
            }
        }

        // 4. retransmissions of lost frames
        while payload_len < budget {
            let Some(frame) = self.retransmit[space].pop_front() else {
                break;
            };
            if payload_len + frame.wire_len() > budget {
                self.retransmit[space].push_front(frame);
                break;
            }
            push(frame, &mut payload_len, &mut frames);
        }

        // 5. application-space control frames and stream data
        if matches!(level, EncryptionLevel::Application | EncryptionLevel::ZeroRtt)
            && (self.is_established() || level == EncryptionLevel::ZeroRtt)
        {
            self.collect_app_frames(level, budget, &mut payload_len, &mut frames);
        }

        if frames.is_empty() {
            return Ok(None);
        }
        self.finish_packet(level, frames, payload_len, now)
    }

    fn has_sendable_data(&self, level: EncryptionLevel) -> bool {
        let space = level.space().index();
        !self.retransmit[space].is_empty()
            || (level == EncryptionLevel::Application
                && (self.pending_handshake_done
                    || self.path_response.is_some()
                    || !self.pending_control.is_empty()
                    || !self.streams.streams_with_pending_data().is_empty()))
    }

    fn collect_app_frames(
        &mut self,
        level: EncryptionLevel,
        budget: usize,
        payload_len: &mut usize,
        frames: &mut Vec<Frame>,
    ) {
        fn push(frame: Frame, payload_len: &mut usize, frames: &mut Vec<Frame>) {
            *payload_len += frame.wire_len();
            frames.push(frame);
        }

        if level == EncryptionLevel::Application {
            if self.pending_handshake_done {
                self.pending_handshake_done = false;
                push(Frame::HandshakeDone, payload_len, frames);
            }

            // queued control frames (resets, retirements, stop-sending)
            while *payload_len < budget {
                let Some(frame) = self.pending_control.pop_front() else {
                    break;
                };
                if *payload_len + frame.wire_len() > budget {
                    self.pending_control.push_front(frame);
                    break;
                }
                push(frame, payload_len, frames);
            }

            // flow-control updates
            if let Some(max) = self.flow.generate_max_data() {
                push(Frame::MaxData { max }, payload_len, frames);
            }
            if self.flow.should_send_data_blocked() {
                self.flow.mark_data_blocked_sent();
                push(
                    Frame::DataBlocked {
                        limit: self.flow.send_limit(),
                    },
                    payload_len,
                    frames,
                );
            }
            for stream_id in self.streams.stream_ids() {
                let Some(stream) = self.streams.get_stream(stream_id) else {
                    continue;
                };
                if let Some(max) = stream.generate_max_stream_data() {
                    push(Frame::MaxStreamData { stream_id, max }, payload_len, frames);
                }
                if stream.should_send_stream_data_blocked() {
                    stream.mark_stream_data_blocked_sent();
                    let limit = stream.max_send_offset();
                    push(
                        Frame::StreamDataBlocked { stream_id, limit },
                        payload_len,
                        frames,
                    );
                }
            }
            for bidi in [true, false] {
                if self.streams.should_send_streams_blocked(bidi) {
                    self.streams.mark_streams_blocked_sent(bidi);
                    let limit = self.streams.peer_max_streams(bidi);
                    push(Frame::StreamsBlocked { bidi, limit }, payload_len, frames);
                }
            }

            // connection-id maintenance
            if let Ok(Some(entry)) = self.local_cids.issue() {
                push(
                    Frame::NewConnectionId(NewConnectionIdFrame {
                        sequence: entry.sequence,
                        retire_prior_to: 0,
                        cid: entry.cid,
                        reset_token: entry.reset_token,
                    }),
                    payload_len,
                    frames,
                );
            }
            if let Some(data) = self.path_response.take() {
                push(Frame::PathResponse { data }, payload_len, frames);
            }
        }

        // fresh stream data, gated by congestion and connection credit
        for stream_id in self.streams.streams_with_pending_data() {
            if *payload_len >= budget {
                break;
            }
            let room = budget - *payload_len;
            if room < 8 || !self.cc.can_send(*payload_len + 64) {
                break;
            }
            let conn_credit = self.flow.available_send_window();
            let Some(stream) = self.streams.get_stream(stream_id) else {
                continue;
            };
            // leave space for the frame header
            let max_data = (room - 8).min(conn_credit as usize);
            if max_data == 0 && stream.pending_bytes() > 0 {
                break;
            }
            let Some(frame) = stream.next_stream_frame(max_data) else {
                continue;
            };
            self.flow
                .consume_send_window(frame.data.len() as u64)
                .expect("gated by available window");
            push(Frame::Stream(frame), payload_len, frames);
        }
    }

    fn finish_packet(
        &mut self,
        level: EncryptionLevel,
        mut frames: Vec<Frame>,
        mut payload_len: usize,
        now: Instant,
    ) -> QuicResult<Option<Vec<u8>>> {
        let space = level.space().index();

        // Initial datagrams are padded to the minimum path size; the
        // overhead estimate assumes a 4-byte packet number, so aim a few
        // bytes past the floor
        if level == EncryptionLevel::Initial {
            let overhead = self.header_overhead(level);
            let target = MIN_UDP_PAYLOAD + 3;
            if payload_len + overhead < target {
                let pad = target - overhead - payload_len;
                frames.push(Frame::Padding { len: pad });
                payload_len += pad;
            }
        } else if payload_len < 4 {
            // keep the header-protection sample in range
            let pad = 4 - payload_len;
            frames.push(Frame::Padding { len: pad });
            payload_len += pad;
        }

        let mut payload = Vec::with_capacity(payload_len);
        for frame in &frames {
            frame.build(&mut payload);
        }

        let pn = self.next_pn[space];
        self.next_pn[space] += 1;
        let largest_acked = self.loss.largest_acked(level);
        let header = self.make_header(level);
        let keys = self.keys[level_index(level)]
            .as_ref()
            .ok_or(QuicError::InvalidState("keys discarded mid-send"))?;
        let packet = seal(&header, pn, largest_acked, &payload, &keys.write)?;

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let in_flight = ack_eliciting || frames.iter().any(|f| matches!(f, Frame::Padding { .. }));
        self.loss.on_packet_sent(SentPacket {
            packet_number: pn,
            sent_time: now,
            sent_bytes: packet.len(),
            ack_eliciting,
            in_flight,
            level,
            frames: frames
                .into_iter()
                .filter(Frame::is_retransmittable)
                .collect(),
        });
        if in_flight {
            self.cc.on_packet_sent(packet.len());
            self.loss.ecn_mut().on_packets_sent(1);
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.len() as u64;
        if ack_eliciting {
            self.arm_idle(now);
            if let Some(interval) = self.config.keep_alive_interval {
                self.keep_alive_at = Some(now + interval);
            }
        }
        Ok(Some(packet))
    }

    fn build_probe(&mut self, level: EncryptionLevel, now: Instant) -> QuicResult<Option<Vec<u8>>> {
        let space = level.space().index();
        // prefer re-sending lost data over a bare ping
        if !self.retransmit[space].is_empty() {
            return self.build_packet(level, now);
        }
        self.finish_packet(level, vec![Frame::Ping], 1, now)
    }

    // ==================================================================
    // timers
    // ==================================================================

    fn arm_idle(&mut self, now: Instant) {
        self.idle_deadline = Some(now + self.idle_timeout);
    }

    /// The earliest instant at which `on_timeout` must run.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                if earliest.map_or(true, |e| t < e) {
                    earliest = Some(t);
                }
            }
        };
        match self.state {
            ConnectionState::Closed | ConnectionState::Idle => return None,
            ConnectionState::Closing => {
                if let Some(close) = &self.close_state {
                    consider(Some(close.closing_until));
                }
                return earliest;
            }
            ConnectionState::Draining => {
                if let Some(close) = &self.close_state {
                    consider(Some(close.draining_until));
                }
                return earliest;
            }
            _ => {}
        }
        consider(self.idle_deadline);
        consider(self.loss.next_timeout());
        consider(self.keep_alive_at);
        for tracker in &self.ack_trackers {
            consider(tracker.ack_deadline());
        }
        earliest
    }

    pub fn on_timeout(&mut self) -> QuicResult<()> {
        self.on_timeout_at(Instant::now())
    }

    pub fn on_timeout_at(&mut self, now: Instant) -> QuicResult<()> {
        match self.state {
            ConnectionState::Closing => {
                if let Some(close) = &self.close_state {
                    if now >= close.closing_until {
                        self.state = ConnectionState::Draining;
                    }
                }
                return Ok(());
            }
            ConnectionState::Draining => {
                if let Some(close) = &self.close_state {
                    if now >= close.draining_until {
                        self.state = ConnectionState::Closed;
                        debug!("connection closed");
                    }
                }
                return Ok(());
            }
            ConnectionState::Closed | ConnectionState::Idle => return Ok(()),
            _ => {}
        }

        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                debug!("idle timeout, draining");
                self.events.push_back(ConnectionEvent::Disconnected {
                    error_code: TransportError::NoError.to_code(),
                    reason: "idle timeout".into(),
                });
                self.enter_draining(now);
                return Ok(());
            }
        }

        if let Some(keep_alive) = self.keep_alive_at {
            if now >= keep_alive {
                self.keep_alive_at = None;
                let space = SpaceId::Application.index();
                self.retransmit[space].push_back(Frame::Ping);
            }
        }

        if let Some(timer) = self.loss.next_timeout() {
            if now >= timer {
                let result = self.loss.on_timeout(now);
                if result.event == LossEvent::PtoExpired {
                    self.probe_pending += 1;
                }
                self.on_loss_result(result, now);
            }
        }
        Ok(())
    }

    // ==================================================================
    // close
    // ==================================================================

    /// Graceful local close: send CONNECTION_CLOSE and walk the
    /// Closing -> Draining -> Closed ladder, 3 PTO per rung.
    pub fn close(&mut self, error_code: u64, reason: &str) -> QuicResult<()> {
        self.close_internal(error_code, reason, true, Instant::now())
    }

    pub fn close_at(&mut self, error_code: u64, reason: &str, now: Instant) -> QuicResult<()> {
        self.close_internal(error_code, reason, true, now)
    }

    fn close_internal(
        &mut self,
        error_code: u64,
        reason: &str,
        application: bool,
        now: Instant,
    ) -> QuicResult<()> {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed
        ) {
            return Ok(());
        }
        let pto3 = self.loss.rtt().pto() * 3;
        self.close_state = Some(CloseState {
            frame: ConnectionCloseFrame {
                error_code,
                frame_type: if application { None } else { Some(0) },
                reason: reason.to_string(),
            },
            resend: true,
            closing_until: now + pto3,
            draining_until: now + pto3 * 2,
        });
        self.streams.close_all_streams(error_code);
        self.state = ConnectionState::Closing;
        debug!(error_code, reason, "closing connection");
        Ok(())
    }

    fn enter_draining(&mut self, now: Instant) {
        let pto3 = self.loss.rtt().pto() * 3;
        if self.close_state.is_none() {
            self.close_state = Some(CloseState {
                frame: ConnectionCloseFrame {
                    error_code: 0,
                    frame_type: None,
                    reason: String::new(),
                },
                resend: false,
                closing_until: now,
                draining_until: now + pto3,
            });
        } else if let Some(close) = self.close_state.as_mut() {
            close.resend = false;
            close.draining_until = now + pto3;
        }
        self.state = ConnectionState::Draining;
    }

    // ==================================================================
    // application surface
    // ==================================================================

    pub fn open_stream(&mut self, bidi: bool) -> QuicResult<u64> {
        self.ensure_writable()?;
        self.streams.create_stream(bidi)
    }

    /// Write application data; `fin` marks the end of the stream. During a
    /// 0-RTT attempt this queues early data.
    pub fn write(&mut self, stream_id: u64, data: &[u8], fin: bool) -> QuicResult<usize> {
        self.ensure_writable()?;
        let stream = self
            .streams
            .get_stream(stream_id)
            .ok_or(QuicError::StreamNotFound(stream_id))?;
        let n = if data.is_empty() {
            0
        } else {
            stream.write(data)?
        };
        if fin {
            stream.finish()?;
        }
        Ok(n)
    }

    pub fn read(&mut self, stream_id: u64, buf: &mut [u8]) -> QuicResult<usize> {
        let stream = self
            .streams
            .get_stream(stream_id)
            .ok_or(QuicError::StreamNotFound(stream_id))?;
        let n = stream.read(buf)?;
        if n > 0 {
            self.flow.record_consumed(n as u64);
        }
        self.streams.remove_closed_streams();
        Ok(n)
    }

    pub fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> QuicResult<()> {
        self.ensure_writable()?;
        let stream = self
            .streams
            .get_stream(stream_id)
            .ok_or(QuicError::StreamNotFound(stream_id))?;
        let final_size = stream.reset(error_code)?;
        self.pending_control.push_back(Frame::ResetStream {
            stream_id,
            error_code,
            final_size,
        });
        Ok(())
    }

    pub fn stop_sending(&mut self, stream_id: u64, error_code: u64) -> QuicResult<()> {
        self.ensure_writable()?;
        if self.streams.get_stream(stream_id).is_none() {
            return Err(QuicError::StreamNotFound(stream_id));
        }
        self.pending_control.push_back(Frame::StopSending {
            stream_id,
            error_code,
        });
        Ok(())
    }

    /// Flip the 1-RTT key phase and install next-generation keys. The old
    /// read keys stay around for packets reordered across the boundary.
    pub fn initiate_key_update(&mut self) -> QuicResult<()> {
        if !self.handshake_confirmed {
            return Err(QuicError::transport(
                TransportError::KeyUpdateError,
                "key update before handshake confirmation",
            ));
        }
        let idx = level_index(EncryptionLevel::Application);
        let pair = self.keys[idx]
            .as_ref()
            .ok_or(QuicError::InvalidState("no 1-RTT keys"))?;
        let next = KeyPair {
            read: pair.read.next_generation()?,
            write: pair.write.next_generation()?,
        };
        self.prev_app_read = Some(pair.read.clone());
        self.keys[idx] = Some(next);
        self.key_phase = !self.key_phase;
        debug!("local key update initiated");
        Ok(())
    }

    fn ensure_writable(&self) -> QuicResult<()> {
        match self.state {
            ConnectionState::Established => Ok(()),
            // a client with accepted-or-pending 0-RTT may write early data
            ConnectionState::Handshaking
                if self.side == Side::Client
                    && self.keys[level_index(EncryptionLevel::ZeroRtt)].is_some()
                    && self.early_data_state != Some(false) =>
            {
                Ok(())
            }
            _ => Err(QuicError::InvalidState("connection not writable")),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("state", &self.state)
            .field("handshake_complete", &self.handshake_complete)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CERT: &[u8] = b"test certificate";
    const KEY: &[u8] = b"test key";

    fn new_pair(client_cfg: Config, server_cfg: Config) -> (Connection, Connection) {
        let mut client = Connection::client(client_cfg).unwrap();
        let mut server = Connection::server(server_cfg).unwrap();
        server
            .init_server_handshake(CERT.to_vec(), KEY.to_vec())
            .unwrap();
        client.start_handshake("example.test", 443).unwrap();
        (client, server)
    }

    /// Shuttle datagrams both ways until the link is quiet, advancing a
    /// simulated clock and firing due timers. `drop_filter` may eat
    /// client-to-server datagrams (returns true to drop).
    fn pump_with(
        client: &mut Connection,
        server: &mut Connection,
        now: &mut Instant,
        mut drop_filter: impl FnMut(usize, &[u8]) -> bool,
    ) {
        let mut c2s_index = 0;
        for _ in 0..64 {
            let mut moved = false;
            for packet in client.generate_packets_at(*now).unwrap() {
                let dropped = drop_filter(c2s_index, &packet);
                c2s_index += 1;
                if !dropped {
                    moved = true;
                    let _ = server.receive_packet_at(&packet, EcnCodepoint::NotEct, *now);
                }
            }
            for packet in server.generate_packets_at(*now).unwrap() {
                moved = true;
                let _ = client.receive_packet_at(&packet, EcnCodepoint::NotEct, *now);
            }
            *now += Duration::from_millis(30);
            for conn in [&mut *client, &mut *server] {
                if let Some(deadline) = conn.next_timeout() {
                    if deadline <= *now {
                        conn.on_timeout_at(*now).unwrap();
                    }
                }
            }
            if !moved && client.is_established() && server.is_established() {
                break;
            }
        }
    }

    fn pump(client: &mut Connection, server: &mut Connection, now: &mut Instant) {
        pump_with(client, server, now, |_, _| false);
    }

    fn drain_events(conn: &mut Connection) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Some(event) = conn.poll_event() {
            events.push(event);
        }
        events
    }

    fn read_all(conn: &mut Connection, stream_id: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(n) = conn.read(stream_id, &mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_handshake_to_one_rtt() {
        let (mut client, mut server) = new_pair(Config::default(), Config::default());
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);

        assert!(client.is_established());
        assert!(server.is_established());
        assert!(drain_events(&mut client).contains(&ConnectionEvent::Connected));
        assert!(drain_events(&mut server).contains(&ConnectionEvent::Connected));

        // hello over a fresh bidi stream, one round trip
        let stream_id = client.open_stream(true).unwrap();
        assert_eq!(client.write(stream_id, b"hello", true).unwrap(), 5);
        pump(&mut client, &mut server, &mut now);

        let events = drain_events(&mut server);
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StreamData { stream_id: id, .. } if *id == stream_id)));
        assert_eq!(read_all(&mut server, stream_id), b"hello");
    }

    #[test]
    fn test_echo_both_directions() {
        let (mut client, mut server) = new_pair(Config::default(), Config::default());
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);

        let stream_id = client.open_stream(true).unwrap();
        client.write(stream_id, b"ping", true).unwrap();
        pump(&mut client, &mut server, &mut now);
        assert_eq!(read_all(&mut server, stream_id), b"ping");

        server.write(stream_id, b"pong", true).unwrap();
        pump(&mut client, &mut server, &mut now);
        assert_eq!(read_all(&mut client, stream_id), b"pong");
    }

    #[test]
    fn test_loss_and_retransmission_preserve_order() {
        let (mut client, mut server) = new_pair(Config::default(), Config::default());
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);

        let stream_id = client.open_stream(true).unwrap();
        let payload: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        client.write(stream_id, &payload, true).unwrap();

        // drop the first post-handshake datagram carrying stream data; the
        // packets behind it push the reorder threshold past it
        let mut dropped = false;
        pump_with(&mut client, &mut server, &mut now, |_, packet| {
            // short-header packets only (first byte high bit clear)
            if !dropped && packet[0] & 0x80 == 0 && packet.len() > 500 {
                dropped = true;
                return true;
            }
            false
        });

        assert!(dropped, "a data packet was dropped");
        assert!(client.stats().packets_lost >= 1, "loss was detected");
        assert_eq!(read_all(&mut server, stream_id), payload);
    }

    #[test]
    fn test_connection_flow_control_blocks_and_recovers() {
        // the server grants only 1 KiB of connection credit up front
        let server_cfg = Config {
            initial_max_data: 1024,
            ..Config::default()
        };
        let (mut client, mut server) = new_pair(Config::default(), server_cfg);
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);

        let stream_id = client.open_stream(true).unwrap();
        let payload = vec![0x42u8; 2048];
        client.write(stream_id, &payload, true).unwrap();
        pump(&mut client, &mut server, &mut now);

        // reading frees credit; MAX_DATA lets the remainder through
        let mut received = read_all(&mut server, stream_id);
        assert!(received.len() >= 1024);
        for _ in 0..4 {
            pump(&mut client, &mut server, &mut now);
            received.extend(read_all(&mut server, stream_id));
            if received.len() == payload.len() {
                break;
            }
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn test_zero_rtt_resumption() {
        let tickets = Arc::new(SessionTicketStore::new());
        let replay = Arc::new(ReplayFilter::new());

        // first connection stores a ticket
        let mut client = Connection::client(Config::default()).unwrap();
        client.set_ticket_store(tickets.clone());
        let mut server = Connection::server(Config::default()).unwrap();
        server.set_replay_filter(replay.clone());
        server
            .init_server_handshake(CERT.to_vec(), KEY.to_vec())
            .unwrap();
        client.start_handshake("example.test", 443).unwrap();
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);
        assert!(client.is_established());
        assert!(tickets.has_ticket("example.test", 443), "ticket stored");

        // second connection sends early data before the handshake finishes
        let mut client2 = Connection::client(Config::default()).unwrap();
        client2.set_ticket_store(tickets.clone());
        let mut server2 = Connection::server(Config::default()).unwrap();
        server2.set_replay_filter(replay);
        server2
            .init_server_handshake(CERT.to_vec(), KEY.to_vec())
            .unwrap();
        client2.start_handshake("example.test", 443).unwrap();

        let stream_id = client2.open_stream(true).unwrap();
        client2.write(stream_id, b"GET /", true).unwrap();
        assert!(!client2.is_established(), "wrote before the handshake");

        pump(&mut client2, &mut server2, &mut now);
        assert!(client2.is_established());
        assert!(server2.is_established());
        assert_eq!(read_all(&mut server2, stream_id), b"GET /");
    }

    #[test]
    fn test_graceful_close() {
        let (mut client, mut server) = new_pair(Config::default(), Config::default());
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);
        drain_events(&mut client);
        drain_events(&mut server);

        client.close_at(7, "bye", now).unwrap();
        assert_eq!(client.state(), ConnectionState::Closing);
        for packet in client.generate_packets_at(now).unwrap() {
            server
                .receive_packet_at(&packet, EcnCodepoint::NotEct, now)
                .unwrap();
        }
        assert_eq!(server.state(), ConnectionState::Draining);
        let events = drain_events(&mut server);
        assert_eq!(
            events,
            vec![ConnectionEvent::Disconnected {
                error_code: 7,
                reason: "bye".into()
            }]
        );

        // the close ladder: 3 PTO closing, 3 PTO draining, then closed
        let pto3 = client.rtt().pto() * 3;
        now += pto3 + Duration::from_millis(1);
        client.on_timeout_at(now).unwrap();
        assert_eq!(client.state(), ConnectionState::Draining);
        now += pto3 + Duration::from_millis(1);
        client.on_timeout_at(now).unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        server.on_timeout_at(now).unwrap();
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_idle_timeout_drains() {
        let cfg = Config {
            idle_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let (mut client, mut server) = new_pair(cfg.clone(), cfg);
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);
        assert!(client.is_established());
        drain_events(&mut client);

        now += Duration::from_secs(3);
        client.on_timeout_at(now).unwrap();
        assert_eq!(client.state(), ConnectionState::Draining);
        assert!(drain_events(&mut client)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Disconnected { .. })));
    }

    #[test]
    fn test_key_update_round_trip() {
        let (mut client, mut server) = new_pair(Config::default(), Config::default());
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);
        let stream_id = client.open_stream(true).unwrap();
        client.write(stream_id, b"before", false).unwrap();
        pump(&mut client, &mut server, &mut now);
        assert_eq!(read_all(&mut server, stream_id), b"before");

        // data written after the phase flip still arrives
        client.initiate_key_update().unwrap();
        client.write(stream_id, b" after", true).unwrap();
        pump(&mut client, &mut server, &mut now);
        assert_eq!(read_all(&mut server, stream_id), b" after");

        // and the reverse direction picks up the new generation too
        server.write(stream_id, b"echo", true).unwrap();
        pump(&mut client, &mut server, &mut now);
        assert_eq!(read_all(&mut client, stream_id), b"echo");
    }

    #[test]
    fn test_stream_reset_reaches_peer() {
        let (mut client, mut server) = new_pair(Config::default(), Config::default());
        let mut now = Instant::now();
        pump(&mut client, &mut server, &mut now);

        let stream_id = client.open_stream(true).unwrap();
        client.write(stream_id, b"partial", false).unwrap();
        pump(&mut client, &mut server, &mut now);
        drain_events(&mut server);

        client.reset_stream(stream_id, 99).unwrap();
        pump(&mut client, &mut server, &mut now);
        let events = drain_events(&mut server);
        assert!(events.contains(&ConnectionEvent::StreamReset {
            stream_id,
            error_code: 99
        }));
    }

    // same engine, real datagrams over a loopback socket
    #[tokio::test]
    async fn test_loopback_udp() {
        let client_sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_sock.local_addr().unwrap();
        let server_addr = server_sock.local_addr().unwrap();

        let (mut client, mut server) = new_pair(Config::default(), Config::default());
        let mut buf = vec![0u8; 65_535];

        for _ in 0..32 {
            for packet in client.generate_packets().unwrap() {
                client_sock.send_to(&packet, server_addr).await.unwrap();
            }
            while let Ok(Ok((n, _))) = tokio::time::timeout(
                Duration::from_millis(20),
                server_sock.recv_from(&mut buf),
            )
            .await
            {
                server
                    .receive_packet(&buf[..n], EcnCodepoint::NotEct)
                    .unwrap();
            }
            for packet in server.generate_packets().unwrap() {
                server_sock.send_to(&packet, client_addr).await.unwrap();
            }
            while let Ok(Ok((n, _))) = tokio::time::timeout(
                Duration::from_millis(20),
                client_sock.recv_from(&mut buf),
            )
            .await
            {
                client
                    .receive_packet(&buf[..n], EcnCodepoint::NotEct)
                    .unwrap();
            }
            if client.is_established() && server.is_established() {
                break;
            }
        }
        assert!(client.is_established());
        assert!(server.is_established());

        let stream_id = client.open_stream(true).unwrap();
        client.write(stream_id, b"over the wire", true).unwrap();
        for packet in client.generate_packets().unwrap() {
            client_sock.send_to(&packet, server_addr).await.unwrap();
        }
        let mut received = Vec::new();
        while let Ok(Ok((n, _))) = tokio::time::timeout(
            Duration::from_millis(50),
            server_sock.recv_from(&mut buf),
        )
        .await
        {
            server
                .receive_packet(&buf[..n], EcnCodepoint::NotEct)
                .unwrap();
            let mut read_buf = [0u8; 256];
            if let Ok(n) = server.read(stream_id, &mut read_buf) {
                received.extend_from_slice(&read_buf[..n]);
            }
            if received == b"over the wire" {
                break;
            }
        }
        assert_eq!(received, b"over the wire");
    }
}
