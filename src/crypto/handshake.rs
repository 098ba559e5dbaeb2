use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use ring::hkdf::{Prk, Salt, HKDF_SHA256};
use tracing::{debug, warn};

use crate::coder::Reader;
use crate::crypto::keys::{hkdf_expand_label, Side, SECRET_LEN};
use crate::packet::types::EncryptionLevel;
use crate::result::{QuicError, QuicResult};
use crate::session::ReplayFilter;

/// Secrets for one encryption level, as handed over by the TLS stack at a
/// key-schedule boundary.
#[derive(Debug, Clone)]
pub struct LevelSecrets {
    pub level: EncryptionLevel,
    pub read_secret: [u8; SECRET_LEN],
    pub write_secret: [u8; SECRET_LEN],
}

/// A NewSessionTicket received by the client; the connection combines it
/// with the endpoint and the peer's transport parameters into a stored
/// [`crate::session::SessionTicket`].
#[derive(Debug, Clone)]
pub struct NewSessionTicket {
    pub ticket_data: Bytes,
    pub lifetime_secs: u32,
    pub age_add: u32,
    pub max_early_data_size: u32,
}

/// Resumption state offered by a client attempting 0-RTT.
#[derive(Debug, Clone)]
pub struct ResumptionOffer {
    pub ticket_data: Bytes,
    pub obfuscated_age: u32,
}

/// The narrow seam to the TLS 1.3 stack. The engine feeds it CRYPTO-frame
/// bytes per encryption level and drains outgoing bytes, fresh secrets and
/// the peer's transport-parameter extension. A rustls-backed driver slots
/// in behind this trait without engine changes.
pub trait Handshake: Send {
    /// Ordered handshake bytes received at `level`.
    fn read_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> QuicResult<()>;

    /// Bytes to transmit at `level`, if any.
    fn take_crypto(&mut self, level: EncryptionLevel) -> Option<Vec<u8>>;

    /// Secrets that became available since the last call, in install order.
    fn take_secrets(&mut self) -> Vec<LevelSecrets>;

    /// The peer's transport-parameter extension, once seen.
    fn peer_transport_params(&mut self) -> Option<Vec<u8>>;

    fn is_complete(&self) -> bool;

    /// Client: whether the server accepted the 0-RTT offer (None until the
    /// answer is known).
    fn early_data_accepted(&self) -> Option<bool>;

    /// Server: the client-hello nonce, used as the anti-replay key.
    fn client_hello_nonce(&self) -> Option<[u8; 32]>;

    /// Client: a post-handshake session ticket, if one arrived.
    fn take_session_ticket(&mut self) -> Option<NewSessionTicket>;
}

// message framing: type (u8), length (u16 be), body
const MSG_CLIENT_HELLO: u8 = 0x01;
const MSG_SERVER_HELLO: u8 = 0x02;
const MSG_ENCRYPTED_EXTENSIONS: u8 = 0x03;
const MSG_FINISHED: u8 = 0x04;
const MSG_NEW_SESSION_TICKET: u8 = 0x05;

const HS_SALT: &[u8] = b"plain handshake v1";
const EARLY_SALT: &[u8] = b"plain early v1";
const TICKET_LEN: usize = 32;
const TICKET_LIFETIME_SECS: u32 = 7 * 24 * 3600;

fn extract(salt: &[u8], ikm: &[u8]) -> Prk {
    Salt::new(HKDF_SHA256, salt).extract(ikm)
}

fn expand32(prk: &Prk, label: &[u8]) -> QuicResult<[u8; SECRET_LEN]> {
    let mut out = [0u8; SECRET_LEN];
    hkdf_expand_label(prk, label, &mut out)?;
    Ok(out)
}

fn push_message(out: &mut Vec<u8>, ty: u8, body: &[u8]) {
    out.push(ty);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

/// Deterministic in-memory handshake driver. It performs the same shape of
/// exchange as a TLS 1.3 stack over QUIC — ClientHello and ServerHello at
/// the Initial level, extensions and Finished at the Handshake level, a
/// session ticket post-handshake — with an HKDF key schedule over both
/// sides' randoms, optionally mixed with a resumption ticket for 0-RTT.
/// It carries no certificate verification and is intended for tests,
/// demos and loopback deployments.
pub struct PlainHandshake {
    side: Side,
    server_name: String,
    local_params: Vec<u8>,
    peer_params: Option<Vec<u8>>,

    local_random: [u8; 32],
    peer_random: Option<[u8; 32]>,

    // per-level byte queues in both directions
    incoming: [Vec<u8>; 3],
    outgoing: [Vec<u8>; 3],
    secrets: Vec<LevelSecrets>,

    hs_prk: Option<Prk>,
    complete: bool,

    // 0-RTT
    resumption: Option<ResumptionOffer>,
    early_accepted: Option<bool>,
    replay_filter: Option<Arc<ReplayFilter>>,
    client_nonce: Option<[u8; 32]>,

    ticket: Option<NewSessionTicket>,
    ticket_issued: bool,

    // server identity; the plain driver only checks presence
    _cert: Vec<u8>,
    _key: Vec<u8>,
}

fn level_slot(level: EncryptionLevel) -> usize {
    match level {
        EncryptionLevel::Initial => 0,
        EncryptionLevel::Handshake => 1,
        // post-handshake messages ride at the application level; 0-RTT
        // carries no handshake bytes
        EncryptionLevel::ZeroRtt | EncryptionLevel::Application => 2,
    }
}

impl PlainHandshake {
    /// Client driver. `resumption` enables a 0-RTT offer.
    pub fn client(
        server_name: &str,
        transport_params: Vec<u8>,
        resumption: Option<ResumptionOffer>,
    ) -> QuicResult<Box<dyn Handshake>> {
        if server_name.is_empty() {
            return Err(QuicError::InvalidArgument("empty server name"));
        }
        let mut local_random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut local_random);

        let mut hs = PlainHandshake {
            side: Side::Client,
            server_name: server_name.to_string(),
            local_params: transport_params,
            peer_params: None,
            local_random,
            peer_random: None,
            incoming: Default::default(),
            outgoing: Default::default(),
            secrets: Vec::new(),
            hs_prk: None,
            complete: false,
            resumption,
            early_accepted: None,
            replay_filter: None,
            client_nonce: None,
            ticket: None,
            ticket_issued: false,
            _cert: Vec::new(),
            _key: Vec::new(),
        };
        hs.send_client_hello()?;
        Ok(Box::new(hs))
    }

    /// Server driver. 0-RTT offers are admitted only when a replay filter
    /// is supplied and passes the client-hello nonce.
    pub fn server(
        cert: Vec<u8>,
        key: Vec<u8>,
        transport_params: Vec<u8>,
        replay_filter: Option<Arc<ReplayFilter>>,
    ) -> QuicResult<Box<dyn Handshake>> {
        if cert.is_empty() || key.is_empty() {
            return Err(QuicError::InvalidArgument("empty certificate or key"));
        }
        let mut local_random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut local_random);
        Ok(Box::new(PlainHandshake {
            side: Side::Server,
            server_name: String::new(),
            local_params: transport_params,
            peer_params: None,
            local_random,
            peer_random: None,
            incoming: Default::default(),
            outgoing: Default::default(),
            secrets: Vec::new(),
            hs_prk: None,
            complete: false,
            resumption: None,
            early_accepted: None,
            replay_filter,
            client_nonce: None,
            ticket: None,
            ticket_issued: false,
            _cert: cert,
            _key: key,
        }))
    }

    fn send_client_hello(&mut self) -> QuicResult<()> {
        let mut body = Vec::with_capacity(96 + self.local_params.len());
        body.extend_from_slice(&self.local_random);
        body.push(self.server_name.len() as u8);
        body.extend_from_slice(self.server_name.as_bytes());
        body.extend_from_slice(&(self.local_params.len() as u16).to_be_bytes());
        body.extend_from_slice(&self.local_params);
        match &self.resumption {
            Some(offer) => {
                body.push(1);
                body.extend_from_slice(&(offer.ticket_data.len() as u16).to_be_bytes());
                body.extend_from_slice(&offer.ticket_data);
                body.extend_from_slice(&offer.obfuscated_age.to_be_bytes());
            }
            None => body.push(0),
        }
        let out = &mut self.outgoing[0];
        push_message(out, MSG_CLIENT_HELLO, &body);

        // the 0-RTT write secret depends only on the ticket and our random,
        // so early data can flow before the server answers
        if let Some(offer) = self.resumption.clone() {
            let early = self.early_secret(&offer.ticket_data)?;
            self.secrets.push(LevelSecrets {
                level: EncryptionLevel::ZeroRtt,
                read_secret: early,
                write_secret: early,
            });
        }
        Ok(())
    }

    fn early_secret(&self, ticket: &[u8]) -> QuicResult<[u8; SECRET_LEN]> {
        let client_random = match self.side {
            Side::Client => self.local_random,
            Side::Server => self.peer_random.ok_or(QuicError::InvalidState(
                "early secret before client hello",
            ))?,
        };
        let mut ikm = Vec::with_capacity(ticket.len() + 32);
        ikm.extend_from_slice(ticket);
        ikm.extend_from_slice(&client_random);
        expand32(&extract(EARLY_SALT, &ikm), b"early data")
    }

    /// Both sides derive the same schedule from the two randoms.
    fn derive_schedule(&mut self) -> QuicResult<()> {
        let (client_random, server_random) = match self.side {
            Side::Client => (self.local_random, self.peer_random.expect("have peer")),
            Side::Server => (self.peer_random.expect("have peer"), self.local_random),
        };
        let mut ikm = Vec::with_capacity(64);
        ikm.extend_from_slice(&client_random);
        ikm.extend_from_slice(&server_random);
        self.hs_prk = Some(extract(HS_SALT, &ikm));

        let prk = self.hs_prk.as_ref().expect("just set");
        let client_hs = expand32(prk, b"client hs")?;
        let server_hs = expand32(prk, b"server hs")?;
        let (read, write) = match self.side {
            Side::Client => (server_hs, client_hs),
            Side::Server => (client_hs, server_hs),
        };
        self.secrets.push(LevelSecrets {
            level: EncryptionLevel::Handshake,
            read_secret: read,
            write_secret: write,
        });
        Ok(())
    }

    fn derive_application(&mut self) -> QuicResult<()> {
        let prk = self
            .hs_prk
            .as_ref()
            .ok_or(QuicError::InvalidState("application keys before handshake"))?;
        let client_app = expand32(prk, b"client app")?;
        let server_app = expand32(prk, b"server app")?;
        let (read, write) = match self.side {
            Side::Client => (server_app, client_app),
            Side::Server => (client_app, server_app),
        };
        self.secrets.push(LevelSecrets {
            level: EncryptionLevel::Application,
            read_secret: read,
            write_secret: write,
        });
        Ok(())
    }

    fn finished_verify(&self, side: Side) -> QuicResult<[u8; 32]> {
        let prk = self
            .hs_prk
            .as_ref()
            .ok_or(QuicError::InvalidState("finished before key schedule"))?;
        let label: &[u8] = match side {
            Side::Client => b"client finished",
            Side::Server => b"server finished",
        };
        expand32(prk, label)
    }

    fn on_client_hello(&mut self, body: &[u8]) -> QuicResult<()> {
        if self.peer_random.is_some() {
            // retransmitted hello; the answer is already queued
            return Ok(());
        }
        let mut r = Reader::new(body);
        let random = r.array::<32>()?;
        let sni_len = r.u8()? as usize;
        let sni = r.bytes(sni_len)?;
        self.server_name = String::from_utf8_lossy(sni).into_owned();
        let params_len = r.u16()? as usize;
        self.peer_params = Some(r.bytes(params_len)?.to_vec());
        self.peer_random = Some(random);
        self.client_nonce = Some(random);

        let mut early_accepted = false;
        if r.u8()? == 1 {
            let ticket_len = r.u16()? as usize;
            let ticket = r.bytes(ticket_len)?.to_vec();
            let _age = r.u32()?;
            // accept only a structurally valid ticket, and only once per
            // nonce within the replay window
            let replay_ok = self
                .replay_filter
                .as_ref()
                .map(|f| f.check_and_record(&random))
                .unwrap_or(false);
            if ticket.len() == TICKET_LEN && replay_ok {
                early_accepted = true;
                let early = self.early_secret(&ticket)?;
                self.secrets.push(LevelSecrets {
                    level: EncryptionLevel::ZeroRtt,
                    read_secret: early,
                    write_secret: early,
                });
            } else {
                warn!("0-RTT offer rejected");
            }
        }
        self.early_accepted = Some(early_accepted);

        // ServerHello at Initial
        let mut sh = Vec::with_capacity(33);
        sh.extend_from_slice(&self.local_random);
        sh.push(early_accepted as u8);
        let mut out = Vec::new();
        push_message(&mut out, MSG_SERVER_HELLO, &sh);
        self.outgoing[0].extend_from_slice(&out);

        self.derive_schedule()?;

        // extensions and Finished at Handshake
        let mut ee = Vec::with_capacity(2 + self.local_params.len());
        ee.extend_from_slice(&(self.local_params.len() as u16).to_be_bytes());
        ee.extend_from_slice(&self.local_params);
        let mut hs_out = Vec::new();
        push_message(&mut hs_out, MSG_ENCRYPTED_EXTENSIONS, &ee);
        let verify = self.finished_verify(Side::Server)?;
        push_message(&mut hs_out, MSG_FINISHED, &verify);
        self.outgoing[1].extend_from_slice(&hs_out);

        // the server can write 1-RTT as soon as its Finished is queued
        self.derive_application()?;
        Ok(())
    }

    fn on_server_hello(&mut self, body: &[u8]) -> QuicResult<()> {
        let mut r = Reader::new(body);
        let random = r.array::<32>()?;
        let early_accepted = r.u8()? == 1;
        self.peer_random = Some(random);
        if self.resumption.is_some() {
            self.early_accepted = Some(early_accepted);
        }
        self.derive_schedule()
    }

    fn on_finished(&mut self, verify: &[u8], from: Side) -> QuicResult<()> {
        let expected = self.finished_verify(from)?;
        if verify != expected.as_slice() {
            return Err(QuicError::Crypto("finished verification failed"));
        }
        match self.side {
            Side::Client => {
                // answer with our Finished and move to 1-RTT
                let verify = self.finished_verify(Side::Client)?;
                let mut out = Vec::new();
                push_message(&mut out, MSG_FINISHED, &verify);
                self.outgoing[1].extend_from_slice(&out);
                self.derive_application()?;
                self.complete = true;
                debug!("client handshake complete");
            }
            Side::Server => {
                self.complete = true;
                self.issue_ticket();
                debug!("server handshake complete");
            }
        }
        Ok(())
    }

    fn issue_ticket(&mut self) {
        if self.ticket_issued {
            return;
        }
        self.ticket_issued = true;
        let mut ticket = vec![0u8; TICKET_LEN];
        rand::thread_rng().fill_bytes(&mut ticket);
        let mut age_add = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut age_add);

        let mut body = Vec::with_capacity(TICKET_LEN + 14);
        body.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
        body.extend_from_slice(&ticket);
        body.extend_from_slice(&TICKET_LIFETIME_SECS.to_be_bytes());
        body.extend_from_slice(&age_add);
        body.extend_from_slice(&u32::MAX.to_be_bytes()); // max_early_data
        let mut out = Vec::new();
        push_message(&mut out, MSG_NEW_SESSION_TICKET, &body);
        self.outgoing[2].extend_from_slice(&out);
    }

    fn on_new_session_ticket(&mut self, body: &[u8]) -> QuicResult<()> {
        let mut r = Reader::new(body);
        let ticket_len = r.u16()? as usize;
        let ticket_data = Bytes::copy_from_slice(r.bytes(ticket_len)?);
        let lifetime_secs = r.u32()?;
        let age_add = r.u32()?;
        let max_early_data_size = r.u32()?;
        self.ticket = Some(NewSessionTicket {
            ticket_data,
            lifetime_secs,
            age_add,
            max_early_data_size,
        });
        Ok(())
    }

    fn process_buffered(&mut self, slot: usize) -> QuicResult<()> {
        loop {
            let buf = &self.incoming[slot];
            if buf.len() < 3 {
                return Ok(());
            }
            let ty = buf[0];
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            if buf.len() < 3 + len {
                return Ok(());
            }
            let body: Vec<u8> = buf[3..3 + len].to_vec();
            self.incoming[slot].drain(..3 + len);

            match (ty, self.side) {
                (MSG_CLIENT_HELLO, Side::Server) => self.on_client_hello(&body)?,
                (MSG_SERVER_HELLO, Side::Client) => self.on_server_hello(&body)?,
                (MSG_ENCRYPTED_EXTENSIONS, Side::Client) => {
                    let mut r = Reader::new(&body);
                    let params_len = r.u16()? as usize;
                    self.peer_params = Some(r.bytes(params_len)?.to_vec());
                }
                (MSG_FINISHED, side) => {
                    let from = match side {
                        Side::Client => Side::Server,
                        Side::Server => Side::Client,
                    };
                    self.on_finished(&body, from)?;
                }
                (MSG_NEW_SESSION_TICKET, Side::Client) => self.on_new_session_ticket(&body)?,
                _ => return Err(QuicError::Crypto("unexpected handshake message")),
            }
        }
    }
}

impl Handshake for PlainHandshake {
    fn read_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> QuicResult<()> {
        let slot = level_slot(level);
        self.incoming[slot].extend_from_slice(data);
        self.process_buffered(slot)
    }

    fn take_crypto(&mut self, level: EncryptionLevel) -> Option<Vec<u8>> {
        let slot = level_slot(level);
        if level == EncryptionLevel::ZeroRtt {
            return None;
        }
        if self.outgoing[slot].is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.outgoing[slot]))
        }
    }

    fn take_secrets(&mut self) -> Vec<LevelSecrets> {
        std::mem::take(&mut self.secrets)
    }

    fn peer_transport_params(&mut self) -> Option<Vec<u8>> {
        self.peer_params.take()
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn early_data_accepted(&self) -> Option<bool> {
        self.early_accepted
    }

    fn client_hello_nonce(&self) -> Option<[u8; 32]> {
        self.client_nonce
    }

    fn take_session_ticket(&mut self) -> Option<NewSessionTicket> {
        self.ticket.take()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Shuttle crypto bytes between two drivers until neither has output.
    fn pump(client: &mut Box<dyn Handshake>, server: &mut Box<dyn Handshake>) {
        let levels = [
            EncryptionLevel::Initial,
            EncryptionLevel::Handshake,
            EncryptionLevel::Application,
        ];
        for _ in 0..8 {
            let mut moved = false;
            for level in levels {
                if let Some(bytes) = client.take_crypto(level) {
                    server.read_crypto(level, &bytes).unwrap();
                    moved = true;
                }
                if let Some(bytes) = server.take_crypto(level) {
                    client.read_crypto(level, &bytes).unwrap();
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    fn new_pair() -> (Box<dyn Handshake>, Box<dyn Handshake>) {
        let client = PlainHandshake::client("example.test", vec![1, 2, 3], None).unwrap();
        let server =
            PlainHandshake::server(vec![0xce; 8], vec![0xd1; 8], vec![4, 5, 6], None).unwrap();
        (client, server)
    }

    #[test]
    fn test_full_handshake() {
        let (mut client, mut server) = new_pair();
        pump(&mut client, &mut server);

        assert!(client.is_complete());
        assert!(server.is_complete());
        assert_eq!(client.peer_transport_params().unwrap(), vec![4, 5, 6]);
        assert_eq!(server.peer_transport_params().unwrap(), vec![1, 2, 3]);

        // the two sides agree on every level's secrets, mirrored
        let cs = client.take_secrets();
        let ss = server.take_secrets();
        let find = |v: &[LevelSecrets], l| v.iter().find(|s| s.level == l).cloned().unwrap();
        for level in [EncryptionLevel::Handshake, EncryptionLevel::Application] {
            let c = find(&cs, level);
            let s = find(&ss, level);
            assert_eq!(c.write_secret, s.read_secret);
            assert_eq!(c.read_secret, s.write_secret);
        }

        // server issued a ticket, client received it
        assert!(client.take_session_ticket().is_some());
    }

    #[test]
    fn test_fragmented_delivery() {
        let (mut client, mut server) = new_pair();
        // deliver the client hello one byte at a time
        let ch = client.take_crypto(EncryptionLevel::Initial).unwrap();
        for byte in ch {
            server.read_crypto(EncryptionLevel::Initial, &[byte]).unwrap();
        }
        assert!(server.take_crypto(EncryptionLevel::Initial).is_some());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(PlainHandshake::client("", vec![], None).is_err());
        assert!(PlainHandshake::server(vec![], vec![1], vec![], None).is_err());
    }

    #[test]
    fn test_zero_rtt_accept_and_replay() {
        let filter = Arc::new(ReplayFilter::new());
        let offer = ResumptionOffer {
            ticket_data: Bytes::from(vec![7u8; TICKET_LEN]),
            obfuscated_age: 12345,
        };

        let mut client =
            PlainHandshake::client("example.test", vec![1], Some(offer.clone())).unwrap();
        // client has an early secret before any server contact
        let early = client
            .take_secrets()
            .into_iter()
            .find(|s| s.level == EncryptionLevel::ZeroRtt)
            .expect("early secret");

        let mut server =
            PlainHandshake::server(vec![1], vec![1], vec![2], Some(filter.clone())).unwrap();

        // capture the hello so it can be replayed verbatim later
        let hello = client.take_crypto(EncryptionLevel::Initial).unwrap();
        server.read_crypto(EncryptionLevel::Initial, &hello).unwrap();
        pump(&mut client, &mut server);

        assert_eq!(client.early_data_accepted(), Some(true));
        assert_eq!(server.early_data_accepted(), Some(true));
        let server_early = server
            .take_secrets()
            .into_iter()
            .find(|s| s.level == EncryptionLevel::ZeroRtt)
            .expect("server early secret");
        assert_eq!(early.write_secret, server_early.read_secret);

        // the identical hello against a fresh server sharing the filter is
        // a replay: the 0-RTT offer must be refused
        let mut replay_server =
            PlainHandshake::server(vec![1], vec![1], vec![2], Some(filter)).unwrap();
        replay_server
            .read_crypto(EncryptionLevel::Initial, &hello)
            .unwrap();
        assert_eq!(replay_server.early_data_accepted(), Some(false));
    }

    #[test]
    fn test_zero_rtt_rejected_without_filter() {
        let offer = ResumptionOffer {
            ticket_data: Bytes::from(vec![7u8; TICKET_LEN]),
            obfuscated_age: 0,
        };
        let mut client = PlainHandshake::client("example.test", vec![1], Some(offer)).unwrap();
        let mut server = PlainHandshake::server(vec![1], vec![1], vec![2], None).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(client.early_data_accepted(), Some(false));
        assert!(client.is_complete());
    }
}
