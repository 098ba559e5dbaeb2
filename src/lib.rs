//! QUIC v1 transport engine (RFC 9000/9001/9002): packet and frame codecs,
//! packet protection, loss recovery with NewReno congestion control and ECN,
//! stream multiplexing with two-level flow control, session resumption with
//! 0-RTT anti-replay, and a single-threaded connection orchestrator driven
//! by `receive_packet` / `generate_packets` / `next_timeout` / `on_timeout`.

pub mod cid;
pub mod coder;
pub mod connection;
pub mod crypto;
pub mod flow;
pub mod packet;
pub mod recovery;
pub mod result;
pub mod session;
pub mod stream;
pub mod tparams;
pub mod varint;

pub use cid::ConnectionId;
pub use connection::{Config, Connection, ConnectionEvent, ConnectionState};
pub use packet::types::{EcnCodepoint, EncryptionLevel};
pub use result::{QuicError, QuicResult, TransportError};
pub use session::{ReplayFilter, SessionTicket, SessionTicketStore};
pub use varint::VarInt;
