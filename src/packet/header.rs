use bytes::Bytes;

use crate::cid::ConnectionId;
use crate::coder::Reader;
use crate::packet::types::{EncryptionLevel, QUIC_VERSION};
use crate::result::{require, QuicError, QuicResult};
use crate::varint::VarInt;

// First-byte layout (RFC 9000 Section 17):
//   long:  1 1 T T R R P P   (T = type, R = reserved, P = pn_length - 1)
//   short: 0 1 S R R K P P   (S = spin, K = key phase)
pub const FORM_LONG: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;
pub const LONG_TYPE_MASK: u8 = 0x30;
pub const LONG_RESERVED_MASK: u8 = 0x0c;
pub const SHORT_SPIN_BIT: u8 = 0x20;
pub const SHORT_RESERVED_MASK: u8 = 0x18;
pub const SHORT_KEY_PHASE: u8 = 0x04;
pub const PN_LEN_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    Initial = 0x00,
    ZeroRtt = 0x01,
    Handshake = 0x02,
    Retry = 0x03,
}

impl LongType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0x00 => LongType::Initial,
            0x01 => LongType::ZeroRtt,
            0x02 => LongType::Handshake,
            _ => LongType::Retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub ty: LongType,
    pub version: u32,
    pub dst_cid: ConnectionId,
    pub src_cid: ConnectionId,
    /// Initial packets carry the (possibly empty) retry token.
    pub token: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub dst_cid: ConnectionId,
    pub spin: bool,
    pub key_phase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long(LongHeader),
    Short(ShortHeader),
}

impl Header {
    pub fn encryption_level(&self) -> QuicResult<EncryptionLevel> {
        match self {
            Header::Long(h) => match h.ty {
                LongType::Initial => Ok(EncryptionLevel::Initial),
                LongType::ZeroRtt => Ok(EncryptionLevel::ZeroRtt),
                LongType::Handshake => Ok(EncryptionLevel::Handshake),
                LongType::Retry => Err(QuicError::Malformed("retry packets carry no payload")),
            },
            Header::Short(_) => Ok(EncryptionLevel::Application),
        }
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Header::Long(h) => &h.dst_cid,
            Header::Short(h) => &h.dst_cid,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Header::Long(_))
    }

    /// Encode through the packet number. `payload_len` must already include
    /// the AEAD tag so the long-header Length field is final.
    pub fn encode(&self, pn: u64, pn_len: usize, payload_len: usize, buf: &mut Vec<u8>) {
        match self {
            Header::Long(h) => {
                let first = FORM_LONG
                    | FIXED_BIT
                    | ((h.ty as u8) << 4)
                    | (pn_len as u8 - 1);
                buf.push(first);
                buf.extend_from_slice(&h.version.to_be_bytes());
                buf.push(h.dst_cid.len() as u8);
                buf.extend_from_slice(h.dst_cid.as_slice());
                buf.push(h.src_cid.len() as u8);
                buf.extend_from_slice(h.src_cid.as_slice());
                if h.ty == LongType::Initial {
                    VarInt::saturating(h.token.len() as u64).encode_to(buf);
                    buf.extend_from_slice(&h.token);
                }
                VarInt::saturating((pn_len + payload_len) as u64).encode_to(buf);
            }
            Header::Short(h) => {
                let mut first = FIXED_BIT | (pn_len as u8 - 1);
                if h.spin {
                    first |= SHORT_SPIN_BIT;
                }
                if h.key_phase {
                    first |= SHORT_KEY_PHASE;
                }
                buf.push(first);
                buf.extend_from_slice(h.dst_cid.as_slice());
            }
        }
        crate::packet::types::PacketNumber::encode(pn, pn_len, buf);
    }
}

/// Header fields recovered before header-protection removal. The packet
/// number and the protected first-byte bits are not yet trustworthy.
#[derive(Debug)]
pub struct PartialDecode {
    pub header: Header,
    /// Offset of the packet-number field within the packet.
    pub pn_offset: usize,
    /// Total length of this packet within the datagram (coalescing).
    pub packet_len: usize,
}

impl PartialDecode {
    /// Parse one packet's header from the front of `data`. Short headers
    /// need the receiver's CID length, which is known out-of-band.
    pub fn parse(data: &[u8], local_cid_len: usize) -> QuicResult<PartialDecode> {
        let mut r = Reader::new(data);
        let first = r.u8()?;
        require(first & FIXED_BIT != 0, "fixed bit is zero")?;

        if first & FORM_LONG != 0 {
            let version = r.u32()?;
            require(version == QUIC_VERSION, "unsupported version")?;
            let ty = LongType::from_bits(first >> 4);
            let dcid_len = r.u8()? as usize;
            require(dcid_len <= 20, "destination connection id too long")?;
            let dst_cid = ConnectionId::from_bytes(r.bytes(dcid_len)?)?;
            let scid_len = r.u8()? as usize;
            require(scid_len <= 20, "source connection id too long")?;
            let src_cid = ConnectionId::from_bytes(r.bytes(scid_len)?)?;

            if ty == LongType::Retry {
                // no length or packet number; the rest of the datagram is
                // token plus 16-byte integrity tag
                let rest = r.rest();
                require(rest.len() >= 16, "retry integrity tag")?;
                let token = Bytes::copy_from_slice(&rest[..rest.len() - 16]);
                return Ok(PartialDecode {
                    header: Header::Long(LongHeader {
                        ty,
                        version,
                        dst_cid,
                        src_cid,
                        token,
                    }),
                    pn_offset: data.len(),
                    packet_len: data.len(),
                });
            }

            let token = if ty == LongType::Initial {
                let token_len = r.varint_len()?;
                Bytes::copy_from_slice(r.bytes(token_len)?)
            } else {
                Bytes::new()
            };
            let length = r.varint_len()?;
            let pn_offset = r.consumed();
            require(r.remaining() >= length, "truncated long-header packet")?;
            Ok(PartialDecode {
                header: Header::Long(LongHeader {
                    ty,
                    version,
                    dst_cid,
                    src_cid,
                    token,
                }),
                pn_offset,
                packet_len: pn_offset + length,
            })
        } else {
            let dst_cid = ConnectionId::from_bytes(r.bytes(local_cid_len)?)?;
            let pn_offset = r.consumed();
            // spin / key-phase bits are read after header protection removal
            Ok(PartialDecode {
                header: Header::Short(ShortHeader {
                    dst_cid,
                    spin: first & SHORT_SPIN_BIT != 0,
                    key_phase: false,
                }),
                pn_offset,
                packet_len: data.len(),
            })
        }
    }
}
