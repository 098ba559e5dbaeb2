use std::collections::HashSet;

use crate::cid::ConnectionId;
use crate::coder::Reader;
use crate::crypto::keys::Side;
use crate::result::{QuicError, QuicResult, TransportError};
use crate::varint::VarInt;

// Transport parameter IDs (RFC 9000 Section 18.2).
mod param_id {
    pub const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const PREFERRED_ADDRESS: u64 = 0x0d;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
    pub const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
    pub const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4_address: [u8; 4],
    pub ipv4_port: u16,
    pub ipv6_address: [u8; 16],
    pub ipv6_port: u16,
    pub cid: ConnectionId,
    pub stateless_reset_token: [u8; 16],
}

/// Transport parameters exchanged in the TLS handshake extension
/// (RFC 9000 Section 18). Encoded as `(id, length, value)` triples with
/// varint ids and lengths; parameters at their default value are omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    // connection ids (server-only except the initial source cid)
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    pub stateless_reset_token: Option<[u8; 16]>,

    // timing
    pub max_idle_timeout: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: u64,

    // flow control
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,

    // stream concurrency
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,

    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            stateless_reset_token: None,
            max_idle_timeout: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            max_udp_payload_size: 65_527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            preferred_address: None,
        }
    }
}

fn put_varint(buf: &mut Vec<u8>, value: u64) {
    VarInt::saturating(value).encode_to(buf);
}

fn put_param_bytes(buf: &mut Vec<u8>, id: u64, value: &[u8]) {
    put_varint(buf, id);
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

fn put_param_varint(buf: &mut Vec<u8>, id: u64, value: u64) {
    let encoded = VarInt::saturating(value).encode();
    put_param_bytes(buf, id, &encoded);
}

fn put_param_empty(buf: &mut Vec<u8>, id: u64) {
    put_varint(buf, id);
    put_varint(buf, 0);
}

impl TransportParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);

        if let Some(cid) = &self.original_destination_connection_id {
            put_param_bytes(
                &mut buf,
                param_id::ORIGINAL_DESTINATION_CONNECTION_ID,
                cid.as_slice(),
            );
        }
        if let Some(cid) = &self.initial_source_connection_id {
            put_param_bytes(&mut buf, param_id::INITIAL_SOURCE_CONNECTION_ID, cid.as_slice());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_param_bytes(&mut buf, param_id::RETRY_SOURCE_CONNECTION_ID, cid.as_slice());
        }
        if let Some(token) = &self.stateless_reset_token {
            put_param_bytes(&mut buf, param_id::STATELESS_RESET_TOKEN, token);
        }
        if self.max_idle_timeout != 0 {
            put_param_varint(&mut buf, param_id::MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        }
        if self.ack_delay_exponent != 3 {
            put_param_varint(&mut buf, param_id::ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        }
        if self.max_ack_delay != 25 {
            put_param_varint(&mut buf, param_id::MAX_ACK_DELAY, self.max_ack_delay);
        }
        if self.max_udp_payload_size != 65_527 {
            put_param_varint(
                &mut buf,
                param_id::MAX_UDP_PAYLOAD_SIZE,
                self.max_udp_payload_size,
            );
        }
        if self.initial_max_data != 0 {
            put_param_varint(&mut buf, param_id::INITIAL_MAX_DATA, self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != 0 {
            put_param_varint(
                &mut buf,
                param_id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                self.initial_max_stream_data_bidi_local,
            );
        }
        if self.initial_max_stream_data_bidi_remote != 0 {
            put_param_varint(
                &mut buf,
                param_id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                self.initial_max_stream_data_bidi_remote,
            );
        }
        if self.initial_max_stream_data_uni != 0 {
            put_param_varint(
                &mut buf,
                param_id::INITIAL_MAX_STREAM_DATA_UNI,
                self.initial_max_stream_data_uni,
            );
        }
        if self.initial_max_streams_bidi != 0 {
            put_param_varint(
                &mut buf,
                param_id::INITIAL_MAX_STREAMS_BIDI,
                self.initial_max_streams_bidi,
            );
        }
        if self.initial_max_streams_uni != 0 {
            put_param_varint(
                &mut buf,
                param_id::INITIAL_MAX_STREAMS_UNI,
                self.initial_max_streams_uni,
            );
        }
        if self.disable_active_migration {
            put_param_empty(&mut buf, param_id::DISABLE_ACTIVE_MIGRATION);
        }
        if self.active_connection_id_limit != 2 {
            put_param_varint(
                &mut buf,
                param_id::ACTIVE_CONNECTION_ID_LIMIT,
                self.active_connection_id_limit,
            );
        }
        if let Some(pa) = &self.preferred_address {
            let mut value = Vec::with_capacity(64);
            value.extend_from_slice(&pa.ipv4_address);
            value.extend_from_slice(&pa.ipv4_port.to_be_bytes());
            value.extend_from_slice(&pa.ipv6_address);
            value.extend_from_slice(&pa.ipv6_port.to_be_bytes());
            value.push(pa.cid.len() as u8);
            value.extend_from_slice(pa.cid.as_slice());
            value.extend_from_slice(&pa.stateless_reset_token);
            put_param_bytes(&mut buf, param_id::PREFERRED_ADDRESS, &value);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> QuicResult<TransportParams> {
        let mut params = TransportParams::default();
        let mut seen = HashSet::new();
        let mut r = Reader::new(data);

        while !r.is_empty() {
            let id = r.varint()?.to_inner();
            let len = r.varint_len()?;
            let value = r.bytes(len)?;
            if !seen.insert(id) {
                return Err(QuicError::transport(
                    TransportError::TransportParameterError,
                    "duplicate transport parameter",
                ));
            }
            let mut vr = Reader::new(value);
            match id {
                param_id::ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id =
                        Some(ConnectionId::from_bytes(value)?);
                }
                param_id::INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(ConnectionId::from_bytes(value)?);
                }
                param_id::RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(ConnectionId::from_bytes(value)?);
                }
                param_id::STATELESS_RESET_TOKEN => {
                    params.stateless_reset_token = Some(vr.array::<16>()?);
                }
                param_id::MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = vr.varint()?.to_inner();
                }
                param_id::ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = vr.varint()?.to_inner();
                }
                param_id::MAX_ACK_DELAY => {
                    params.max_ack_delay = vr.varint()?.to_inner();
                }
                param_id::MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = vr.varint()?.to_inner();
                }
                param_id::INITIAL_MAX_DATA => {
                    params.initial_max_data = vr.varint()?.to_inner();
                }
                param_id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = vr.varint()?.to_inner();
                }
                param_id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = vr.varint()?.to_inner();
                }
                param_id::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = vr.varint()?.to_inner();
                }
                param_id::INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = vr.varint()?.to_inner();
                }
                param_id::INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = vr.varint()?.to_inner();
                }
                param_id::DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(QuicError::transport(
                            TransportError::TransportParameterError,
                            "disable_active_migration carries a value",
                        ));
                    }
                    params.disable_active_migration = true;
                }
                param_id::ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = vr.varint()?.to_inner();
                }
                param_id::PREFERRED_ADDRESS => {
                    let ipv4_address = vr.array::<4>()?;
                    let ipv4_port = vr.u16()?;
                    let ipv6_address = vr.array::<16>()?;
                    let ipv6_port = vr.u16()?;
                    let cid_len = vr.u8()? as usize;
                    let cid = ConnectionId::from_bytes(vr.bytes(cid_len)?)?;
                    let stateless_reset_token = vr.array::<16>()?;
                    params.preferred_address = Some(PreferredAddress {
                        ipv4_address,
                        ipv4_port,
                        ipv6_address,
                        ipv6_port,
                        cid,
                        stateless_reset_token,
                    });
                }
                // unknown parameters must be ignored (RFC 9000 Section 7.4.2)
                _ => {}
            }
        }
        Ok(params)
    }

    /// Validate parameters received from the peer. `sender` is the side
    /// that produced them.
    pub fn validate(&self, sender: Side) -> QuicResult<()> {
        let fail = |reason| {
            Err(QuicError::transport(
                TransportError::TransportParameterError,
                reason,
            ))
        };
        if sender == Side::Client
            && (self.original_destination_connection_id.is_some()
                || self.retry_source_connection_id.is_some()
                || self.stateless_reset_token.is_some()
                || self.preferred_address.is_some())
        {
            return fail("client sent a server-only parameter");
        }
        if self.ack_delay_exponent > 20 {
            return fail("ack_delay_exponent above 20");
        }
        if self.max_ack_delay >= 1 << 14 {
            return fail("max_ack_delay above 2^14 - 1");
        }
        if self.max_udp_payload_size < 1200 {
            return fail("max_udp_payload_size below 1200");
        }
        if self.active_connection_id_limit < 2 {
            return fail("active_connection_id_limit below 2");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn full_params() -> TransportParams {
        TransportParams {
            original_destination_connection_id: Some(
                ConnectionId::from_bytes(&[1, 2, 3, 4]).unwrap(),
            ),
            initial_source_connection_id: Some(ConnectionId::from_bytes(&[5, 6, 7, 8]).unwrap()),
            retry_source_connection_id: None,
            stateless_reset_token: Some([0xaa; 16]),
            max_idle_timeout: 30_000,
            ack_delay_exponent: 4,
            max_ack_delay: 50,
            max_udp_payload_size: 1452,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 65_536,
            initial_max_stream_data_bidi_remote: 65_536,
            initial_max_stream_data_uni: 32_768,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 10,
            disable_active_migration: true,
            active_connection_id_limit: 4,
            preferred_address: Some(PreferredAddress {
                ipv4_address: [192, 0, 2, 1],
                ipv4_port: 4433,
                ipv6_address: [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
                ipv6_port: 4433,
                cid: ConnectionId::from_bytes(&[9; 8]).unwrap(),
                stateless_reset_token: [0xbb; 16],
            }),
        }
    }

    #[test]
    fn test_round_trip_full() {
        let params = full_params();
        let encoded = params.encode();
        let decoded = TransportParams::decode(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_defaults_encode_empty() {
        let params = TransportParams::default();
        assert!(params.encode().is_empty());
        let decoded = TransportParams::decode(&[]).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut encoded = Vec::new();
        put_param_varint(&mut encoded, param_id::INITIAL_MAX_DATA, 100);
        put_param_varint(&mut encoded, param_id::INITIAL_MAX_DATA, 200);
        let err = TransportParams::decode(&encoded).unwrap_err();
        assert_eq!(err.wire_code(), TransportError::TransportParameterError);
    }

    #[test]
    fn test_truncated_rejected() {
        let encoded = full_params().encode();
        for cut in 1..encoded.len() {
            // every proper prefix either errors or silently drops a whole
            // trailing parameter; mid-parameter cuts must error
            let _ = TransportParams::decode(&encoded[..cut]);
        }
        // a cut inside a value is always an error
        let mut buf = Vec::new();
        put_param_bytes(&mut buf, param_id::STATELESS_RESET_TOKEN, &[0xcc; 16]);
        assert!(TransportParams::decode(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn test_unknown_parameter_ignored() {
        let mut encoded = Vec::new();
        put_param_bytes(&mut encoded, 0x1f, &[1, 2, 3]);
        put_param_varint(&mut encoded, param_id::INITIAL_MAX_DATA, 7);
        let params = TransportParams::decode(&encoded).unwrap();
        assert_eq!(params.initial_max_data, 7);
    }

    #[test]
    fn test_validation_rules() {
        let mut p = TransportParams::default();
        assert!(p.validate(Side::Server).is_ok());

        p.stateless_reset_token = Some([0; 16]);
        assert!(p.validate(Side::Server).is_ok());
        assert!(p.validate(Side::Client).is_err());

        let mut p = TransportParams {
            ack_delay_exponent: 21,
            ..Default::default()
        };
        assert!(p.validate(Side::Server).is_err());
        p.ack_delay_exponent = 20;
        assert!(p.validate(Side::Server).is_ok());

        let p = TransportParams {
            max_udp_payload_size: 1199,
            ..Default::default()
        };
        assert!(p.validate(Side::Server).is_err());

        let p = TransportParams {
            max_ack_delay: 1 << 14,
            ..Default::default()
        };
        assert!(p.validate(Side::Server).is_err());

        let p = TransportParams {
            active_connection_id_limit: 1,
            ..Default::default()
        };
        assert!(p.validate(Side::Server).is_err());
    }
}
