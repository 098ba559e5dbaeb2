use ring::aead::Aad;

use crate::crypto::keys::{Keys, TAG_LEN};
use crate::packet::header::{
    Header, PartialDecode, LONG_RESERVED_MASK, PN_LEN_MASK, SHORT_KEY_PHASE, SHORT_RESERVED_MASK,
    SHORT_SPIN_BIT,
};
use crate::packet::types::PacketNumber;
use crate::result::{require, QuicError, QuicResult, TransportError};

/// Header protection samples 16 bytes of ciphertext starting 4 bytes past
/// the packet-number offset (RFC 9001 Section 5.4.2).
const SAMPLE_OFFSET: usize = 4;
const SAMPLE_LEN: usize = 16;

/// A decrypted packet: trustworthy header bits, expanded packet number and
/// plaintext payload.
#[derive(Debug)]
pub struct PlainPacket {
    pub header: Header,
    pub pn: u64,
    pub key_phase: bool,
    pub payload: Vec<u8>,
}

/// Encrypt `payload` under `keys` and apply header protection, producing
/// the complete wire packet.
pub fn seal(
    header: &Header,
    pn: u64,
    largest_acked: Option<u64>,
    payload: &[u8],
    keys: &Keys,
) -> QuicResult<Vec<u8>> {
    let pn_len = PacketNumber::encoded_len(pn, largest_acked);
    // the sample window must be covered by packet number + ciphertext
    require(
        pn_len + payload.len() + TAG_LEN >= SAMPLE_OFFSET + SAMPLE_LEN,
        "payload too short to sample",
    )?;

    let mut packet = Vec::with_capacity(64 + payload.len());
    header.encode(pn, pn_len, payload.len() + TAG_LEN, &mut packet);
    let pn_offset = packet.len() - pn_len;

    let mut in_out = payload.to_vec();
    let tag = keys
        .aead_key()?
        .seal_in_place_separate_tag(
            ring::aead::Nonce::assume_unique_for_key(keys.nonce_for(pn)),
            Aad::from(&packet),
            &mut in_out,
        )
        .map_err(|_| QuicError::Crypto("aead seal failed"))?;
    packet.extend_from_slice(&in_out);
    packet.extend_from_slice(tag.as_ref());

    // header protection over the first byte's low bits and the pn field
    let sample_start = pn_offset + SAMPLE_OFFSET;
    let mask = keys.hp_mask(&packet[sample_start..sample_start + SAMPLE_LEN])?;
    if header.is_long() {
        packet[0] ^= mask[0] & 0x0f;
    } else {
        packet[0] ^= mask[0] & 0x1f;
    }
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    Ok(packet)
}

/// Remove header protection and open the AEAD. `packet` is exactly one
/// packet (`pd.packet_len` bytes). Failure means the datagram is dropped
/// silently by the caller.
pub fn open(
    packet: &[u8],
    pd: &PartialDecode,
    keys: &Keys,
    largest_acked: Option<u64>,
) -> QuicResult<PlainPacket> {
    let pn_offset = pd.pn_offset;
    require(
        packet.len() >= pn_offset + SAMPLE_OFFSET + SAMPLE_LEN,
        "packet too short to sample",
    )?;

    let sample_start = pn_offset + SAMPLE_OFFSET;
    let mask = keys.hp_mask(&packet[sample_start..sample_start + SAMPLE_LEN])?;

    let mut first = packet[0];
    if pd.header.is_long() {
        first ^= mask[0] & 0x0f;
    } else {
        first ^= mask[0] & 0x1f;
    }
    let pn_len = (first & PN_LEN_MASK) as usize + 1;
    require(packet.len() >= pn_offset + pn_len, "truncated packet number")?;

    // reserved bits must be zero once unprotected
    let reserved = if pd.header.is_long() {
        first & LONG_RESERVED_MASK
    } else {
        first & SHORT_RESERVED_MASK
    };
    if reserved != 0 {
        return Err(QuicError::transport(
            TransportError::ProtocolViolation,
            "non-zero reserved header bits",
        ));
    }

    let mut truncated = 0u64;
    for i in 0..pn_len {
        truncated = truncated << 8 | (packet[pn_offset + i] ^ mask[1 + i]) as u64;
    }
    let pn = PacketNumber::decode(truncated, pn_len, largest_acked)?;

    // associated data is the unprotected header through the packet number
    let mut aad = packet[..pn_offset + pn_len].to_vec();
    aad[0] = first;
    for i in 0..pn_len {
        aad[pn_offset + i] ^= mask[1 + i];
    }

    let mut in_out = packet[pn_offset + pn_len..].to_vec();
    let plain_len = keys
        .aead_key()?
        .open_in_place(
            ring::aead::Nonce::assume_unique_for_key(keys.nonce_for(pn)),
            Aad::from(&aad),
            &mut in_out,
        )
        .map_err(|_| QuicError::DecryptFailed)?
        .len();
    in_out.truncate(plain_len);

    let mut header = pd.header.clone();
    let mut key_phase = false;
    if let Header::Short(h) = &mut header {
        h.spin = first & SHORT_SPIN_BIT != 0;
        h.key_phase = first & SHORT_KEY_PHASE != 0;
        key_phase = h.key_phase;
    }

    Ok(PlainPacket {
        header,
        pn,
        key_phase,
        payload: in_out,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cid::ConnectionId;
    use crate::crypto::keys::{initial_keys, Side};
    use crate::packet::header::{LongHeader, LongType, ShortHeader};
    use crate::packet::types::QUIC_VERSION;
    use bytes::Bytes;

    fn test_keys() -> (Keys, Keys) {
        let dcid = ConnectionId::from_bytes(&[0x83, 0x94, 0xc8, 0xf0]).unwrap();
        let client = initial_keys(&dcid, Side::Client).unwrap();
        (client.write.clone(), client.read.clone())
    }

    fn long_header() -> Header {
        Header::Long(LongHeader {
            ty: LongType::Initial,
            version: QUIC_VERSION,
            dst_cid: ConnectionId::from_bytes(&[1; 8]).unwrap(),
            src_cid: ConnectionId::from_bytes(&[2; 8]).unwrap(),
            token: Bytes::new(),
        })
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (write, _) = test_keys();
        let payload = b"frame bytes frame bytes frame bytes".to_vec();
        let packet = seal(&long_header(), 42, None, &payload, &write).unwrap();

        let pd = PartialDecode::parse(&packet, 0).unwrap();
        let plain = open(&packet[..pd.packet_len], &pd, &write, None).unwrap();
        assert_eq!(plain.pn, 42);
        assert_eq!(plain.payload, payload);
        assert_eq!(plain.header, long_header());
    }

    #[test]
    fn test_any_bit_flip_fails() {
        let (write, _) = test_keys();
        let payload = b"sixteen byte min".to_vec();
        let packet = seal(&long_header(), 7, None, &payload, &write).unwrap();
        let pd = PartialDecode::parse(&packet, 0).unwrap();

        // flipping a bit anywhere past the version field breaks either the
        // header protection sample, the aad or the ciphertext
        for pos in [5, packet.len() / 2, packet.len() - 1] {
            let mut corrupted = packet.clone();
            corrupted[pos] ^= 0x40;
            match PartialDecode::parse(&corrupted, 0) {
                Ok(cpd) => {
                    assert!(
                        open(&corrupted[..cpd.packet_len], &cpd, &write, None).is_err(),
                        "flip at {pos} not caught"
                    );
                }
                Err(_) => {}
            }
        }
    }

    #[test]
    fn test_wrong_keys_fail() {
        let (write, read) = test_keys();
        let packet = seal(&long_header(), 7, None, b"some payload data", &write).unwrap();
        let pd = PartialDecode::parse(&packet, 0).unwrap();
        // read-direction keys differ from write keys and must not open it
        let err = open(&packet[..pd.packet_len], &pd, &read, None).unwrap_err();
        assert_eq!(err, QuicError::DecryptFailed);
    }

    #[test]
    fn test_short_header_round_trip_with_key_phase() {
        let (write, _) = test_keys();
        let header = Header::Short(ShortHeader {
            dst_cid: ConnectionId::from_bytes(&[9; 8]).unwrap(),
            spin: false,
            key_phase: true,
        });
        let packet = seal(&header, 1000, Some(900), b"short packet payload", &write).unwrap();
        let pd = PartialDecode::parse(&packet, 8).unwrap();
        let plain = open(&packet[..pd.packet_len], &pd, &write, Some(900)).unwrap();
        assert_eq!(plain.pn, 1000);
        assert!(plain.key_phase);
        assert_eq!(plain.payload, b"short packet payload");
    }

    #[test]
    fn test_pn_expansion_through_packet_layer() {
        let (write, _) = test_keys();
        // pn 300 encoded against largest_acked 298 uses one byte (0x2c);
        // the receiver expands it back against its own largest_acked
        let packet = seal(&long_header(), 300, Some(298), b"payload for pn test", &write).unwrap();
        let pd = PartialDecode::parse(&packet, 0).unwrap();
        let plain = open(&packet[..pd.packet_len], &pd, &write, Some(298)).unwrap();
        assert_eq!(plain.pn, 300);
    }
}
