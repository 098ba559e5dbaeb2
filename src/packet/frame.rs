use bytes::Bytes;

use crate::cid::ConnectionId;
use crate::coder::Reader;
use crate::result::{require, QuicError, QuicResult, TransportError};
use crate::varint::VarInt;

// Frame types (RFC 9000 Section 19). STREAM occupies 0x08-0x0f with the low
// three bits acting as FIN/LEN/OFF flags.
pub mod frame_type {
    pub const PADDING: u64 = 0x00;
    pub const PING: u64 = 0x01;
    // ack frames identify received packets via one or more ack ranges; the
    // ecn variant appends the three cumulative ecn counts
    pub const ACK: u64 = 0x02;
    pub const ACK_ECN: u64 = 0x03;
    // abruptly terminates the sending part of a stream; the receiver may
    // discard data it already holds
    pub const RESET_STREAM: u64 = 0x04;
    // asks the peer to cease transmission on a stream
    pub const STOP_SENDING: u64 = 0x05;
    // carries the tls handshake byte stream; no FIN bit, offsets only
    pub const CRYPTO: u64 = 0x06;
    pub const NEW_TOKEN: u64 = 0x07;
    pub const STREAM_BASE: u64 = 0x08;
    pub const MAX_DATA: u64 = 0x10;
    pub const MAX_STREAM_DATA: u64 = 0x11;
    pub const MAX_STREAMS_BIDI: u64 = 0x12;
    pub const MAX_STREAMS_UNI: u64 = 0x13;
    // sent when connection-level flow control stalls the sender
    pub const DATA_BLOCKED: u64 = 0x14;
    pub const STREAM_DATA_BLOCKED: u64 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u64 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u64 = 0x17;
    pub const NEW_CONNECTION_ID: u64 = 0x18;
    pub const RETIRE_CONNECTION_ID: u64 = 0x19;
    pub const PATH_CHALLENGE: u64 = 0x1a;
    pub const PATH_RESPONSE: u64 = 0x1b;
    pub const CONNECTION_CLOSE: u64 = 0x1c;
    pub const CONNECTION_CLOSE_APP: u64 = 0x1d;
    // server-only signal that the handshake is confirmed
    pub const HANDSHAKE_DONE: u64 = 0x1e;
}

pub mod stream_flags {
    pub const FIN: u8 = 0x01;
    pub const LEN: u8 = 0x02;
    pub const OFF: u8 = 0x04;
}

pub fn is_stream_type(t: u64) -> bool {
    (0x08..=0x0f).contains(&t)
}

/// Cumulative ECN counts carried by an ACK_ECN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ecn_ce: u64,
}

impl EcnCounts {
    pub fn total(&self) -> u64 {
        self.ect0 + self.ect1 + self.ecn_ce
    }
}

/// A `(gap, length)` pair describing an earlier run of acknowledged packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub gap: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acknowledged: u64,
    /// Raw wire value; multiply by `2^ack_delay_exponent` for microseconds.
    pub ack_delay: u64,
    /// Packets acknowledged below `largest_acknowledged` in the first run.
    pub first_range: u64,
    pub ranges: Vec<AckRange>,
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// All acknowledged packet numbers as inclusive `(low, high)` spans,
    /// highest first. Fails if any computed packet number would go negative.
    pub fn spans(&self) -> QuicResult<Vec<(u64, u64)>> {
        let mut spans = Vec::with_capacity(1 + self.ranges.len());
        let high = self.largest_acknowledged;
        let low = high
            .checked_sub(self.first_range)
            .ok_or(QuicError::transport(
                TransportError::FrameEncodingError,
                "ack first range underflows",
            ))?;
        spans.push((low, high));

        let mut next_high = low;
        for range in &self.ranges {
            let high = next_high
                .checked_sub(range.gap + 2)
                .ok_or(QuicError::transport(
                    TransportError::FrameEncodingError,
                    "ack gap underflows",
                ))?;
            let low = high.checked_sub(range.length).ok_or(QuicError::transport(
                TransportError::FrameEncodingError,
                "ack range underflows",
            ))?;
            spans.push((low, high));
            next_high = low;
        }
        Ok(spans)
    }

    pub fn acknowledges(&self, pn: u64) -> bool {
        self.spans()
            .map(|spans| spans.iter().any(|&(lo, hi)| pn >= lo && pn <= hi))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub cid: ConnectionId,
    pub reset_token: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u64,
    /// Transport variant carries the offending frame type; the application
    /// variant (0x1d) has no such field.
    pub frame_type: Option<u64>,
    pub reason: String,
}

impl ConnectionCloseFrame {
    pub fn is_application(&self) -> bool {
        self.frame_type.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding { len: usize },
    Ping,
    Ack(AckFrame),
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream(StreamFrame),
    MaxData {
        max: u64,
    },
    MaxStreamData {
        stream_id: u64,
        max: u64,
    },
    MaxStreams {
        bidi: bool,
        max: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlocked {
        bidi: bool,
        limit: u64,
    },
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone,
}

impl Frame {
    /// Everything except ACK, PADDING and CONNECTION_CLOSE must be
    /// acknowledged by the peer (RFC 9002 Section 2).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding { .. } | Frame::ConnectionClose(_)
        )
    }

    /// Frames whose loss requires the contents to be sent again.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding { .. } | Frame::Ping)
    }

    /// Parse one frame, returning it and the bytes consumed.
    pub fn parse(data: &[u8]) -> QuicResult<(Frame, usize)> {
        let mut r = Reader::new(data);
        let frame = Self::parse_from(&mut r)?;
        Ok((frame, r.consumed()))
    }

    /// Parse frames until the buffer is exhausted, aborting on the first
    /// error.
    pub fn parse_all(data: &[u8]) -> QuicResult<Vec<Frame>> {
        let mut r = Reader::new(data);
        let mut frames = Vec::new();
        while !r.is_empty() {
            frames.push(Self::parse_from(&mut r)?);
        }
        Ok(frames)
    }

    fn parse_from(r: &mut Reader<'_>) -> QuicResult<Frame> {
        let ty = r.varint()?.to_inner();
        match ty {
            frame_type::PADDING => {
                // run-length: swallow the padding run in one frame
                let mut len = 1;
                while !r.is_empty() && r.peek_u8()? == 0 {
                    r.u8()?;
                    len += 1;
                }
                Ok(Frame::Padding { len })
            }
            frame_type::PING => Ok(Frame::Ping),
            frame_type::ACK | frame_type::ACK_ECN => {
                let largest_acknowledged = r.varint()?.to_inner();
                let ack_delay = r.varint()?.to_inner();
                let range_count = r.varint()?.to_inner();
                let first_range = r.varint()?.to_inner();
                let mut ranges = Vec::with_capacity(range_count.min(64) as usize);
                for _ in 0..range_count {
                    let gap = r.varint()?.to_inner();
                    let length = r.varint()?.to_inner();
                    ranges.push(AckRange { gap, length });
                }
                let ecn = if ty == frame_type::ACK_ECN {
                    Some(EcnCounts {
                        ect0: r.varint()?.to_inner(),
                        ect1: r.varint()?.to_inner(),
                        ecn_ce: r.varint()?.to_inner(),
                    })
                } else {
                    None
                };
                let ack = AckFrame {
                    largest_acknowledged,
                    ack_delay,
                    first_range,
                    ranges,
                    ecn,
                };
                // validate range arithmetic up front
                ack.spans()?;
                Ok(Frame::Ack(ack))
            }
            frame_type::RESET_STREAM => Ok(Frame::ResetStream {
                stream_id: r.varint()?.to_inner(),
                error_code: r.varint()?.to_inner(),
                final_size: r.varint()?.to_inner(),
            }),
            frame_type::STOP_SENDING => Ok(Frame::StopSending {
                stream_id: r.varint()?.to_inner(),
                error_code: r.varint()?.to_inner(),
            }),
            frame_type::CRYPTO => {
                let offset = r.varint()?.to_inner();
                let len = r.varint_len()?;
                let data = Bytes::copy_from_slice(r.bytes(len)?);
                require(
                    offset + data.len() as u64 <= VarInt::MAX.to_inner(),
                    "crypto frame exceeds stream bound",
                )?;
                Ok(Frame::Crypto { offset, data })
            }
            frame_type::NEW_TOKEN => {
                let len = r.varint_len()?;
                if len == 0 {
                    return Err(QuicError::transport(
                        TransportError::FrameEncodingError,
                        "NEW_TOKEN with empty token",
                    ));
                }
                Ok(Frame::NewToken {
                    token: Bytes::copy_from_slice(r.bytes(len)?),
                })
            }
            t if is_stream_type(t) => {
                let flags = (t & 0x07) as u8;
                let stream_id = r.varint()?.to_inner();
                let offset = if flags & stream_flags::OFF != 0 {
                    r.varint()?.to_inner()
                } else {
                    0
                };
                let data = if flags & stream_flags::LEN != 0 {
                    let len = r.varint_len()?;
                    Bytes::copy_from_slice(r.bytes(len)?)
                } else {
                    // no length field: payload extends to the end of the packet
                    Bytes::copy_from_slice(r.rest())
                };
                require(
                    offset + data.len() as u64 <= VarInt::MAX.to_inner(),
                    "stream frame exceeds final-offset bound",
                )?;
                Ok(Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin: flags & stream_flags::FIN != 0,
                }))
            }
            frame_type::MAX_DATA => Ok(Frame::MaxData {
                max: r.varint()?.to_inner(),
            }),
            frame_type::MAX_STREAM_DATA => Ok(Frame::MaxStreamData {
                stream_id: r.varint()?.to_inner(),
                max: r.varint()?.to_inner(),
            }),
            frame_type::MAX_STREAMS_BIDI | frame_type::MAX_STREAMS_UNI => Ok(Frame::MaxStreams {
                bidi: ty == frame_type::MAX_STREAMS_BIDI,
                max: r.varint()?.to_inner(),
            }),
            frame_type::DATA_BLOCKED => Ok(Frame::DataBlocked {
                limit: r.varint()?.to_inner(),
            }),
            frame_type::STREAM_DATA_BLOCKED => Ok(Frame::StreamDataBlocked {
                stream_id: r.varint()?.to_inner(),
                limit: r.varint()?.to_inner(),
            }),
            frame_type::STREAMS_BLOCKED_BIDI | frame_type::STREAMS_BLOCKED_UNI => {
                Ok(Frame::StreamsBlocked {
                    bidi: ty == frame_type::STREAMS_BLOCKED_BIDI,
                    limit: r.varint()?.to_inner(),
                })
            }
            frame_type::NEW_CONNECTION_ID => {
                let sequence = r.varint()?.to_inner();
                let retire_prior_to = r.varint()?.to_inner();
                let cid_len = r.u8()? as usize;
                if !(1..=20).contains(&cid_len) {
                    return Err(QuicError::transport(
                        TransportError::FrameEncodingError,
                        "NEW_CONNECTION_ID length outside 1..=20",
                    ));
                }
                let cid = ConnectionId::from_bytes(r.bytes(cid_len)?)?;
                let reset_token = r.array::<16>()?;
                if retire_prior_to > sequence {
                    return Err(QuicError::transport(
                        TransportError::FrameEncodingError,
                        "retire_prior_to exceeds sequence number",
                    ));
                }
                Ok(Frame::NewConnectionId(NewConnectionIdFrame {
                    sequence,
                    retire_prior_to,
                    cid,
                    reset_token,
                }))
            }
            frame_type::RETIRE_CONNECTION_ID => Ok(Frame::RetireConnectionId {
                sequence: r.varint()?.to_inner(),
            }),
            frame_type::PATH_CHALLENGE => Ok(Frame::PathChallenge {
                data: r.array::<8>()?,
            }),
            frame_type::PATH_RESPONSE => Ok(Frame::PathResponse {
                data: r.array::<8>()?,
            }),
            frame_type::CONNECTION_CLOSE | frame_type::CONNECTION_CLOSE_APP => {
                let error_code = r.varint()?.to_inner();
                let frame_type = if ty == frame_type::CONNECTION_CLOSE {
                    Some(r.varint()?.to_inner())
                } else {
                    None
                };
                let reason_len = r.varint_len()?;
                let reason = String::from_utf8_lossy(r.bytes(reason_len)?).into_owned();
                Ok(Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    frame_type,
                    reason,
                }))
            }
            frame_type::HANDSHAKE_DONE => Ok(Frame::HandshakeDone),
            _ => Err(QuicError::transport(
                TransportError::FrameEncodingError,
                "unknown frame type",
            )),
        }
    }

    /// Append the canonical wire form.
    pub fn build(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Padding { len } => {
                buf.resize(buf.len() + len.max(&1), 0);
            }
            Frame::Ping => put_varint(buf, frame_type::PING),
            Frame::Ack(ack) => {
                let ty = if ack.ecn.is_some() {
                    frame_type::ACK_ECN
                } else {
                    frame_type::ACK
                };
                put_varint(buf, ty);
                put_varint(buf, ack.largest_acknowledged);
                put_varint(buf, ack.ack_delay);
                put_varint(buf, ack.ranges.len() as u64);
                put_varint(buf, ack.first_range);
                for range in &ack.ranges {
                    put_varint(buf, range.gap);
                    put_varint(buf, range.length);
                }
                if let Some(ecn) = &ack.ecn {
                    put_varint(buf, ecn.ect0);
                    put_varint(buf, ecn.ect1);
                    put_varint(buf, ecn.ecn_ce);
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                put_varint(buf, frame_type::RESET_STREAM);
                put_varint(buf, *stream_id);
                put_varint(buf, *error_code);
                put_varint(buf, *final_size);
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                put_varint(buf, frame_type::STOP_SENDING);
                put_varint(buf, *stream_id);
                put_varint(buf, *error_code);
            }
            Frame::Crypto { offset, data } => {
                put_varint(buf, frame_type::CRYPTO);
                put_varint(buf, *offset);
                put_varint(buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                put_varint(buf, frame_type::NEW_TOKEN);
                put_varint(buf, token.len() as u64);
                buf.extend_from_slice(token);
            }
            Frame::Stream(f) => Frame::build_stream(f, true, buf),
            Frame::MaxData { max } => {
                put_varint(buf, frame_type::MAX_DATA);
                put_varint(buf, *max);
            }
            Frame::MaxStreamData { stream_id, max } => {
                put_varint(buf, frame_type::MAX_STREAM_DATA);
                put_varint(buf, *stream_id);
                put_varint(buf, *max);
            }
            Frame::MaxStreams { bidi, max } => {
                put_varint(
                    buf,
                    if *bidi {
                        frame_type::MAX_STREAMS_BIDI
                    } else {
                        frame_type::MAX_STREAMS_UNI
                    },
                );
                put_varint(buf, *max);
            }
            Frame::DataBlocked { limit } => {
                put_varint(buf, frame_type::DATA_BLOCKED);
                put_varint(buf, *limit);
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                put_varint(buf, frame_type::STREAM_DATA_BLOCKED);
                put_varint(buf, *stream_id);
                put_varint(buf, *limit);
            }
            Frame::StreamsBlocked { bidi, limit } => {
                put_varint(
                    buf,
                    if *bidi {
                        frame_type::STREAMS_BLOCKED_BIDI
                    } else {
                        frame_type::STREAMS_BLOCKED_UNI
                    },
                );
                put_varint(buf, *limit);
            }
            Frame::NewConnectionId(f) => {
                put_varint(buf, frame_type::NEW_CONNECTION_ID);
                put_varint(buf, f.sequence);
                put_varint(buf, f.retire_prior_to);
                buf.push(f.cid.len() as u8);
                buf.extend_from_slice(f.cid.as_slice());
                buf.extend_from_slice(&f.reset_token);
            }
            Frame::RetireConnectionId { sequence } => {
                put_varint(buf, frame_type::RETIRE_CONNECTION_ID);
                put_varint(buf, *sequence);
            }
            Frame::PathChallenge { data } => {
                put_varint(buf, frame_type::PATH_CHALLENGE);
                buf.extend_from_slice(data);
            }
            Frame::PathResponse { data } => {
                put_varint(buf, frame_type::PATH_RESPONSE);
                buf.extend_from_slice(data);
            }
            Frame::ConnectionClose(f) => {
                if let Some(frame_type_val) = f.frame_type {
                    put_varint(buf, frame_type::CONNECTION_CLOSE);
                    put_varint(buf, f.error_code);
                    put_varint(buf, frame_type_val);
                } else {
                    put_varint(buf, frame_type::CONNECTION_CLOSE_APP);
                    put_varint(buf, f.error_code);
                }
                put_varint(buf, f.reason.len() as u64);
                buf.extend_from_slice(f.reason.as_bytes());
            }
            Frame::HandshakeDone => put_varint(buf, frame_type::HANDSHAKE_DONE),
        }
    }

    /// STREAM frames may omit the length field when they are the last frame
    /// in a packet.
    pub fn build_stream(f: &StreamFrame, include_length: bool, buf: &mut Vec<u8>) {
        let mut ty = frame_type::STREAM_BASE as u8;
        if f.fin {
            ty |= stream_flags::FIN;
        }
        if include_length {
            ty |= stream_flags::LEN;
        }
        if f.offset != 0 {
            ty |= stream_flags::OFF;
        }
        put_varint(buf, ty as u64);
        put_varint(buf, f.stream_id);
        if f.offset != 0 {
            put_varint(buf, f.offset);
        }
        if include_length {
            put_varint(buf, f.data.len() as u64);
        }
        buf.extend_from_slice(&f.data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.build(&mut buf);
        buf
    }

    /// Encoded size of this frame's canonical form.
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Padding { len } => *len.max(&1),
            _ => self.to_bytes().len(),
        }
    }
}

fn put_varint(buf: &mut Vec<u8>, value: u64) {
    VarInt::saturating(value).encode_to(buf);
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Ping,
            Frame::Ack(AckFrame {
                largest_acknowledged: 100,
                ack_delay: 40,
                first_range: 3,
                ranges: vec![AckRange { gap: 1, length: 2 }, AckRange { gap: 0, length: 0 }],
                ecn: None,
            }),
            Frame::Ack(AckFrame {
                largest_acknowledged: 9,
                ack_delay: 0,
                first_range: 0,
                ranges: vec![],
                ecn: Some(EcnCounts {
                    ect0: 7,
                    ect1: 0,
                    ecn_ce: 2,
                }),
            }),
            Frame::ResetStream {
                stream_id: 4,
                error_code: 7,
                final_size: 4096,
            },
            Frame::StopSending {
                stream_id: 8,
                error_code: 1,
            },
            Frame::Crypto {
                offset: 1200,
                data: Bytes::from_static(b"hello tls"),
            },
            Frame::NewToken {
                token: Bytes::from_static(&[0xab; 16]),
            },
            Frame::Stream(StreamFrame {
                stream_id: 0,
                offset: 65536,
                data: Bytes::from_static(b"stream payload"),
                fin: true,
            }),
            Frame::MaxData { max: 1 << 20 },
            Frame::MaxStreamData {
                stream_id: 4,
                max: 1 << 17,
            },
            Frame::MaxStreams {
                bidi: true,
                max: 128,
            },
            Frame::MaxStreams {
                bidi: false,
                max: 3,
            },
            Frame::DataBlocked { limit: 1024 },
            Frame::StreamDataBlocked {
                stream_id: 4,
                limit: 65536,
            },
            Frame::StreamsBlocked {
                bidi: true,
                limit: 100,
            },
            Frame::NewConnectionId(NewConnectionIdFrame {
                sequence: 3,
                retire_prior_to: 1,
                cid: ConnectionId::from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
                reset_token: [0x5a; 16],
            }),
            Frame::RetireConnectionId { sequence: 2 },
            Frame::PathChallenge {
                data: [1, 2, 3, 4, 5, 6, 7, 8],
            },
            Frame::PathResponse {
                data: [1, 2, 3, 4, 5, 6, 7, 8],
            },
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: 0x0a,
                frame_type: Some(0x06),
                reason: "bad crypto".into(),
            }),
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: 17,
                frame_type: None,
                reason: "bye".into(),
            }),
            Frame::HandshakeDone,
        ]
    }

    #[test]
    fn test_round_trip_every_variant() {
        for frame in sample_frames() {
            let bytes = frame.to_bytes();
            let (parsed, consumed) = Frame::parse(&bytes).unwrap();
            assert_eq!(parsed, frame);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_prefix_fails() {
        for frame in sample_frames() {
            let bytes = frame.to_bytes();
            // the empty prefix and every proper prefix must fail or consume
            // fewer bytes than a full parse would
            for cut in 0..bytes.len() {
                match Frame::parse(&bytes[..cut]) {
                    Err(_) => {}
                    Ok((parsed, consumed)) => {
                        assert!(consumed <= cut);
                        // padding prefixes legitimately parse shorter
                        assert!(matches!(parsed, Frame::Padding { .. } | Frame::Ping));
                    }
                }
            }
        }
    }

    #[test]
    fn test_padding_run_length() {
        let bytes = [0u8, 0, 0, 0, 0x01];
        let frames = Frame::parse_all(&bytes).unwrap();
        assert_eq!(
            frames,
            vec![Frame::Padding { len: 4 }, Frame::Ping]
        );

        let mut buf = Vec::new();
        Frame::Padding { len: 7 }.build(&mut buf);
        assert_eq!(buf, vec![0u8; 7]);
    }

    #[test]
    fn test_stream_without_length_runs_to_end() {
        // type 0x08: no OFF, no LEN, no FIN
        let mut bytes = vec![0x08, 0x04];
        bytes.extend_from_slice(b"abcdef");
        let (frame, consumed) = Frame::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(
            frame,
            Frame::Stream(StreamFrame {
                stream_id: 4,
                offset: 0,
                data: Bytes::from_static(b"abcdef"),
                fin: false,
            })
        );
    }

    #[test]
    fn test_stream_build_without_length() {
        let f = StreamFrame {
            stream_id: 4,
            offset: 10,
            data: Bytes::from_static(b"xyz"),
            fin: false,
        };
        let mut buf = Vec::new();
        Frame::build_stream(&f, false, &mut buf);
        let (parsed, _) = Frame::parse(&buf).unwrap();
        assert_eq!(parsed, Frame::Stream(f));
    }

    #[test]
    fn test_ack_spans() {
        let ack = AckFrame {
            largest_acknowledged: 100,
            ack_delay: 0,
            first_range: 2,
            ranges: vec![AckRange { gap: 3, length: 1 }],
            ecn: None,
        };
        // 98..=100, then gap of 4 packets (97..94), then 92..=93
        assert_eq!(ack.spans().unwrap(), vec![(98, 100), (92, 93)]);
        assert!(ack.acknowledges(99));
        assert!(!ack.acknowledges(97));
        assert!(ack.acknowledges(92));
    }

    #[test]
    fn test_ack_negative_pn_rejected() {
        let ack = AckFrame {
            largest_acknowledged: 2,
            ack_delay: 0,
            first_range: 5,
            ranges: vec![],
            ecn: None,
        };
        assert!(ack.spans().is_err());
        // the parser rejects it on arrival too
        let bytes = Frame::Ack(ack).to_bytes();
        assert!(Frame::parse(&bytes).is_err());
    }

    #[test]
    fn test_empty_new_token_rejected() {
        let bytes = [0x07u8, 0x00];
        assert!(Frame::parse(&bytes).is_err());
    }

    #[test]
    fn test_ack_eliciting_classification() {
        assert!(!Frame::Padding { len: 4 }.is_ack_eliciting());
        assert!(!Frame::Ack(AckFrame {
            largest_acknowledged: 0,
            ack_delay: 0,
            first_range: 0,
            ranges: vec![],
            ecn: None,
        })
        .is_ack_eliciting());
        assert!(!Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0,
            frame_type: None,
            reason: String::new(),
        })
        .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::MaxData { max: 1 }.is_ack_eliciting());
    }
}
