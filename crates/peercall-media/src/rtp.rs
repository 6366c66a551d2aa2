//! RTP framing for outgoing audio
//!
//! Every encoded packet is prefixed with a fixed 12-byte RTP header (RFC 3550
//! section 5.1). No CSRCs, extensions or padding are ever written; the receive
//! path still understands them so frames from other stacks de-frame correctly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;
use thiserror::Error;

/// Size of the fixed header we write
pub const RTP_HEADER_LEN: usize = 12;

pub const RTP_VERSION: u8 = 2;

/// Timestamp advance per frame (20ms at the 8kHz RTP clock convention)
pub const TIMESTAMP_INCREMENT: u32 = 160;

/// Dynamic payload type conventionally used for Opus
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RtpError {
    #[error("Packet too short: need {required} bytes, have {available}")]
    TooShort { required: usize, available: usize },

    #[error("Unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid padding length {0}")]
    InvalidPadding(usize),
}

/// Parsed fixed RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Header for a plain audio frame: no padding, extension, CSRCs or marker
    pub fn audio(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: payload_type & 0x7f,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        let mut first = RTP_VERSION << 6;
        if self.padding {
            first |= 0x20;
        }
        if self.extension {
            first |= 0x10;
        }
        first |= self.csrc_count & 0x0f;

        let mut second = self.payload_type & 0x7f;
        if self.marker {
            second |= 0x80;
        }

        buf.put_u8(first);
        buf.put_u8(second);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpError::TooShort {
                required: RTP_HEADER_LEN,
                available: data.len(),
            });
        }

        let mut buf = data;
        let first = buf.get_u8();
        let second = buf.get_u8();

        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(version));
        }

        Ok(Self {
            padding: first & 0x20 != 0,
            extension: first & 0x10 != 0,
            csrc_count: first & 0x0f,
            marker: second & 0x80 != 0,
            payload_type: second & 0x7f,
            sequence_number: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        })
    }
}

/// Frame `payload` behind a fresh header.
///
/// Writes the current `sequence` and then advances it (wrapping at 2^16);
/// advances `timestamp` by [`TIMESTAMP_INCREMENT`] and writes the new value.
pub fn frame(
    sequence: &mut u16,
    timestamp: &mut u32,
    ssrc: u32,
    payload_type: u8,
    payload: &[u8],
) -> Bytes {
    let seq = *sequence;
    *sequence = sequence.wrapping_add(1);
    *timestamp = timestamp.wrapping_add(TIMESTAMP_INCREMENT);

    let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
    RtpHeader::audio(payload_type, seq, *timestamp, ssrc).write_to(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Byte range of the payload inside a received packet
pub fn payload_range(data: &[u8]) -> Result<Range<usize>, RtpError> {
    let header = RtpHeader::parse(data)?;

    let mut start = RTP_HEADER_LEN + 4 * header.csrc_count as usize;
    if header.extension {
        if data.len() < start + 4 {
            return Err(RtpError::TooShort {
                required: start + 4,
                available: data.len(),
            });
        }
        let words = u16::from_be_bytes([data[start + 2], data[start + 3]]) as usize;
        start += 4 + 4 * words;
    }

    if data.len() < start {
        return Err(RtpError::TooShort {
            required: start,
            available: data.len(),
        });
    }

    let mut end = data.len();
    if header.padding {
        let pad = data[end - 1] as usize;
        if pad == 0 || pad > end - start {
            return Err(RtpError::InvalidPadding(pad));
        }
        end -= pad;
    }

    Ok(start..end)
}

/// Strip the RTP header (and any padding) from a received packet
pub fn strip_header(packet: Bytes) -> Result<Bytes, RtpError> {
    let range = payload_range(&packet)?;
    Ok(packet.slice(range))
}

/// Sequencing state for one outgoing stream.
///
/// Each peer session owns one of these; counters are never shared between
/// sessions.
#[derive(Debug, Clone)]
pub struct RtpStream {
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
}

impl RtpStream {
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self::with_initial(ssrc, payload_type, 0, 0)
    }

    pub fn with_initial(ssrc: u32, payload_type: u8, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            payload_type: payload_type & 0x7f,
            sequence,
            timestamp,
        }
    }

    /// Stream with a randomly chosen SSRC
    pub fn random(payload_type: u8) -> Self {
        Self::new(rand::random(), payload_type)
    }

    /// Frame the next packet of this stream
    pub fn next_frame(&mut self, payload: &[u8]) -> Bytes {
        frame(
            &mut self.sequence,
            &mut self.timestamp,
            self.ssrc,
            self.payload_type,
            payload,
        )
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next frame will carry
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp carried by the most recent frame
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let mut seq = 0x1234;
        let mut ts = 1000;
        let packet = frame(&mut seq, &mut ts, 0xdeadbeef, OPUS_PAYLOAD_TYPE, &[9, 8, 7]);

        assert_eq!(packet.len(), RTP_HEADER_LEN + 3);
        assert_eq!(packet[0] >> 6, 2);
        assert_eq!(packet[0], 0x80);
        assert_eq!(packet[1], 111);
        assert_eq!(&packet[2..4], &[0x12, 0x34]);
        assert_eq!(&packet[4..8], &1160u32.to_be_bytes());
        assert_eq!(&packet[8..12], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&packet[12..], &[9, 8, 7]);

        assert_eq!(seq, 0x1235);
        assert_eq!(ts, 1160);
    }

    #[test]
    fn test_frame_length_for_any_payload() {
        let mut seq = 0;
        let mut ts = 0;
        for len in [0usize, 1, 60, 480, 4000] {
            let payload = vec![0xaa; len];
            let packet = frame(&mut seq, &mut ts, 1, 111, &payload);
            assert_eq!(packet.len(), RTP_HEADER_LEN + len);
            assert_eq!(packet[0] >> 6, RTP_VERSION);
        }
    }

    #[test]
    fn test_sequence_is_contiguous_and_wraps() {
        let start = u16::MAX - 2;
        let mut stream = RtpStream::with_initial(7, 111, start, 500);

        let mut last_ts = 500u32;
        for i in 0..6u16 {
            let packet = stream.next_frame(b"opus");
            let header = RtpHeader::parse(&packet).unwrap();
            assert_eq!(header.sequence_number, start.wrapping_add(i));
            assert_eq!(header.timestamp, last_ts + TIMESTAMP_INCREMENT);
            assert_eq!(header.ssrc, 7);
            last_ts = header.timestamp;
        }
        assert_eq!(stream.sequence(), start.wrapping_add(6));
    }

    #[test]
    fn test_payload_type_is_masked_to_seven_bits() {
        let mut stream = RtpStream::new(1, 0xff);
        let packet = stream.next_frame(&[]);
        let header = RtpHeader::parse(&packet).unwrap();
        assert_eq!(header.payload_type, 0x7f);
        assert!(!header.marker);
    }

    #[test]
    fn test_strip_header_returns_payload() {
        let mut stream = RtpStream::new(1, 111);
        let packet = stream.next_frame(&[1, 2, 3, 4]);
        let payload = strip_header(packet).unwrap();
        assert_eq!(&payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_payload_range_skips_csrcs_extension_and_padding() {
        let mut buf = BytesMut::new();
        RtpHeader {
            padding: true,
            extension: true,
            csrc_count: 1,
            marker: true,
            payload_type: 111,
            sequence_number: 1,
            timestamp: 2,
            ssrc: 3,
        }
        .write_to(&mut buf);
        buf.put_u32(0xcafe); // CSRC
        buf.put_u16(0xbede); // extension profile
        buf.put_u16(1); // one extension word
        buf.put_u32(0);
        buf.put_slice(&[5, 6]); // payload
        buf.put_slice(&[0, 0, 3]); // padding, last byte is the count

        let range = payload_range(&buf).unwrap();
        assert_eq!(&buf[range], &[5, 6]);
    }

    #[test]
    fn test_parse_rejects_short_and_wrong_version() {
        assert_eq!(
            RtpHeader::parse(&[0x80; 5]),
            Err(RtpError::TooShort {
                required: RTP_HEADER_LEN,
                available: 5
            })
        );

        let mut packet = RtpStream::new(1, 111).next_frame(&[1]).to_vec();
        packet[0] = 0x40;
        assert_eq!(RtpHeader::parse(&packet), Err(RtpError::UnsupportedVersion(1)));
    }

    #[test]
    fn test_invalid_padding_is_rejected() {
        let mut packet = RtpStream::new(1, 111).next_frame(&[1, 2]).to_vec();
        packet[0] |= 0x20;
        *packet.last_mut().unwrap() = 50;
        assert_eq!(payload_range(&packet), Err(RtpError::InvalidPadding(50)));
    }
}
