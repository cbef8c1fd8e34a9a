//! RTP fixed header framing (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::error::{MalformedKind, Result, RtpVideoError};
use crate::limits::RTP_HEADER_SIZE;

const RTP_VERSION: u8 = 2;
const PADDING_BIT: u8 = 0x20;
const EXTENSION_BIT: u8 = 0x10;
const CSRC_COUNT_MASK: u8 = 0x0F;
const MARKER_BIT: u8 = 0x80;
const PAYLOAD_TYPE_MASK: u8 = 0x7F;
const EXTENSION_HEADER_SIZE: usize = 4;

/// Sender-side RTP header state for one stream.
///
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: 32-bit media clock, wrapping, advanced once per frame.
/// - **SSRC**: random by default (RFC 3550 §8.1).
///
/// Padding, extension and CSRC count are always written as 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt: pt & PAYLOAD_TYPE_MASK,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        let ssrc: u32 = rand::random();
        Self::new(pt, ssrc)
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Serialize the fixed header and advance the sequence number.
    ///
    /// `marker` flags the last packet of a frame.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_SIZE] {
        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = RTP_VERSION << 6;
        header[1] = (if marker { MARKER_BIT } else { 0 }) | self.pt;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Advance the RTP timestamp, e.g. by `90000 / fps` for video.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}

/// Header extension carried after the CSRC list (RFC 3550 §5.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpExtension<'a> {
    pub profile: u16,
    pub data: &'a [u8],
}

/// A received RTP packet, borrowing from the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extension: Option<RtpExtension<'a>>,
    /// Payload with padding removed.
    pub payload: &'a [u8],
}

fn malformed(kind: MalformedKind) -> RtpVideoError {
    RtpVideoError::MalformedRtp(kind)
}

impl<'a> RtpPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let truncated = || malformed(MalformedKind::Truncated);
        let (fixed, mut rest) = data
            .split_first_chunk::<RTP_HEADER_SIZE>()
            .ok_or_else(truncated)?;

        let version = fixed[0] >> 6;
        if version != RTP_VERSION {
            return Err(malformed(MalformedKind::BadVersion(version)));
        }

        let csrc_count = (fixed[0] & CSRC_COUNT_MASK) as usize;
        let mut csrcs = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            let (csrc, tail) = rest.split_first_chunk::<4>().ok_or_else(truncated)?;
            csrcs.push(u32::from_be_bytes(*csrc));
            rest = tail;
        }

        let mut extension = None;
        if fixed[0] & EXTENSION_BIT != 0 {
            let (ext_header, tail) = rest
                .split_first_chunk::<EXTENSION_HEADER_SIZE>()
                .ok_or_else(truncated)?;
            let profile = u16::from_be_bytes([ext_header[0], ext_header[1]]);
            let len = 4 * u16::from_be_bytes([ext_header[2], ext_header[3]]) as usize;
            if tail.len() < len {
                return Err(truncated());
            }
            let (ext_data, tail) = tail.split_at(len);
            extension = Some(RtpExtension {
                profile,
                data: ext_data,
            });
            rest = tail;
        }

        if fixed[0] & PADDING_BIT != 0 {
            let padding = *rest.last().ok_or_else(truncated)? as usize;
            if padding == 0 || padding > rest.len() {
                return Err(malformed(MalformedKind::InvalidField("padding length")));
            }
            rest = &rest[..rest.len() - padding];
        }

        Ok(Self {
            marker: fixed[1] & MARKER_BIT != 0,
            payload_type: fixed[1] & PAYLOAD_TYPE_MASK,
            sequence: u16::from_be_bytes([fixed[2], fixed[3]]),
            timestamp: u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
            ssrc: u32::from_be_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]),
            csrcs,
            extension,
            payload: rest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD)
    }

    // --- Writer ---

    #[test]
    fn fixed_header_layout() {
        let mut h = make_header();
        h.set_timestamp(0x0102_0304);
        let buf = h.write(true);
        assert_eq!(
            buf,
            [0x80, 0x80 | 96, 0, 0, 1, 2, 3, 4, 0xAA, 0xBB, 0xCC, 0xDD]
        );
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        assert_eq!(h.write(false)[1] & 0x80, 0);
        assert_eq!(h.write(true)[1] & 0x80, 0x80);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = make_header();
        h.sequence = u16::MAX;
        let buf = h.write(false);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn timestamp_wraps() {
        let mut h = make_header();
        h.set_timestamp(u32::MAX - 1000);
        h.advance_timestamp(3000);
        assert_eq!(h.timestamp(), 1999);
    }

    #[test]
    fn random_ssrc_differs() {
        let h1 = RtpHeader::with_random_ssrc(96);
        let h2 = RtpHeader::with_random_ssrc(96);
        assert_ne!(h1.ssrc, h2.ssrc);
    }

    // --- Parser ---

    #[test]
    fn parse_written_header() {
        let mut h = make_header();
        h.set_timestamp(90_000);
        let mut packet = h.write(true).to_vec();
        packet.extend_from_slice(&[0x65, 0x88]);

        let parsed = RtpPacket::parse(&packet).unwrap();
        assert!(parsed.marker);
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.sequence, 0);
        assert_eq!(parsed.timestamp, 90_000);
        assert_eq!(parsed.ssrc, 0xAABBCCDD);
        assert!(parsed.csrcs.is_empty());
        assert_eq!(parsed.extension, None);
        assert_eq!(parsed.payload, &[0x65, 0x88]);
    }

    #[test]
    fn parse_csrc_extension_and_padding() {
        let packet = [
            0xB1, 0x60, 0x00, 0x07, 0, 0, 0, 1, 0, 0, 0, 2, // P, X, CC=1
            0x11, 0x22, 0x33, 0x44, // CSRC
            0xBE, 0xDE, 0x00, 0x01, 0x10, 0xFF, 0x00, 0x00, // one-word extension
            0xAA, 0xBB, 0x00, 0x00, 0x03, // payload + 3 bytes padding
        ];
        let parsed = RtpPacket::parse(&packet).unwrap();
        assert!(!parsed.marker);
        assert_eq!(parsed.payload_type, 0x60);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.csrcs, vec![0x1122_3344]);
        let extension = parsed.extension.unwrap();
        assert_eq!(extension.profile, 0xBEDE);
        assert_eq!(extension.data, &[0x10, 0xFF, 0x00, 0x00]);
        assert_eq!(parsed.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn parse_rejects_bad_packets() {
        assert!(RtpPacket::parse(&[0x80, 0x60, 0, 1]).is_err());

        let mut v1 = make_header().write(false);
        v1[0] = 0x40;
        assert!(matches!(
            RtpPacket::parse(&v1),
            Err(RtpVideoError::MalformedRtp(MalformedKind::BadVersion(1)))
        ));

        let mut csrc = make_header().write(false).to_vec();
        csrc[0] |= 0x02;
        csrc.extend_from_slice(&[0, 0, 0, 1]);
        assert!(RtpPacket::parse(&csrc).is_err());

        let mut padding = make_header().write(false).to_vec();
        padding[0] |= PADDING_BIT;
        padding.extend_from_slice(&[0xAA, 0x05]);
        assert!(RtpPacket::parse(&padding).is_err());
    }
}
