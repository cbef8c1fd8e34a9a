//! Generic video payload format for codecs without a dedicated RTP mapping.
//!
//! ```text
//!  0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+
//! |  RSV    |E|F|K|   E: extended header, F: first packet, K: key frame
//! +-+-+-+-+-+-+-+-+
//! |M| PICTURE ID  |   (E only, M always set)
//! +-+-+-+-+-+-+-+-+
//! |  PICTURE ID   |
//! +-+-+-+-+-+-+-+-+
//! ```

use std::borrow::Cow;

use crate::error::{MalformedKind, Result, RtpVideoError};
use crate::header::{CodecHeader, FrameKind, GenericHeader, RtpVideoHeader, VideoCodecKind};
use crate::limits::PayloadSizeLimits;
use crate::media::{Depacketizer, PacketResult, Packetizer, ParsedPayload, drop_malformed};
use crate::split::split_about_equally;

const KEY_FRAME_BIT: u8 = 0x01;
const FIRST_PACKET_BIT: u8 = 0x02;
const EXTENDED_HEADER_BIT: u8 = 0x04;

const PICTURE_ID_MASK: u16 = 0x7FFF;
const HEADER_SIZE: usize = 1;
const EXTENDED_HEADER_SIZE: usize = 2;

fn malformed(kind: MalformedKind) -> RtpVideoError {
    RtpVideoError::malformed(VideoCodecKind::Generic, kind)
}

#[derive(Debug)]
pub struct GenericPacketizer<'a> {
    header: [u8; HEADER_SIZE + EXTENDED_HEADER_SIZE],
    header_len: usize,
    remaining: &'a [u8],
    sizes: Vec<usize>,
    next_index: usize,
}

impl<'a> GenericPacketizer<'a> {
    pub fn new(
        payload: &'a [u8],
        limits: PayloadSizeLimits,
        generic: &GenericHeader,
        frame_kind: FrameKind,
    ) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE + EXTENDED_HEADER_SIZE];
        let mut header_len = HEADER_SIZE;
        if frame_kind == FrameKind::Key {
            header[0] |= KEY_FRAME_BIT;
        }
        if let Some(picture_id) = generic.picture_id {
            if picture_id > PICTURE_ID_MASK {
                return Err(RtpVideoError::InvariantViolation(format!(
                    "generic picture id {picture_id} exceeds 15 bits"
                )));
            }
            header[0] |= EXTENDED_HEADER_BIT;
            header[1..].copy_from_slice(&(picture_id | 0x8000).to_be_bytes());
            header_len += EXTENDED_HEADER_SIZE;
        }

        let limits = limits.reduced_by(header_len)?;
        let sizes = split_about_equally(payload.len(), &limits)?;

        Ok(Self {
            header,
            header_len,
            remaining: payload,
            sizes,
            next_index: 0,
        })
    }
}

impl Packetizer for GenericPacketizer<'_> {
    fn num_packets(&self) -> usize {
        self.sizes.len() - self.next_index
    }

    fn next_packet(&mut self, out: &mut Vec<u8>) -> PacketResult {
        out.clear();
        let Some(&len) = self.sizes.get(self.next_index) else {
            return PacketResult::NoPayload;
        };

        let mut header = self.header;
        if self.next_index == 0 {
            header[0] |= FIRST_PACKET_BIT;
        }
        self.next_index += 1;

        out.extend_from_slice(&header[..self.header_len]);
        let (body, rest) = self.remaining.split_at(len);
        out.extend_from_slice(body);
        self.remaining = rest;

        if self.next_index == self.sizes.len() {
            PacketResult::LastPacket(out.len())
        } else {
            PacketResult::MoreToCome(out.len())
        }
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Generic
    }
}

/// Depacketizer for the generic format. The descriptor carries no end of
/// frame flag, so `last_in_frame` is left to the RTP marker bit.
#[derive(Debug, Default)]
pub struct GenericDepacketizer;

impl GenericDepacketizer {
    fn parse_payload<'a>(&self, payload: &'a [u8]) -> Result<ParsedPayload<'a>> {
        let (&flags, mut body) = payload
            .split_first()
            .ok_or_else(|| malformed(MalformedKind::Empty))?;

        let mut generic = GenericHeader::default();
        if flags & EXTENDED_HEADER_BIT != 0 {
            let Some((id, rest)) = body.split_first_chunk::<EXTENDED_HEADER_SIZE>() else {
                return Err(malformed(MalformedKind::Truncated));
            };
            generic.picture_id = Some(u16::from_be_bytes(*id) & PICTURE_ID_MASK);
            body = rest;
        }

        let mut header = RtpVideoHeader::new(VideoCodecKind::Generic);
        header.first_in_frame = flags & FIRST_PACKET_BIT != 0;
        header.frame_kind = if flags & KEY_FRAME_BIT != 0 {
            FrameKind::Key
        } else {
            FrameKind::Delta
        };
        header.codec_header = CodecHeader::Generic(generic);

        Ok(ParsedPayload {
            header,
            fragment: Cow::Borrowed(body),
        })
    }
}

impl Depacketizer for GenericDepacketizer {
    fn parse<'a>(&mut self, payload: &'a [u8]) -> Option<ParsedPayload<'a>> {
        drop_malformed(self.parse_payload(payload))
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Generic
    }
}
