//! Video RTP payload formats.
//!
//! This module provides the [`Packetizer`] and [`Depacketizer`] traits and
//! codec-specific implementations that convert encoded frames into RTP
//! payloads and back.
//!
//! ## Packetization
//!
//! A packetizer is created for one encoded frame. It plans every packet up
//! front against a [`PayloadSizeLimits`] budget and then hands out payloads
//! one at a time through [`Packetizer::next_packet`]. The payload written is
//! everything after the RTP fixed header: codec descriptor plus body.
//! [`PacketResult::LastPacket`] marks the packet that should carry the RTP
//! marker bit.
//!
//! ## Depacketization
//!
//! A depacketizer turns one RTP payload into a [`ParsedPayload`]: the bytes
//! to hand to the frame assembler plus a parsed [`RtpVideoHeader`].
//! Malformed payloads yield `None` and are logged at debug level; nothing is
//! retried.
//!
//! ## Supported codecs
//!
//! | Codec | Module | Format |
//! |-------|--------|--------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | VP8 | [`vp8`] | [RFC 7741](https://tools.ietf.org/html/rfc7741) |
//! | VP9 | [`vp9`] | draft-ietf-payload-vp9 |
//! | AV1 | [`av1`] | [AV1 RTP payload](https://aomediacodec.github.io/av1-rtp-spec/) |
//! | Generic | [`generic`] | 1-byte descriptor |

pub mod av1;
pub mod generic;
pub mod h264;
pub mod rtp;
pub mod stream;
pub mod vp8;
pub mod vp9;


use std::borrow::Cow;

use crate::error::{Result, RtpVideoError};
use crate::header::{CodecHeader, FrameKind, Fragment, RtpVideoHeader, VideoCodecKind};
use crate::limits::PayloadSizeLimits;

use self::av1::{Av1Depacketizer, Av1Packetizer};
use self::generic::{GenericDepacketizer, GenericPacketizer};
use self::h264::{H264Depacketizer, H264Packetizer};
use self::vp8::{Vp8Depacketizer, Vp8Packetizer};
use self::vp9::{Vp9Depacketizer, Vp9Packetizer};

/// Outcome of [`Packetizer::next_packet`]. Lengths are the bytes written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketResult {
    MoreToCome(usize),
    /// Last packet of the frame; the RTP marker bit belongs on it.
    LastPacket(usize),
    /// Every planned packet has already been returned.
    NoPayload,
}

/// Codec-specific RTP packetizer for a single encoded frame.
///
/// Packets are planned when the packetizer is created, so a packetizer that
/// was built successfully never fails afterwards.
pub trait Packetizer: Send {
    /// Number of packets not yet returned by [`next_packet`](Self::next_packet).
    fn num_packets(&self) -> usize;

    /// Write the next payload into `out`, replacing its contents.
    fn next_packet(&mut self, out: &mut Vec<u8>) -> PacketResult;

    fn codec(&self) -> VideoCodecKind;

    /// Drain the packetizer into a list of payloads, in wire order.
    fn packetize_all(&mut self) -> Vec<Vec<u8>> {
        let mut packets = Vec::with_capacity(self.num_packets());
        loop {
            let mut out = Vec::new();
            match self.next_packet(&mut out) {
                PacketResult::MoreToCome(_) => packets.push(out),
                PacketResult::LastPacket(_) => {
                    packets.push(out);
                    break;
                }
                PacketResult::NoPayload => break,
            }
        }
        packets
    }
}

/// One depacketized RTP payload.
///
/// `fragment` borrows from the caller's buffer unless the payload format
/// requires the bytes to be rewritten (H.264 start codes, FU-A headers).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload<'a> {
    pub header: RtpVideoHeader,
    pub fragment: Cow<'a, [u8]>,
}

/// Codec-specific RTP depacketizer.
///
/// A depacketizer lives for the whole stream; H.264 keeps FU-A state between
/// calls, the other codecs are stateless.
pub trait Depacketizer: Send {
    /// Parse one RTP payload, returning `None` when it is malformed.
    fn parse<'a>(&mut self, payload: &'a [u8]) -> Option<ParsedPayload<'a>>;

    /// Drop any partially reassembled NAL unit, e.g. after packet loss.
    fn reset(&mut self) {}

    fn codec(&self) -> VideoCodecKind;
}

/// Log and drop a payload that failed to parse.
pub(crate) fn drop_malformed<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::debug!(%err, "dropping RTP payload");
            None
        }
    }
}

/// Packetizer selected by [`VideoCodecKind`].
#[derive(Debug)]
pub enum VideoPacketizer<'a> {
    H264(H264Packetizer<'a>),
    Vp8(Vp8Packetizer<'a>),
    Vp9(Vp9Packetizer<'a>),
    Av1(Av1Packetizer<'a>),
    Generic(GenericPacketizer<'a>),
}

impl<'a> VideoPacketizer<'a> {
    /// Plan the packets for one encoded frame.
    ///
    /// `header` must be the [`CodecHeader`] variant for `codec`.
    /// `fragmentation` lists H.264 NAL units (an Annex B bitstream is
    /// expected when it is `None`) or VP8 partitions; other codecs take none.
    pub fn create(
        codec: VideoCodecKind,
        payload: &'a [u8],
        limits: PayloadSizeLimits,
        header: &CodecHeader,
        frame_kind: FrameKind,
        fragmentation: Option<&[Fragment]>,
    ) -> Result<Self> {
        limits.validate()?;
        if header.codec() != codec {
            return Err(RtpVideoError::InvariantViolation(format!(
                "{} header given to {codec} packetizer",
                header.codec()
            )));
        }
        if let Some(fragments) = fragmentation {
            if !matches!(codec, VideoCodecKind::H264 | VideoCodecKind::Vp8) {
                return Err(RtpVideoError::InvariantViolation(format!(
                    "{codec} packetizer does not take a fragmentation"
                )));
            }
            Fragment::validate_all(fragments, payload.len())?;
        }

        let packetizer = match header {
            CodecHeader::H264(h) => Self::H264(H264Packetizer::new(
                payload,
                limits,
                h.packetization_mode,
                fragmentation,
            )?),
            CodecHeader::Vp8(h) => Self::Vp8(Vp8Packetizer::new(payload, limits, h, fragmentation)?),
            CodecHeader::Vp9(h) => Self::Vp9(Vp9Packetizer::new(payload, limits, h)?),
            CodecHeader::Av1(_) => Self::Av1(Av1Packetizer::new(payload, limits, frame_kind)?),
            CodecHeader::Generic(h) => {
                Self::Generic(GenericPacketizer::new(payload, limits, h, frame_kind)?)
            }
        };

        tracing::trace!(
            %codec,
            frame_bytes = payload.len(),
            packets = packetizer.num_packets(),
            "frame packetization planned"
        );

        Ok(packetizer)
    }

    fn inner(&self) -> &dyn Packetizer {
        match self {
            Self::H264(p) => p,
            Self::Vp8(p) => p,
            Self::Vp9(p) => p,
            Self::Av1(p) => p,
            Self::Generic(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Packetizer {
        match self {
            Self::H264(p) => p,
            Self::Vp8(p) => p,
            Self::Vp9(p) => p,
            Self::Av1(p) => p,
            Self::Generic(p) => p,
        }
    }
}

impl Packetizer for VideoPacketizer<'_> {
    fn num_packets(&self) -> usize {
        self.inner().num_packets()
    }

    fn next_packet(&mut self, out: &mut Vec<u8>) -> PacketResult {
        self.inner_mut().next_packet(out)
    }

    fn codec(&self) -> VideoCodecKind {
        self.inner().codec()
    }
}

/// Depacketizer selected by [`VideoCodecKind`].
#[derive(Debug)]
pub enum VideoDepacketizer {
    H264(H264Depacketizer),
    Vp8(Vp8Depacketizer),
    Vp9(Vp9Depacketizer),
    Av1(Av1Depacketizer),
    Generic(GenericDepacketizer),
}

impl VideoDepacketizer {
    pub fn create(codec: VideoCodecKind) -> Self {
        tracing::debug!(%codec, "depacketizer created");
        match codec {
            VideoCodecKind::H264 => Self::H264(H264Depacketizer::new()),
            VideoCodecKind::Vp8 => Self::Vp8(Vp8Depacketizer),
            VideoCodecKind::Vp9 => Self::Vp9(Vp9Depacketizer),
            VideoCodecKind::Av1 => Self::Av1(Av1Depacketizer),
            VideoCodecKind::Generic => Self::Generic(GenericDepacketizer),
        }
    }
}

impl Depacketizer for VideoDepacketizer {
    fn parse<'a>(&mut self, payload: &'a [u8]) -> Option<ParsedPayload<'a>> {
        match self {
            Self::H264(d) => d.parse(payload),
            Self::Vp8(d) => d.parse(payload),
            Self::Vp9(d) => d.parse(payload),
            Self::Av1(d) => d.parse(payload),
            Self::Generic(d) => d.parse(payload),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::H264(d) => d.reset(),
            Self::Vp8(d) => d.reset(),
            Self::Vp9(d) => d.reset(),
            Self::Av1(d) => d.reset(),
            Self::Generic(d) => d.reset(),
        }
    }

    fn codec(&self) -> VideoCodecKind {
        match self {
            Self::H264(_) => VideoCodecKind::H264,
            Self::Vp8(_) => VideoCodecKind::Vp8,
            Self::Vp9(_) => VideoCodecKind::Vp9,
            Self::Av1(_) => VideoCodecKind::Av1,
            Self::Generic(_) => VideoCodecKind::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{GenericHeader, Vp9Header};

    #[test]
    fn mismatched_header_rejected() {
        let err = VideoPacketizer::create(
            VideoCodecKind::Vp8,
            &[1, 2, 3],
            PayloadSizeLimits::default(),
            &CodecHeader::Vp9(Vp9Header::default()),
            FrameKind::Delta,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RtpVideoError::InvariantViolation(_)));
    }

    #[test]
    fn fragmentation_rejected_for_generic() {
        let fragments = [Fragment::new(0, 3)];
        let err = VideoPacketizer::create(
            VideoCodecKind::Generic,
            &[1, 2, 3],
            PayloadSizeLimits::default(),
            &CodecHeader::Generic(GenericHeader::default()),
            FrameKind::Delta,
            Some(&fragments),
        )
        .unwrap_err();
        assert!(matches!(err, RtpVideoError::InvariantViolation(_)));
    }

    #[test]
    fn next_after_last_packet_is_no_payload() {
        let mut packetizer = VideoPacketizer::create(
            VideoCodecKind::Generic,
            &[1, 2, 3],
            PayloadSizeLimits::default(),
            &CodecHeader::Generic(GenericHeader::default()),
            FrameKind::Key,
            None,
        )
        .unwrap();
        let mut out = Vec::new();
        assert_eq!(packetizer.next_packet(&mut out), PacketResult::LastPacket(4));
        assert_eq!(packetizer.next_packet(&mut out), PacketResult::NoPayload);
        assert_eq!(packetizer.num_packets(), 0);
    }

    #[test]
    fn empty_frame_has_no_packets() {
        for codec in [
            VideoCodecKind::H264,
            VideoCodecKind::Vp8,
            VideoCodecKind::Vp9,
            VideoCodecKind::Av1,
            VideoCodecKind::Generic,
        ] {
            let mut packetizer = VideoPacketizer::create(
                codec,
                &[],
                PayloadSizeLimits::default(),
                &CodecHeader::default_for(codec),
                FrameKind::Delta,
                None,
            )
            .unwrap();
            assert_eq!(packetizer.num_packets(), 0, "{codec}");
            assert!(packetizer.packetize_all().is_empty(), "{codec}");
        }
    }

    #[test]
    fn depacketizer_codec_matches() {
        for codec in [
            VideoCodecKind::H264,
            VideoCodecKind::Vp8,
            VideoCodecKind::Vp9,
            VideoCodecKind::Av1,
            VideoCodecKind::Generic,
        ] {
            assert_eq!(VideoDepacketizer::create(codec).codec(), codec);
        }
    }
}
