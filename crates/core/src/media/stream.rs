//! Whole RTP packets for one video stream: fixed header plus codec payload.

use crate::error::Result;
use crate::header::{CodecHeader, FrameKind, Fragment, VideoCodecKind};
use crate::limits::{PayloadSizeLimits, RTP_HEADER_SIZE};
use crate::media::rtp::{RtpHeader, RtpPacket};
use crate::media::{
    Depacketizer, PacketResult, Packetizer, ParsedPayload, VideoDepacketizer, VideoPacketizer,
    drop_malformed,
};

/// RTP clock rate of every video payload format handled here.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Packetizes encoded frames of one codec into complete RTP packets.
///
/// The marker bit is set on the last packet of each frame (for VP9, only when
/// the layer frame also ends the picture). The RTP timestamp is advanced after
/// every frame by the increment passed in.
#[derive(Debug)]
pub struct RtpVideoSender {
    header: RtpHeader,
    codec: VideoCodecKind,
    limits: PayloadSizeLimits,
}

impl RtpVideoSender {
    /// `limits` is the payload budget after the RTP fixed header, see
    /// [`PayloadSizeLimits::for_mtu`].
    pub fn new(codec: VideoCodecKind, pt: u8, ssrc: u32, limits: PayloadSizeLimits) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            codec,
            limits,
        }
    }

    pub fn with_random_ssrc(codec: VideoCodecKind, pt: u8, limits: PayloadSizeLimits) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            codec,
            limits,
        }
    }

    pub fn codec(&self) -> VideoCodecKind {
        self.codec
    }

    pub fn header(&self) -> &RtpHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut RtpHeader {
        &mut self.header
    }

    /// Packetize one encoded frame, then advance the timestamp by
    /// `timestamp_increment` (`90000 / fps` for a constant frame rate).
    pub fn packetize_frame(
        &mut self,
        frame: &[u8],
        codec_header: &CodecHeader,
        frame_kind: FrameKind,
        fragmentation: Option<&[Fragment]>,
        timestamp_increment: u32,
    ) -> Result<Vec<Vec<u8>>> {
        let mut packetizer = VideoPacketizer::create(
            self.codec,
            frame,
            self.limits,
            codec_header,
            frame_kind,
            fragmentation,
        )?;
        let ends_picture = match codec_header {
            CodecHeader::Vp9(vp9) => vp9.end_of_picture,
            _ => true,
        };

        let mut packets = Vec::with_capacity(packetizer.num_packets());
        let mut payload = Vec::new();
        loop {
            let marker = match packetizer.next_packet(&mut payload) {
                PacketResult::MoreToCome(_) => false,
                PacketResult::LastPacket(_) => ends_picture,
                PacketResult::NoPayload => break,
            };
            let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
            packet.extend_from_slice(&self.header.write(marker));
            packet.extend_from_slice(&payload);
            packets.push(packet);
        }

        self.header.advance_timestamp(timestamp_increment);

        tracing::trace!(
            codec = %self.codec,
            rtp_packets = packets.len(),
            frame_bytes = frame.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );

        Ok(packets)
    }
}

/// One received RTP packet after depacketization.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedVideoPacket<'a> {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub payload: ParsedPayload<'a>,
}

/// Parses RTP packets of one video stream and refines the frame boundary
/// flags of the payload with the RTP timestamp and marker bit.
///
/// A packet only starts a frame when its timestamp differs from the previous
/// packet's or the previous packet carried the marker. A packet only ends a
/// frame when it carries the marker (and, for formats with an end flag, the
/// payload agrees).
#[derive(Debug)]
pub struct RtpVideoReceiver {
    depacketizer: VideoDepacketizer,
    last_sequence: Option<u16>,
    last_timestamp: Option<u32>,
    last_marker: bool,
}

impl RtpVideoReceiver {
    pub fn new(codec: VideoCodecKind) -> Self {
        Self {
            depacketizer: VideoDepacketizer::create(codec),
            last_sequence: None,
            last_timestamp: None,
            last_marker: false,
        }
    }

    pub fn codec(&self) -> VideoCodecKind {
        self.depacketizer.codec()
    }

    /// Parse one RTP packet. Returns `None` for malformed packets.
    pub fn receive<'a>(&mut self, packet: &'a [u8]) -> Option<ReceivedVideoPacket<'a>> {
        let rtp = drop_malformed(RtpPacket::parse(packet))?;

        if let Some(last) = self.last_sequence {
            if rtp.sequence != last.wrapping_add(1) {
                tracing::warn!(
                    expected = last.wrapping_add(1),
                    got = rtp.sequence,
                    "RTP sequence gap"
                );
                // A lost fragment must not be spliced over.
                self.depacketizer.reset();
            }
        }
        let new_frame = self.last_timestamp != Some(rtp.timestamp) || self.last_marker;
        self.last_sequence = Some(rtp.sequence);
        self.last_timestamp = Some(rtp.timestamp);
        self.last_marker = rtp.marker;

        let mut payload = self.depacketizer.parse(rtp.payload)?;
        let payload_ends_frame = match self.codec() {
            // No end of frame flag in the descriptor.
            VideoCodecKind::Vp8 | VideoCodecKind::Generic => true,
            _ => payload.header.last_in_frame,
        };
        payload.header.first_in_frame &= new_frame;
        payload.header.last_in_frame = rtp.marker && payload_ends_frame;

        Some(ReceivedVideoPacket {
            sequence: rtp.sequence,
            timestamp: rtp.timestamp,
            ssrc: rtp.ssrc,
            marker: rtp.marker,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{GenericHeader, Vp9Header};

    fn sender(codec: VideoCodecKind, mtu: usize) -> RtpVideoSender {
        RtpVideoSender::new(codec, 96, 0x1234_5678, PayloadSizeLimits::for_mtu(mtu).unwrap())
    }

    // --- Sender ---

    #[test]
    fn marker_on_last_packet_and_timestamp_advance() {
        let mut sender = sender(VideoCodecKind::Generic, 32);
        let frame: Vec<u8> = (0..50).collect();
        let header = CodecHeader::Generic(GenericHeader::default());

        let packets = sender
            .packetize_frame(&frame, &header, FrameKind::Key, None, 3000)
            .unwrap();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= 32));
        for (i, packet) in packets.iter().enumerate() {
            let rtp = RtpPacket::parse(packet).unwrap();
            assert_eq!(rtp.marker, i + 1 == packets.len());
            assert_eq!(rtp.sequence, i as u16);
            assert_eq!(rtp.timestamp, 0);
        }
        assert_eq!(sender.header().timestamp(), 3000);

        let next = sender
            .packetize_frame(&[1], &header, FrameKind::Delta, None, 3000)
            .unwrap();
        assert_eq!(RtpPacket::parse(&next[0]).unwrap().timestamp, 3000);
    }

    #[test]
    fn vp9_marker_needs_end_of_picture() {
        let mut sender = sender(VideoCodecKind::Vp9, 1200);
        let header = CodecHeader::Vp9(Vp9Header {
            end_of_picture: false,
            ..Vp9Header::default()
        });
        let packets = sender
            .packetize_frame(&[1, 2, 3], &header, FrameKind::Key, None, 0)
            .unwrap();
        assert!(!RtpPacket::parse(&packets[0]).unwrap().marker);
    }

    #[test]
    fn empty_frame_still_advances_timestamp() {
        let mut sender = sender(VideoCodecKind::Generic, 1200);
        let header = CodecHeader::Generic(GenericHeader::default());
        let packets = sender
            .packetize_frame(&[], &header, FrameKind::Empty, None, 3000)
            .unwrap();
        assert!(packets.is_empty());
        assert_eq!(sender.header().timestamp(), 3000);
        assert_eq!(sender.header().sequence(), 0);
    }

    // --- Receiver ---

    #[test]
    fn receiver_frame_boundaries_from_marker() {
        let mut sender = sender(VideoCodecKind::Generic, 32);
        let header = CodecHeader::Generic(GenericHeader::default());
        let frame: Vec<u8> = (0..50).collect();
        let packets = sender
            .packetize_frame(&frame, &header, FrameKind::Key, None, 3000)
            .unwrap();

        let mut receiver = RtpVideoReceiver::new(VideoCodecKind::Generic);
        let received: Vec<_> = packets
            .iter()
            .map(|p| receiver.receive(p).unwrap())
            .collect();
        let last = received.len() - 1;
        for (i, packet) in received.iter().enumerate() {
            assert_eq!(packet.payload.header.first_in_frame, i == 0);
            assert_eq!(packet.payload.header.last_in_frame, i == last);
            assert_eq!(packet.payload.header.frame_kind, FrameKind::Key);
        }
        let body: Vec<u8> = received
            .iter()
            .flat_map(|p| p.payload.fragment.to_vec())
            .collect();
        assert_eq!(body, frame);
    }

    #[test]
    fn sequence_gap_abandons_fu_a() {
        let mut sender = sender(VideoCodecKind::H264, 100);
        let header = CodecHeader::default_for(VideoCodecKind::H264);
        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.extend((0..400).map(|i| (i % 200 + 1) as u8));
        let packets = sender
            .packetize_frame(&frame, &header, FrameKind::Key, None, 3000)
            .unwrap();
        assert!(packets.len() >= 4);

        let mut receiver = RtpVideoReceiver::new(VideoCodecKind::H264);
        assert!(receiver.receive(&packets[0]).unwrap().payload.header.first_in_frame);
        for packet in &packets[2..] {
            let received = receiver.receive(packet).unwrap();
            assert!(!received.payload.header.first_in_frame);
            assert!(!received.payload.header.last_in_frame);
        }
    }

    #[test]
    fn receiver_drops_bad_rtp() {
        let mut receiver = RtpVideoReceiver::new(VideoCodecKind::H264);
        assert!(receiver.receive(&[0x80, 0x60]).is_none());
        assert!(receiver.receive(&[0x40; 14]).is_none());
        assert_eq!(receiver.codec(), VideoCodecKind::H264);
    }
}
