use std::borrow::Cow;

use super::sps::parse_sps;
use super::{
    ANNEX_B_START_CODE, E_BIT, F_BIT, FU_A_HEADER_SIZE, LENGTH_FIELD_SIZE, NRI_MASK, S_BIT,
    STAP_A_HEADER_SIZE, TYPE_MASK, nal_type,
};
use crate::error::{MalformedKind, Result, RtpVideoError};
use crate::header::{
    CodecHeader, FrameKind, H264Header, H264PacketizationMode, H264PacketizationType,
    RtpVideoHeader, VideoCodecKind,
};
use crate::media::{Depacketizer, ParsedPayload, drop_malformed};

fn malformed(kind: MalformedKind) -> RtpVideoError {
    RtpVideoError::malformed(VideoCodecKind::H264, kind)
}

/// H.264 RTP depacketizer (RFC 6184).
///
/// Each payload is rewritten into Annex B form with 4-byte start codes:
///
/// - **Single NAL unit**: start code + NAL.
/// - **STAP-A**: start code + NAL for every aggregated unit. Units of size
///   zero or running past the payload reject the whole packet.
/// - **FU-A**: the start fragment yields start code + rebuilt NAL header +
///   body; continuation fragments yield their body as-is.
///
/// FU-A fragments are tracked across calls. A continuation that does not
/// follow a start fragment of the same NAL is reported with both
/// `first_in_frame` and `last_in_frame` cleared so the frame can never be
/// completed.
///
/// `last_in_frame` reports that the packet ends a NAL unit; whether it also
/// ends the access unit is known only from the RTP marker bit.
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    /// Rebuilt header of the NAL being reassembled from FU-A fragments.
    fu_a_in_progress: Option<u8>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_payload<'a>(&mut self, payload: &'a [u8]) -> Result<ParsedPayload<'a>> {
        let first = *payload
            .first()
            .ok_or_else(|| malformed(MalformedKind::Empty))?;
        let packet_type = first & TYPE_MASK;

        if packet_type == nal_type::FU_A {
            return self.parse_fu_a(payload);
        }

        if let Some(header) = self.fu_a_in_progress.take() {
            tracing::warn!(
                nal_type = header & TYPE_MASK,
                "FU-A NAL unit incomplete, discarding"
            );
        }

        match packet_type {
            0 | nal_type::STAP_B..=nal_type::MTAP24 | nal_type::FU_B..=31 => {
                Err(malformed(MalformedKind::UnsupportedType(packet_type)))
            }
            nal_type::STAP_A => {
                let nalus = stap_a_nal_units(payload)?;
                Self::build_single_or_stap_a(&nalus, H264PacketizationType::StapA)
            }
            _ => Self::build_single_or_stap_a(&[payload], H264PacketizationType::SingleNalu),
        }
    }

    fn build_single_or_stap_a<'a>(
        nalus: &[&[u8]],
        packetization_type: H264PacketizationType,
    ) -> Result<ParsedPayload<'a>> {
        let mut header = RtpVideoHeader::new(VideoCodecKind::H264);
        header.first_in_frame = true;
        header.last_in_frame = true;

        let mut h264 = H264Header {
            packetization_mode: H264PacketizationMode::NonInterleaved,
            packetization_type,
            nalu_type: nalus[0][0] & TYPE_MASK,
            nalus: Vec::with_capacity(nalus.len()),
        };

        let mut fragment = Vec::with_capacity(
            nalus.iter().map(|n| n.len() + ANNEX_B_START_CODE.len()).sum(),
        );
        for nalu in nalus {
            let nalu_type = nalu[0] & TYPE_MASK;
            h264.nalus.push(nalu_type);
            match nalu_type {
                nal_type::IDR => header.frame_kind = FrameKind::Key,
                nal_type::SPS => {
                    header.frame_kind = FrameKind::Key;
                    match parse_sps(&nalu[1..]) {
                        Some(sps) => header.resolution = Some(sps.resolution),
                        None => tracing::debug!("failed to parse SPS resolution"),
                    }
                }
                nal_type::STAP_A | nal_type::FU_A => {
                    return Err(malformed(MalformedKind::InvalidField("aggregated NAL type")));
                }
                _ => {}
            }
            fragment.extend_from_slice(&ANNEX_B_START_CODE);
            fragment.extend_from_slice(nalu);
        }

        header.codec_header = CodecHeader::H264(h264);
        Ok(ParsedPayload {
            header,
            fragment: Cow::Owned(fragment),
        })
    }

    fn parse_fu_a<'a>(&mut self, payload: &'a [u8]) -> Result<ParsedPayload<'a>> {
        if payload.len() < FU_A_HEADER_SIZE {
            return Err(malformed(MalformedKind::Truncated));
        }
        let fnri = payload[0] & (F_BIT | NRI_MASK);
        let fu_header = payload[1];
        let original_type = fu_header & TYPE_MASK;
        let original_header = fnri | original_type;
        let start = fu_header & S_BIT != 0;
        let end = fu_header & E_BIT != 0;
        let body = &payload[FU_A_HEADER_SIZE..];

        let mut header = RtpVideoHeader::new(VideoCodecKind::H264);
        header.frame_kind = if original_type == nal_type::IDR {
            FrameKind::Key
        } else {
            FrameKind::Delta
        };

        let fragment = if start {
            if let Some(previous) = self.fu_a_in_progress.replace(original_header) {
                tracing::warn!(
                    nal_type = previous & TYPE_MASK,
                    "FU-A start before previous NAL unit ended, discarding"
                );
            }
            header.first_in_frame = true;
            let mut nalu = Vec::with_capacity(ANNEX_B_START_CODE.len() + 1 + body.len());
            nalu.extend_from_slice(&ANNEX_B_START_CODE);
            nalu.push(original_header);
            nalu.extend_from_slice(body);
            Cow::Owned(nalu)
        } else {
            match self.fu_a_in_progress {
                Some(in_progress) if in_progress & TYPE_MASK == original_type => {}
                _ => {
                    tracing::warn!(nal_type = original_type, "FU-A fragment without start");
                    self.fu_a_in_progress = None;
                    header.codec_header = CodecHeader::H264(fu_a_header(original_type, false));
                    return Ok(ParsedPayload {
                        header,
                        fragment: Cow::Borrowed(body),
                    });
                }
            }
            Cow::Borrowed(body)
        };

        if end {
            self.fu_a_in_progress = None;
            header.last_in_frame = true;
        }
        header.codec_header = CodecHeader::H264(fu_a_header(original_type, start));
        Ok(ParsedPayload { header, fragment })
    }
}

fn fu_a_header(original_type: u8, start: bool) -> H264Header {
    H264Header {
        packetization_mode: H264PacketizationMode::NonInterleaved,
        packetization_type: H264PacketizationType::FuA,
        nalu_type: original_type,
        nalus: if start { vec![original_type] } else { Vec::new() },
    }
}

/// Split a STAP-A payload into its aggregated NAL units.
fn stap_a_nal_units(payload: &[u8]) -> Result<Vec<&[u8]>> {
    if payload.len() <= STAP_A_HEADER_SIZE {
        return Err(malformed(MalformedKind::Truncated));
    }
    let mut nalus = Vec::new();
    let mut rest = &payload[1..];
    while !rest.is_empty() {
        if rest.len() < LENGTH_FIELD_SIZE {
            return Err(malformed(MalformedKind::Truncated));
        }
        let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[LENGTH_FIELD_SIZE..];
        if size == 0 {
            return Err(malformed(MalformedKind::ZeroLengthElement));
        }
        if size > rest.len() {
            return Err(malformed(MalformedKind::Truncated));
        }
        nalus.push(&rest[..size]);
        rest = &rest[size..];
    }
    Ok(nalus)
}

impl Depacketizer for H264Depacketizer {
    fn parse<'a>(&mut self, payload: &'a [u8]) -> Option<ParsedPayload<'a>> {
        drop_malformed(self.parse_payload(payload))
    }

    fn reset(&mut self) {
        if let Some(header) = self.fu_a_in_progress.take() {
            tracing::debug!(nal_type = header & TYPE_MASK, "FU-A reassembly reset");
        }
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::H264
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Resolution;

    fn h264(parsed: &ParsedPayload<'_>) -> H264Header {
        match &parsed.header.codec_header {
            CodecHeader::H264(h) => h.clone(),
            other => panic!("unexpected codec header {other:?}"),
        }
    }

    fn annex_b(nal: &[u8]) -> Vec<u8> {
        [&ANNEX_B_START_CODE[..], nal].concat()
    }

    const SPS_1280X720: [u8; 24] = [
        nal_type::SPS, 0x7A, 0x00, 0x1F, 0xBC, 0xD9, 0x40, 0x50, 0x05, 0xBA, 0x10, 0x00,
        0x00, 0x03, 0x00, 0xC0, 0x00, 0x00, 0x03, 0x2A, 0xE0, 0xF1, 0x83, 0x25,
    ];

    // --- Single NAL unit ---

    #[test]
    fn single_nalu() {
        let packet = [nal_type::IDR, 0xFF];
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer.parse(&packet).unwrap();

        assert_eq!(parsed.fragment.as_ref(), annex_b(&packet).as_slice());
        assert_eq!(parsed.header.frame_kind, FrameKind::Key);
        assert_eq!(parsed.header.codec, VideoCodecKind::H264);
        assert!(parsed.header.first_in_frame);
        let h = h264(&parsed);
        assert_eq!(h.packetization_type, H264PacketizationType::SingleNalu);
        assert_eq!(h.nalu_type, nal_type::IDR);
    }

    #[test]
    fn single_nalu_sps_with_resolution() {
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer.parse(&SPS_1280X720).unwrap();

        assert_eq!(parsed.fragment.as_ref(), annex_b(&SPS_1280X720).as_slice());
        assert_eq!(parsed.header.frame_kind, FrameKind::Key);
        assert_eq!(
            parsed.header.resolution,
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
    }

    #[test]
    fn delta_slice() {
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer.parse(&[nal_type::SLICE, 0x80]).unwrap();
        assert_eq!(parsed.header.frame_kind, FrameKind::Delta);
    }

    // --- STAP-A ---

    #[test]
    fn stap_a_key() {
        let packet = [
            nal_type::STAP_A,
            0x00, 0x02, nal_type::SPS, 0xFF,
            0x00, 0x03, nal_type::PPS, 0xFF, 0x00,
            0x00, 0x04, nal_type::IDR, 0xFF, 0x00, 0x11,
        ];
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer.parse(&packet).unwrap();

        let expected = [
            annex_b(&[nal_type::SPS, 0xFF]),
            annex_b(&[nal_type::PPS, 0xFF, 0x00]),
            annex_b(&[nal_type::IDR, 0xFF, 0x00, 0x11]),
        ]
        .concat();
        assert_eq!(parsed.fragment.as_ref(), expected.as_slice());
        assert_eq!(parsed.header.frame_kind, FrameKind::Key);
        let h = h264(&parsed);
        assert_eq!(h.packetization_type, H264PacketizationType::StapA);
        assert_eq!(h.nalu_type, nal_type::SPS);
        assert_eq!(h.nalus, vec![nal_type::SPS, nal_type::PPS, nal_type::IDR]);
    }

    #[test]
    fn stap_a_delta() {
        let packet = [
            nal_type::STAP_A,
            0x00, 0x02, nal_type::SLICE, 0xFF,
            0x00, 0x03, nal_type::SLICE, 0xFF, 0x00,
        ];
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer.parse(&packet).unwrap();
        assert_eq!(parsed.header.frame_kind, FrameKind::Delta);
    }

    #[test]
    fn empty_stap_a_rejected() {
        let mut depacketizer = H264Depacketizer::new();
        assert!(depacketizer.parse(&[nal_type::STAP_A]).is_none());
        assert!(depacketizer.parse(&[nal_type::STAP_A, 0x00, 0x00]).is_none());
        assert!(depacketizer.parse(&[nal_type::STAP_A, 0x00, 0x00, 0x00]).is_none());
    }

    #[test]
    fn stap_a_zero_length_unit_rejected() {
        let packet = [nal_type::STAP_A, 0x00, 0x02, nal_type::SLICE, 0xFF, 0x00, 0x00];
        let mut depacketizer = H264Depacketizer::new();
        assert!(depacketizer.parse(&packet).is_none());
    }

    #[test]
    fn stap_a_length_past_end_rejected() {
        let packet = [nal_type::STAP_A, 0x00, 0x05, nal_type::SLICE, 0xFF];
        let mut depacketizer = H264Depacketizer::new();
        assert!(depacketizer.parse(&packet).is_none());
    }

    // --- Malformed ---

    #[test]
    fn empty_payload_rejected() {
        assert!(H264Depacketizer::new().parse(&[]).is_none());
    }

    #[test]
    fn truncated_payloads_rejected() {
        let mut depacketizer = H264Depacketizer::new();
        assert!(depacketizer.parse(&[0x9C]).is_none());
        assert!(depacketizer.parse(&[0xD8, 0x27]).is_none());
        assert!(depacketizer.parse(&[0x58, 0xCB, 0xED, 0xDF]).is_none());
        assert!(depacketizer.parse(&[0x38, 0x27, 0x27]).is_none());
    }

    #[test]
    fn unsupported_types_rejected() {
        let mut depacketizer = H264Depacketizer::new();
        for t in [0, nal_type::STAP_B, nal_type::MTAP16, nal_type::MTAP24, nal_type::FU_B, 30, 31] {
            assert!(depacketizer.parse(&[t, 0x00, 0x01, 0x02]).is_none(), "type {t}");
        }
    }

    // --- FU-A ---

    #[test]
    fn fu_a_reassembly() {
        let packet1 = [nal_type::FU_A, S_BIT | nal_type::IDR, 0xFF, 0x00];
        let packet2 = [nal_type::FU_A, nal_type::IDR, 0x02];
        let packet3 = [nal_type::FU_A, E_BIT | nal_type::IDR, 0x03];
        let mut depacketizer = H264Depacketizer::new();

        let parsed = depacketizer.parse(&packet1).unwrap();
        assert_eq!(
            parsed.fragment.as_ref(),
            annex_b(&[nal_type::IDR, 0xFF, 0x00]).as_slice()
        );
        assert_eq!(parsed.header.frame_kind, FrameKind::Key);
        assert!(parsed.header.first_in_frame);
        assert!(!parsed.header.last_in_frame);
        let h = h264(&parsed);
        assert_eq!(h.packetization_type, H264PacketizationType::FuA);
        assert_eq!(h.nalus, vec![nal_type::IDR]);

        let parsed = depacketizer.parse(&packet2).unwrap();
        assert_eq!(parsed.fragment.as_ref(), &[0x02]);
        assert_eq!(parsed.header.frame_kind, FrameKind::Key);
        assert!(!parsed.header.first_in_frame);
        assert!(!parsed.header.last_in_frame);
        assert!(h264(&parsed).nalus.is_empty());

        let parsed = depacketizer.parse(&packet3).unwrap();
        assert_eq!(parsed.fragment.as_ref(), &[0x03]);
        assert!(!parsed.header.first_in_frame);
        assert!(parsed.header.last_in_frame);
    }

    #[test]
    fn reset_drops_fu_a_in_progress() {
        let mut depacketizer = H264Depacketizer::new();
        depacketizer
            .parse(&[nal_type::FU_A, S_BIT | nal_type::IDR, 0xFF])
            .unwrap();
        depacketizer.reset();

        let parsed = depacketizer
            .parse(&[nal_type::FU_A, E_BIT | nal_type::IDR, 0x03])
            .unwrap();
        assert!(!parsed.header.first_in_frame);
        assert!(!parsed.header.last_in_frame);
    }

    #[test]
    fn fu_a_keeps_nri_and_f_bits() {
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer
            .parse(&[F_BIT | 0x60 | nal_type::FU_A, S_BIT | nal_type::SLICE, 0xAB])
            .unwrap();
        assert_eq!(parsed.fragment[4], F_BIT | 0x60 | nal_type::SLICE);
    }

    #[test]
    fn fu_a_without_start_never_completes() {
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer
            .parse(&[nal_type::FU_A, E_BIT | nal_type::IDR, 0x03])
            .unwrap();
        assert!(!parsed.header.first_in_frame);
        assert!(!parsed.header.last_in_frame);
    }

    #[test]
    fn fu_a_interrupted_by_other_nal() {
        let mut depacketizer = H264Depacketizer::new();
        depacketizer
            .parse(&[nal_type::FU_A, S_BIT | nal_type::IDR, 0x01])
            .unwrap();
        depacketizer.parse(&[nal_type::SLICE, 0x01]).unwrap();
        let parsed = depacketizer
            .parse(&[nal_type::FU_A, E_BIT | nal_type::IDR, 0x02])
            .unwrap();
        assert!(!parsed.header.last_in_frame);
    }

    #[test]
    fn fu_a_header_only_accepted() {
        let mut depacketizer = H264Depacketizer::new();
        let parsed = depacketizer
            .parse(&[nal_type::FU_A, S_BIT | nal_type::SLICE])
            .unwrap();
        assert_eq!(parsed.fragment.as_ref(), annex_b(&[nal_type::SLICE]).as_slice());
    }
}
