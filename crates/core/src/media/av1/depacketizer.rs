use std::borrow::Cow;

use super::{
    N_BIT, W_MASK, W_SHIFT, Y_BIT, Z_BIT, malformed, obu_type, obu_type_of, split_elements,
    write_obu,
};
use crate::error::{MalformedKind, Result};
use crate::header::{Av1Header, CodecHeader, FrameKind, RtpVideoHeader, VideoCodecKind};
use crate::media::{Depacketizer, ParsedPayload, drop_malformed};

fn parse_aggregation_header(byte: u8) -> Av1Header {
    Av1Header {
        continues_obu: byte & Z_BIT != 0,
        obu_continues: byte & Y_BIT != 0,
        obu_count: (byte & W_MASK) >> W_SHIFT,
        new_coded_video_sequence: byte & N_BIT != 0,
        first_obu_type: None,
    }
}

/// AV1 RTP depacketizer.
///
/// The fragment is the element area after the aggregation header; use
/// [`Av1Depacketizer::assemble_frame`] to turn the payloads of a whole
/// temporal unit back into a low-overhead bitstream.
#[derive(Debug, Default)]
pub struct Av1Depacketizer;

impl Av1Depacketizer {
    fn parse_payload<'a>(&self, payload: &'a [u8]) -> Result<ParsedPayload<'a>> {
        let (&aggregation, body) = payload
            .split_first()
            .ok_or_else(|| malformed(MalformedKind::Empty))?;
        let mut av1 = parse_aggregation_header(aggregation);
        if av1.new_coded_video_sequence && av1.continues_obu {
            return Err(malformed(MalformedKind::InvalidField(
                "N set on a continuation packet",
            )));
        }

        let elements = split_elements(body, av1.obu_count)?;
        if !av1.continues_obu {
            // Zero-length elements and temporal delimiters say nothing about
            // the frame; the first real OBU header decides.
            av1.first_obu_type = elements
                .iter()
                .filter_map(|element| element.first())
                .map(|&header| obu_type_of(header))
                .find(|&t| t != obu_type::TEMPORAL_DELIMITER);
        }

        let mut header = RtpVideoHeader::new(VideoCodecKind::Av1);
        header.first_in_frame = !av1.continues_obu;
        header.last_in_frame = !av1.obu_continues;
        header.frame_kind = if av1.first_obu_type == Some(obu_type::SEQUENCE_HEADER) {
            FrameKind::Key
        } else {
            FrameKind::Delta
        };
        header.codec_header = CodecHeader::Av1(av1);

        Ok(ParsedPayload {
            header,
            fragment: Cow::Borrowed(body),
        })
    }

    /// Rebuild the low-overhead bitstream of one temporal unit from its RTP
    /// payloads, in sequence number order.
    ///
    /// Fragments are joined across Z/Y boundaries and every OBU gets an
    /// `obu_size` field. Returns `None` when the payloads are malformed or
    /// the first or last OBU is incomplete.
    pub fn assemble_frame(payloads: &[&[u8]]) -> Option<Vec<u8>> {
        let mut obus: Vec<Vec<u8>> = Vec::new();
        let mut continues = false;
        for payload in payloads {
            let (&aggregation, body) = payload.split_first()?;
            let av1 = parse_aggregation_header(aggregation);
            if av1.continues_obu != continues {
                tracing::debug!(
                    continues_obu = av1.continues_obu,
                    expected = continues,
                    "AV1 fragment chain broken"
                );
                return None;
            }

            let elements = split_elements(body, av1.obu_count).ok()?;
            for (i, element) in elements.into_iter().enumerate() {
                if element.is_empty() {
                    continue;
                }
                if i == 0 && av1.continues_obu {
                    obus.last_mut()?.extend_from_slice(element);
                } else {
                    obus.push(element.to_vec());
                }
            }
            continues = av1.obu_continues;
        }
        if continues {
            return None;
        }

        let mut frame = Vec::with_capacity(obus.iter().map(|obu| obu.len() + 2).sum());
        for obu in &obus {
            write_obu(obu, &mut frame)?;
        }
        Some(frame)
    }
}

impl Depacketizer for Av1Depacketizer {
    fn parse<'a>(&mut self, payload: &'a [u8]) -> Option<ParsedPayload<'a>> {
        drop_malformed(self.parse_payload(payload))
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Av1
    }
}
