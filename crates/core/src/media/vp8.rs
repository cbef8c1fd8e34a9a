//! VP8 RTP payload format (RFC 7741).
//!
//! Every packet starts with the VP8 payload descriptor:
//!
//! ```text
//!       0 1 2 3 4 5 6 7
//!      +-+-+-+-+-+-+-+-+
//!      |X|R|N|S|R| PID | (REQUIRED)
//!      +-+-+-+-+-+-+-+-+
//! X:   |I|L|T|K| RSV   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! I:   |M| PictureID   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//!      |   PictureID   |
//!      +-+-+-+-+-+-+-+-+
//! L:   |   TL0PICIDX   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! T/K: |TID|Y| KEYIDX  | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! ```

use std::borrow::Cow;

use crate::error::{MalformedKind, Result, RtpVideoError};
use crate::header::{
    CodecHeader, FrameKind, Fragment, Resolution, RtpVideoHeader, VideoCodecKind, Vp8Header,
};
use crate::limits::PayloadSizeLimits;
use crate::media::{Depacketizer, PacketResult, Packetizer, ParsedPayload, drop_malformed};
use crate::split::split_about_equally;

const X_BIT: u8 = 0x80;
const N_BIT: u8 = 0x20;
const S_BIT: u8 = 0x10;
const PID_MASK: u8 = 0x07;

const I_BIT: u8 = 0x80;
const L_BIT: u8 = 0x40;
const T_BIT: u8 = 0x20;
const K_BIT: u8 = 0x10;

const M_BIT: u8 = 0x80;
const Y_BIT: u8 = 0x20;
const KEY_IDX_MASK: u8 = 0x1F;

/// Partition indices are 3 bits wide.
pub const MAX_PARTITIONS: usize = 8;

/// Size of the uncompressed data chunk at the start of a key frame.
const KEY_FRAME_HEADER_SIZE: usize = 10;

fn malformed(kind: MalformedKind) -> RtpVideoError {
    RtpVideoError::malformed(VideoCodecKind::Vp8, kind)
}

/// Serialize the payload descriptor for the first packet of partition 0.
fn build_descriptor(header: &Vp8Header) -> Vec<u8> {
    let mut x_field = 0u8;
    if header.picture_id.is_some() {
        x_field |= I_BIT;
    }
    if header.tl0_pic_idx.is_some() {
        x_field |= L_BIT;
    }
    if header.temporal_idx.is_some() {
        x_field |= T_BIT;
    }
    if header.key_idx.is_some() {
        x_field |= K_BIT;
    }

    let mut flags = S_BIT;
    if x_field != 0 {
        flags |= X_BIT;
    }
    if header.non_reference {
        flags |= N_BIT;
    }

    let mut descriptor = vec![flags];
    if x_field == 0 {
        return descriptor;
    }
    descriptor.push(x_field);
    if let Some(picture_id) = header.picture_id {
        // Always the 15-bit form.
        descriptor.push(M_BIT | ((picture_id >> 8) as u8 & 0x7F));
        descriptor.push(picture_id as u8);
    }
    if let Some(tl0_pic_idx) = header.tl0_pic_idx {
        descriptor.push(tl0_pic_idx);
    }
    if header.temporal_idx.is_some() || header.key_idx.is_some() {
        let mut tk = 0u8;
        if let Some(tid) = header.temporal_idx {
            tk |= (tid & 0x03) << 6;
            if header.layer_sync {
                tk |= Y_BIT;
            }
        }
        if let Some(key_idx) = header.key_idx {
            tk |= key_idx & KEY_IDX_MASK;
        }
        descriptor.push(tk);
    }
    descriptor
}

#[derive(Debug)]
struct PlannedPacket {
    partition_id: u8,
    start_of_partition: bool,
    len: usize,
}

/// VP8 RTP packetizer.
///
/// The descriptor is built once from the [`Vp8Header`] and repeated on every
/// packet. Without a fragmentation the frame is one partition split with
/// [`split_about_equally`]. With one, each partition is split on its own so
/// no packet mixes partitions; the first packet of every partition carries
/// its index in PID and has S set.
#[derive(Debug)]
pub struct Vp8Packetizer<'a> {
    descriptor: Vec<u8>,
    remaining: &'a [u8],
    packets: std::vec::IntoIter<PlannedPacket>,
    num_packets_left: usize,
}

impl<'a> Vp8Packetizer<'a> {
    pub fn new(
        payload: &'a [u8],
        limits: PayloadSizeLimits,
        header: &Vp8Header,
        partitions: Option<&[Fragment]>,
    ) -> Result<Self> {
        let descriptor = build_descriptor(header);
        let limits = limits.reduced_by(descriptor.len())?;

        let whole = [Fragment::new(0, payload.len())];
        let partitions = match partitions {
            Some(partitions) if !partitions.is_empty() => {
                validate_partitions(partitions, payload.len())?;
                partitions
            }
            _ => &whole[..],
        };

        let mut plan = Vec::new();
        let last_partition = partitions.len() - 1;
        for (index, partition) in partitions.iter().enumerate() {
            let mut partition_limits = limits;
            if index != 0 {
                partition_limits.first_packet_reduction_len = 0;
            }
            if index != last_partition {
                partition_limits.last_packet_reduction_len = 0;
            }
            let sizes = split_about_equally(partition.length, &partition_limits)?;
            plan.extend(sizes.into_iter().enumerate().map(|(i, len)| PlannedPacket {
                partition_id: index as u8,
                start_of_partition: i == 0,
                len,
            }));
        }

        tracing::trace!(
            partitions = partitions.len(),
            packets = plan.len(),
            descriptor_len = descriptor.len(),
            "VP8 frame planned"
        );

        Ok(Self {
            descriptor,
            remaining: payload,
            num_packets_left: plan.len(),
            packets: plan.into_iter(),
        })
    }
}

fn validate_partitions(partitions: &[Fragment], payload_len: usize) -> Result<()> {
    if partitions.len() > MAX_PARTITIONS {
        return Err(RtpVideoError::InvariantViolation(format!(
            "{} VP8 partitions, at most {MAX_PARTITIONS} supported",
            partitions.len()
        )));
    }
    let mut expected_offset = 0;
    for partition in partitions {
        if partition.length == 0 {
            return Err(RtpVideoError::InvariantViolation(
                "VP8 partitions must not be empty".into(),
            ));
        }
        if partition.offset != expected_offset {
            return Err(RtpVideoError::InvariantViolation(
                "VP8 partitions must be contiguous".into(),
            ));
        }
        expected_offset = partition.end();
    }
    if expected_offset != payload_len {
        return Err(RtpVideoError::InvariantViolation(
            "VP8 partitions must cover the whole frame".into(),
        ));
    }
    Ok(())
}

impl Packetizer for Vp8Packetizer<'_> {
    fn num_packets(&self) -> usize {
        self.num_packets_left
    }

    fn next_packet(&mut self, out: &mut Vec<u8>) -> PacketResult {
        out.clear();
        let Some(packet) = self.packets.next() else {
            return PacketResult::NoPayload;
        };

        out.extend_from_slice(&self.descriptor);
        out[0] &= !(S_BIT | PID_MASK);
        out[0] |= packet.partition_id & PID_MASK;
        if packet.start_of_partition {
            out[0] |= S_BIT;
        }
        let (body, rest) = self.remaining.split_at(packet.len);
        out.extend_from_slice(body);
        self.remaining = rest;

        self.num_packets_left -= 1;
        if self.num_packets_left == 0 {
            PacketResult::LastPacket(out.len())
        } else {
            PacketResult::MoreToCome(out.len())
        }
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Vp8
    }
}

/// VP8 RTP depacketizer.
///
/// `first_in_frame` is set on the first packet of partition 0. The frame
/// kind and, for key frames, the resolution come from the VP8 frame tag at
/// the start of that packet. The end of a frame is only known from the RTP
/// marker bit, so `last_in_frame` is never set here.
#[derive(Debug, Default)]
pub struct Vp8Depacketizer;

impl Vp8Depacketizer {
    fn parse_payload<'a>(&self, payload: &'a [u8]) -> Result<ParsedPayload<'a>> {
        let (vp8, descriptor_len) = parse_descriptor(payload)?;
        let body = &payload[descriptor_len..];
        if body.is_empty() {
            return Err(malformed(MalformedKind::Truncated));
        }

        let mut header = RtpVideoHeader::new(VideoCodecKind::Vp8);
        header.first_in_frame = vp8.beginning_of_partition && vp8.partition_id == 0;

        // P bit of the frame tag: 0 for key frames.
        if header.first_in_frame && body[0] & 0x01 == 0 {
            header.frame_kind = FrameKind::Key;
            if body.len() < KEY_FRAME_HEADER_SIZE {
                return Err(malformed(MalformedKind::Truncated));
            }
            header.resolution = Some(Resolution {
                width: u16::from_le_bytes([body[6], body[7]]) & 0x3FFF,
                height: u16::from_le_bytes([body[8], body[9]]) & 0x3FFF,
            });
        }

        header.codec_header = CodecHeader::Vp8(vp8);
        Ok(ParsedPayload {
            header,
            fragment: Cow::Borrowed(body),
        })
    }
}

/// Parse the payload descriptor, returning it and its length in bytes.
pub fn parse_descriptor(payload: &[u8]) -> Result<(Vp8Header, usize)> {
    let first = *payload
        .first()
        .ok_or_else(|| malformed(MalformedKind::Empty))?;
    let mut header = Vp8Header {
        non_reference: first & N_BIT != 0,
        beginning_of_partition: first & S_BIT != 0,
        partition_id: first & PID_MASK,
        ..Vp8Header::default()
    };
    let mut offset = 1;
    if first & X_BIT == 0 {
        return Ok((header, offset));
    }

    let next = |offset: &mut usize| -> Result<u8> {
        let byte = *payload
            .get(*offset)
            .ok_or_else(|| malformed(MalformedKind::Truncated))?;
        *offset += 1;
        Ok(byte)
    };

    let x_field = next(&mut offset)?;
    if x_field & I_BIT != 0 {
        let byte = next(&mut offset)?;
        let picture_id = if byte & M_BIT != 0 {
            (((byte & 0x7F) as u16) << 8) | next(&mut offset)? as u16
        } else {
            byte as u16
        };
        header.picture_id = Some(picture_id);
    }
    if x_field & L_BIT != 0 {
        header.tl0_pic_idx = Some(next(&mut offset)?);
    }
    if x_field & (T_BIT | K_BIT) != 0 {
        let tk = next(&mut offset)?;
        if x_field & T_BIT != 0 {
            header.temporal_idx = Some(tk >> 6);
            header.layer_sync = tk & Y_BIT != 0;
        }
        if x_field & K_BIT != 0 {
            header.key_idx = Some(tk & KEY_IDX_MASK);
        }
    }
    Ok((header, offset))
}

impl Depacketizer for Vp8Depacketizer {
    fn parse<'a>(&mut self, payload: &'a [u8]) -> Option<ParsedPayload<'a>> {
        drop_malformed(self.parse_payload(payload))
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Vp8
    }
}
