//! VP9 RTP payload format (draft-ietf-payload-vp9).
//!
//! ```text
//!       0 1 2 3 4 5 6 7
//!      +-+-+-+-+-+-+-+-+
//!      |I|P|L|F|B|E|V|Z| (REQUIRED)
//!      +-+-+-+-+-+-+-+-+
//! I:   |M| PICTURE ID  | (RECOMMENDED)
//!      +-+-+-+-+-+-+-+-+
//! M:   | EXTENDED PID  | (RECOMMENDED)
//!      +-+-+-+-+-+-+-+-+
//! L:   |  T  |U|  S  |D| (CONDITIONALLY RECOMMENDED)
//!      +-+-+-+-+-+-+-+-+
//!      |   TL0PICIDX   | (non-flexible mode only)
//!      +-+-+-+-+-+-+-+-+                             -|
//! P,F: | P_DIFF      |N| (flexible mode only)        - up to 3 times
//!      +-+-+-+-+-+-+-+-+                             -|
//! V:   | SS            |
//!      | ..            |
//!      +-+-+-+-+-+-+-+-+
//! ```
//!
//! Scalability structure (SS), first packet of a layer frame only:
//!
//! ```text
//! V:   | N_S |Y|G|-|-|-|
//! Y:   |     WIDTH     | x2 bytes  -| N_S + 1 times
//!      |     HEIGHT    | x2 bytes  -|
//! G:   |      N_G      |
//! N_G: |  T  |U| R |-|-|           -| N_G times
//!      |    P_DIFF     | R times   -|
//! ```

use std::borrow::Cow;
use std::io;

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};

use crate::error::{MalformedKind, Result, RtpVideoError};
use crate::header::{
    CodecHeader, FrameKind, GofFrame, PictureIdLength, Resolution, RtpVideoHeader,
    VP9_MAX_GOF_FRAMES, VP9_MAX_REF_PICS, VP9_MAX_SPATIAL_LAYERS, VideoCodecKind, Vp9Header,
};
use crate::limits::PayloadSizeLimits;
use crate::media::{Depacketizer, PacketResult, Packetizer, ParsedPayload, drop_malformed};
use crate::split::split_about_equally;

const B_BIT: u8 = 0x08;
const E_BIT: u8 = 0x04;
const V_BIT: u8 = 0x02;

fn malformed(kind: MalformedKind) -> RtpVideoError {
    RtpVideoError::malformed(VideoCodecKind::Vp9, kind)
}

fn invalid(message: &str) -> RtpVideoError {
    RtpVideoError::InvariantViolation(format!("VP9 header: {message}"))
}

fn picture_id_len(header: &Vp9Header) -> usize {
    match (header.picture_id, header.picture_id_length) {
        (None, _) => 0,
        (Some(_), PictureIdLength::Short) => 1,
        (Some(_), PictureIdLength::Long) => 2,
    }
}

fn layer_info_present(header: &Vp9Header) -> bool {
    header.temporal_idx.is_some() || header.spatial_idx.is_some()
}

fn ref_indices_present(header: &Vp9Header) -> bool {
    header.inter_pic_predicted && header.flexible_mode
}

fn gof_present(header: &Vp9Header) -> bool {
    header.gof_present || !header.gof.is_empty()
}

/// Descriptor bytes repeated on every packet.
fn descriptor_len(header: &Vp9Header) -> usize {
    let layer_len = match (layer_info_present(header), header.flexible_mode) {
        (false, _) => 0,
        (true, true) => 1,
        (true, false) => 2,
    };
    let refs_len = if ref_indices_present(header) {
        header.pid_diffs.len()
    } else {
        0
    };
    1 + picture_id_len(header) + layer_len + refs_len
}

/// Bytes of SS data carried by the first packet.
fn ss_data_len(header: &Vp9Header) -> usize {
    if !header.ss_data_available {
        return 0;
    }
    let mut len = 1;
    if header.spatial_layer_resolution_present {
        len += 4 * header.num_spatial_layers as usize;
    }
    if gof_present(header) {
        len += 1;
    }
    len + header
        .gof
        .iter()
        .map(|frame| 1 + frame.pid_diffs.len())
        .sum::<usize>()
}

fn validate(header: &Vp9Header) -> Result<()> {
    if let Some(picture_id) = header.picture_id {
        let limit = match header.picture_id_length {
            PictureIdLength::Short => 0x80,
            PictureIdLength::Long => 0x8000,
        };
        if picture_id >= limit {
            return Err(invalid("picture id out of range"));
        }
    }
    if header.temporal_idx.is_some_and(|t| t > 7) || header.spatial_idx.is_some_and(|s| s > 7) {
        return Err(invalid("layer index out of range"));
    }
    if ref_indices_present(header)
        && (header.pid_diffs.is_empty()
            || header.pid_diffs.len() > VP9_MAX_REF_PICS
            || header.pid_diffs.iter().any(|&d| d > 0x7F))
    {
        return Err(invalid("flexible mode needs 1 to 3 reference diffs below 128"));
    }
    if header.ss_data_available {
        let layers = header.num_spatial_layers as usize;
        if layers == 0 || layers > VP9_MAX_SPATIAL_LAYERS {
            return Err(invalid("spatial layer count out of range"));
        }
        if header.spatial_layer_resolution_present && header.resolutions.len() != layers {
            return Err(invalid("one resolution per spatial layer required"));
        }
        if header.gof.len() > VP9_MAX_GOF_FRAMES {
            return Err(invalid("too many frames in group of frames"));
        }
        if header
            .gof
            .iter()
            .any(|f| f.temporal_idx > 7 || f.pid_diffs.len() > VP9_MAX_REF_PICS)
        {
            return Err(invalid("group of frames entry out of range"));
        }
    }
    Ok(())
}

/// Descriptor with B, E and V clear. The packetizer sets them per packet.
fn write_descriptor(header: &Vp9Header) -> io::Result<Vec<u8>> {
    let mut writer = BitWriter::endian(Vec::new(), BigEndian);
    writer.write_bit(header.picture_id.is_some())?;
    writer.write_bit(header.inter_pic_predicted)?;
    writer.write_bit(layer_info_present(header))?;
    writer.write_bit(header.flexible_mode)?;
    writer.write(3, 0u8)?;
    writer.write_bit(header.non_ref_for_inter_layer_pred)?;

    if let Some(picture_id) = header.picture_id {
        match header.picture_id_length {
            PictureIdLength::Short => {
                writer.write_bit(false)?;
                writer.write(7, picture_id)?;
            }
            PictureIdLength::Long => {
                writer.write_bit(true)?;
                writer.write(15, picture_id)?;
            }
        }
    }

    if layer_info_present(header) {
        writer.write(3, header.temporal_idx.unwrap_or(0))?;
        writer.write_bit(header.temporal_up_switch)?;
        writer.write(3, header.spatial_idx.unwrap_or(0))?;
        writer.write_bit(header.inter_layer_predicted)?;
        if !header.flexible_mode {
            writer.write(8, header.tl0_pic_idx.unwrap_or(0))?;
        }
    }

    if ref_indices_present(header) {
        let last = header.pid_diffs.len() - 1;
        for (i, &diff) in header.pid_diffs.iter().enumerate() {
            writer.write(7, diff)?;
            writer.write_bit(i != last)?;
        }
    }

    Ok(writer.into_writer())
}

fn write_ss_data(header: &Vp9Header) -> io::Result<Vec<u8>> {
    let mut writer = BitWriter::endian(Vec::new(), BigEndian);
    writer.write(3, header.num_spatial_layers - 1)?;
    writer.write_bit(header.spatial_layer_resolution_present)?;
    writer.write_bit(gof_present(header))?;
    writer.write(3, 0u8)?;
    if header.spatial_layer_resolution_present {
        for resolution in &header.resolutions {
            writer.write(16, resolution.width)?;
            writer.write(16, resolution.height)?;
        }
    }
    if gof_present(header) {
        writer.write(8, header.gof.len() as u8)?;
    }
    for frame in &header.gof {
        writer.write(3, frame.temporal_idx)?;
        writer.write_bit(frame.temporal_up_switch)?;
        writer.write(2, frame.pid_diffs.len() as u8)?;
        writer.write(2, 0u8)?;
        for &diff in &frame.pid_diffs {
            writer.write(8, diff)?;
        }
    }
    Ok(writer.into_writer())
}

/// VP9 RTP packetizer for one layer frame.
///
/// The descriptor is rendered once and flagged per packet: B on the first,
/// E on the last, SS data on the first when `ss_data_available` is set. The SS bytes
/// count against the first packet's budget. Whether the last packet ends the
/// whole picture is carried in [`Vp9Header::end_of_picture`].
#[derive(Debug)]
pub struct Vp9Packetizer<'a> {
    descriptor: Vec<u8>,
    ss_data: Vec<u8>,
    remaining: &'a [u8],
    sizes: Vec<usize>,
    next_index: usize,
}

impl<'a> Vp9Packetizer<'a> {
    pub fn new(payload: &'a [u8], limits: PayloadSizeLimits, header: &Vp9Header) -> Result<Self> {
        validate(header)?;
        let write_failed = |err: io::Error| invalid(&err.to_string());
        let descriptor = write_descriptor(header).map_err(write_failed)?;
        let ss_data = if header.ss_data_available {
            write_ss_data(header).map_err(write_failed)?
        } else {
            Vec::new()
        };

        let mut limits = limits.reduced_by(descriptor.len())?;
        limits.first_packet_reduction_len += ss_data.len();
        let sizes = split_about_equally(payload.len(), &limits)?;

        tracing::trace!(
            packets = sizes.len(),
            descriptor_len = descriptor.len(),
            ss_data_len = ss_data.len(),
            "VP9 layer frame planned"
        );

        Ok(Self {
            descriptor,
            ss_data,
            remaining: payload,
            sizes,
            next_index: 0,
        })
    }
}

impl Packetizer for Vp9Packetizer<'_> {
    fn num_packets(&self) -> usize {
        self.sizes.len() - self.next_index
    }

    fn next_packet(&mut self, out: &mut Vec<u8>) -> PacketResult {
        out.clear();
        let Some(&len) = self.sizes.get(self.next_index) else {
            return PacketResult::NoPayload;
        };
        let layer_begin = self.next_index == 0;
        self.next_index += 1;
        let layer_end = self.next_index == self.sizes.len();

        out.extend_from_slice(&self.descriptor);
        if layer_begin {
            out[0] |= B_BIT;
            if !self.ss_data.is_empty() {
                out[0] |= V_BIT;
                out.extend_from_slice(&self.ss_data);
            }
        }
        if layer_end {
            out[0] |= E_BIT;
        }
        let (body, rest) = self.remaining.split_at(len);
        out.extend_from_slice(body);
        self.remaining = rest;

        if layer_end {
            PacketResult::LastPacket(out.len())
        } else {
            PacketResult::MoreToCome(out.len())
        }
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Vp9
    }
}

/// VP9 RTP depacketizer.
///
/// `first_in_frame` is B on the base layer (or a layer that does not depend
/// on a lower one), `last_in_frame` is E. Frames with P clear are key frames.
#[derive(Debug, Default)]
pub struct Vp9Depacketizer;

impl Vp9Depacketizer {
    fn parse_payload<'a>(&self, payload: &'a [u8]) -> Result<ParsedPayload<'a>> {
        if payload.is_empty() {
            return Err(malformed(MalformedKind::Empty));
        }
        let (vp9, descriptor_len) = parse_descriptor(payload)?;
        let body = &payload[descriptor_len..];
        if body.is_empty() {
            return Err(malformed(MalformedKind::Truncated));
        }

        let mut header = RtpVideoHeader::new(VideoCodecKind::Vp9);
        header.frame_kind = if vp9.inter_pic_predicted {
            FrameKind::Delta
        } else {
            FrameKind::Key
        };
        header.first_in_frame = vp9.beginning_of_frame
            && (!layer_info_present(&vp9) || !vp9.inter_layer_predicted);
        header.last_in_frame = vp9.end_of_frame;
        if vp9.ss_data_available && vp9.spatial_layer_resolution_present {
            let spatial_idx = vp9.spatial_idx.unwrap_or(0) as usize;
            header.resolution = vp9.resolutions.get(spatial_idx).copied();
        }

        header.codec_header = CodecHeader::Vp9(vp9);
        Ok(ParsedPayload {
            header,
            fragment: Cow::Borrowed(body),
        })
    }
}

/// Parse the payload descriptor, returning it and its length in bytes.
pub fn parse_descriptor(payload: &[u8]) -> Result<(Vp9Header, usize)> {
    let truncated = |_: io::Error| malformed(MalformedKind::Truncated);
    let mut reader = BitReader::endian(payload, BigEndian);

    let i_bit = reader.read_bit().map_err(truncated)?;
    let mut header = Vp9Header {
        inter_pic_predicted: reader.read_bit().map_err(truncated)?,
        ..Vp9Header::default()
    };
    let l_bit = reader.read_bit().map_err(truncated)?;
    header.flexible_mode = reader.read_bit().map_err(truncated)?;
    header.beginning_of_frame = reader.read_bit().map_err(truncated)?;
    header.end_of_frame = reader.read_bit().map_err(truncated)?;
    header.ss_data_available = reader.read_bit().map_err(truncated)?;
    header.non_ref_for_inter_layer_pred = reader.read_bit().map_err(truncated)?;
    header.end_of_picture = false;

    if i_bit {
        let m_bit = reader.read_bit().map_err(truncated)?;
        let (bits, length) = if m_bit {
            (15, PictureIdLength::Long)
        } else {
            (7, PictureIdLength::Short)
        };
        header.picture_id = Some(reader.read::<u16>(bits).map_err(truncated)?);
        header.picture_id_length = length;
    }

    if l_bit {
        header.temporal_idx = Some(reader.read::<u8>(3).map_err(truncated)?);
        header.temporal_up_switch = reader.read_bit().map_err(truncated)?;
        header.spatial_idx = Some(reader.read::<u8>(3).map_err(truncated)?);
        header.inter_layer_predicted = reader.read_bit().map_err(truncated)?;
        if !header.flexible_mode {
            header.tl0_pic_idx = Some(reader.read::<u8>(8).map_err(truncated)?);
        }
    }

    if ref_indices_present(&header) {
        loop {
            let diff = reader.read::<u8>(7).map_err(truncated)?;
            let more = reader.read_bit().map_err(truncated)?;
            header.pid_diffs.push(diff);
            if !more {
                break;
            }
            if header.pid_diffs.len() == VP9_MAX_REF_PICS {
                return Err(malformed(MalformedKind::InvalidField("reference count")));
            }
        }
    }

    if header.ss_data_available {
        parse_ss_data(&mut reader, &mut header).map_err(truncated)?;
    }

    // Every field group ends on a byte boundary.
    let len = descriptor_len(&header) + ss_data_len(&header);
    Ok((header, len))
}

fn parse_ss_data(
    reader: &mut BitReader<&[u8], BigEndian>,
    header: &mut Vp9Header,
) -> io::Result<()> {
    header.num_spatial_layers = reader.read::<u8>(3)? + 1;
    header.spatial_layer_resolution_present = reader.read_bit()?;
    header.gof_present = reader.read_bit()?;
    reader.skip(3)?;

    if header.spatial_layer_resolution_present {
        for _ in 0..header.num_spatial_layers {
            let width = reader.read::<u16>(16)?;
            let height = reader.read::<u16>(16)?;
            header.resolutions.push(Resolution { width, height });
        }
    }

    let num_frames = if header.gof_present {
        reader.read::<u8>(8)?
    } else {
        0
    };
    for _ in 0..num_frames {
        let temporal_idx = reader.read::<u8>(3)?;
        let temporal_up_switch = reader.read_bit()?;
        let num_refs = reader.read::<u8>(2)?;
        reader.skip(2)?;
        let mut pid_diffs = Vec::with_capacity(num_refs as usize);
        for _ in 0..num_refs {
            pid_diffs.push(reader.read::<u8>(8)?);
        }
        header.gof.push(GofFrame {
            temporal_idx,
            temporal_up_switch,
            pid_diffs,
        });
    }
    Ok(())
}

impl Depacketizer for Vp9Depacketizer {
    fn parse<'a>(&mut self, payload: &'a [u8]) -> Option<ParsedPayload<'a>> {
        drop_malformed(self.parse_payload(payload))
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Vp9
    }
}
