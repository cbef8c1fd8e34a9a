//! Parsed video headers shared by packetizers and depacketizers.

use std::fmt;

use crate::error::{Result, RtpVideoError};

/// Video codec carried in an RTP stream. Selects the packetizer and
/// depacketizer implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodecKind {
    H264,
    Vp8,
    Vp9,
    Av1,
    Generic,
}

impl fmt::Display for VideoCodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::H264 => "H264",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
            Self::Generic => "Generic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    /// Starts a new coded video sequence, decodable on its own.
    Key,
    #[default]
    Delta,
    /// No coded data, e.g. a dropped frame.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

/// Codec-independent view of one RTP video payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpVideoHeader {
    pub codec: VideoCodecKind,
    pub frame_kind: FrameKind,
    pub first_in_frame: bool,
    pub last_in_frame: bool,
    /// Frame size, when the payload carries it (key frames, SS data, SPS).
    pub resolution: Option<Resolution>,
    pub codec_header: CodecHeader,
}

impl RtpVideoHeader {
    pub fn new(codec: VideoCodecKind) -> Self {
        Self {
            codec,
            frame_kind: FrameKind::Delta,
            first_in_frame: false,
            last_in_frame: false,
            resolution: None,
            codec_header: CodecHeader::default_for(codec),
        }
    }
}

/// Codec-specific part of [`RtpVideoHeader`].
#[derive(Debug, Clone, PartialEq)]
pub enum CodecHeader {
    H264(H264Header),
    Vp8(Vp8Header),
    Vp9(Vp9Header),
    Av1(Av1Header),
    Generic(GenericHeader),
}

impl CodecHeader {
    pub fn default_for(codec: VideoCodecKind) -> Self {
        match codec {
            VideoCodecKind::H264 => Self::H264(H264Header::default()),
            VideoCodecKind::Vp8 => Self::Vp8(Vp8Header::default()),
            VideoCodecKind::Vp9 => Self::Vp9(Vp9Header::default()),
            VideoCodecKind::Av1 => Self::Av1(Av1Header::default()),
            VideoCodecKind::Generic => Self::Generic(GenericHeader::default()),
        }
    }

    pub fn codec(&self) -> VideoCodecKind {
        match self {
            Self::H264(_) => VideoCodecKind::H264,
            Self::Vp8(_) => VideoCodecKind::Vp8,
            Self::Vp9(_) => VideoCodecKind::Vp9,
            Self::Av1(_) => VideoCodecKind::Av1,
            Self::Generic(_) => VideoCodecKind::Generic,
        }
    }
}

// --- H.264 ---

/// Packetization mode negotiated in SDP (RFC 6184 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum H264PacketizationMode {
    /// Mode 0: one NAL unit per packet, no aggregation or fragmentation.
    SingleNalUnit,
    /// Mode 1: single NAL, STAP-A and FU-A.
    #[default]
    NonInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum H264PacketizationType {
    #[default]
    SingleNalu,
    StapA,
    FuA,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct H264Header {
    pub packetization_mode: H264PacketizationMode,
    pub packetization_type: H264PacketizationType,
    /// Type of the first NAL unit carried (the original type for FU-A).
    pub nalu_type: u8,
    /// Types of all NAL units in the packet.
    pub nalus: Vec<u8>,
}

// --- VP8 ---

/// VP8 payload descriptor fields (RFC 7741 §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp8Header {
    pub non_reference: bool,
    /// 15-bit picture id.
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    pub temporal_idx: Option<u8>,
    pub layer_sync: bool,
    pub key_idx: Option<u8>,
    pub partition_id: u8,
    pub beginning_of_partition: bool,
}

// --- VP9 ---

pub const VP9_MAX_REF_PICS: usize = 3;
pub const VP9_MAX_SPATIAL_LAYERS: usize = 8;
pub const VP9_MAX_GOF_FRAMES: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureIdLength {
    /// 7-bit picture id, M bit clear.
    Short,
    /// 15-bit picture id, M bit set.
    #[default]
    Long,
}

/// One entry of the VP9 group-of-frames description in SS data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GofFrame {
    pub temporal_idx: u8,
    pub temporal_up_switch: bool,
    pub pid_diffs: Vec<u8>,
}

/// VP9 payload descriptor fields (draft-ietf-payload-vp9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vp9Header {
    pub inter_pic_predicted: bool,
    pub flexible_mode: bool,
    pub beginning_of_frame: bool,
    pub end_of_frame: bool,
    pub ss_data_available: bool,
    /// Z bit: no upper spatial layer frame of this picture references this one.
    pub non_ref_for_inter_layer_pred: bool,
    pub picture_id: Option<u16>,
    pub picture_id_length: PictureIdLength,
    /// Layer indices; the L byte is written when either is set.
    pub temporal_idx: Option<u8>,
    pub spatial_idx: Option<u8>,
    pub temporal_up_switch: bool,
    pub inter_layer_predicted: bool,
    pub tl0_pic_idx: Option<u8>,
    /// Reference picture id diffs, flexible mode only.
    pub pid_diffs: Vec<u8>,
    /// Last packet of the picture across all spatial layers. Not on the wire;
    /// drives the RTP marker bit.
    pub end_of_picture: bool,
    pub num_spatial_layers: u8,
    pub spatial_layer_resolution_present: bool,
    pub resolutions: Vec<Resolution>,
    /// G bit. Set to send an N_G byte even when `gof` is empty; a
    /// non-empty `gof` is always sent.
    pub gof_present: bool,
    pub gof: Vec<GofFrame>,
}

impl Default for Vp9Header {
    fn default() -> Self {
        Self {
            inter_pic_predicted: false,
            flexible_mode: false,
            beginning_of_frame: false,
            end_of_frame: false,
            ss_data_available: false,
            non_ref_for_inter_layer_pred: false,
            picture_id: None,
            picture_id_length: PictureIdLength::Long,
            temporal_idx: None,
            spatial_idx: None,
            temporal_up_switch: false,
            inter_layer_predicted: false,
            tl0_pic_idx: None,
            pid_diffs: Vec::new(),
            end_of_picture: true,
            num_spatial_layers: 1,
            spatial_layer_resolution_present: false,
            resolutions: Vec::new(),
            gof_present: false,
            gof: Vec::new(),
        }
    }
}

// --- AV1 ---

/// AV1 aggregation header fields (AV1 RTP §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Av1Header {
    /// Z: first element continues an OBU from the previous packet.
    pub continues_obu: bool,
    /// Y: last element continues in the next packet.
    pub obu_continues: bool,
    /// W: number of OBU elements, 0 when every element is size-prefixed.
    pub obu_count: u8,
    /// N: first packet of a coded video sequence.
    pub new_coded_video_sequence: bool,
    /// Type of the first non temporal-delimiter OBU that starts in this packet.
    pub first_obu_type: Option<u8>,
}

// --- Generic ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenericHeader {
    /// 15-bit picture id carried in the extended descriptor.
    pub picture_id: Option<u16>,
}

/// One `(offset, length)` entry of a codec fragmentation: H.264 NAL units or
/// VP8 partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: usize,
    pub length: usize,
}

impl Fragment {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Check that every fragment lies within a payload of `payload_len` bytes.
    pub fn validate_all(fragments: &[Fragment], payload_len: usize) -> Result<()> {
        for (i, fragment) in fragments.iter().enumerate() {
            let end = fragment.offset.checked_add(fragment.length);
            if end.is_none_or(|end| end > payload_len) {
                return Err(RtpVideoError::InvariantViolation(format!(
                    "fragment {i} ({}+{}) exceeds payload of {payload_len} bytes",
                    fragment.offset, fragment.length
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_kind_display() {
        assert_eq!(VideoCodecKind::H264.to_string(), "H264");
        assert_eq!(VideoCodecKind::Av1.to_string(), "AV1");
    }

    #[test]
    fn default_codec_header_matches_kind() {
        for codec in [
            VideoCodecKind::H264,
            VideoCodecKind::Vp8,
            VideoCodecKind::Vp9,
            VideoCodecKind::Av1,
            VideoCodecKind::Generic,
        ] {
            assert_eq!(CodecHeader::default_for(codec).codec(), codec);
            assert_eq!(RtpVideoHeader::new(codec).codec, codec);
        }
    }

    #[test]
    fn fragment_bounds() {
        let fragments = [Fragment::new(0, 4), Fragment::new(4, 6)];
        assert!(Fragment::validate_all(&fragments, 10).is_ok());
        assert!(Fragment::validate_all(&fragments, 9).is_err());
        assert!(Fragment::validate_all(&[Fragment::new(usize::MAX, 2)], 10).is_err());
    }
}
