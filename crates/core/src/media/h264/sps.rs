//! Sequence parameter set parsing, far enough to recover the frame size.

use crate::header::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub id: u8,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub resolution: Resolution,
}

/// Parse an SPS NAL unit body (without the NAL header byte).
///
/// Returns `None` on truncated or out-of-range fields, or when the cropped
/// frame size does not fit the header's 16-bit dimensions.
pub fn parse_sps(nalu_body: &[u8]) -> Option<SpsInfo> {
    let rbsp = h264_reader::rbsp::decode_nal(nalu_body);
    let sps = h264_reader::nal::sps::SeqParameterSet::from_bytes(&rbsp).ok()?;
    let (width, height) = sps.pixel_dimensions().ok()?;

    // profile_idc, constraint flags, level_idc lead the RBSP.
    Some(SpsInfo {
        id: sps.seq_parameter_set_id.id(),
        profile_idc: *rbsp.first()?,
        level_idc: *rbsp.get(2)?,
        resolution: Resolution {
            width: u16::try_from(width).ok()?,
            height: u16::try_from(height).ok()?,
        },
    })
}
