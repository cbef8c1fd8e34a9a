//! H.264 RTP payload format (RFC 6184).
//!
//! The packetizer takes a frame either as an Annex B bitstream or as raw NAL
//! units described by a fragmentation list, and emits single NAL unit,
//! STAP-A and FU-A packets. The depacketizer turns each payload back into
//! Annex B with 4-byte start codes, so the concatenated fragments of a frame
//! form a decodable access unit.
//!
//! ```text
//! NAL header:    [F|NRI|Type]            (1 byte)
//! STAP-A:        [F|NRI|24] [size:16 | NAL]...
//! FU indicator:  [F|NRI|28]              (1 byte)
//! FU header:     [S|E|R|NAL_Type]        (1 byte)
//! ```

mod depacketizer;
mod packetizer;
mod sps;

pub use depacketizer::H264Depacketizer;
pub use packetizer::H264Packetizer;
pub use sps::{SpsInfo, parse_sps};

use crate::header::Fragment;

pub(crate) const NAL_HEADER_SIZE: usize = 1;
pub(crate) const LENGTH_FIELD_SIZE: usize = 2;
pub(crate) const FU_A_HEADER_SIZE: usize = 2;
pub(crate) const STAP_A_HEADER_SIZE: usize = NAL_HEADER_SIZE + LENGTH_FIELD_SIZE;

pub(crate) const F_BIT: u8 = 0x80;
pub(crate) const NRI_MASK: u8 = 0x60;
pub(crate) const TYPE_MASK: u8 = 0x1F;
pub(crate) const S_BIT: u8 = 0x80;
pub(crate) const E_BIT: u8 = 0x40;

pub(crate) const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types referenced by the payload format.
pub mod nal_type {
    pub const SLICE: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
    pub const STAP_A: u8 = 24;
    pub const STAP_B: u8 = 25;
    pub const MTAP16: u8 = 26;
    pub const MTAP24: u8 = 27;
    pub const FU_A: u8 = 28;
    pub const FU_B: u8 = 29;
}

/// Locate NAL units in an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the ranges between them, excluding the start
/// codes themselves. Empty NAL units are skipped.
///
/// The start code length is tracked per NAL so that boundaries between
/// adjacent NALs come out right when 3-byte and 4-byte start codes are mixed.
pub fn annex_b_nal_units(data: &[u8]) -> Vec<Fragment> {
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = match start_entries.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nal_units.push(Fragment::new(start, end - start));
        }
    }

    nal_units
}
