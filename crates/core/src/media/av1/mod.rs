//! AV1 RTP payload format (AV1 RTP specification v1.0).
//!
//! Every payload starts with a one byte aggregation header followed by OBU
//! elements. An element is an OBU (or a fragment of one) with its `obu_size`
//! field removed; elements are prefixed with a leb128 length except the last
//! one when `W` is non-zero.
//!
//! ```text
//!  0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+
//! |Z|Y| W |N|-|-|-|
//! +-+-+-+-+-+-+-+-+
//! ```

mod depacketizer;
mod packetizer;

pub use self::depacketizer::Av1Depacketizer;
pub use self::packetizer::Av1Packetizer;

use crate::error::{MalformedKind, Result, RtpVideoError};
use crate::header::VideoCodecKind;

pub(crate) const AGGREGATION_HEADER_SIZE: usize = 1;

pub(crate) const Z_BIT: u8 = 0x80;
pub(crate) const Y_BIT: u8 = 0x40;
pub(crate) const W_MASK: u8 = 0x30;
pub(crate) const W_SHIFT: u8 = 4;
pub(crate) const N_BIT: u8 = 0x08;

/// Largest element count that can be signalled in `W`.
pub(crate) const MAX_COUNTED_ELEMENTS: usize = 3;

/// Longest leb128 value accepted (AV1 §4.10.5).
pub const MAX_LEB128_LEN: usize = 8;

const OBU_TYPE_MASK: u8 = 0x78;
const OBU_TYPE_SHIFT: u8 = 3;
const OBU_EXTENSION_FLAG: u8 = 0x04;
const OBU_HAS_SIZE_FLAG: u8 = 0x02;

/// OBU types (AV1 §6.2.2).
pub mod obu_type {
    pub const SEQUENCE_HEADER: u8 = 1;
    pub const TEMPORAL_DELIMITER: u8 = 2;
    pub const FRAME_HEADER: u8 = 3;
    pub const TILE_GROUP: u8 = 4;
    pub const METADATA: u8 = 5;
    pub const FRAME: u8 = 6;
    pub const REDUNDANT_FRAME_HEADER: u8 = 7;
    pub const TILE_LIST: u8 = 8;
    pub const PADDING: u8 = 15;
}

pub(crate) fn malformed(kind: MalformedKind) -> RtpVideoError {
    RtpVideoError::malformed(VideoCodecKind::Av1, kind)
}

/// Type field of an OBU header byte.
pub fn obu_type_of(header: u8) -> u8 {
    (header & OBU_TYPE_MASK) >> OBU_TYPE_SHIFT
}

/// Decode a leb128 value, returning it with the number of bytes read.
///
/// Returns `None` when `data` ends inside the value or the value is longer
/// than [`MAX_LEB128_LEN`] bytes.
pub fn read_leb128(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().take(MAX_LEB128_LEN).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

pub fn write_leb128(mut value: usize, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push(0x80 | (value & 0x7F) as u8);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Bytes needed to leb128-encode `value`.
pub fn leb128_size(mut value: usize) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        size += 1;
        value >>= 7;
    }
    size
}

/// Read a leb128 length that must fit in the `available` bytes following it.
fn read_length(data: &[u8], available: impl Fn(usize) -> usize) -> Result<(usize, usize)> {
    let (value, read) = read_leb128(data).ok_or_else(|| malformed(MalformedKind::InvalidLeb128))?;
    let len = usize::try_from(value).map_err(|_| malformed(MalformedKind::InvalidLeb128))?;
    if len > available(read) {
        return Err(malformed(MalformedKind::InvalidLeb128));
    }
    Ok((len, read))
}

/// One OBU of a low-overhead bitstream, with its `obu_size` field stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obu<'a> {
    pub header: u8,
    pub extension: Option<u8>,
    pub payload: &'a [u8],
}

impl Obu<'_> {
    pub fn obu_type(&self) -> u8 {
        obu_type_of(self.header)
    }

    pub fn temporal_id(&self) -> u8 {
        self.extension.map_or(0, |ext| ext >> 5)
    }

    pub fn spatial_id(&self) -> u8 {
        self.extension.map_or(0, |ext| (ext >> 3) & 0x03)
    }

    /// Whether the OBU is carried over RTP at all (AV1 RTP §5).
    pub fn is_transmitted(&self) -> bool {
        !matches!(
            self.obu_type(),
            obu_type::TEMPORAL_DELIMITER | obu_type::TILE_LIST | obu_type::PADDING
        )
    }

    fn head(&self) -> ([u8; 2], usize) {
        let header = self.header & !OBU_HAS_SIZE_FLAG;
        match self.extension {
            Some(ext) => ([header, ext], 2),
            None => ([header, 0], 1),
        }
    }

    /// Length of the OBU as an RTP element: header, extension and payload.
    pub fn element_len(&self) -> usize {
        self.head().1 + self.payload.len()
    }

    /// Append bytes `start..end` of the element form of this OBU to `out`.
    pub(crate) fn write_element_range(&self, start: usize, end: usize, out: &mut Vec<u8>) {
        let (head, head_len) = self.head();
        if start < head_len {
            out.extend_from_slice(&head[start..end.min(head_len)]);
        }
        if end > head_len {
            out.extend_from_slice(&self.payload[start.saturating_sub(head_len)..end - head_len]);
        }
    }
}

/// Split a low-overhead bitstream into OBUs.
///
/// An OBU without `obu_size` extends to the end of `data`.
pub fn parse_obus(data: &[u8]) -> Result<Vec<Obu<'_>>> {
    let mut obus = Vec::new();
    let mut rest = data;
    while let Some((&header, tail)) = rest.split_first() {
        rest = tail;
        let extension = if header & OBU_EXTENSION_FLAG != 0 {
            let (&ext, tail) = rest
                .split_first()
                .ok_or_else(|| malformed(MalformedKind::Truncated))?;
            rest = tail;
            Some(ext)
        } else {
            None
        };

        let payload;
        if header & OBU_HAS_SIZE_FLAG != 0 {
            let (len, read) = read_length(rest, |read| rest.len() - read)?;
            let (body, tail) = rest[read..].split_at(len);
            payload = body;
            rest = tail;
        } else {
            payload = rest;
            rest = &[];
        }
        obus.push(Obu {
            header,
            extension,
            payload,
        });
    }
    Ok(obus)
}

/// Split the element area of a payload (after the aggregation header) into
/// its elements. Zero-length elements are kept so indices match `W`.
pub(crate) fn split_elements(mut data: &[u8], obu_count: u8) -> Result<Vec<&[u8]>> {
    let mut elements = Vec::new();
    while !data.is_empty() {
        let implicit_last = obu_count != 0 && elements.len() + 1 == obu_count as usize;
        let len = if implicit_last {
            data.len()
        } else {
            let (len, read) = read_length(data, |read| data.len() - read)?;
            data = &data[read..];
            len
        };
        let (element, rest) = data.split_at(len);
        elements.push(element);
        data = rest;
    }
    Ok(elements)
}

/// Write one complete OBU element back in low-overhead form, with `obu_size`.
fn write_obu(element: &[u8], out: &mut Vec<u8>) -> Option<()> {
    let header = *element.first()?;
    let head_len = if header & OBU_EXTENSION_FLAG != 0 { 2 } else { 1 };
    if element.len() < head_len {
        return None;
    }
    if header & OBU_HAS_SIZE_FLAG != 0 {
        let (size, read) = read_leb128(&element[head_len..])?;
        if head_len + read + usize::try_from(size).ok()? != element.len() {
            return None;
        }
        out.extend_from_slice(element);
        return Some(());
    }
    out.push(header | OBU_HAS_SIZE_FLAG);
    out.extend_from_slice(&element[1..head_len]);
    write_leb128(element.len() - head_len, out);
    out.extend_from_slice(&element[head_len..]);
    Some(())
}
