use std::mem;

use super::{
    AGGREGATION_HEADER_SIZE, MAX_COUNTED_ELEMENTS, N_BIT, Obu, W_SHIFT, Y_BIT, Z_BIT,
    leb128_size, obu_type, parse_obus, write_leb128,
};
use crate::error::{Result, RtpVideoError};
use crate::header::{FrameKind, VideoCodecKind};
use crate::limits::PayloadSizeLimits;
use crate::media::{PacketResult, Packetizer};

/// A contiguous byte range of one OBU's element form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Element {
    obu: usize,
    offset: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct PlannedPacket {
    elements: Vec<Element>,
}

impl PlannedPacket {
    fn sized_elements(count: usize) -> bool {
        count > MAX_COUNTED_ELEMENTS
    }

    /// Bytes after the aggregation header.
    fn size(&self) -> usize {
        let count = self.elements.len();
        self.elements
            .iter()
            .enumerate()
            .map(|(i, e)| {
                if Self::sized_elements(count) || i + 1 < count {
                    e.len + leb128_size(e.len)
                } else {
                    e.len
                }
            })
            .sum()
    }

    /// Longest element that can still be appended within `capacity` bytes.
    fn room(&self, capacity: usize) -> usize {
        // Once another element follows, every existing one is size-prefixed.
        let used: usize = self
            .elements
            .iter()
            .map(|e| e.len + leb128_size(e.len))
            .sum();
        let available = capacity.saturating_sub(used);
        if Self::sized_elements(self.elements.len() + 1) {
            max_prefixed_len(available)
        } else {
            available
        }
    }
}

/// Largest `len` with `len + leb128_size(len) <= available`.
fn max_prefixed_len(available: usize) -> usize {
    let mut len = available.saturating_sub(1);
    while len > 0 && len + leb128_size(len) > available {
        len -= 1;
    }
    len
}

/// AV1 RTP packetizer for one temporal unit.
///
/// Temporal delimiters, tile lists and padding OBUs are not sent and
/// `obu_size` fields are stripped. Packets are filled greedily; an OBU that
/// does not fit is fragmented across packets with Z and Y marking the
/// boundaries. N is set on the first packet of a key frame that starts with a
/// sequence header.
#[derive(Debug)]
pub struct Av1Packetizer<'a> {
    obus: Vec<Obu<'a>>,
    packets: Vec<PlannedPacket>,
    next_index: usize,
    new_coded_video_sequence: bool,
}

impl<'a> Av1Packetizer<'a> {
    pub fn new(payload: &'a [u8], limits: PayloadSizeLimits, frame_kind: FrameKind) -> Result<Self> {
        let limits = limits.reduced_by(AGGREGATION_HEADER_SIZE)?;
        let obus: Vec<Obu<'a>> = parse_obus(payload)?
            .into_iter()
            .filter(Obu::is_transmitted)
            .collect();
        let packets = plan_packets(&obus, &limits)?;
        let new_coded_video_sequence = frame_kind == FrameKind::Key
            && obus
                .first()
                .is_some_and(|obu| obu.obu_type() == obu_type::SEQUENCE_HEADER);

        tracing::trace!(
            obus = obus.len(),
            packets = packets.len(),
            new_coded_video_sequence,
            "AV1 temporal unit planned"
        );

        Ok(Self {
            obus,
            packets,
            next_index: 0,
            new_coded_video_sequence,
        })
    }

    fn aggregation_header(&self, index: usize) -> u8 {
        let packet = &self.packets[index];
        let mut header = 0;
        if packet.elements.first().is_some_and(|e| e.offset > 0) {
            header |= Z_BIT;
        }
        if let Some(last) = packet.elements.last() {
            if last.offset + last.len < self.obus[last.obu].element_len() {
                header |= Y_BIT;
            }
        }
        let count = packet.elements.len();
        if count <= MAX_COUNTED_ELEMENTS {
            header |= (count as u8) << W_SHIFT;
        }
        if index == 0 && self.new_coded_video_sequence {
            header |= N_BIT;
        }
        header
    }
}

fn plan_packets(obus: &[Obu<'_>], limits: &PayloadSizeLimits) -> Result<Vec<PlannedPacket>> {
    let capacity = |index: usize| {
        if index == 0 {
            limits.max_payload_len - limits.first_packet_reduction_len
        } else {
            limits.max_payload_len
        }
    };

    let mut packets = Vec::new();
    let mut current = PlannedPacket::default();
    for (index, obu) in obus.iter().enumerate() {
        let element_len = obu.element_len();
        let mut offset = 0;
        while offset < element_len {
            let room = current.room(capacity(packets.len()));
            if room == 0 {
                if current.elements.is_empty() {
                    return Err(RtpVideoError::BudgetExceeded {
                        needed: 1,
                        capacity: capacity(packets.len()),
                    });
                }
                packets.push(mem::take(&mut current));
                continue;
            }
            let len = room.min(element_len - offset);
            current.elements.push(Element {
                obu: index,
                offset,
                len,
            });
            offset += len;
        }
    }
    if current.elements.is_empty() {
        return Ok(packets);
    }
    packets.push(current);

    balance_last_packet(&mut packets, limits, &capacity)?;
    Ok(packets)
}

/// Move the tail of the last packet into a new one when it does not leave
/// room for the last packet reduction.
fn balance_last_packet(
    packets: &mut Vec<PlannedPacket>,
    limits: &PayloadSizeLimits,
    capacity: &dyn Fn(usize) -> usize,
) -> Result<()> {
    let last_index = packets.len() - 1;
    let reduction = limits.last_packet_reduction_len;
    let last_capacity = capacity(last_index).saturating_sub(reduction);
    let size = packets[last_index].size();
    if size <= last_capacity {
        return Ok(());
    }

    let new_capacity = capacity(last_index + 1).saturating_sub(reduction);
    let last = &mut packets[last_index];
    let keep = if last.elements.len() == 1 { 1 } else { 0 };
    let Some(tail) = last.elements.last_mut() else {
        return Ok(());
    };
    // Roughly halve the overflowing packet.
    let moved = (size / 2).max(1).min(new_capacity).min(tail.len - keep);
    if moved == 0 {
        return Err(RtpVideoError::BudgetExceeded {
            needed: size,
            capacity: last_capacity,
        });
    }

    tail.len -= moved;
    let element = Element {
        obu: tail.obu,
        offset: tail.offset + tail.len,
        len: moved,
    };
    if tail.len == 0 {
        last.elements.pop();
    }
    packets.push(PlannedPacket {
        elements: vec![element],
    });
    Ok(())
}

impl Packetizer for Av1Packetizer<'_> {
    fn num_packets(&self) -> usize {
        self.packets.len() - self.next_index
    }

    fn next_packet(&mut self, out: &mut Vec<u8>) -> PacketResult {
        out.clear();
        let index = self.next_index;
        let Some(packet) = self.packets.get(index) else {
            return PacketResult::NoPayload;
        };
        self.next_index += 1;

        out.push(self.aggregation_header(index));
        let count = packet.elements.len();
        for (i, element) in packet.elements.iter().enumerate() {
            if PlannedPacket::sized_elements(count) || i + 1 < count {
                write_leb128(element.len, out);
            }
            self.obus[element.obu].write_element_range(
                element.offset,
                element.offset + element.len,
                out,
            );
        }

        if self.next_index == self.packets.len() {
            PacketResult::LastPacket(out.len())
        } else {
            PacketResult::MoreToCome(out.len())
        }
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Av1
    }
}
