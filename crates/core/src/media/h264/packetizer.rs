use std::collections::VecDeque;

use super::{
    E_BIT, F_BIT, FU_A_HEADER_SIZE, LENGTH_FIELD_SIZE, NAL_HEADER_SIZE, NRI_MASK, S_BIT,
    TYPE_MASK, annex_b_nal_units, nal_type,
};
use crate::error::{Result, RtpVideoError};
use crate::header::{Fragment, H264PacketizationMode, VideoCodecKind};
use crate::limits::PayloadSizeLimits;
use crate::media::{PacketResult, Packetizer};
use crate::split::split_about_equally;

/// Largest NAL unit the 16-bit STAP-A size field can describe.
const MAX_AGGREGATED_NALU_LEN: usize = u16::MAX as usize;

/// One planned packet, or one NAL unit inside a planned STAP-A.
#[derive(Debug)]
struct PacketUnit<'a> {
    data: &'a [u8],
    first_fragment: bool,
    last_fragment: bool,
    aggregated: bool,
    /// Header byte of the NAL unit `data` belongs to.
    header: u8,
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Every NAL unit of the frame is planned as one of:
///
/// - **Single NAL unit** (§5.6): the NAL is the whole payload.
/// - **STAP-A** (§5.7.1): consecutive NALs that fit together are aggregated,
///   each prefixed by a 16-bit size. Only used when two or more NALs end up
///   in the packet; a lone NAL is sent as a single NAL unit packet.
/// - **FU-A** (§5.8): a NAL larger than the packet budget is split with
///   [`split_about_equally`] over its body. The NAL header byte is carried in
///   the FU indicator and FU header instead.
///
/// In [`H264PacketizationMode::SingleNalUnit`] only the first form is
/// allowed and a NAL that does not fit fails with
/// [`RtpVideoError::BudgetExceeded`].
///
/// The first reduction of the limits applies to the packets of the first NAL
/// and the last reduction to the packets of the last NAL.
#[derive(Debug)]
pub struct H264Packetizer<'a> {
    limits: PayloadSizeLimits,
    nalus: Vec<&'a [u8]>,
    packets: VecDeque<PacketUnit<'a>>,
    num_packets_left: usize,
}

impl<'a> H264Packetizer<'a> {
    /// Plan the packets of one access unit.
    ///
    /// With `fragmentation` each entry is a NAL unit (header byte first, no
    /// start code) inside `payload`. Without it `payload` is parsed as Annex B.
    pub fn new(
        payload: &'a [u8],
        limits: PayloadSizeLimits,
        mode: H264PacketizationMode,
        fragmentation: Option<&[Fragment]>,
    ) -> Result<Self> {
        limits.validate()?;
        let fragments = match fragmentation {
            Some(fragments) => {
                Fragment::validate_all(fragments, payload.len())?;
                fragments.to_vec()
            }
            None => annex_b_nal_units(payload),
        };

        let mut nalus = Vec::with_capacity(fragments.len());
        for (i, fragment) in fragments.iter().enumerate() {
            if fragment.length == 0 {
                return Err(RtpVideoError::InvariantViolation(format!(
                    "NAL unit {i} is empty"
                )));
            }
            nalus.push(&payload[fragment.offset..fragment.end()]);
        }

        let mut packetizer = Self {
            limits,
            nalus,
            packets: VecDeque::new(),
            num_packets_left: 0,
        };
        packetizer.generate_packets(mode)?;
        Ok(packetizer)
    }

    fn generate_packets(&mut self, mode: H264PacketizationMode) -> Result<()> {
        let mut i = 0;
        while i < self.nalus.len() {
            match mode {
                H264PacketizationMode::SingleNalUnit => {
                    self.packetize_single_nalu(i)?;
                    i += 1;
                }
                H264PacketizationMode::NonInterleaved => {
                    if self.nalus[i].len() > self.single_packet_capacity(i) {
                        self.packetize_fu_a(i)?;
                        i += 1;
                    } else {
                        i = self.packetize_stap_a(i);
                    }
                }
            }
        }
        Ok(())
    }

    /// Budget for NAL `index` if it were sent on its own.
    fn single_packet_capacity(&self, index: usize) -> usize {
        let count = self.nalus.len();
        if count == 1 {
            self.limits.single_packet_capacity()
        } else if index == 0 {
            self.limits.capacity(0, 2)
        } else if index + 1 == count {
            self.limits.capacity(1, 2)
        } else {
            self.limits.max_payload_len
        }
    }

    fn packetize_single_nalu(&mut self, index: usize) -> Result<()> {
        let nalu = self.nalus[index];
        let capacity = self.single_packet_capacity(index);
        if nalu.len() > capacity {
            return Err(RtpVideoError::BudgetExceeded {
                needed: nalu.len(),
                capacity,
            });
        }
        self.packets.push_back(PacketUnit {
            data: nalu,
            first_fragment: true,
            last_fragment: true,
            aggregated: false,
            header: nalu[0],
        });
        self.num_packets_left += 1;
        Ok(())
    }

    fn packetize_fu_a(&mut self, index: usize) -> Result<()> {
        let nalu = self.nalus[index];
        let last_index = self.nalus.len() - 1;

        // Room for the FU indicator and FU header; reductions only apply to
        // the NALs at the frame edges.
        let mut limits = self.limits.reduced_by(FU_A_HEADER_SIZE)?;
        if index != 0 {
            limits.first_packet_reduction_len = 0;
        }
        if index != last_index {
            limits.last_packet_reduction_len = 0;
        }

        let body = &nalu[NAL_HEADER_SIZE..];
        let sizes = split_about_equally(body.len(), &limits)?;
        let num_fragments = sizes.len();

        let mut offset = 0;
        for (i, size) in sizes.into_iter().enumerate() {
            self.packets.push_back(PacketUnit {
                data: &body[offset..offset + size],
                first_fragment: i == 0,
                last_fragment: i + 1 == num_fragments,
                aggregated: false,
                header: nalu[0],
            });
            offset += size;
        }
        self.num_packets_left += num_fragments;

        tracing::trace!(
            nal_type = nalu[0] & TYPE_MASK,
            nal_size = nalu.len(),
            fragments = num_fragments,
            "FU-A fragmented NAL unit"
        );
        Ok(())
    }

    /// Aggregate NALs starting at `index` into one packet. Returns the index
    /// of the first NAL that was not aggregated.
    fn packetize_stap_a(&mut self, mut index: usize) -> usize {
        let count = self.nalus.len();
        let mut payload_size_left = if count == 1 {
            self.limits.single_packet_capacity()
        } else if index == 0 {
            self.limits.capacity(0, 2)
        } else {
            self.limits.max_payload_len
        };
        let mut aggregated = 0usize;
        let mut headers_len = 0usize;
        self.num_packets_left += 1;

        while index < count {
            let nalu = self.nalus[index];
            // A NAL too long for the size field is always sent on its own.
            let previous_len = self.nalus[index.saturating_sub(1)].len();
            if aggregated > 0
                && (nalu.len() > MAX_AGGREGATED_NALU_LEN
                    || previous_len > MAX_AGGREGATED_NALU_LEN)
            {
                break;
            }
            let mut needed = nalu.len() + headers_len;
            if count > 1 && index + 1 == count {
                // The aggregate may end up being the last packet.
                needed += self.limits.last_packet_reduction_len;
            }
            if payload_size_left < needed {
                break;
            }

            self.packets.push_back(PacketUnit {
                data: nalu,
                first_fragment: aggregated == 0,
                last_fragment: false,
                aggregated: true,
                header: nalu[0],
            });
            payload_size_left -= nalu.len() + headers_len;

            headers_len = LENGTH_FIELD_SIZE;
            // A second NAL turns the packet into a STAP-A: add the STAP-A
            // header and the size field of the first NAL.
            if aggregated == 0 {
                headers_len += NAL_HEADER_SIZE + LENGTH_FIELD_SIZE;
            }
            aggregated += 1;
            index += 1;
        }

        if let Some(last) = self.packets.back_mut() {
            last.last_fragment = true;
        }
        index
    }

    fn next_aggregate_packet(&mut self, out: &mut Vec<u8>) {
        out.push(0);
        let mut stap_header = 0u8;
        let mut max_nri = 0u8;

        while let Some(unit) = self.packets.pop_front() {
            stap_header |= unit.header & F_BIT;
            max_nri = max_nri.max(unit.header & NRI_MASK);
            out.extend_from_slice(&(unit.data.len() as u16).to_be_bytes());
            out.extend_from_slice(unit.data);
            if unit.last_fragment {
                break;
            }
        }

        out[0] = stap_header | max_nri | nal_type::STAP_A;
    }

    fn next_fragment_packet(unit: PacketUnit<'_>, out: &mut Vec<u8>) {
        let fu_indicator = (unit.header & (F_BIT | NRI_MASK)) | nal_type::FU_A;
        let mut fu_header = unit.header & TYPE_MASK;
        if unit.first_fragment {
            fu_header |= S_BIT;
        }
        if unit.last_fragment {
            fu_header |= E_BIT;
        }
        out.push(fu_indicator);
        out.push(fu_header);
        out.extend_from_slice(unit.data);
    }
}

impl Packetizer for H264Packetizer<'_> {
    fn num_packets(&self) -> usize {
        self.num_packets_left
    }

    fn next_packet(&mut self, out: &mut Vec<u8>) -> PacketResult {
        out.clear();
        let Some(unit) = self.packets.front() else {
            return PacketResult::NoPayload;
        };

        if unit.first_fragment && unit.last_fragment {
            out.extend_from_slice(unit.data);
            self.packets.pop_front();
        } else if unit.aggregated {
            self.next_aggregate_packet(out);
        } else if let Some(unit) = self.packets.pop_front() {
            Self::next_fragment_packet(unit, out);
        }

        self.num_packets_left -= 1;
        if self.packets.is_empty() {
            PacketResult::LastPacket(out.len())
        } else {
            PacketResult::MoreToCome(out.len())
        }
    }

    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::H264
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize, first: usize, last: usize) -> PayloadSizeLimits {
        PayloadSizeLimits {
            max_payload_len: max,
            first_packet_reduction_len: first,
            last_packet_reduction_len: last,
        }
    }

    fn nal(header: u8, len: usize) -> Vec<u8> {
        let mut nal = vec![header];
        nal.extend((1..len).map(|i| i as u8));
        nal
    }

    fn frame(nals: &[Vec<u8>]) -> (Vec<u8>, Vec<Fragment>) {
        let mut payload = Vec::new();
        let mut fragments = Vec::new();
        for nal in nals {
            fragments.push(Fragment::new(payload.len(), nal.len()));
            payload.extend_from_slice(nal);
        }
        (payload, fragments)
    }

    fn packetize(
        payload: &[u8],
        limits: PayloadSizeLimits,
        mode: H264PacketizationMode,
        fragments: &[Fragment],
    ) -> Vec<Vec<u8>> {
        H264Packetizer::new(payload, limits, mode, Some(fragments))
            .unwrap()
            .packetize_all()
    }

    // --- Single NAL unit ---

    #[test]
    fn small_nal_single_packet() {
        let (payload, fragments) = frame(&[nal(0x65, 4)]);
        let packets = packetize(
            &payload,
            limits(1200, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets, vec![payload.clone()]);
    }

    #[test]
    fn single_nal_mode_one_packet_per_nal() {
        let (payload, fragments) = frame(&[nal(0x67, 3), nal(0x68, 2), nal(0x65, 5)]);
        let packets = packetize(
            &payload,
            limits(1200, 0, 0),
            H264PacketizationMode::SingleNalUnit,
            &fragments,
        );
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[2], nal(0x65, 5));
    }

    #[test]
    fn single_nal_mode_rejects_oversized_nal() {
        let (payload, fragments) = frame(&[nal(0x65, 20)]);
        let err = H264Packetizer::new(
            &payload,
            limits(10, 0, 0),
            H264PacketizationMode::SingleNalUnit,
            Some(&fragments),
        )
        .unwrap_err();
        assert!(matches!(err, RtpVideoError::BudgetExceeded { .. }));
    }

    #[test]
    fn annex_b_input_without_fragmentation() {
        let payload = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let packets = H264Packetizer::new(
            &payload,
            limits(1200, 0, 0),
            H264PacketizationMode::NonInterleaved,
            None,
        )
        .unwrap()
        .packetize_all();
        assert_eq!(packets, vec![vec![0x65, 0xAA, 0xBB]]);
    }

    #[test]
    fn empty_nal_rejected() {
        let err = H264Packetizer::new(
            &[0x65],
            limits(1200, 0, 0),
            H264PacketizationMode::NonInterleaved,
            Some(&[Fragment::new(0, 0)]),
        )
        .unwrap_err();
        assert!(matches!(err, RtpVideoError::InvariantViolation(_)));
    }

    // --- STAP-A ---

    #[test]
    fn stap_a_aggregates_small_nals() {
        let nals = [nal(0x67, 2), nal(0x68, 2), nal(0x65, 0x123)];
        let (payload, fragments) = frame(&nals);
        let packets = packetize(
            &payload,
            limits(1200, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets.len(), 1);

        let mut expected = vec![nal_type::STAP_A | 0x60];
        for nal in &nals {
            expected.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            expected.extend_from_slice(nal);
        }
        assert_eq!(packets[0], expected);
    }

    #[test]
    fn stap_a_header_takes_max_nri_and_f_bit() {
        let (payload, fragments) = frame(&[nal(0x86, 2), nal(0x41, 2)]);
        let packets = packetize(
            &payload,
            limits(1200, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], F_BIT | 0x40 | nal_type::STAP_A);
    }

    #[test]
    fn stap_a_respects_last_packet_reduction() {
        // Both NALs fit together within max, but not with the reduction.
        let (payload, fragments) = frame(&[nal(0x67, 2), nal(0x65, 2)]);
        let packets = packetize(
            &payload,
            limits(9, 0, 1),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], nal(0x67, 2));
        assert_eq!(packets[1], nal(0x65, 2));

        let packets = packetize(
            &payload,
            limits(9, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 9);
    }

    #[test]
    fn stap_a_splits_when_full() {
        let nals = [nal(0x67, 3), nal(0x68, 3), nal(0x65, 3)];
        let (payload, fragments) = frame(&nals);
        // 1 + (2 + 3) * 2 = 11 bytes for two NALs, a third does not fit.
        let packets = packetize(
            &payload,
            limits(12, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 11);
        assert_eq!(packets[1], nals[2]);
    }

    #[test]
    fn stap_a_never_takes_nal_over_size_field() {
        let big = nal(0x65, MAX_AGGREGATED_NALU_LEN + 10);
        for nals in [
            [big.clone(), nal(0x41, 2)],
            [nal(0x67, 2), big.clone()],
        ] {
            let (payload, fragments) = frame(&nals);
            let packets = packetize(
                &payload,
                limits(100_000, 0, 0),
                H264PacketizationMode::NonInterleaved,
                &fragments,
            );
            assert_eq!(packets, nals.to_vec());
        }
    }

    // --- FU-A ---

    #[test]
    fn large_nal_fragmented() {
        let nal = nal(0x65, 1400 + 500);
        let (payload, fragments) = frame(&[nal.clone()]);
        let packets = packetize(
            &payload,
            limits(1200, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0][0], 0x60 | nal_type::FU_A);
        assert_eq!(packets[0][1], S_BIT | nal_type::IDR);
        assert_eq!(packets[1][1], E_BIT | nal_type::IDR);

        let body: Vec<u8> = packets.iter().flat_map(|p| p[2..].to_vec()).collect();
        assert_eq!(body, nal[1..]);
    }

    #[test]
    fn fu_a_fragments_are_balanced() {
        let (payload, fragments) = frame(&[nal(0x65, 11)]);
        let packets = packetize(
            &payload,
            limits(7, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        // 10 body bytes over a 5-byte budget.
        let sizes: Vec<usize> = packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![7, 7]);
    }

    #[test]
    fn fu_a_honours_last_packet_reduction() {
        let (payload, fragments) = frame(&[nal(0x65, 100)]);
        let packets = packetize(
            &payload,
            limits(30, 0, 5),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert!(packets.iter().all(|p| p.len() <= 30));
        assert!(packets.last().unwrap().len() <= 25);
        assert_eq!(packets.iter().map(|p| p.len() - 2).sum::<usize>(), 99);
    }

    #[test]
    fn mixed_stap_a_and_fu_a() {
        let nals = [nal(0x67, 4), nal(0x68, 3), nal(0x65, 40)];
        let (payload, fragments) = frame(&nals);
        let packets = packetize(
            &payload,
            limits(20, 0, 0),
            H264PacketizationMode::NonInterleaved,
            &fragments,
        );
        assert_eq!(packets[0][0] & TYPE_MASK, nal_type::STAP_A);
        assert!(packets[1..].iter().all(|p| p[0] & TYPE_MASK == nal_type::FU_A));
        assert_eq!(packets[1][1] & S_BIT, S_BIT);
        assert_eq!(packets.last().unwrap()[1] & E_BIT, E_BIT);
    }

    #[test]
    fn fu_a_needs_room_for_header() {
        let (payload, fragments) = frame(&[nal(0x65, 10)]);
        let err = H264Packetizer::new(
            &payload,
            limits(3, 0, 1),
            H264PacketizationMode::NonInterleaved,
            Some(&fragments),
        )
        .unwrap_err();
        assert!(matches!(err, RtpVideoError::BudgetExceeded { .. }));
    }

    #[test]
    fn last_packet_reported() {
        let (payload, fragments) = frame(&[nal(0x65, 30)]);
        let mut packetizer = H264Packetizer::new(
            &payload,
            limits(12, 0, 0),
            H264PacketizationMode::NonInterleaved,
            Some(&fragments),
        )
        .unwrap();
        let total = packetizer.num_packets();
        let mut out = Vec::new();
        for _ in 0..total - 1 {
            assert!(matches!(
                packetizer.next_packet(&mut out),
                PacketResult::MoreToCome(_)
            ));
        }
        assert!(matches!(
            packetizer.next_packet(&mut out),
            PacketResult::LastPacket(_)
        ));
        assert_eq!(packetizer.next_packet(&mut out), PacketResult::NoPayload);
    }
}
