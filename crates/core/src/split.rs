//! Balanced packet planning shared by all packetizers.

use crate::error::{Result, RtpVideoError};
use crate::limits::PayloadSizeLimits;

/// Split `payload_len` bytes into the minimum number of packets allowed by
/// `limits`, keeping packet sizes as close to each other as possible.
///
/// The first and last packets are treated as if they were full sized by
/// adding their reductions to the total before dividing, so after the
/// reductions are taken off every packet carries about the same share of
/// the payload:
///
/// ```text
/// split(13, max=5, last_red=2)  ->  [5, 5, 3]     (effective [5, 5, 5])
/// split(28, max=7, last_red=5)  ->  [6, 6, 7, 7, 2]
/// ```
///
/// Packets that get one extra byte are placed at the end. When a reduction is
/// so large that the per-packet share would leave nothing for the last
/// packet, one byte is held back for it and the spread may exceed one byte.
///
/// Returns an empty plan for an empty payload.
pub fn split_about_equally(payload_len: usize, limits: &PayloadSizeLimits) -> Result<Vec<usize>> {
    limits.validate()?;

    if payload_len == 0 {
        return Ok(Vec::new());
    }
    if payload_len <= limits.single_packet_capacity() {
        return Ok(vec![payload_len]);
    }

    let first_red = limits.first_packet_reduction_len;
    let total = payload_len + first_red + limits.last_packet_reduction_len;
    let mut num_packets_left = total.div_ceil(limits.max_payload_len);

    // Every packet needs at least one byte of payload.
    if payload_len < num_packets_left {
        return Err(RtpVideoError::BudgetExceeded {
            needed: total,
            capacity: payload_len * limits.max_payload_len,
        });
    }

    let mut bytes_per_packet = total / num_packets_left;
    let num_larger_packets = total % num_packets_left;
    let mut remaining = payload_len;
    let mut result = Vec::with_capacity(num_packets_left);

    while remaining > 0 && num_packets_left > 0 {
        if num_packets_left == num_larger_packets {
            bytes_per_packet += 1;
        }
        let mut current = bytes_per_packet;
        if result.is_empty() {
            current = if current > first_red + 1 {
                current - first_red
            } else {
                1
            };
        }
        current = current.min(remaining);
        // Not the last packet, but nothing would be left for the last one.
        if num_packets_left == 2 && current == remaining {
            current -= 1;
        }
        result.push(current);
        remaining -= current;
        num_packets_left -= 1;
    }

    if remaining > 0 {
        return Err(RtpVideoError::BudgetExceeded {
            needed: payload_len,
            capacity: payload_len - remaining,
        });
    }

    tracing::trace!(
        payload_len,
        packets = result.len(),
        max_payload_len = limits.max_payload_len,
        "payload split"
    );

    Ok(result)
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

    #[test]
    fn empty_payload_gives_empty_plan() {
        assert!(split_about_equally(0, &limits(5, 0, 0)).unwrap().is_empty());
    }

    #[test]
    fn fits_in_single_packet() {
        assert_eq!(split_about_equally(5, &limits(5, 0, 0)).unwrap(), vec![5]);
        assert_eq!(split_about_equally(3, &limits(5, 1, 1)).unwrap(), vec![3]);
    }

    #[test]
    fn single_packet_must_fit_both_reductions() {
        // 4 bytes would fit max=5, but not with both reductions applied.
        let plan = split_about_equally(4, &limits(5, 1, 1)).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.iter().sum::<usize>(), 4);
    }

    #[test]
    fn last_reduction_evens_out() {
        assert_eq!(
            split_about_equally(13, &limits(5, 0, 2)).unwrap(),
            vec![5, 5, 3]
        );
    }

    #[test]
    fn larger_packets_go_last() {
        assert_eq!(
            split_about_equally(28, &limits(7, 0, 5)).unwrap(),
            vec![6, 6, 7, 7, 2]
        );
        assert_eq!(
            split_about_equally(24, &limits(7, 0, 5)).unwrap(),
            vec![5, 6, 6, 6, 1]
        );
    }

    #[test]
    fn first_reduction_shrinks_first_packet() {
        let plan = split_about_equally(13, &limits(5, 2, 0)).unwrap();
        assert_eq!(plan, vec![3, 5, 5]);
    }

    #[test]
    fn reserves_a_byte_for_last_packet() {
        let plan = split_about_equally(3, &limits(5, 0, 4)).unwrap();
        assert_eq!(plan, vec![2, 1]);
    }

    #[test]
    fn more_packets_than_bytes_rejected() {
        let err = split_about_equally(1, &limits(5, 3, 3)).unwrap_err();
        assert!(matches!(err, RtpVideoError::BudgetExceeded { .. }));
    }

    #[test]
    fn invalid_limits_rejected() {
        let err = split_about_equally(10, &limits(5, 0, 5)).unwrap_err();
        assert!(matches!(err, RtpVideoError::InvariantViolation(_)));
    }
}
