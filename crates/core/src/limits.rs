use crate::error::{Result, RtpVideoError};

/// Size of the RTP fixed header (RFC 3550 §5.1) without CSRCs or extensions.
pub const RTP_HEADER_SIZE: usize = 12;

/// Default payload budget, leaving room for SRTP and header extensions
/// inside a typical 1500-byte Ethernet MTU.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1200;

/// Per-packet payload budget handed to every packetizer.
///
/// `max_payload_len` bounds the bytes written by a single call to
/// [`Packetizer::next_packet`](crate::Packetizer::next_packet), descriptor
/// included. The first and last packets of a frame may be required to be
/// smaller, e.g. when the transport appends a trailer to the last packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSizeLimits {
    pub max_payload_len: usize,
    pub first_packet_reduction_len: usize,
    pub last_packet_reduction_len: usize,
}

impl Default for PayloadSizeLimits {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            first_packet_reduction_len: 0,
            last_packet_reduction_len: 0,
        }
    }
}

impl PayloadSizeLimits {
    /// Limits with no first-packet reduction.
    pub fn new(max_payload_len: usize, last_packet_reduction_len: usize) -> Result<Self> {
        let limits = Self {
            max_payload_len,
            first_packet_reduction_len: 0,
            last_packet_reduction_len,
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Limits for an RTP packet of at most `mtu` bytes, fixed header included.
    pub fn for_mtu(mtu: usize) -> Result<Self> {
        let max_payload_len = mtu.saturating_sub(RTP_HEADER_SIZE);
        Self::new(max_payload_len, 0)
    }

    pub fn with_first_packet_reduction(mut self, len: usize) -> Result<Self> {
        self.first_packet_reduction_len = len;
        self.validate()?;
        Ok(self)
    }

    pub fn with_last_packet_reduction(mut self, len: usize) -> Result<Self> {
        self.last_packet_reduction_len = len;
        self.validate()?;
        Ok(self)
    }

    /// Check `max_payload_len > 0` and that neither reduction consumes the whole budget.
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_len == 0 {
            return Err(RtpVideoError::InvariantViolation(
                "max_payload_len must be positive".into(),
            ));
        }
        if self.max_payload_len <= self.last_packet_reduction_len {
            return Err(RtpVideoError::InvariantViolation(format!(
                "max_payload_len {} must exceed last_packet_reduction_len {}",
                self.max_payload_len, self.last_packet_reduction_len
            )));
        }
        if self.max_payload_len <= self.first_packet_reduction_len {
            return Err(RtpVideoError::InvariantViolation(format!(
                "max_payload_len {} must exceed first_packet_reduction_len {}",
                self.max_payload_len, self.first_packet_reduction_len
            )));
        }
        Ok(())
    }

    /// Budget of a frame that fits in exactly one packet.
    pub fn single_packet_capacity(&self) -> usize {
        self.max_payload_len
            .saturating_sub(self.first_packet_reduction_len)
            .saturating_sub(self.last_packet_reduction_len)
    }

    /// Budget of packet `index` out of `count` packets.
    pub fn capacity(&self, index: usize, count: usize) -> usize {
        if count == 1 {
            self.single_packet_capacity()
        } else if index == 0 {
            self.max_payload_len.saturating_sub(self.first_packet_reduction_len)
        } else if index + 1 == count {
            self.max_payload_len.saturating_sub(self.last_packet_reduction_len)
        } else {
            self.max_payload_len
        }
    }

    /// Shrink every budget by a per-packet descriptor of `overhead` bytes.
    ///
    /// Fails when the descriptor leaves no room for a single payload byte.
    pub fn reduced_by(&self, overhead: usize) -> Result<Self> {
        let max_payload_len = self.max_payload_len.saturating_sub(overhead);
        let reduced = Self {
            max_payload_len,
            ..*self
        };
        if max_payload_len == 0
            || max_payload_len <= self.first_packet_reduction_len
            || max_payload_len <= self.last_packet_reduction_len
        {
            return Err(RtpVideoError::BudgetExceeded {
                needed: overhead
                    + 1
                    + self
                        .first_packet_reduction_len
                        .max(self.last_packet_reduction_len),
                capacity: self.max_payload_len,
            });
        }
        Ok(reduced)
    }
}
