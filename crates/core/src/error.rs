//! Error types for the RTP video payload library.

use std::fmt;

use crate::header::VideoCodecKind;

/// Errors that can occur while packetizing or depacketizing video payloads.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Configuration**: [`InvariantViolation`](Self::InvariantViolation): limits,
///   fragmentation or codec headers that break a precondition.
/// - **Packetization**: [`BudgetExceeded`](Self::BudgetExceeded): the payload
///   cannot be fitted into packets under the given limits.
/// - **Depacketization**: [`Malformed`](Self::Malformed) and
///   [`MalformedRtp`](Self::MalformedRtp): the wire bytes do not follow the
///   payload format or RFC 3550.
/// - **Statistics**: [`DuplicateTimestamp`](Self::DuplicateTimestamp).
#[derive(Debug, thiserror::Error)]
pub enum RtpVideoError {
    /// A caller-supplied value violates a documented precondition.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A unit of `needed` bytes cannot be carried within `capacity` bytes of payload.
    #[error("payload budget exceeded: {needed} bytes needed, {capacity} available")]
    BudgetExceeded { needed: usize, capacity: usize },

    /// An RTP payload could not be parsed.
    #[error("malformed {codec} payload: {kind}")]
    Malformed {
        codec: VideoCodecKind,
        kind: MalformedKind,
    },

    /// An RTP packet's fixed header, CSRC list, extension or padding is invalid.
    #[error("malformed RTP packet: {0}")]
    MalformedRtp(MalformedKind),

    /// [`FrameStats::add_frame`](crate::FrameStats::add_frame) was called twice
    /// with the same RTP timestamp.
    #[error("frame with RTP timestamp {0} already recorded")]
    DuplicateTimestamp(u32),
}

impl RtpVideoError {
    pub(crate) fn malformed(codec: VideoCodecKind, kind: MalformedKind) -> Self {
        Self::Malformed { codec, kind }
    }
}

/// Specific kind of payload parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Payload had no bytes at all.
    Empty,
    /// Payload ended before a header field or element was complete.
    Truncated,
    /// A header field holds a value the payload format does not allow.
    InvalidField(&'static str),
    /// The packetization type is not supported (e.g. H.264 STAP-B, MTAP, FU-B).
    UnsupportedType(u8),
    /// A leb128 value was longer than 8 bytes or larger than the remaining buffer.
    InvalidLeb128,
    /// An aggregated element declared a size of zero.
    ZeroLengthElement,
    /// The RTP fixed header is not version 2.
    BadVersion(u8),
}

impl fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty payload"),
            Self::Truncated => write!(f, "truncated payload"),
            Self::InvalidField(field) => write!(f, "invalid {field}"),
            Self::UnsupportedType(t) => write!(f, "unsupported packetization type {t}"),
            Self::InvalidLeb128 => write!(f, "invalid leb128 value"),
            Self::ZeroLengthElement => write!(f, "zero-length aggregated element"),
            Self::BadVersion(v) => write!(f, "RTP version {v}"),
        }
    }
}

/// Convenience alias for `Result<T, RtpVideoError>`.
pub type Result<T> = std::result::Result<T, RtpVideoError>;
