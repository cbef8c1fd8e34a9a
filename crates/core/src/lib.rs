pub mod error;
pub mod header;
pub mod limits;
pub mod media;
pub mod split;
pub mod stats;

pub use error::{MalformedKind, Result, RtpVideoError};
pub use header::{
    CodecHeader, FrameKind, Fragment, Resolution, RtpVideoHeader, VideoCodecKind,
};
pub use limits::PayloadSizeLimits;
pub use media::rtp::{RtpHeader, RtpPacket};
pub use media::stream::{ReceivedVideoPacket, RtpVideoReceiver, RtpVideoSender};
pub use media::{
    Depacketizer, PacketResult, Packetizer, ParsedPayload, VideoDepacketizer, VideoPacketizer,
};
pub use split::split_about_equally;
pub use stats::{FrameStatistic, FrameStats, RunningStats, StreamSummary, max_nalu_size_bytes};
