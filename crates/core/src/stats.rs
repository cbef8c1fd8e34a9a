//! Per-frame statistics for codec test harnesses.
//!
//! A [`FrameStats`] store records one [`FrameStatistic`] per encoded frame,
//! keyed both by frame number (its position) and by RTP timestamp, so encode
//! and decode callbacks can find the frame they belong to.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, RtpVideoError};
use crate::header::{FrameKind, Resolution, VideoCodecKind};
use crate::media::h264::annex_b_nal_units;

/// Measurements for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStatistic {
    pub frame_number: usize,
    pub rtp_timestamp: u32,

    // Encoding
    pub encoding_successful: bool,
    pub encode_time_us: u64,
    pub target_bitrate_kbps: u32,
    pub length_bytes: usize,
    pub frame_kind: FrameKind,
    pub qp: Option<u8>,
    pub max_nalu_size_bytes: usize,
    pub temporal_idx: u8,
    pub spatial_idx: u8,

    // Decoding
    pub decoding_successful: bool,
    pub decode_time_us: u64,
    pub decoded_resolution: Option<Resolution>,

    // Quality
    pub psnr: Option<f64>,
    pub ssim: Option<f64>,
}

impl FrameStatistic {
    pub fn new(frame_number: usize, rtp_timestamp: u32) -> Self {
        Self {
            frame_number,
            rtp_timestamp,
            encoding_successful: false,
            encode_time_us: 0,
            target_bitrate_kbps: 0,
            length_bytes: 0,
            frame_kind: FrameKind::Delta,
            qp: None,
            max_nalu_size_bytes: 0,
            temporal_idx: 0,
            spatial_idx: 0,
            decoding_successful: false,
            decode_time_us: 0,
            decoded_resolution: None,
            psnr: None,
            ssim: None,
        }
    }
}

impl fmt::Display for FrameStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {} ts {} {:?} {} bytes layer {}/{}",
            self.frame_number,
            self.rtp_timestamp,
            self.frame_kind,
            self.length_bytes,
            self.spatial_idx,
            self.temporal_idx
        )?;
        if let Some(qp) = self.qp {
            write!(f, " qp {qp}")?;
        }
        if !self.encoding_successful {
            return write!(f, " dropped");
        }
        write!(f, " enc {} us", self.encode_time_us)?;
        if self.decoding_successful {
            write!(f, " dec {} us", self.decode_time_us)?;
        }
        if let Some(res) = self.decoded_resolution {
            write!(f, " {}x{}", res.width, res.height)?;
        }
        if let Some(psnr) = self.psnr {
            write!(f, " psnr {psnr:.2}")?;
        }
        if let Some(ssim) = self.ssim {
            write!(f, " ssim {ssim:.4}")?;
        }
        Ok(())
    }
}

/// Append-only store of frame statistics.
///
/// Frame numbers are assigned in insertion order. RTP timestamps must be
/// unique; the timestamp index is an ordered map so iteration over it is
/// deterministic.
#[derive(Debug, Default)]
pub struct FrameStats {
    frames: Vec<FrameStatistic>,
    by_timestamp: BTreeMap<u32, usize>,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new frame and return it for filling in.
    pub fn add_frame(&mut self, rtp_timestamp: u32) -> Result<&mut FrameStatistic> {
        if self.by_timestamp.contains_key(&rtp_timestamp) {
            return Err(RtpVideoError::DuplicateTimestamp(rtp_timestamp));
        }
        let frame_number = self.frames.len();
        self.by_timestamp.insert(rtp_timestamp, frame_number);
        self.frames.push(FrameStatistic::new(frame_number, rtp_timestamp));
        tracing::trace!(frame_number, rtp_timestamp, "frame statistic added");
        Ok(&mut self.frames[frame_number])
    }

    pub fn get(&self, frame_number: usize) -> Option<&FrameStatistic> {
        self.frames.get(frame_number)
    }

    pub fn get_mut(&mut self, frame_number: usize) -> Option<&mut FrameStatistic> {
        self.frames.get_mut(frame_number)
    }

    pub fn get_by_timestamp(&self, rtp_timestamp: u32) -> Option<&FrameStatistic> {
        let &index = self.by_timestamp.get(&rtp_timestamp)?;
        self.frames.get(index)
    }

    pub fn get_by_timestamp_mut(&mut self, rtp_timestamp: u32) -> Option<&mut FrameStatistic> {
        let &index = self.by_timestamp.get(&rtp_timestamp)?;
        self.frames.get_mut(index)
    }

    pub fn size(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FrameStatistic> {
        self.frames.iter()
    }

    /// Frames `first..=last`, or `None` when the range is out of bounds.
    pub fn slice(&self, first: usize, last: usize) -> Option<&[FrameStatistic]> {
        if first > last {
            return None;
        }
        self.frames.get(first..=last)
    }

    /// Aggregate frames `first..=last`.
    pub fn summarize(&self, first: usize, last: usize) -> Option<StreamSummary> {
        let frames = self.slice(first, last)?;
        Some(StreamSummary::from_frames(frames))
    }
}

impl<'a> IntoIterator for &'a FrameStats {
    type Item = &'a FrameStatistic;
    type IntoIter = std::slice::Iter<'a, FrameStatistic>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

/// Count, mean, min and max of a stream of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn add(&mut self, sample: f64) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.count += 1;
        self.sum += sample;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

/// Aggregate over a range of frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub num_frames: usize,
    pub num_dropped_frames: usize,
    pub num_key_frames: usize,
    pub num_decoded_frames: usize,
    /// Times the decoded resolution changed between consecutive decoded frames.
    pub num_spatial_resizes: usize,
    pub total_encoded_bytes: usize,
    pub max_nalu_size_bytes: usize,
    pub key_frame_size_bytes: RunningStats,
    pub delta_frame_size_bytes: RunningStats,
    pub qp: RunningStats,
    pub psnr: RunningStats,
    pub ssim: RunningStats,
    pub encode_time_us: RunningStats,
    pub decode_time_us: RunningStats,
}

impl StreamSummary {
    pub fn from_frames(frames: &[FrameStatistic]) -> Self {
        let mut summary = Self {
            num_frames: frames.len(),
            ..Self::default()
        };
        let mut last_resolution: Option<Resolution> = None;

        for frame in frames {
            if !frame.encoding_successful {
                summary.num_dropped_frames += 1;
                continue;
            }
            summary.total_encoded_bytes += frame.length_bytes;
            summary.max_nalu_size_bytes =
                summary.max_nalu_size_bytes.max(frame.max_nalu_size_bytes);
            summary.encode_time_us.add(frame.encode_time_us as f64);
            if let Some(qp) = frame.qp {
                summary.qp.add(qp as f64);
            }
            match frame.frame_kind {
                FrameKind::Key => {
                    summary.num_key_frames += 1;
                    summary.key_frame_size_bytes.add(frame.length_bytes as f64);
                }
                FrameKind::Delta => summary.delta_frame_size_bytes.add(frame.length_bytes as f64),
                FrameKind::Empty => {}
            }

            if !frame.decoding_successful {
                continue;
            }
            summary.num_decoded_frames += 1;
            summary.decode_time_us.add(frame.decode_time_us as f64);
            if let Some(resolution) = frame.decoded_resolution {
                if last_resolution.is_some_and(|last| last != resolution) {
                    summary.num_spatial_resizes += 1;
                }
                last_resolution = Some(resolution);
            }
            if let Some(psnr) = frame.psnr {
                summary.psnr.add(psnr);
            }
            if let Some(ssim) = frame.ssim {
                summary.ssim.add(ssim);
            }
        }
        summary
    }
}

/// Largest NAL unit in an encoded frame, for codecs that have NAL units.
///
/// `payload` is an H.264 Annex B bitstream; the NAL header byte is counted.
/// Returns 0 for other codecs.
pub fn max_nalu_size_bytes(codec: VideoCodecKind, payload: &[u8]) -> usize {
    match codec {
        VideoCodecKind::H264 => annex_b_nal_units(payload)
            .iter()
            .map(|nal| nal.length)
            .max()
            .unwrap_or(0),
        _ => 0,
    }
}
