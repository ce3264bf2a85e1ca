// Encoded video vocabulary: codecs, containers, per-frame flags and the
// track format captured from the encoder.
//
// A new codec needs its GStreamer caps and parser in gst_caps_name() /
// gst_parser() and an elementary stream extension in ContainerFormat::extension().

pub mod drain;

pub use drain::{
    Dequeue, DrainError, DrainReport, DrainStats, EncodeDrainWorker, EncodedUnit, EncoderDrain,
    EncoderOutput,
};

use serde::{Deserialize, Serialize};

/// Supported compressed video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC - what phone and desktop hardware encoders produce by default
    H264,
    /// H.265/HEVC
    H265,
    /// AV1
    Av1,
    /// Motion JPEG - every frame is a keyframe
    Mjpeg,
}

impl VideoCodec {
    /// Get the GStreamer caps name for this codec
    pub fn gst_caps_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/x-h264",
            VideoCodec::H265 => "video/x-h265",
            VideoCodec::Av1 => "video/x-av1",
            VideoCodec::Mjpeg => "image/jpeg",
        }
    }

    /// Get the GStreamer parser element name for this codec
    pub fn gst_parser(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264parse",
            VideoCodec::H265 => "h265parse",
            VideoCodec::Av1 => "av1parse",
            VideoCodec::Mjpeg => "jpegparse",
        }
    }

    /// Get the appropriate container format for this codec
    pub fn container(&self) -> ContainerFormat {
        match self {
            VideoCodec::H264 => ContainerFormat::Mp4,
            VideoCodec::H265 => ContainerFormat::Mp4,
            VideoCodec::Av1 => ContainerFormat::WebM,
            VideoCodec::Mjpeg => ContainerFormat::Mkv,
        }
    }

    /// Human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
            VideoCodec::Av1 => "AV1",
            VideoCodec::Mjpeg => "MJPEG",
        }
    }
}

/// Output file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// MP4 (.mp4)
    Mp4,
    /// Matroska (.mkv)
    Mkv,
    /// WebM (.webm)
    WebM,
    /// Raw elementary stream, codec config followed by the samples
    Elementary,
}

impl ContainerFormat {
    /// Get the file extension for this container
    pub fn extension(&self, codec: VideoCodec) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::WebM => "webm",
            ContainerFormat::Elementary => match codec {
                VideoCodec::H264 => "h264",
                VideoCodec::H265 => "h265",
                VideoCodec::Av1 => "obu",
                VideoCodec::Mjpeg => "mjpeg",
            },
        }
    }

    /// Get the GStreamer muxer element name (None for the elementary stream)
    pub fn gst_muxer(&self) -> Option<&'static str> {
        match self {
            ContainerFormat::Mp4 => Some("mp4mux"),
            ContainerFormat::Mkv => Some("matroskamux"),
            ContainerFormat::WebM => Some("webmmux"),
            ContainerFormat::Elementary => None,
        }
    }
}

impl Default for ContainerFormat {
    fn default() -> Self {
        Self::Mp4
    }
}

/// Per-frame flags reported by the encoder.
///
/// Bit values match what hardware codec APIs use, so flags coming from an
/// encoder can be wrapped without translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    /// Decodable without reference to earlier frames
    pub const KEYFRAME: FrameFlags = FrameFlags(1);
    /// Codec configuration (parameter sets), not a picture
    pub const CODEC_CONFIG: FrameFlags = FrameFlags(2);
    /// Last unit the encoder will produce
    pub const END_OF_STREAM: FrameFlags = FrameFlags(4);

    pub const fn from_bits(bits: u32) -> Self {
        FrameFlags(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_keyframe(&self) -> bool {
        self.contains(Self::KEYFRAME)
    }

    pub fn is_codec_config(&self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Stream format announced by the encoder on its first format change.
///
/// Required by every muxer before samples can be written. It is set once on
/// the ring and only read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Codec-specific setup data (e.g. SPS and PPS for H.264), in order
    pub codec_config: Vec<Vec<u8>>,
}

impl TrackFormat {
    pub fn new(codec: VideoCodec, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            frame_rate: 30.0,
            codec_config: Vec::new(),
        }
    }

    pub fn with_codec_config(mut self, config: Vec<Vec<u8>>) -> Self {
        self.codec_config = config;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = frame_rate;
        self
    }
}
