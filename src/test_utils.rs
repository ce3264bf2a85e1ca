//! Test doubles shared by unit tests, integration tests and the tools crate.
//!
//! - `ScriptedEncoder` plays back encoder output queued through an `EncoderFeed`
//! - `RecordingMuxerFactory` opens muxers that record every call instead of writing files
//! - fixtures for filling rings and collecting save callbacks

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::encoding::{Dequeue, EncodedUnit, EncoderOutput, FrameFlags, TrackFormat, VideoCodec};
use crate::muxing::{Muxer, MuxerError, MuxerFactory, Result, TrackId};
use crate::recording::{FrameRing, SaveCallback};

/// Frame interval at 30 fps, in microseconds
pub const FRAME_US: i64 = 33_333;

pub fn h264_format() -> TrackFormat {
    TrackFormat::new(VideoCodec::H264, 640, 480)
        .with_frame_rate(30.0)
        .with_codec_config(vec![vec![0, 0, 0, 1, 0x67, 0x42], vec![0, 0, 0, 1, 0x68, 0xce]])
}

/// Push frames `start..start + count` at 30 fps with a keyframe every `gop`
/// frames. Payload bytes are derived from the frame number.
pub fn push_frames(ring: &mut FrameRing, start: usize, count: usize, gop: usize, size: usize) {
    for i in start..start + count {
        let flags = if i % gop == 0 {
            FrameFlags::KEYFRAME
        } else {
            FrameFlags::NONE
        };
        let payload = vec![(i % 251) as u8; size];
        if let Err(e) = ring.push_back(&payload, flags, i as i64 * FRAME_US) {
            panic!("push_frames: frame {} rejected: {}", i, e);
        }
    }
}

/// A save callback that forwards `(file, success)` into a channel
pub fn save_events() -> (SaveCallback, Receiver<(PathBuf, bool)>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let callback: SaveCallback = Arc::new(move |path: &Path, success: bool| {
        let _ = tx.send((path.to_path_buf(), success));
    });
    (callback, rx)
}

// ============================================================================
// Scripted encoder
// ============================================================================

enum Output {
    Unit {
        data: Vec<u8>,
        flags: FrameFlags,
        timestamp_us: i64,
    },
    Format(TrackFormat),
    Status(i32),
}

#[derive(Default)]
struct FeedState {
    queue: VecDeque<Output>,
    released: Vec<usize>,
}

/// Producer side of a `ScriptedEncoder`, usable from any thread
#[derive(Clone, Default)]
pub struct EncoderFeed {
    state: Arc<Mutex<FeedState>>,
}

impl EncoderFeed {
    pub fn push_frame(&self, data: Vec<u8>, flags: FrameFlags, timestamp_us: i64) {
        self.state.lock().queue.push_back(Output::Unit {
            data,
            flags,
            timestamp_us,
        });
    }

    pub fn push_format(&self, format: TrackFormat) {
        self.state.lock().queue.push_back(Output::Format(format));
    }

    pub fn push_status(&self, status: i32) {
        self.state.lock().queue.push_back(Output::Status(status));
    }

    /// Outputs not yet dequeued
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Buffer ids given back by the drain, in order
    pub fn released(&self) -> Vec<usize> {
        self.state.lock().released.clone()
    }
}

/// Encoder stand-in that hands out whatever was queued on its feed
pub struct ScriptedEncoder {
    feed: EncoderFeed,
    held: Vec<u8>,
    next_buffer: usize,
}

impl ScriptedEncoder {
    pub fn with_feed() -> (Self, EncoderFeed) {
        let feed = EncoderFeed::default();
        let encoder = Self {
            feed: feed.clone(),
            held: Vec::new(),
            next_buffer: 0,
        };
        (encoder, feed)
    }
}

impl EncoderOutput for ScriptedEncoder {
    fn dequeue_output(&mut self) -> Dequeue<'_> {
        let next = self.feed.state.lock().queue.pop_front();
        match next {
            None => Dequeue::TryAgainLater,
            Some(Output::Format(format)) => Dequeue::FormatChanged(format),
            Some(Output::Status(status)) => Dequeue::Status(status),
            Some(Output::Unit {
                data,
                flags,
                timestamp_us,
            }) => {
                self.held = data;
                self.next_buffer += 1;
                Dequeue::Unit(EncodedUnit {
                    buffer_id: self.next_buffer,
                    data: &self.held,
                    flags,
                    timestamp_us,
                })
            }
        }
    }

    fn release_output(&mut self, buffer_id: usize) {
        self.feed.state.lock().released.push(buffer_id);
    }
}

// ============================================================================
// Recording muxer
// ============================================================================

/// A call made on a muxer opened by `RecordingMuxerFactory`
#[derive(Debug, Clone, PartialEq)]
pub enum MuxCall {
    Open(PathBuf),
    AddTrack,
    Start,
    Write {
        size: usize,
        flags: FrameFlags,
        timestamp_us: i64,
    },
    Stop,
    Release,
}

/// Opens muxers that log their calls into a shared list
#[derive(Clone, Default)]
pub struct RecordingMuxerFactory {
    calls: Arc<Mutex<Vec<MuxCall>>>,
    fail_start: bool,
    fail_write: bool,
    fail_stop: bool,
}

impl RecordingMuxerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start()` fail on every muxer opened from now on
    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Make every `write_sample()` fail. The call is still recorded.
    pub fn fail_write(mut self) -> Self {
        self.fail_write = true;
        self
    }

    /// Make every `stop()` fail. The call is still recorded.
    pub fn fail_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.calls.lock().clone()
    }
}

impl MuxerFactory for RecordingMuxerFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>> {
        self.calls.lock().push(MuxCall::Open(path.to_path_buf()));
        Ok(Box::new(RecordingMuxer {
            calls: self.calls.clone(),
            fail_start: self.fail_start,
            fail_write: self.fail_write,
            fail_stop: self.fail_stop,
        }))
    }
}

struct RecordingMuxer {
    calls: Arc<Mutex<Vec<MuxCall>>>,
    fail_start: bool,
    fail_write: bool,
    fail_stop: bool,
}

impl Muxer for RecordingMuxer {
    fn add_track(&mut self, _format: &TrackFormat) -> Result<TrackId> {
        self.calls.lock().push(MuxCall::AddTrack);
        Ok(TrackId(0))
    }

    fn start(&mut self) -> Result<()> {
        self.calls.lock().push(MuxCall::Start);
        if self.fail_start {
            return Err(MuxerError::Pipeline("start failed".into()));
        }
        Ok(())
    }

    fn write_sample(&mut self, _track: TrackId, data: &[u8], flags: FrameFlags, timestamp_us: i64) -> Result<()> {
        self.calls.lock().push(MuxCall::Write {
            size: data.len(),
            flags,
            timestamp_us,
        });
        if self.fail_write {
            return Err(MuxerError::Pipeline("write failed".into()));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.calls.lock().push(MuxCall::Stop);
        if self.fail_stop {
            return Err(MuxerError::Pipeline("stop failed".into()));
        }
        Ok(())
    }

    fn release(&mut self) {
        self.calls.lock().push(MuxCall::Release);
    }
}
