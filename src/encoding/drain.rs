//! Encoder drain: moves encoded output from the encoder into the frame ring
//!
//! The encoder is polled without waiting until it reports that nothing is
//! ready. Codec configuration units are not stored as frames (the track format
//! carries them), payload units are appended to the ring under its lock, and
//! the first format change is recorded on the ring so muxers can be opened.
//!
//! `EncodeDrainWorker` runs the drain on its own thread. Producers call
//! `frame_available_soon()` once per submitted input frame; requests that pile
//! up while a drain is running are folded into the next one.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::{FrameFlags, TrackFormat};
use crate::recording::{BufferStatusCallback, RingError, SharedRing, WorkerError};

/// Error type for draining
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Drain worker has stopped")]
    Stopped,
}

/// One encoded output buffer, borrowed from the encoder until released
#[derive(Debug)]
pub struct EncodedUnit<'a> {
    pub buffer_id: usize,
    pub data: &'a [u8],
    pub flags: FrameFlags,
    pub timestamp_us: i64,
}

/// Result of polling the encoder for output
#[derive(Debug)]
pub enum Dequeue<'a> {
    /// Nothing is ready
    TryAgainLater,
    /// The output format is known or has changed
    FormatChanged(TrackFormat),
    /// Encoder-specific status code. Negative values are unexpected.
    Status(i32),
    Unit(EncodedUnit<'a>),
}

/// Output side of a video encoder
pub trait EncoderOutput: Send {
    /// Poll for the next output without waiting
    fn dequeue_output(&mut self) -> Dequeue<'_>;

    /// Give a buffer returned in `Dequeue::Unit` back to the encoder
    fn release_output(&mut self, buffer_id: usize);
}

/// Counters for everything drained so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainStats {
    pub frames: u64,
    pub bytes: u64,
    pub config_skipped: u64,
    /// Set when the drain worker stopped because of an error
    pub last_error: Option<String>,
}

/// What a single drain pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub frames: usize,
    pub bytes: usize,
    pub config_skipped: usize,
    pub end_of_stream: bool,
}

enum Step {
    Done,
    Format(TrackFormat),
    Status(i32),
    Unit {
        buffer_id: usize,
        pushed: Option<Result<usize, RingError>>,
        size: usize,
        end_of_stream: bool,
    },
}

/// Drains an encoder into a shared ring
pub struct EncoderDrain<E> {
    encoder: E,
    ring: SharedRing,
    stats: Arc<Mutex<DrainStats>>,
    format_seen: bool,
}

impl<E: EncoderOutput> EncoderDrain<E> {
    pub fn new(encoder: E, ring: SharedRing) -> Self {
        Self {
            encoder,
            ring,
            stats: Arc::new(Mutex::new(DrainStats::default())),
            format_seen: false,
        }
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    pub fn stats(&self) -> DrainStats {
        self.stats.lock().clone()
    }

    pub fn into_encoder(self) -> E {
        self.encoder
    }

    /// Pull everything the encoder has ready into the ring.
    ///
    /// Fails only when a frame cannot be stored at all (`FrameTooLarge`),
    /// which means the ring is sized wrong for the stream.
    pub fn drain(&mut self) -> Result<DrainReport, DrainError> {
        let mut report = DrainReport::default();

        loop {
            let step = match self.encoder.dequeue_output() {
                Dequeue::TryAgainLater => Step::Done,
                Dequeue::FormatChanged(format) => Step::Format(format),
                Dequeue::Status(status) => Step::Status(status),
                Dequeue::Unit(unit) => {
                    let pushed = if unit.flags.is_codec_config() || unit.data.is_empty() {
                        None
                    } else {
                        Some(self.ring.lock().push_back(unit.data, unit.flags, unit.timestamp_us))
                    };
                    Step::Unit {
                        buffer_id: unit.buffer_id,
                        pushed,
                        size: unit.data.len(),
                        end_of_stream: unit.flags.is_end_of_stream(),
                    }
                }
            };

            match step {
                Step::Done => break,
                Step::Format(format) => {
                    if self.format_seen {
                        log::warn!("Encoder format changed again, keeping the first one");
                    } else {
                        log::info!(
                            "Encoder output format: {} {}x{}",
                            format.codec.display_name(),
                            format.width,
                            format.height
                        );
                        self.ring.lock().set_format(format);
                        self.format_seen = true;
                    }
                }
                Step::Status(status) => {
                    if status < 0 {
                        log::warn!("Unexpected encoder status {}, ignoring", status);
                    } else {
                        log::trace!("Encoder status {}", status);
                    }
                }
                Step::Unit {
                    buffer_id,
                    pushed,
                    size,
                    end_of_stream,
                } => {
                    self.encoder.release_output(buffer_id);
                    match pushed {
                        None => report.config_skipped += 1,
                        Some(Ok(_)) => {
                            report.frames += 1;
                            report.bytes += size;
                        }
                        Some(Err(e)) => {
                            self.record(&report);
                            return Err(e.into());
                        }
                    }
                    if end_of_stream {
                        log::warn!("Encoder reached end of stream unexpectedly");
                        report.end_of_stream = true;
                        break;
                    }
                }
            }
        }

        self.record(&report);
        Ok(report)
    }

    fn record(&self, report: &DrainReport) {
        let mut stats = self.stats.lock();
        stats.frames += report.frames as u64;
        stats.bytes += report.bytes as u64;
        stats.config_skipped += report.config_skipped as u64;
    }
}

/// Messages sent to the drain thread
enum DrainMessage {
    Drain,
    Shutdown,
}

/// Owns an encoder and drains it on a dedicated thread
pub struct EncodeDrainWorker<E: EncoderOutput + 'static> {
    sender: Sender<DrainMessage>,
    thread: Option<JoinHandle<E>>,
    stats: Arc<Mutex<DrainStats>>,
}

impl<E: EncoderOutput + 'static> EncodeDrainWorker<E> {
    /// Start the drain thread. `on_status` receives the buffered duration in
    /// microseconds after every drain.
    pub fn spawn(encoder: E, ring: SharedRing, on_status: Option<BufferStatusCallback>) -> Result<Self, WorkerError> {
        let drain = EncoderDrain::new(encoder, ring);
        let stats = drain.stats.clone();
        let (sender, receiver) = unbounded::<DrainMessage>();

        let thread = std::thread::Builder::new()
            .name("rewind-encoder-drain".into())
            .spawn(move || Self::drain_thread_main(drain, receiver, on_status))?;

        Ok(Self {
            sender,
            thread: Some(thread),
            stats,
        })
    }

    /// Request a drain. Cheap, never blocks.
    pub fn frame_available_soon(&self) -> Result<(), DrainError> {
        self.sender.send(DrainMessage::Drain).map_err(|_| DrainError::Stopped)
    }

    pub fn stats(&self) -> DrainStats {
        self.stats.lock().clone()
    }

    /// Check if the drain thread has stopped on an error
    pub fn has_error(&self) -> Option<String> {
        self.stats.lock().last_error.clone()
    }

    /// Stop the thread and hand back the encoder
    pub fn shutdown(mut self) -> Result<E, WorkerError> {
        let _ = self.sender.send(DrainMessage::Shutdown);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| WorkerError::Panicked),
            None => Err(WorkerError::Disconnected),
        }
    }

    fn drain_thread_main(
        mut drain: EncoderDrain<E>,
        receiver: Receiver<DrainMessage>,
        on_status: Option<BufferStatusCallback>,
    ) -> E {
        log::debug!("Encoder drain started");

        while let Ok(DrainMessage::Drain) = receiver.recv() {
            // one pass empties the encoder, so queued requests add nothing
            let mut shutdown = false;
            for message in receiver.try_iter() {
                if let DrainMessage::Shutdown = message {
                    shutdown = true;
                    break;
                }
            }

            match drain.drain() {
                Ok(report) => {
                    if report.frames > 0 {
                        log::trace!("Drained {} frames ({} bytes)", report.frames, report.bytes);
                    }
                    if let Some(cb) = &on_status {
                        let buffered_us = drain.ring().lock().buffered_duration_us();
                        cb(buffered_us);
                    }
                }
                Err(e) => {
                    log::error!("Encoder drain stopped: {}", e);
                    drain.stats.lock().last_error = Some(e.to_string());
                    break;
                }
            }

            if shutdown {
                break;
            }
        }

        let stats = drain.stats();
        log::debug!(
            "Encoder drain finished: {} frames, {} bytes, {} config units skipped",
            stats.frames,
            stats.bytes,
            stats.config_skipped
        );
        drain.into_encoder()
    }
}

impl<E: EncoderOutput + 'static> Drop for EncodeDrainWorker<E> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.sender.send(DrainMessage::Shutdown);
            if thread.join().is_err() {
                log::error!("Encoder drain thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::VideoCodec;
    use crate::recording::FrameRing;
    use crate::test_utils::{h264_format, ScriptedEncoder};
    use std::time::Duration;

    fn ring() -> SharedRing {
        FrameRing::with_capacity(4096, 64, 30.0).into_shared()
    }

    #[test]
    fn drains_frames_and_skips_config() {
        let (encoder, feed) = ScriptedEncoder::with_feed();
        feed.push_format(h264_format());
        feed.push_frame(vec![0, 0, 0, 1, 0x67], FrameFlags::CODEC_CONFIG, 0);
        feed.push_frame(vec![1; 100], FrameFlags::KEYFRAME, 0);
        feed.push_frame(vec![2; 50], FrameFlags::NONE, 33_333);
        feed.push_frame(Vec::new(), FrameFlags::NONE, 40_000);

        let shared = ring();
        let mut drain = EncoderDrain::new(encoder, shared.clone());
        let report = drain.drain().unwrap();

        assert_eq!(report.frames, 2);
        assert_eq!(report.bytes, 150);
        assert_eq!(report.config_skipped, 2);
        assert!(!report.end_of_stream);

        let ring = shared.lock();
        assert_eq!(ring.len(), 2);
        assert!(ring.is_i_frame(ring.begin()).unwrap());
        assert_eq!(ring.format().map(|f| f.codec), Some(VideoCodec::H264));
        assert_eq!(feed.released().len(), 4);
        assert_eq!(feed.pending(), 0);
    }

    #[test]
    fn negative_status_is_ignored() {
        let (encoder, feed) = ScriptedEncoder::with_feed();
        feed.push_status(-3);
        feed.push_frame(vec![1; 10], FrameFlags::KEYFRAME, 0);

        let mut drain = EncoderDrain::new(encoder, ring());
        assert_eq!(drain.drain().unwrap().frames, 1);
    }

    #[test]
    fn end_of_stream_stops_the_pass() {
        let (encoder, feed) = ScriptedEncoder::with_feed();
        feed.push_frame(vec![1; 10], FrameFlags::KEYFRAME | FrameFlags::END_OF_STREAM, 0);
        feed.push_frame(vec![2; 10], FrameFlags::NONE, 33_333);

        let mut drain = EncoderDrain::new(encoder, ring());
        let report = drain.drain().unwrap();
        assert!(report.end_of_stream);
        assert_eq!(report.frames, 1);
        assert_eq!(feed.pending(), 1);

        // the next pass picks up where the last one stopped
        assert_eq!(drain.drain().unwrap().frames, 1);
    }

    #[test]
    fn second_format_change_keeps_the_first() {
        let (encoder, feed) = ScriptedEncoder::with_feed();
        feed.push_format(h264_format());
        feed.push_format(TrackFormat::new(VideoCodec::H265, 8, 8));

        let shared = ring();
        let mut drain = EncoderDrain::new(encoder, shared.clone());
        drain.drain().unwrap();
        assert_eq!(shared.lock().format().map(|f| f.codec), Some(VideoCodec::H264));
    }

    #[test]
    fn oversized_frame_fails_the_drain() {
        let (encoder, feed) = ScriptedEncoder::with_feed();
        feed.push_frame(vec![1; 10], FrameFlags::KEYFRAME, 0);
        feed.push_frame(vec![0; 5000], FrameFlags::NONE, 33_333);

        let mut drain = EncoderDrain::new(encoder, ring());
        let err = drain.drain().unwrap_err();
        assert!(matches!(err, DrainError::Ring(RingError::FrameTooLarge { size: 5000, .. })));
        assert_eq!(drain.stats().frames, 1);
        assert_eq!(feed.released().len(), 2);
    }

    #[test]
    fn worker_drains_on_request_and_reports_status() {
        let (encoder, feed) = ScriptedEncoder::with_feed();
        let shared = ring();
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        let on_status: BufferStatusCallback = Arc::new(move |us| {
            let _ = status_tx.send(us);
        });
        let worker = EncodeDrainWorker::spawn(encoder, shared.clone(), Some(on_status)).unwrap();

        for i in 0..10i64 {
            let flags = if i == 0 { FrameFlags::KEYFRAME } else { FrameFlags::NONE };
            feed.push_frame(vec![i as u8; 20], flags, i * 33_333);
            worker.frame_available_soon().unwrap();
        }

        let mut last = 0;
        while last < 9 * 33_333 {
            last = status_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(worker.stats().frames, 10);
        assert_eq!(shared.lock().len(), 10);

        let encoder = worker.shutdown().unwrap();
        drop(encoder);
    }

    #[test]
    fn worker_stops_after_oversized_frame() {
        let (encoder, feed) = ScriptedEncoder::with_feed();
        let worker = EncodeDrainWorker::spawn(encoder, ring(), None).unwrap();

        feed.push_frame(vec![0; 5000], FrameFlags::KEYFRAME, 0);
        worker.frame_available_soon().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.has_error().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.has_error().is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(worker.frame_available_soon(), Err(DrainError::Stopped)));
    }
}
