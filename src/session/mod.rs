// Capture session: ties the frame ring, the encoder drain and the persistence
// worker together for one recording run

pub mod storage;

pub use storage::*;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::encoding::{DrainError, DrainStats, EncodeDrainWorker, EncoderOutput, VideoCodec};
use crate::muxing::MuxerFactory;
use crate::recording::{
    BufferStatusCallback, ContinuousTask, EventTask, FrameRing, PersistenceHandle, PersistenceWorker,
    SaveCallback, SharedRing, SnapshotTask, WorkerError,
};

/// Error type for capture session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Drain error: {0}")]
    Drain(#[from] DrainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Callbacks into the application
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    /// Called once per save with the clip path and whether it succeeded
    pub on_save: Option<SaveCallback>,
    /// Called after every drain with the buffered duration in microseconds
    pub on_buffer_status: Option<BufferStatusCallback>,
}

/// One capture run: owns the ring and both worker threads.
///
/// Teardown stops the persistence worker first, terminating pending saves,
/// then the drain worker. The ring is released last.
pub struct CaptureSession<E: EncoderOutput + 'static> {
    config: Config,
    ring: SharedRing,
    persistence: Option<PersistenceWorker>,
    drain: Option<EncodeDrainWorker<E>>,
}

impl<E: EncoderOutput + 'static> CaptureSession<E> {
    pub fn start(
        config: Config,
        encoder: E,
        muxers: Arc<dyn MuxerFactory>,
        callbacks: SessionCallbacks,
    ) -> Result<Self> {
        let buffer = &config.buffer;
        let ring = FrameRing::new(buffer.bitrate_bps as f64, buffer.frame_rate, buffer.span_secs).into_shared();
        {
            let r = ring.lock();
            log::info!(
                "Frame ring: {} bytes, {} frame slots for {:.1}s at {} bps",
                r.data_capacity(),
                r.capacity(),
                buffer.span_secs,
                buffer.bitrate_bps
            );
        }

        let persistence = PersistenceWorker::spawn(ring.clone(), muxers, callbacks.on_save)?;
        let drain = EncodeDrainWorker::spawn(encoder, ring.clone(), callbacks.on_buffer_status)?;

        Ok(Self {
            config,
            ring,
            persistence: Some(persistence),
            drain: Some(drain),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    fn handle(&self) -> Result<PersistenceHandle> {
        self.persistence
            .as_ref()
            .map(PersistenceWorker::handle)
            .ok_or(SessionError::ShutDown)
    }

    /// Tell the session the encoder has been given a frame. Triggers a drain.
    pub fn frame_available_soon(&self) -> Result<()> {
        let drain = self.drain.as_ref().ok_or(SessionError::ShutDown)?;
        drain.frame_available_soon()?;
        Ok(())
    }

    pub fn drain_stats(&self) -> DrainStats {
        self.drain.as_ref().map(EncodeDrainWorker::stats).unwrap_or_default()
    }

    pub fn buffered_duration_us(&self) -> i64 {
        self.ring.lock().buffered_duration_us()
    }

    /// Path for a new clip in the storage folder
    pub fn output_path(&self, prefix: &str) -> Result<PathBuf> {
        let codec = self
            .ring
            .lock()
            .format()
            .map(|f| f.codec)
            .unwrap_or(VideoCodec::H264);
        let extension = self.config.container.extension(codec);
        Ok(clip_path(&self.config.storage_path, prefix, extension)?)
    }

    /// Save the last few seconds
    pub fn save_snapshot(&self) -> Result<Arc<SnapshotTask>> {
        let handle = self.handle()?;
        let path = self.output_path("snapshot")?;
        Ok(SnapshotTask::start(&handle, self.config.snapshot_options(), path))
    }

    /// Save from the newest keyframe onward until the task is terminated.
    /// Older frames are dropped so the ring starts on that keyframe.
    pub fn start_continuous(&self) -> Result<Arc<ContinuousTask>> {
        let handle = self.handle()?;
        {
            let mut ring = self.ring.lock();
            match ring.find_last_i_frame() {
                Some(keyframe) => {
                    if let Err(e) = ring.drop_before(keyframe) {
                        log::error!("Failed to trim ring before continuous capture: {}", e);
                    }
                }
                None => ring.clear(),
            }
        }
        let path = self.output_path("continuous")?;
        Ok(ContinuousTask::start(&handle, self.config.continuous_options(), path))
    }

    /// Save around an event, see `EventTask::extend()` for later events
    pub fn start_event(&self) -> Result<Arc<EventTask>> {
        let handle = self.handle()?;
        let path = self.output_path("event")?;
        Ok(EventTask::start(&handle, self.config.event_options(), path))
    }

    /// Stop both workers and hand back the encoder
    pub fn shutdown(mut self) -> Result<E> {
        if let Some(persistence) = self.persistence.take() {
            persistence.shutdown()?;
        }
        let drain = self.drain.take().ok_or(SessionError::ShutDown)?;
        let encoder = drain.shutdown()?;
        log::info!("Capture session stopped");
        Ok(encoder)
    }
}

impl<E: EncoderOutput + 'static> Drop for CaptureSession<E> {
    fn drop(&mut self) {
        drop(self.persistence.take());
        drop(self.drain.take());
    }
}
