// Muxer contract used by the persistence tasks
//
// A muxer is driven strictly in this order:
//   open(path) -> add_track(format) -> start() -> write_sample()* -> stop() -> release()
// MuxSession wraps an opened muxer and makes sure the tail of that sequence
// runs on every path, including failures part way through.

pub mod elementary;
#[cfg(feature = "gstreamer")]
pub mod gst;

pub use elementary::{ElementaryMuxer, ElementaryMuxerFactory};
#[cfg(feature = "gstreamer")]
pub use gst::{GstMuxer, GstMuxerFactory};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::encoding::{ContainerFormat, FrameFlags, TrackFormat};

/// Error type for muxer operations
#[derive(Debug, thiserror::Error)]
pub enum MuxerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Muxer used out of order: {0}")]
    InvalidState(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Track format has not been set")]
    MissingFormat,
}

pub type Result<T> = std::result::Result<T, MuxerError>;

/// Track handle returned by `Muxer::add_track()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub usize);

/// Packages samples into an output file
pub trait Muxer: Send {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackId>;

    fn start(&mut self) -> Result<()>;

    fn write_sample(
        &mut self,
        track: TrackId,
        data: &[u8],
        flags: FrameFlags,
        timestamp_us: i64,
    ) -> Result<()>;

    /// Finalize the file. Only valid after `start()`.
    fn stop(&mut self) -> Result<()>;

    /// Free resources. Always called last, whether or not `stop()` succeeded.
    fn release(&mut self) {}
}

/// Opens muxers for output files
pub trait MuxerFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>>;
}

/// Pick the muxer factory for `container`. Containers other than the
/// elementary stream need the `gstreamer` feature; without it clips are
/// written as elementary streams.
pub fn factory_for(container: ContainerFormat) -> Result<Arc<dyn MuxerFactory>> {
    match container {
        ContainerFormat::Elementary => Ok(Arc::new(ElementaryMuxerFactory)),
        #[cfg(feature = "gstreamer")]
        other => Ok(Arc::new(GstMuxerFactory::new(other)?)),
        #[cfg(not(feature = "gstreamer"))]
        other => {
            log::warn!("{:?} output needs the gstreamer feature, writing elementary streams", other);
            Ok(Arc::new(ElementaryMuxerFactory))
        }
    }
}

/// An opened and started muxer with a single video track.
///
/// Dropping a session that was not finished stops and releases the muxer,
/// logging any error.
pub struct MuxSession {
    muxer: Box<dyn Muxer>,
    track: TrackId,
    path: PathBuf,
    samples_written: u64,
    last_timestamp_us: Option<i64>,
    closed: bool,
}

impl MuxSession {
    /// Open `path`, add the track and start the muxer
    pub fn open(factory: &dyn MuxerFactory, path: &Path, format: &TrackFormat) -> Result<Self> {
        let mut muxer = factory.open(path)?;

        let track = match muxer.add_track(format) {
            Ok(track) => track,
            Err(e) => {
                muxer.release();
                return Err(e);
            }
        };
        if let Err(e) = muxer.start() {
            muxer.release();
            return Err(e);
        }

        log::debug!("Opened muxer for {}", path.display());

        Ok(Self {
            muxer,
            track,
            path: path.to_path_buf(),
            samples_written: 0,
            last_timestamp_us: None,
            closed: false,
        })
    }

    pub fn write(&mut self, data: &[u8], flags: FrameFlags, timestamp_us: i64) -> Result<()> {
        self.muxer.write_sample(self.track, data, flags, timestamp_us)?;
        self.samples_written += 1;
        self.last_timestamp_us = Some(timestamp_us);
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Timestamp of the most recent sample written, if any
    pub fn last_timestamp_us(&self) -> Option<i64> {
        self.last_timestamp_us
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop and release the muxer, returning the number of samples written
    pub fn finish(mut self) -> Result<u64> {
        self.closed = true;
        let result = self.muxer.stop();
        self.muxer.release();
        log::debug!(
            "Closed muxer for {} after {} samples",
            self.path.display(),
            self.samples_written
        );
        result.map(|_| self.samples_written)
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.muxer.stop() {
            log::warn!("Failed to stop muxer for {}: {}", self.path.display(), e);
        }
        self.muxer.release();
    }
}
