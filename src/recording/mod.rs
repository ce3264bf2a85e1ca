// Recording modules: the frame ring, the persistence worker and the save
// tasks that run on it

pub mod continuous;
pub mod event;
pub mod ring;
pub mod scheduler;
pub mod snapshot;
pub mod worker;

pub use continuous::{ContinuousOptions, ContinuousTask};
pub use event::{EventOptions, EventTask};
pub use ring::{FrameMeta, FrameRing, FrameView, RingError, SharedRing};
pub use snapshot::{SnapshotOptions, SnapshotTask};
pub use worker::{PersistenceHandle, PersistenceWorker, WorkerError};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::muxing::MuxerError;

/// Called once per task with the output file and whether the save succeeded
pub type SaveCallback = Arc<dyn Fn(&Path, bool) + Send + Sync>;

/// Called after each drain with the buffered duration in microseconds
pub type BufferStatusCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// Identity of a scheduled task, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A unit of persistence work scheduled on the `PersistenceWorker`.
///
/// `perform()` runs on the worker thread, never concurrently with another
/// task. `terminate()` may be called from any thread; implementations take
/// the same task-local lock in both, so a terminate waits for an in-flight
/// perform to finish. Both are no-ops once the task has finished.
pub trait Task: Send + Sync {
    fn id(&self) -> TaskId;

    fn perform(&self);

    fn terminate(&self);

    fn is_finished(&self) -> bool;
}

/// Why a save did not produce a file. Reported through the `SaveCallback`
/// as a failure, never returned across the worker boundary.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("Buffer is empty")]
    BufferEmpty,

    #[error("No keyframe near the requested start")]
    NoKeyframe,

    #[error("Not enough buffered before the start: {margin_us}us / {frames} frames, need {required_us}us / {required_frames} frames")]
    InsufficientMargin {
        margin_us: i64,
        frames: usize,
        required_us: i64,
        required_frames: usize,
    },

    #[error("Clip is too short: {duration_us}us, need {required_us}us")]
    SpanTooShort { duration_us: i64, required_us: i64 },

    #[error("Track format has not been received from the encoder")]
    MissingFormat,

    #[error("Frames were evicted before they could be saved")]
    Overrun,

    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Muxer error: {0}")]
    Muxer(#[from] MuxerError),
}

impl SaveError {
    /// Log at a level matching how unexpected the failure is
    pub(crate) fn log(&self, path: &Path) {
        match self {
            SaveError::Ring(_) => log::error!("Save to {} hit a ring invariant: {}", path.display(), self),
            SaveError::Muxer(_) | SaveError::Overrun => {
                log::error!("Save to {} failed: {}", path.display(), self)
            }
            _ => log::warn!("Save to {} refused: {}", path.display(), self),
        }
    }
}

pub(crate) fn duration_us(duration: Duration) -> i64 {
    duration.as_micros().min(i64::MAX as u128) as i64
}

/// Minimum frame count expected in `duration` at `fps`
pub(crate) fn frames_in(duration: Duration, fps: f64) -> usize {
    (duration.as_secs_f64() * fps).floor().max(0.0) as usize
}
