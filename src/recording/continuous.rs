//! Continuous capture: save everything from the start of the ring until the
//! task is terminated
//!
//! The task runs on the persistence worker once per chunk interval and appends
//! the frames produced since the previous run. The muxer is opened lazily on
//! the first run, which fails unless the ring holds frames beginning on a
//! keyframe.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{FrameRing, PersistenceHandle, RingError, SaveError, Task, TaskId};
use crate::encoding::TrackFormat;
use crate::muxing::MuxSession;

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousOptions {
    /// Interval between appends
    pub chunk: Duration,
}

impl Default for ContinuousOptions {
    fn default() -> Self {
        Self {
            chunk: Duration::from_secs(1),
        }
    }
}

/// Appends ring frames to an open session a range at a time.
///
/// Progress is tracked both by ring index and by timestamp. If frames were
/// evicted before they could be written, writing resumes at the next keyframe
/// newer than the last frame written.
pub(crate) struct IncrementalWriter {
    session: MuxSession,
    cursor: usize,
    start_ts: i64,
}

impl IncrementalWriter {
    pub fn open(
        handle: &PersistenceHandle,
        path: &Path,
        format: &TrackFormat,
        first: usize,
        first_ts: i64,
    ) -> Result<Self, SaveError> {
        Ok(Self {
            session: handle.open_session(path, format)?,
            cursor: first,
            start_ts: first_ts,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.session.samples_written()
    }

    pub fn finish(self) -> Result<u64, SaveError> {
        Ok(self.session.finish()?)
    }

    /// First index to write, or `None` when there is nothing to write yet
    fn resume_point(&self, ring: &FrameRing) -> Result<Option<usize>, RingError> {
        if ring.is_empty() {
            return Ok(None);
        }

        let last_ts = self.session.last_timestamp_us();
        let resume_ts = last_ts.map_or(self.start_ts, |ts| ts + 1);
        let from = ring.find_by_time(ring.begin(), ring.end(), resume_ts)?;
        if ring.time_us(from)? < resume_ts {
            return Ok(None);
        }

        let contiguous = from == self.cursor
            && match last_ts {
                None => ring.time_us(from)? == self.start_ts,
                Some(last_ts) => from == ring.begin() || ring.time_us(ring.prev(from))? <= last_ts,
            };
        if contiguous {
            return Ok(Some(from));
        }

        let resume = ring.find_next_i_frame(from)?;
        match resume {
            Some(index) => log::warn!(
                "Frames were evicted before they reached {}, resuming at {}us",
                self.session.path().display(),
                ring.time_us(index)?
            ),
            None => log::debug!(
                "Frames were evicted before they reached {}, waiting for a keyframe",
                self.session.path().display()
            ),
        }
        Ok(resume)
    }

    /// Write from the resume point up to the bound returned by `bound`, which
    /// runs under the ring lock. Returns the number of frames written.
    pub fn write_until<F>(&mut self, handle: &PersistenceHandle, bound: F) -> Result<usize, SaveError>
    where
        F: FnOnce(&FrameRing) -> Result<usize, SaveError>,
    {
        let range = {
            let ring = handle.ring().lock();
            match self.resume_point(&ring)? {
                Some(first) => {
                    let last = bound(&ring)?;
                    // a bound behind the resume point means there is nothing left to write
                    if ring.frame_count(first, last).is_ok() {
                        Some((first, last))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        let Some((first, last)) = range else {
            return Ok(0);
        };

        match handle.write_range(first, last, &mut self.session) {
            Ok(written) => {
                self.cursor = last;
                Ok(written)
            }
            Err(SaveError::Overrun) => {
                log::warn!(
                    "Ring overran the save to {}, will resync on the next pass",
                    self.session.path().display()
                );
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

struct State {
    writer: Option<IncrementalWriter>,
    finished: bool,
}

pub struct ContinuousTask {
    id: TaskId,
    this: Weak<ContinuousTask>,
    handle: PersistenceHandle,
    options: ContinuousOptions,
    file: PathBuf,
    state: Mutex<State>,
}

impl ContinuousTask {
    /// Create the task and schedule its first run one chunk from now
    pub fn start(handle: &PersistenceHandle, options: ContinuousOptions, file: impl Into<PathBuf>) -> Arc<Self> {
        let task = Arc::new_cyclic(|this| Self {
            id: TaskId::next(),
            this: this.clone(),
            handle: handle.clone(),
            options,
            file: file.into(),
            state: Mutex::new(State {
                writer: None,
                finished: false,
            }),
        });
        log::debug!("Continuous capture to {} started", task.file.display());
        task.handle.schedule(task.clone(), task.options.chunk);
        task
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn frames_written(&self) -> u64 {
        self.state
            .lock()
            .writer
            .as_ref()
            .map_or(0, IncrementalWriter::frames_written)
    }

    /// Open the output at the keyframe the ring begins with
    fn open_writer(&self) -> Result<IncrementalWriter, SaveError> {
        let (first, first_ts, format) = {
            let ring = self.handle.ring().lock();
            if ring.is_empty() {
                return Err(SaveError::BufferEmpty);
            }
            let head = ring.begin();
            let first = if ring.is_i_frame(head)? {
                head
            } else {
                let next = ring.next(head);
                if ring.contains(next) && ring.is_i_frame(next)? {
                    next
                } else {
                    return Err(SaveError::NoKeyframe);
                }
            };
            let format = ring.format().cloned().ok_or(SaveError::MissingFormat)?;
            (first, ring.time_us(first)?, format)
        };

        IncrementalWriter::open(&self.handle, &self.file, &format, first, first_ts)
    }

    fn tick(&self, state: &mut State) -> Result<(), SaveError> {
        if state.writer.is_none() {
            state.writer = Some(self.open_writer()?);
        }
        if let Some(writer) = state.writer.as_mut() {
            let written = writer.write_until(&self.handle, |ring| Ok(ring.end()))?;
            log::trace!("Appended {} frames to {}", written, self.file.display());
        }
        Ok(())
    }

    /// Write what is left and close the output
    fn flush(&self, state: &mut State) -> Result<u64, SaveError> {
        let ticked = self.tick(state);
        let writer = state.writer.take();
        ticked?;
        match writer {
            Some(writer) => writer.finish(),
            None => Ok(0),
        }
    }
}

impl Task for ContinuousTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn perform(&self) {
        let failed = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            match self.tick(&mut state) {
                Ok(()) => false,
                Err(e) => {
                    e.log(&self.file);
                    state.finished = true;
                    state.writer = None;
                    true
                }
            }
        };

        if failed {
            self.handle.report(&self.file, false);
        } else if let Some(this) = self.this.upgrade() {
            self.handle.schedule(this, self.options.chunk);
        }
    }

    fn terminate(&self) {
        let success = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            match self.flush(&mut state) {
                Ok(frames) => {
                    log::debug!("Continuous capture to {} stopped after {} frames", self.file.display(), frames);
                    frames > 0
                }
                Err(e) => {
                    e.log(&self.file);
                    false
                }
            }
        };
        self.handle.cancel(self.id);
        self.handle.report(&self.file, success);
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}
