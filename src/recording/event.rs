//! Event capture: save the video around something interesting
//!
//! The clip starts `margin` before the newest frame at creation time and ends
//! `margin` after it. Calling `extend()` when another event happens pushes the
//! end out again. The task writes new frames once per chunk interval and
//! finishes by itself when the newest frame passes the planned end.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::continuous::IncrementalWriter;
use super::{duration_us, FrameRing, PersistenceHandle, SaveError, Task, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub struct EventOptions {
    /// Video kept before the first event and after the last one
    pub margin: Duration,
    /// Interval between appends
    pub chunk: Duration,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self {
            margin: Duration::from_secs(2),
            chunk: Duration::from_secs(1),
        }
    }
}

struct State {
    writer: Option<IncrementalWriter>,
    end_us: i64,
    finished: bool,
}

pub struct EventTask {
    id: TaskId,
    this: Weak<EventTask>,
    handle: PersistenceHandle,
    options: EventOptions,
    file: PathBuf,
    state: Mutex<State>,
}

fn latest_us(ring: &FrameRing) -> Result<i64, SaveError> {
    if ring.is_empty() {
        return Err(SaveError::BufferEmpty);
    }
    Ok(ring.time_us(ring.prev(ring.end()))?)
}

/// One past the frame nearest the planned end, or the ring end while the
/// newest frame has not reached it. The flag tells whether the end was reached.
fn end_bound(ring: &FrameRing, end_us: i64) -> Result<(usize, bool), SaveError> {
    if ring.is_empty() || latest_us(ring)? <= end_us {
        return Ok((ring.end(), false));
    }
    let last = ring.find_by_time(ring.begin(), ring.end(), end_us)?;
    Ok((ring.next(last), true))
}

impl EventTask {
    /// Plan the clip around the newest frame and schedule the first append.
    ///
    /// Failures are reported through the save callback before this returns.
    pub fn start(handle: &PersistenceHandle, options: EventOptions, file: impl Into<PathBuf>) -> Arc<Self> {
        let file = file.into();
        let opened = Self::open(handle, &options, &file);

        let (writer, end_us, finished) = match opened {
            Ok((writer, end_us)) => (Some(writer), end_us, false),
            Err(e) => {
                e.log(&file);
                (None, 0, true)
            }
        };

        let task = Arc::new_cyclic(|this| Self {
            id: TaskId::next(),
            this: this.clone(),
            handle: handle.clone(),
            options,
            file,
            state: Mutex::new(State {
                writer,
                end_us,
                finished,
            }),
        });

        if finished {
            task.handle.report(&task.file, false);
        } else {
            log::debug!("Event capture to {} planned to end at {}us", task.file.display(), end_us);
            task.handle.schedule(task.clone(), Duration::ZERO);
        }
        task
    }

    fn open(handle: &PersistenceHandle, options: &EventOptions, file: &Path) -> Result<(IncrementalWriter, i64), SaveError> {
        let margin_us = duration_us(options.margin);
        let (first, first_ts, end_us, format) = {
            let ring = handle.ring().lock();
            let now_us = latest_us(&ring)?;
            let near = ring.find_by_time(ring.begin(), ring.end(), now_us - margin_us)?;
            let first = ring.find_i_frame(near)?;
            if !ring.is_i_frame(first)? {
                return Err(SaveError::NoKeyframe);
            }
            let format = ring.format().cloned().ok_or(SaveError::MissingFormat)?;
            (first, ring.time_us(first)?, now_us + margin_us, format)
        };

        let writer = IncrementalWriter::open(handle, file, &format, first, first_ts)?;
        Ok((writer, end_us))
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Planned end of the clip in ring time
    pub fn end_us(&self) -> i64 {
        self.state.lock().end_us
    }

    /// Move the planned end to `margin` past the newest frame.
    ///
    /// Returns `false` if the task has already finished. An empty ring fails
    /// the task.
    pub fn extend(&self) -> bool {
        let failed = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            let latest = {
                let ring = self.handle.ring().lock();
                latest_us(&ring)
            };
            match latest {
                Ok(now_us) => {
                    state.end_us = now_us + duration_us(self.options.margin);
                    log::debug!("Event capture to {} extended to {}us", self.file.display(), state.end_us);
                    false
                }
                Err(e) => {
                    e.log(&self.file);
                    state.finished = true;
                    state.writer = None;
                    true
                }
            }
        };

        if failed {
            self.handle.cancel(self.id);
            self.handle.report(&self.file, false);
        }
        !failed
    }

    /// Append frames up to the planned end. Returns whether the end was reached.
    fn append(&self, state: &mut State) -> Result<bool, SaveError> {
        let end_us = state.end_us;
        let mut reached = false;
        if let Some(writer) = state.writer.as_mut() {
            writer.write_until(&self.handle, |ring| {
                let (last, done) = end_bound(ring, end_us)?;
                reached = done;
                Ok(last)
            })?;
        }
        Ok(reached)
    }

    fn close(state: &mut State) -> Result<u64, SaveError> {
        match state.writer.take() {
            Some(writer) => writer.finish(),
            None => Ok(0),
        }
    }
}

impl Task for EventTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn perform(&self) {
        let outcome = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            match self.append(&mut state) {
                Ok(false) => None,
                Ok(true) => {
                    state.finished = true;
                    match Self::close(&mut state) {
                        Ok(frames) => {
                            log::debug!("Event capture to {} finished after {} frames", self.file.display(), frames);
                            Some(frames > 0)
                        }
                        Err(e) => {
                            e.log(&self.file);
                            Some(false)
                        }
                    }
                }
                Err(e) => {
                    e.log(&self.file);
                    state.finished = true;
                    state.writer = None;
                    Some(false)
                }
            }
        };

        match outcome {
            None => {
                if let Some(this) = self.this.upgrade() {
                    self.handle.schedule(this, self.options.chunk);
                }
            }
            Some(success) => {
                self.handle.cancel(self.id);
                self.handle.report(&self.file, success);
            }
        }
    }

    fn terminate(&self) {
        let success = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            let appended = self.append(&mut state);
            let closed = Self::close(&mut state);
            match appended.and(closed) {
                Ok(frames) => frames > 0,
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
