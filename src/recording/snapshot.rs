//! Snapshot saves: write the last few seconds of the ring to a file, once
//!
//! The start of the clip is planned when the task is created, under the ring
//! lock, and snapped to a keyframe. The save itself runs on the persistence
//! worker after a settle delay so the frames captured around the request have
//! reached the ring. The end of the clip is whatever the ring holds at that
//! point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{duration_us, frames_in, FrameRing, PersistenceHandle, SaveError, Task, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOptions {
    /// Wait before saving, also added to the end of the clip
    pub settle_delay: Duration,
    /// Requested clip length
    pub span: Duration,
    /// Buffered history required before the clip start, on top of the settle delay
    pub min_margin: Duration,
    /// Shortest clip worth saving
    pub min_length: Duration,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            span: Duration::from_secs(3),
            min_margin: Duration::from_secs(1),
            min_length: Duration::from_secs(2),
        }
    }
}

impl SnapshotOptions {
    /// History that must precede the clip start so it is not evicted before the save runs
    pub fn required_margin(&self) -> Duration {
        self.min_margin + self.settle_delay
    }
}

struct State {
    first: usize,
    first_ts: i64,
    finished: bool,
}

pub struct SnapshotTask {
    id: TaskId,
    handle: PersistenceHandle,
    options: SnapshotOptions,
    file: PathBuf,
    state: Mutex<State>,
}

impl SnapshotTask {
    /// Plan a snapshot and schedule it on the persistence worker.
    ///
    /// If the ring cannot provide a clip the failure is reported through the
    /// save callback before this returns and nothing is scheduled.
    pub fn start(handle: &PersistenceHandle, options: SnapshotOptions, file: impl Into<PathBuf>) -> Arc<Self> {
        let file = file.into();
        let planned = {
            let ring = handle.ring().lock();
            plan(&ring, &options)
        };

        let (first, first_ts, finished) = match planned {
            Ok((first, first_ts)) => (first, first_ts, false),
            Err(e) => {
                e.log(&file);
                (0, 0, true)
            }
        };

        let task = Arc::new(Self {
            id: TaskId::next(),
            handle: handle.clone(),
            options,
            file,
            state: Mutex::new(State {
                first,
                first_ts,
                finished,
            }),
        });

        if finished {
            task.handle.report(&task.file, false);
        } else {
            log::debug!(
                "Snapshot {} starts at frame {} ({}us), saving in {:?}",
                task.file.display(),
                first,
                first_ts,
                task.options.settle_delay
            );
            task.handle.schedule(task.clone(), task.options.settle_delay);
        }
        task
    }

    pub fn file(&self) -> &std::path::Path {
        &self.file
    }

    fn save(&self, first: usize, first_ts: i64) -> Result<u64, SaveError> {
        let (last, format) = {
            let ring = self.handle.ring().lock();
            if !ring.contains(first) || ring.time_us(first)? != first_ts {
                return Err(SaveError::Overrun);
            }
            let last = ring.end();
            let span_us = ring.duration(first, last)?;
            let required_us = duration_us(self.options.min_length);
            if span_us < required_us {
                return Err(SaveError::SpanTooShort {
                    duration_us: span_us,
                    required_us,
                });
            }
            let format = ring.format().cloned().ok_or(SaveError::MissingFormat)?;
            (last, format)
        };

        let mut session = self.handle.open_session(&self.file, &format)?;
        self.handle.write_range(first, last, &mut session)?;
        Ok(session.finish()?)
    }
}

/// Find the clip start: a keyframe near `latest + settle - span` with enough
/// history before it. Returns its index and timestamp.
fn plan(ring: &FrameRing, options: &SnapshotOptions) -> Result<(usize, i64), SaveError> {
    if ring.is_empty() {
        return Err(SaveError::BufferEmpty);
    }

    let latest = ring.time_us(ring.prev(ring.end()))?;
    let target = latest + duration_us(options.settle_delay) - duration_us(options.span);
    let near = ring.find_by_time(ring.begin(), ring.end(), target)?;
    let first = ring.find_i_frame(near)?;
    if !ring.is_i_frame(first)? {
        return Err(SaveError::NoKeyframe);
    }

    let required = options.required_margin();
    let required_us = duration_us(required);
    let required_frames = frames_in(required, ring.frame_rate());
    let margin_us = ring.duration(ring.begin(), first)?;
    let frames = ring.frame_count(ring.begin(), first)?;
    if margin_us < required_us || frames < required_frames {
        return Err(SaveError::InsufficientMargin {
            margin_us,
            frames,
            required_us,
            required_frames,
        });
    }

    Ok((first, ring.time_us(first)?))
}

impl Task for SnapshotTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn perform(&self) {
        let result = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            self.save(state.first, state.first_ts)
        };

        match result {
            Ok(frames) => {
                log::debug!("Snapshot {} wrote {} frames", self.file.display(), frames);
                self.handle.report(&self.file, true);
            }
            Err(e) => {
                e.log(&self.file);
                self.handle.report(&self.file, false);
            }
        }
    }

    fn terminate(&self) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
        }
        self.handle.cancel(self.id);
        log::debug!("Snapshot {} terminated before saving", self.file.display());
        self.handle.report(&self.file, false);
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::PersistenceWorker;
    use crate::test_utils::{h264_format, push_frames, save_events, MuxCall, RecordingMuxerFactory};

    fn ring_with(frames: usize) -> crate::recording::SharedRing {
        let mut ring = FrameRing::with_capacity(64 * 1024, 1024, 30.0);
        ring.set_format(h264_format());
        push_frames(&mut ring, 0, frames, 15, 16);
        ring.into_shared()
    }

    fn quick() -> SnapshotOptions {
        SnapshotOptions {
            settle_delay: Duration::from_millis(20),
            ..SnapshotOptions::default()
        }
    }

    #[test]
    fn empty_ring_fails_immediately() {
        let factory = RecordingMuxerFactory::new();
        let (on_save, saves) = save_events();
        let worker = PersistenceWorker::spawn(ring_with(0), Arc::new(factory.clone()), Some(on_save)).unwrap();

        let task = SnapshotTask::start(&worker.handle(), quick(), "empty.mp4");
        assert!(task.is_finished());
        assert_eq!(saves.try_recv().unwrap(), (PathBuf::from("empty.mp4"), false));
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn short_history_fails_before_scheduling() {
        // 2.9 s buffered, 3 s requested with a 0.5 s settle delay
        let factory = RecordingMuxerFactory::new();
        let (on_save, saves) = save_events();
        let ring = ring_with(88);
        assert_eq!(ring.lock().buffered_duration_us(), 87 * 33_333);
        let worker = PersistenceWorker::spawn(ring, Arc::new(factory.clone()), Some(on_save)).unwrap();

        let task = SnapshotTask::start(&worker.handle(), SnapshotOptions::default(), "short.mp4");
        assert!(task.is_finished());
        assert_eq!(saves.try_recv().unwrap(), (PathBuf::from("short.mp4"), false));

        std::thread::sleep(Duration::from_millis(700));
        assert!(saves.try_recv().is_err());
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn plan_reports_margin_shortfall() {
        let ring = ring_with(88);
        let err = plan(&ring.lock(), &SnapshotOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            SaveError::InsufficientMargin { required_us: 1_500_000, required_frames: 45, .. }
        ));
    }

    #[test]
    fn plan_snaps_to_nearest_keyframe() {
        // 6 s at 30 fps, keyframe every 15 frames; the target lands on frame 104
        let ring = ring_with(180);
        let (first, first_ts) = plan(&ring.lock(), &SnapshotOptions::default()).unwrap();
        assert_eq!(first, 105);
        assert_eq!(first_ts, 105 * 33_333);
    }

    #[test]
    fn saves_from_keyframe_to_newest_frame() {
        let factory = RecordingMuxerFactory::new();
        let (on_save, saves) = save_events();
        let worker = PersistenceWorker::spawn(ring_with(180), Arc::new(factory.clone()), Some(on_save)).unwrap();

        let task = SnapshotTask::start(&worker.handle(), quick(), "clip.mp4");
        assert!(!task.is_finished());
        let (path, success) = saves.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(path, PathBuf::from("clip.mp4"));
        assert!(success);
        assert!(task.is_finished());

        let writes: Vec<_> = factory
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MuxCall::Write { flags, timestamp_us, .. } => Some((flags, timestamp_us)),
                _ => None,
            })
            .collect();
        // a 20 ms settle puts the start right on the keyframe at frame 90
        assert_eq!(writes.len(), 90);
        assert!(writes[0].0.is_keyframe());
        assert_eq!(writes[0].1, 90 * 33_333);
        assert_eq!(writes[89].1, 179 * 33_333);
        assert_eq!(factory.calls().last(), Some(&MuxCall::Release));
    }

    #[test]
    fn terminate_before_settle_reports_once() {
        let factory = RecordingMuxerFactory::new();
        let (on_save, saves) = save_events();
        let worker = PersistenceWorker::spawn(ring_with(600), Arc::new(factory.clone()), Some(on_save)).unwrap();

        let options = SnapshotOptions {
            settle_delay: Duration::from_secs(5),
            span: Duration::from_secs(8),
            ..SnapshotOptions::default()
        };
        let task = SnapshotTask::start(&worker.handle(), options, "late.mp4");
        assert!(!task.is_finished());

        task.terminate();
        task.terminate();
        task.perform();

        assert_eq!(saves.try_recv().unwrap(), (PathBuf::from("late.mp4"), false));
        assert!(saves.try_recv().is_err());
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn evicted_start_fails_the_save() {
        let factory = RecordingMuxerFactory::new();
        let (on_save, saves) = save_events();
        let ring = ring_with(180);
        let worker = PersistenceWorker::spawn(ring.clone(), Arc::new(factory.clone()), Some(on_save)).unwrap();

        let options = SnapshotOptions {
            settle_delay: Duration::from_millis(200),
            ..SnapshotOptions::default()
        };
        let _task = SnapshotTask::start(&worker.handle(), options, "overrun.mp4");
        ring.lock().clear();

        let (_, success) = saves.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!success);
        assert!(factory.calls().is_empty());
    }

    /// Run a snapshot of 180 frames against `factory` and return the single
    /// reported outcome
    fn save_with(factory: &RecordingMuxerFactory, file: &str) -> (PathBuf, bool) {
        let (on_save, saves) = save_events();
        let worker = PersistenceWorker::spawn(ring_with(180), Arc::new(factory.clone()), Some(on_save)).unwrap();

        let _task = SnapshotTask::start(&worker.handle(), quick(), file);
        let outcome = saves.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.shutdown().unwrap();
        assert!(saves.try_recv().is_err());
        outcome
    }

    #[test]
    fn write_failure_closes_the_muxer_and_fails_once() {
        let factory = RecordingMuxerFactory::new().fail_write();
        assert_eq!(save_with(&factory, "broken.mp4"), (PathBuf::from("broken.mp4"), false));

        let calls = factory.calls();
        let writes = calls.iter().filter(|c| matches!(c, MuxCall::Write { .. })).count();
        assert_eq!(writes, 1);
        assert!(calls.contains(&MuxCall::Stop));
        assert_eq!(calls.last(), Some(&MuxCall::Release));
    }

    #[test]
    fn stop_failure_still_releases_and_fails_once() {
        let factory = RecordingMuxerFactory::new().fail_stop();
        assert_eq!(save_with(&factory, "unfinished.mp4"), (PathBuf::from("unfinished.mp4"), false));

        let calls = factory.calls();
        assert_eq!(calls.iter().filter(|c| **c == MuxCall::Stop).count(), 1);
        assert_eq!(calls.last(), Some(&MuxCall::Release));
    }
}
