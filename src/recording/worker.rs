//! Persistence worker: a dedicated thread that runs save tasks
//!
//! The thread consumes commands from a channel and keeps a deadline queue of
//! scheduled tasks:
//! - `Schedule` queues a task to run at a given instant
//! - `Cancel` drops every pending run of a task
//! - `Shutdown` terminates whatever is still pending and exits
//!
//! Tasks reach the worker through a cloneable [`PersistenceHandle`], which also
//! owns the shared ring, the muxer factory and the scratch buffer used to copy
//! frames out of the ring.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, SendError, Sender};
use parking_lot::Mutex;

use super::scheduler::DeadlineQueue;
use super::{RingError, SaveCallback, SaveError, SharedRing, Task, TaskId};
use crate::encoding::TrackFormat;
use crate::muxing::{MuxSession, MuxerError, MuxerFactory};

/// Error type for worker thread management
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker thread is not running")]
    Disconnected,

    #[error("Worker thread panicked")]
    Panicked,
}

/// Messages sent to the worker thread
enum Command {
    Schedule { task: Arc<dyn Task>, at: Instant },
    Cancel(TaskId),
    Shutdown,
}

struct Shared {
    ring: SharedRing,
    /// Copy-out buffer for frames, grows to the largest frame and is reused
    scratch: Mutex<Vec<u8>>,
    commands: Sender<Command>,
    muxers: Arc<dyn MuxerFactory>,
    on_save: Option<SaveCallback>,
}

/// Cloneable access to the persistence worker for tasks and the application
#[derive(Clone)]
pub struct PersistenceHandle {
    inner: Arc<Shared>,
}

impl PersistenceHandle {
    pub fn ring(&self) -> &SharedRing {
        &self.inner.ring
    }

    /// Run `task` on the worker thread after `delay`. If the worker has
    /// already exited the task is terminated right away on the calling
    /// thread, so it still reports its outcome. Callers must not hold the
    /// task's own state lock.
    pub fn schedule(&self, task: Arc<dyn Task>, delay: Duration) {
        let at = Instant::now() + delay;
        let command = Command::Schedule { task, at };
        if let Err(SendError(Command::Schedule { task, .. })) = self.inner.commands.send(command) {
            log::warn!("Persistence worker is gone, terminating task {:?}", task.id());
            task.terminate();
        }
    }

    /// Drop pending runs of a task. A run already in progress is not affected.
    pub fn cancel(&self, id: TaskId) {
        let _ = self.inner.commands.send(Command::Cancel(id));
    }

    pub(crate) fn open_session(&self, path: &Path, format: &TrackFormat) -> Result<MuxSession, MuxerError> {
        MuxSession::open(self.inner.muxers.as_ref(), path, format)
    }

    /// Copy frames `[first, last)` into `session`, one frame at a time.
    ///
    /// The ring lock is held only while a frame is copied into the scratch
    /// buffer; the scratch lock is held for the whole range so concurrent
    /// range writes are serialized. Frames evicted before they are reached
    /// fail the write with `Overrun`.
    pub fn write_range(&self, first: usize, last: usize, session: &mut MuxSession) -> Result<usize, SaveError> {
        let mut scratch = self.inner.scratch.lock();
        let mut index = first;
        let mut written = 0usize;
        let mut prev_ts: Option<i64> = None;

        while index != last {
            let (meta, next) = {
                let ring = self.inner.ring.lock();
                let view = ring.get(index).map_err(|e| match e {
                    RingError::OutOfRange { .. } => SaveError::Overrun,
                    other => SaveError::Ring(other),
                })?;
                scratch.clear();
                scratch.extend_from_slice(view.data);
                (view.meta, ring.next(index))
            };

            // a recycled slot holds a newer frame than the ones after it
            if prev_ts.is_some_and(|prev| meta.timestamp_us <= prev) {
                return Err(SaveError::Overrun);
            }
            prev_ts = Some(meta.timestamp_us);

            session.write(&scratch, meta.flags, meta.timestamp_us)?;
            written += 1;
            index = next;
        }

        Ok(written)
    }

    /// Report a finished save
    pub(crate) fn report(&self, path: &Path, success: bool) {
        if success {
            log::info!("Saved {}", path.display());
        } else {
            log::info!("Failed to save {}", path.display());
        }
        if let Some(cb) = &self.inner.on_save {
            cb(path, success);
        }
    }
}

/// Owns the persistence thread. Dropping it shuts the thread down and joins it.
pub struct PersistenceWorker {
    handle: PersistenceHandle,
    thread: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    pub fn spawn(
        ring: SharedRing,
        muxers: Arc<dyn MuxerFactory>,
        on_save: Option<SaveCallback>,
    ) -> Result<Self, WorkerError> {
        let (sender, receiver) = unbounded::<Command>();

        let handle = PersistenceHandle {
            inner: Arc::new(Shared {
                ring,
                scratch: Mutex::new(Vec::new()),
                commands: sender,
                muxers,
                on_save,
            }),
        };

        let thread = std::thread::Builder::new()
            .name("rewind-persistence".into())
            .spawn(move || Self::worker_thread_main(receiver))?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    /// Terminate pending tasks, stop the thread and wait for it
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), WorkerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.handle.inner.commands.send(Command::Shutdown);
        thread.join().map_err(|_| WorkerError::Panicked)
    }

    fn worker_thread_main(receiver: Receiver<Command>) {
        log::debug!("Persistence worker started");
        let mut queue = DeadlineQueue::new();

        loop {
            let now = Instant::now();
            while let Some(task) = queue.pop_due(now) {
                task.perform();
            }

            let command = match queue.next_deadline() {
                Some(deadline) => receiver.recv_deadline(deadline),
                None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(Command::Schedule { task, at }) => queue.push(task, at),
                Ok(Command::Cancel(id)) => {
                    let removed = queue.cancel(id);
                    if removed > 0 {
                        log::debug!("Cancelled {} pending run(s) of task {:?}", removed, id);
                    }
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        // Terminate everything still pending, including tasks whose schedule
        // command arrived after the shutdown
        let mut pending = queue.drain();
        pending.extend(receiver.try_iter().filter_map(|command| match command {
            Command::Schedule { task, .. } => Some(task),
            _ => None,
        }));
        if !pending.is_empty() {
            log::info!("Terminating {} pending task run(s) on shutdown", pending.len());
        }
        for task in pending {
            task.terminate();
        }

        log::debug!("Persistence worker stopped");
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Persistence worker shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{FrameFlags, VideoCodec};
    use crate::recording::FrameRing;
    use crate::test_utils::{MuxCall, RecordingMuxerFactory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        id: TaskId,
        runs: AtomicUsize,
        terminated: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: TaskId::next(),
                runs: AtomicUsize::new(0),
                terminated: AtomicUsize::new(0),
            })
        }
    }

    impl Task for Counter {
        fn id(&self) -> TaskId {
            self.id
        }
        fn perform(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
        fn terminate(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
        fn is_finished(&self) -> bool {
            false
        }
    }

    fn spawn_worker(ring: SharedRing, factory: &RecordingMuxerFactory) -> PersistenceWorker {
        PersistenceWorker::spawn(ring, Arc::new(factory.clone()), None).unwrap()
    }

    fn filled_ring(frames: usize) -> SharedRing {
        let mut ring = FrameRing::with_capacity(10_000, 64, 30.0);
        ring.set_format(TrackFormat::new(VideoCodec::H264, 64, 64));
        for i in 0..frames {
            let flags = if i == 0 { FrameFlags::KEYFRAME } else { FrameFlags::NONE };
            ring.push_back(&[i as u8; 8], flags, i as i64 * 1_000).unwrap();
        }
        ring.into_shared()
    }

    #[test]
    fn scheduled_task_runs_after_delay() {
        let factory = RecordingMuxerFactory::new();
        let worker = spawn_worker(filled_ring(0), &factory);
        let task = Counter::new();
        worker.handle().schedule(task.clone(), Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let factory = RecordingMuxerFactory::new();
        let worker = spawn_worker(filled_ring(0), &factory);
        let task = Counter::new();
        let handle = worker.handle();
        handle.schedule(task.clone(), Duration::from_millis(100));
        handle.cancel(task.id());

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        drop(worker);
        assert_eq!(task.terminated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_terminates_pending_tasks() {
        let factory = RecordingMuxerFactory::new();
        let worker = spawn_worker(filled_ring(0), &factory);
        let task = Counter::new();
        worker.handle().schedule(task.clone(), Duration::from_secs(60));
        worker.shutdown().unwrap();

        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        assert_eq!(task.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduling_after_shutdown_terminates_the_task() {
        let factory = RecordingMuxerFactory::new();
        let worker = spawn_worker(filled_ring(0), &factory);
        let handle = worker.handle();
        worker.shutdown().unwrap();

        let task = Counter::new();
        handle.schedule(task.clone(), Duration::ZERO);
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        assert_eq!(task.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_range_copies_each_frame_once() {
        let factory = RecordingMuxerFactory::new();
        let ring = filled_ring(5);
        let worker = spawn_worker(ring.clone(), &factory);
        let handle = worker.handle();

        let (first, last, format) = {
            let ring = ring.lock();
            (ring.begin(), ring.end(), ring.format().cloned().unwrap())
        };
        let mut session = handle.open_session(Path::new("range.mp4"), &format).unwrap();
        assert_eq!(handle.write_range(first, last, &mut session).unwrap(), 5);
        session.finish().unwrap();

        let writes: Vec<_> = factory
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MuxCall::Write { timestamp_us, .. } => Some(timestamp_us),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![0, 1_000, 2_000, 3_000, 4_000]);
    }

    #[test]
    fn write_range_reports_evicted_frames() {
        let factory = RecordingMuxerFactory::new();
        let ring = filled_ring(5);
        let worker = spawn_worker(ring.clone(), &factory);
        let handle = worker.handle();

        let (first, last, format) = {
            let mut ring = ring.lock();
            let range = (ring.begin(), ring.end(), ring.format().cloned().unwrap());
            ring.clear();
            range
        };
        let mut session = handle.open_session(Path::new("gone.mp4"), &format).unwrap();
        let err = handle.write_range(first, last, &mut session).unwrap_err();
        assert!(matches!(err, SaveError::Overrun));
    }
}
