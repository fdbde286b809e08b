//! A pool of background threads that persist sticky records and analytics events off the request
//! path.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{Receiver, SyncSender, TrySendError},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use derive_more::From;
use rand::{thread_rng, Rng};

use crate::{
    models::{FeatureEvent, UserAssignment},
    repository::{Repository, RepositoryError, RepositoryResult},
    BackgroundWriterConfig, Error, Result,
};

/// A write to perform in the background.
#[derive(Debug, Clone, PartialEq, From)]
pub enum BackgroundTask {
    CreateUserAssignment(UserAssignment),
    TrackEvent(FeatureEvent),
}

impl BackgroundTask {
    fn kind(&self) -> &'static str {
        match self {
            BackgroundTask::CreateUserAssignment(_) => "user_assignment",
            BackgroundTask::TrackEvent(_) => "feature_event",
        }
    }

    fn run(&self, repository: &dyn Repository) -> RepositoryResult<()> {
        match self {
            BackgroundTask::CreateUserAssignment(assignment) => {
                match repository.create_user_assignment(assignment) {
                    // Another replica persisted the same decision first.
                    Err(RepositoryError::AlreadyExists) => Ok(()),
                    result => result,
                }
            }
            BackgroundTask::TrackEvent(event) => repository.create_feature_event(event),
        }
    }
}

/// Background writer threads fed by a bounded queue.
///
/// Submission never blocks: when the queue is full the task is dropped with a warning. Dropping
/// the writer closes the queue; workers finish what is queued and exit. Use
/// [`BackgroundWriter::shutdown`] to wait for that.
pub struct BackgroundWriter {
    /// `None` once shutdown has started.
    sender: Mutex<Option<SyncSender<BackgroundTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Number of workers that haven't exited yet.
    live: Arc<(Mutex<usize>, Condvar)>,
    shutdown_timeout: Duration,
}

#[derive(Clone)]
struct WorkerSettings {
    max_retries: u32,
    retry_backoff: Duration,
    retry_jitter: Duration,
}

impl BackgroundWriter {
    pub fn start(
        repository: Arc<dyn Repository>,
        config: BackgroundWriterConfig,
    ) -> Result<BackgroundWriter> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let live = Arc::new((Mutex::new(0usize), Condvar::new()));
        let settings = WorkerSettings {
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            retry_jitter: config.retry_jitter,
        };

        let writer = BackgroundWriter {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            live,
            shutdown_timeout: config.shutdown_timeout,
        };

        for index in 0..config.workers.max(1) {
            let handle = {
                let repository = Arc::clone(&repository);
                let receiver = Arc::clone(&receiver);
                let settings = settings.clone();
                let guard = LiveGuard::enter(Arc::clone(&writer.live));
                std::thread::Builder::new()
                    .name(format!("flagwise-writer-{index}"))
                    .spawn(move || {
                        let _guard = guard;
                        worker_loop(&*repository, &receiver, &settings);
                    })?
            };
            if let Ok(mut workers) = writer.workers.lock() {
                workers.push(handle);
            }
        }

        Ok(writer)
    }

    /// Queue `task` for writing.
    ///
    /// Returns [`Error::QueueFull`] if the task was dropped because the queue is full, and
    /// [`Error::WriterStopped`] after shutdown.
    pub fn submit(&self, task: impl Into<BackgroundTask>) -> Result<()> {
        let task = task.into();
        let sender = self.sender.lock().map_err(|_| Error::WorkerPanicked)?;
        let Some(sender) = sender.as_ref() else {
            return Err(Error::WriterStopped);
        };

        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                log::warn!(target: "flagwise",
                           task = task.kind();
                           "background queue is full, dropping task");
                Err(Error::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::WriterStopped),
        }
    }

    /// Stop accepting tasks and block until queued tasks are written.
    ///
    /// Waits at most the configured shutdown timeout. On timeout, returns
    /// [`Error::ShutdownTimedOut`] and leaves the remaining workers running detached. Calling this
    /// more than once is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        // Dropping the only sender makes `recv` fail once the queue is empty.
        let sender = self
            .sender
            .lock()
            .map_err(|_| Error::WorkerPanicked)?
            .take();
        if sender.is_none() {
            return Ok(());
        }
        drop(sender);
        log::debug!(target: "flagwise", "background writer shutting down");

        {
            let (lock, condvar) = &*self.live;
            let live = lock.lock().map_err(|_| Error::WorkerPanicked)?;
            let (live, wait) = condvar
                .wait_timeout_while(live, self.shutdown_timeout, |live| *live > 0)
                .map_err(|_| Error::WorkerPanicked)?;
            if wait.timed_out() && *live > 0 {
                log::warn!(target: "flagwise",
                           busy_workers = *live;
                           "background writer did not drain before shutdown timeout");
                return Err(Error::ShutdownTimedOut {
                    busy_workers: *live,
                });
            }
        }

        let handles = std::mem::take(&mut *self.workers.lock().map_err(|_| Error::WorkerPanicked)?);
        for handle in handles {
            handle.join().map_err(|_| Error::WorkerPanicked)?;
        }
        Ok(())
    }
}

fn worker_loop(
    repository: &dyn Repository,
    receiver: &Mutex<Receiver<BackgroundTask>>,
    settings: &WorkerSettings,
) {
    loop {
        // The lock is only held while waiting for the next task, not while writing it.
        let task = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(task) = task else {
            log::debug!(target: "flagwise", "background queue closed, worker exiting");
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            write_with_retry(repository, &task, settings)
        }));
        if outcome.is_err() {
            log::warn!(target: "flagwise",
                       task = task.kind();
                       "repository panicked while writing background task");
        }
    }
}

fn write_with_retry(repository: &dyn Repository, task: &BackgroundTask, settings: &WorkerSettings) {
    let mut attempt = 0;
    loop {
        match task.run(repository) {
            Ok(()) => return,
            Err(RepositoryError::Unavailable(message)) if attempt < settings.max_retries => {
                attempt += 1;
                log::debug!(target: "flagwise",
                            task = task.kind(),
                            attempt;
                            "background write failed, retrying: {message}");
                let backoff = settings.retry_backoff.saturating_mul(attempt);
                std::thread::sleep(jitter(backoff, settings.retry_jitter));
            }
            Err(err) => {
                log::warn!(target: "flagwise",
                           task = task.kind(),
                           attempt;
                           "dropping background task: {err}");
                return;
            }
        }
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval.saturating_add(thread_rng().gen_range(Duration::ZERO..jitter))
}

/// Counts a worker as live until it is dropped, including when the worker panics.
struct LiveGuard(Arc<(Mutex<usize>, Condvar)>);

impl LiveGuard {
    fn enter(live: Arc<(Mutex<usize>, Condvar)>) -> LiveGuard {
        if let Ok(mut count) = live.0.lock() {
            *count += 1;
        }
        LiveGuard(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.0;
        if let Ok(mut count) = lock.lock() {
            *count = count.saturating_sub(1);
        }
        condvar.notify_all();
    }
}
