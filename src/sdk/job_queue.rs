//! Plugin-side Job Queue
//!
//! A fixed pool of workers pulling jobs from one bounded buffer. Every job is
//! announced on the stream as running before it is queued and always ends
//! with exactly one terminal `JobResult`. A job that panics is reported with
//! an `Error` message and a failed result; its worker keeps going.

use crate::protocol::{ErrorMessage, JobResult, PluginMessage, StreamSender};
use crate::sdk::error::{SdkError, SdkResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Pending jobs the queue holds before `push` refuses more
pub const QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProperties {
    pub id: String,
    pub description: String,
    /// Total runs allowed when the job returns an error; 0 behaves as 1
    pub max_retry: usize,
}

impl JobProperties {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            max_retry: 0,
        }
    }

    pub fn with_max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = max_retry;
        self
    }
}

/// A unit of plugin work
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn properties(&self) -> JobProperties;

    async fn run(&self) -> SdkResult<()>;
}

/// Job built from a closure returning a future
pub struct FnJob<F> {
    properties: JobProperties,
    work: F,
}

pub fn job_fn<F, Fut>(properties: JobProperties, work: F) -> FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SdkResult<()>> + Send + 'static,
{
    FnJob { properties, work }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SdkResult<()>> + Send + 'static,
{
    fn properties(&self) -> JobProperties {
        self.properties.clone()
    }

    async fn run(&self) -> SdkResult<()> {
        (self.work)().await
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    finished: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

pub struct JobQueue {
    tx: mpsc::Sender<Box<dyn Job>>,
    events: StreamSender<PluginMessage>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Start `max_concurrent` workers (at least one) reporting on `events`
    pub fn new(max_concurrent: usize, events: StreamSender<PluginMessage>) -> Self {
        let (tx, rx) = mpsc::channel::<Box<dyn Job>>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let idle = Arc::new(Notify::new());

        let workers = (0..max_concurrent.max(1))
            .map(|index| {
                tokio::spawn(worker(
                    index,
                    rx.clone(),
                    events.clone(),
                    counters.clone(),
                    idle.clone(),
                ))
            })
            .collect();

        Self {
            tx,
            events,
            counters,
            idle,
            workers: Mutex::new(workers),
        }
    }

    /// Announce `job` as running, then queue it
    pub fn push(&self, job: impl Job) -> SdkResult<()> {
        self.push_boxed(Box::new(job))
    }

    pub fn push_boxed(&self, job: Box<dyn Job>) -> SdkResult<()> {
        let props = job.properties();
        self.events.send(PluginMessage::JobResult(JobResult::running(
            &props.id,
            &props.description,
        )))?;
        self.counters.submitted.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = self.tx.try_send(job) {
            let error = match e {
                mpsc::error::TrySendError::Full(_) => SdkError::QueueFull {
                    capacity: QUEUE_CAPACITY,
                },
                mpsc::error::TrySendError::Closed(_) => SdkError::QueueClosed,
            };
            if let Err(e) = self.events.send(PluginMessage::JobResult(JobResult::finished(
                &props.id,
                &props.description,
                Some(error.to_string()),
            ))) {
                log::warn!("JobQueue: lost the failed result of job '{}': {}", props.id, e);
            }
            finish(&self.counters, &self.idle);
            return Err(error);
        }
        log::debug!("JobQueue: queued job '{}'", props.id);
        Ok(())
    }

    pub fn submitted(&self) -> usize {
        self.counters.submitted.load(Ordering::Acquire)
    }

    pub fn finished(&self) -> usize {
        self.counters.finished.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::Acquire)
    }

    /// Highest number of jobs seen running at once
    pub fn peak_running(&self) -> usize {
        self.counters.peak_running.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.finished() >= self.submitted()
    }

    /// Resolves once every submitted job has reached a terminal state
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the workers; jobs still queued are dropped
    pub fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            worker.abort();
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn finish(counters: &Counters, idle: &Notify) {
    counters.finished.fetch_add(1, Ordering::AcqRel);
    idle.notify_waiters();
}

async fn worker(
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>>,
    events: StreamSender<PluginMessage>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        let now_running = counters.running.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_running.fetch_max(now_running, Ordering::AcqRel);

        let props = job.properties();
        let failure = run_job(job.as_ref(), &props, &events).await;
        if let Some(message) = &failure {
            log::warn!("JobQueue[{}]: job '{}' failed: {}", index, props.id, message);
        }

        counters.running.fetch_sub(1, Ordering::AcqRel);
        let result = JobResult::finished(&props.id, &props.description, failure);
        if let Err(e) = events.send_waiting(PluginMessage::JobResult(result)).await {
            log::warn!("JobQueue[{}]: lost the result of job '{}': {}", index, props.id, e);
        }
        finish(&counters, &idle);
    }
    log::trace!("JobQueue[{}]: worker stopped", index);
}

/// Run a job to its terminal state; `Some` carries the failure message
async fn run_job(
    job: &dyn Job,
    props: &JobProperties,
    events: &StreamSender<PluginMessage>,
) -> Option<String> {
    let attempts = props.max_retry.max(1);
    for attempt in 1..=attempts {
        match AssertUnwindSafe(job.run()).catch_unwind().await {
            Ok(Ok(())) => return None,
            Ok(Err(e)) if attempt < attempts => {
                log::debug!(
                    "JobQueue: job '{}' attempt {}/{} failed, retrying: {}",
                    props.id,
                    attempt,
                    attempts,
                    e
                );
            }
            Ok(Err(e)) => return Some(e.to_string()),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "job panicked".to_string());
                let report = ErrorMessage::new(format!("job {} panicked: {}", props.id, detail));
                if let Err(e) = events.send_waiting(PluginMessage::Error(report)).await {
                    log::warn!("JobQueue: lost the panic report of job '{}': {}", props.id, e);
                }
                return Some(detail);
            }
        }
    }
    None
}
