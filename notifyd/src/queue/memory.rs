//! In-process job queue backend.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DeadLetter, Job, JobOptions, JobProcessor, JobQueue, JobState, QueueStats};
use crate::utils::time;
use crate::{Error, Result};

/// Configuration for the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Fallback poll interval for consumers, also bounds how late delayed
    /// jobs become visible.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct QueueInner {
    jobs: Mutex<HashMap<String, Job>>,
    notify: Notify,
    dead_letters: DashMap<u64, DeadLetter>,
    next_dead_letter_id: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    closed: AtomicBool,
}

impl QueueInner {
    /// Claim the best deliverable job for `job_name`: highest priority
    /// first, then oldest.
    fn dequeue(&self, job_name: &str) -> Option<Job> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();

        let id = jobs
            .values()
            .filter(|job| {
                job.name == job_name && job.state != JobState::Active && job.available_at <= now
            })
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|job| job.id.clone())?;

        let job = jobs.get_mut(&id)?;
        job.state = JobState::Active;
        Some(job.clone())
    }

    fn complete(&self, job_id: &str) {
        self.jobs.lock().remove(job_id);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn fail(&self, job_id: &str, err: &Error) {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };

        job.attempts_made += 1;
        job.last_error = Some(err.to_string());

        if err.is_permanent() || job.attempts_made >= job.max_attempts {
            let Some(job) = jobs.remove(job_id) else {
                return;
            };
            drop(jobs);
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.dead_letter(job, err.to_string());
            return;
        }

        let delay = job
            .backoff
            .map(|backoff| backoff.for_attempt(job.attempts_made))
            .unwrap_or_default();
        job.available_at = time::after(now, delay);
        job.state = if delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        warn!(
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts_made,
            max_attempts = job.max_attempts,
            ?delay,
            error = %err,
            "Job failed, scheduling redelivery"
        );
        drop(jobs);
        self.notify.notify_waiters();
    }

    fn dead_letter(&self, job: Job, error: String) {
        let id = self.next_dead_letter_id.fetch_add(1, Ordering::SeqCst);
        error!(
            job_id = %job.id,
            job_name = %job.name,
            attempts = job.attempts_made,
            error = %error,
            "Job dead-lettered"
        );
        self.dead_letters.insert(
            id,
            DeadLetter {
                id,
                attempts: job.attempts_made,
                created_at: job.created_at,
                dead_lettered_at: Utc::now(),
                error,
                job,
            },
        );
    }

    fn insert(&self, mut job: Job) -> Job {
        let now = Utc::now();
        job.state = if job.available_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let job = {
            let mut jobs = self.jobs.lock();
            if let Some(existing) = jobs.get(&job.id) {
                debug!(job_id = %job.id, "Job already queued, keeping existing");
                return existing.clone();
            }
            jobs.insert(job.id.clone(), job.clone());
            job
        };

        debug!(job_id = %job.id, job_name = %job.name, priority = job.priority, "Enqueued job");
        self.notify.notify_waiters();
        job
    }

    async fn run(&self, job: Job, processor: &Arc<dyn JobProcessor>) {
        let outcome = AssertUnwindSafe(processor.process(&job)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                debug!(job_id = %job.id, job_name = %job.name, "Job completed");
                self.complete(&job.id);
            }
            Ok(Err(e)) => self.fail(&job.id, &e),
            Err(_) => self.fail(&job.id, &Error::Other("job processor panicked".to_string())),
        }
    }
}

/// Job queue kept in process memory.
///
/// Jobs do not survive a restart. Consumers are woken on every add and poll
/// at `poll_interval` as a fallback.
pub struct InMemoryJobQueue {
    config: QueueConfig,
    inner: Arc<QueueInner>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                dead_letters: DashMap::new(),
                next_dead_letter_id: AtomicU64::new(1),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Look up a waiting, delayed or active job.
    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.lock().get(job_id).cloned()
    }

    /// Re-enqueue a dead letter with a fresh attempt budget.
    pub fn retry_dead_letter(&self, id: u64) -> Result<Job> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::queue("queue is closed"));
        }
        let (_, dead_letter) = self
            .inner
            .dead_letters
            .remove(&id)
            .ok_or_else(|| Error::queue(format!("dead letter {id} not found")))?;

        let mut job = dead_letter.job;
        job.attempts_made = 0;
        job.last_error = None;
        job.available_at = Utc::now();
        info!(dead_letter_id = id, job_id = %job.id, "Retrying dead letter");
        Ok(self.inner.insert(job))
    }

    /// Drop dead letters older than `retention`. Returns how many were removed.
    pub fn cleanup_dead_letters(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let before = self.inner.dead_letters.len();
        self.inner
            .dead_letters
            .retain(|_, entry| entry.dead_lettered_at > cutoff);
        before.saturating_sub(self.inner.dead_letters.len())
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn add(&self, job_name: &str, data: Value, options: JobOptions) -> Result<Job> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::queue("queue is closed"));
        }

        let now = Utc::now();
        let delay = options.delay.unwrap_or_default();
        let Some(available_at) = time::checked_after(now, delay) else {
            return Err(Error::validation(format!(
                "job delay of {} ms is out of range",
                delay.as_millis()
            )));
        };
        let job = Job {
            id: options.job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: job_name.to_string(),
            data,
            priority: options.priority,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff: options.backoff,
            state: JobState::Waiting,
            created_at: now,
            available_at,
            last_error: None,
        };

        Ok(self.inner.insert(job))
    }

    fn process(
        &self,
        job_name: &str,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::queue("queue is closed"));
        }

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return Err(Error::queue("queue is closed"));
        };

        let concurrency = concurrency.max(1);
        info!(job_name = %job_name, concurrency, "Starting queue consumers");

        for worker in 0..concurrency {
            let inner = self.inner.clone();
            let processor = processor.clone();
            let token = self.cancellation_token.clone();
            let job_name = job_name.to_string();
            let poll_interval = self.config.poll_interval;

            join_set.spawn(async move {
                debug!(job_name = %job_name, worker, "Queue consumer started");

                loop {
                    if token.is_cancelled() {
                        break;
                    }

                    if let Some(job) = inner.dequeue(&job_name) {
                        debug!(job_id = %job.id, job_name = %job_name, worker, "Processing job");
                        inner.run(job, &processor).await;
                        continue;
                    }

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = inner.notify.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                debug!(job_name = %job_name, worker, "Queue consumer stopped");
            });
        }

        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let mut stats = QueueStats {
            completed: self.inner.completed.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            dead_lettered: self.inner.dead_letters.len(),
            ..Default::default()
        };

        for job in self.inner.jobs.lock().values() {
            match job.state {
                JobState::Active => stats.active += 1,
                _ if job.available_at > now => stats.delayed += 1,
                _ => stats.waiting += 1,
            }
        }

        stats
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing job queue");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Job queue closed");
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut entries: Vec<DeadLetter> = self
            .inner
            .dead_letters
            .iter()
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}
