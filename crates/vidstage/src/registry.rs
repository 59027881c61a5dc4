use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use crate::error::{JobError, JobResult};
use crate::key::JobKey;

/// Live state of one in-flight job
#[derive(Debug)]
pub struct JobEntry {
    pub started_at: DateTime<Utc>,
    /// f64 percent stored as bits
    progress: AtomicU64,
    cancel: CancellationToken,
}

impl JobEntry {
    fn new(cancel: CancellationToken) -> Self {
        JobEntry {
            started_at: Utc::now(),
            progress: AtomicU64::new(0f64.to_bits()),
            cancel,
        }
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn set_progress(&self, percent: f64) {
        self.progress.store(percent.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// In-process map of running jobs. Not durable: the lock file is.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<JobKey, Arc<JobEntry>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `key`. The returned handle unregisters on drop.
    pub fn register(&self, key: &JobKey) -> JobResult<JobHandle> {
        self.claim(key, CancellationToken::new())
    }

    /// Like `register`, but the job is also cancelled when `parent` is
    pub fn register_child(&self, key: &JobKey, parent: &CancellationToken) -> JobResult<JobHandle> {
        self.claim(key, parent.child_token())
    }

    fn claim(&self, key: &JobKey, cancel: CancellationToken) -> JobResult<JobHandle> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(key) {
            return Err(JobError::AlreadyProcessing(key.to_string()));
        }
        let entry = Arc::new(JobEntry::new(cancel));
        jobs.insert(key.clone(), entry.clone());
        debug!("{}: registered", key);

        Ok(JobHandle {
            key: key.clone(),
            entry,
            registry: self.clone(),
        })
    }

    pub fn is_registered(&self, key: &JobKey) -> bool {
        self.jobs.lock().contains_key(key)
    }

    pub fn progress(&self, key: &JobKey) -> Option<f64> {
        self.jobs.lock().get(key).map(|entry| entry.progress())
    }

    /// Signal cancellation to a running job. False if it is not registered.
    pub fn cancel(&self, key: &JobKey) -> bool {
        match self.jobs.lock().get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    fn unregister(&self, key: &JobKey, entry: &Arc<JobEntry>) {
        let mut jobs = self.jobs.lock();
        if jobs.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            jobs.remove(key);
            debug!("{}: unregistered", key);
        }
    }
}

/// Ownership of a registry slot for the duration of one job
#[derive(Debug)]
pub struct JobHandle {
    key: JobKey,
    entry: Arc<JobEntry>,
    registry: JobRegistry,
}

impl JobHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn entry(&self) -> &Arc<JobEntry> {
        &self.entry
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.entry.cancel.clone()
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, &self.entry);
    }
}
