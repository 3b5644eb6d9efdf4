//! Keyed, ordered job records with atomic patch and snapshot broadcast.
//!
//! All mutation funnels through [`JobStore::update`], which applies a patch
//! under the lock and then broadcasts the patched snapshot. SSE adapters and
//! the event-bus bridge subscribe to that channel; nothing else observes
//! intermediate state.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::model::{JobPatch, JobSnapshot, VideoJobRequest};

pub struct JobStore {
    jobs: Mutex<HashMap<String, JobSnapshot>>,
    updates: broadcast::Sender<JobSnapshot>,
}

impl JobStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        JobStore { jobs: Mutex::new(HashMap::new()), updates }
    }

    /// Receive every patched snapshot from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobSnapshot> {
        self.updates.subscribe()
    }

    /// Insert a fresh record. Returns the stored snapshot.
    pub fn save(&self, id: String, request: VideoJobRequest) -> JobSnapshot {
        let snapshot = JobSnapshot::new(id.clone(), request);
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.insert(id, snapshot.clone());
        drop(jobs);
        let _ = self.updates.send(snapshot.clone());
        snapshot
    }

    /// Insert a prebuilt record (sync-path parity).
    pub fn save_snapshot(&self, snapshot: JobSnapshot) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.insert(snapshot.id.clone(), snapshot.clone());
        drop(jobs);
        let _ = self.updates.send(snapshot);
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Apply `patch` atomically. Terminal records are frozen: patching them
    /// returns `None` and the stored record is untouched. Progress never
    /// moves backwards.
    pub fn update(&self, id: &str, patch: JobPatch) -> Option<JobSnapshot> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        let record = jobs.get_mut(id)?;
        if record.status.is_terminal() {
            tracing::debug!(job_id = id, status = %record.status, "patch rejected: terminal record");
            return None;
        }

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(percent) = patch.progress_percent {
            record.progress_percent = record.progress_percent.max(percent.min(100));
        }
        if let Some(step) = patch.current_step {
            record.current_step = Some(step);
        }
        if let Some(url) = patch.result_url {
            record.result_url = Some(url);
        }
        if let Some(size) = patch.file_size_bytes {
            record.file_size_bytes = Some(size);
        }
        if let Some(ms) = patch.processing_time_ms {
            record.processing_time_ms = Some(ms);
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        record.updated_at = Utc::now();

        let snapshot = record.clone();
        drop(jobs);
        let _ = self.updates.send(snapshot.clone());
        Some(snapshot)
    }

    /// Most recent jobs first.
    pub fn list(&self, limit: usize) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<JobSnapshot> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        all.truncate(limit);
        all
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails with `NotFound` when the id is unknown.
    pub fn require(&self, id: &str) -> Result<JobSnapshot, Error> {
        self.get(id).ok_or_else(|| Error::not_found("job", id))
    }
}

impl Default for JobStore {
    fn default() -> Self {
        JobStore::new()
    }
}
