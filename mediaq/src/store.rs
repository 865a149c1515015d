//! Job Record Store.
//!
//! Authoritative in-memory table of all jobs. Every externally visible
//! mutation goes through [`JobStore::update`], which applies a mutation
//! atomically per job and optionally guards it with an expected status so a
//! late callback can never resurrect a job that moved on (e.g. was cancelled).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::domain::{Job, JobStatus};
use crate::{Error, Result};

/// In-memory job table keyed by job id.
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<String, Job>,
}

impl JobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new job. Fails if the id is already present.
    pub fn create(&self, job: Job) -> Result<Job> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateId(job.id)),
            Entry::Vacant(slot) => {
                trace!(job_id = %job.id, status = %job.status, "Job created");
                slot.insert(job.clone());
                Ok(job)
            }
        }
    }

    /// Get a copy of a job.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of every job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Snapshot of the jobs matching `predicate`, oldest first.
    pub fn list_where(&self, predicate: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Atomically apply `mutation` to a job.
    ///
    /// When `expected` is given and the current status differs, nothing is
    /// changed and [`Error::Conflict`] is returned. The mutation runs on a
    /// draft; if it returns an error the stored job is left untouched. A
    /// status change must be an edge of the job state machine.
    ///
    /// # Panics
    /// Panics if the mutation breaks the `retry_count <= max_retries`
    /// invariant, which indicates a bug in the caller.
    pub fn update<F>(&self, id: &str, expected: Option<JobStatus>, mutation: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;

        let current = entry.status;
        if let Some(expected) = expected
            && current != expected
        {
            return Err(Error::Conflict {
                id: id.to_string(),
                expected,
                actual: current,
            });
        }

        let mut draft = entry.clone();
        mutation(&mut draft)?;

        if draft.status != current && !current.can_transition_to(draft.status) {
            return Err(Error::InvalidStateTransition {
                from: current,
                to: draft.status,
            });
        }

        assert!(
            draft.retry_count <= draft.max_retries,
            "job {id}: retry_count {} exceeds max_retries {}",
            draft.retry_count,
            draft.max_retries
        );
        assert_eq!(draft.id, id, "job id is immutable");

        if draft.status != current {
            trace!(job_id = %id, from = %current, to = %draft.status, "Job transitioned");
        }

        *entry = draft;
        Ok(entry.value().clone())
    }

    /// Remove a job, returning it.
    pub fn delete(&self, id: &str) -> Option<Job> {
        self.jobs.remove(id).map(|(_, job)| job)
    }

    /// Remove every job matching `predicate`, returning the removed jobs.
    pub fn delete_where(&self, predicate: impl Fn(&Job) -> bool) -> Vec<Job> {
        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.key().clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.jobs.remove_if(&id, |_, job| predicate(job)))
            .map(|(_, job)| job)
            .collect()
    }

    /// Oldest job that is ready to be admitted at `now`.
    pub fn oldest_ready(&self, now: DateTime<Utc>) -> Option<Job> {
        self.jobs
            .iter()
            .filter(|e| e.value().is_ready(now))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|e| e.value().clone())
    }

    /// Number of jobs in `status`.
    pub fn count_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|e| e.status == status).count()
    }

    /// Total number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
