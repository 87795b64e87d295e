//! Lookup of jobs by ID.
//!
//! A job known to the node is registered here whatever its state, and must be
//! registered before anything replicates or queues it.
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::types::ids::JobId;
use crate::types::job::Job;

/// Returned by `JobRegistry::register` when the ID is taken. The rejected job
/// is handed back untouched; the caller decides what to do with it.
#[derive(Debug, thiserror::Error)]
#[error("job {} is already registered", .0.id)]
pub struct DuplicateId(pub Box<Job>);

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the job, never overwriting an existing registration.
    pub fn register(&mut self, job: Job) -> Result<&mut Job, DuplicateId> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(DuplicateId(Box::new(job))),
            Entry::Vacant(slot) => Ok(slot.insert(job)),
        }
    }

    pub fn lookup(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn lookup_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Removes the registration and hands the job back. Dropping it releases
    /// its body, node sets and queue reference.
    pub fn unregister(&mut self, id: &JobId) -> Option<Job> {
        self.jobs.remove(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
