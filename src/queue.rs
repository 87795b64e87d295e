//! The queue side of job admission: named queues shared by reference between
//! jobs, and the per-queue listing of admitted jobs.
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::types::ids::JobId;
use crate::types::job::Job;
use crate::types::states::JobState;

/// A reference-counted handle on a named queue. Each job holding one keeps
/// the queue alive; the count is released when the job is dropped.
#[derive(Clone, Eq, PartialEq)]
pub struct Queue(Arc<Bytes>);

impl Queue {
    /// Creates a handle not yet interned in any `QueueTable`, as produced when
    /// decoding a job record.
    pub fn detached(name: impl Into<Bytes>) -> Self {
        Self(Arc::new(name.into()))
    }

    pub fn name(&self) -> &[u8] {
        &self.0
    }

    /// Number of live handles on this queue, the table's own included.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Queue({})", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug)]
struct QueueEntry {
    handle: Queue,
    /// Admitted jobs, oldest creation time first.
    jobs: BTreeSet<(u64, JobId)>,
}

/// All the queues known to a node.
#[derive(Debug, Default)]
pub struct QueueTable {
    queues: HashMap<Bytes, QueueEntry>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a shared handle on the queue called `name`, creating it if
    /// needed.
    pub fn intern(&mut self, name: &[u8]) -> Queue {
        if let Some(entry) = self.queues.get(name) {
            return entry.handle.clone();
        }

        let name = Bytes::copy_from_slice(name);
        let handle = Queue::detached(name.clone());
        self.queues.insert(
            name,
            QueueEntry {
                handle: handle.clone(),
                jobs: BTreeSet::new(),
            },
        );

        handle
    }

    /// Makes the job visible to consumers of its queue. Jobs without a queue
    /// are left untouched.
    pub fn enqueue(&mut self, job: &mut Job, now_secs: u32) -> bool {
        let Some(name) = job.queue.as_ref().map(|q| q.name().to_vec()) else {
            return false;
        };

        // Replica copies carry detached handles: share the table's one.
        let queue = self.intern(&name);
        job.queue = Some(queue);
        job.state = JobState::Queued;
        job.qtime = now_secs;

        if let Some(entry) = self.queues.get_mut(name.as_slice()) {
            entry.jobs.insert((job.ctime, job.id));
        }

        trace!(job_id = %job.id, queue = %String::from_utf8_lossy(&name), "job queued");
        true
    }

    /// Takes the job out of its queue listing, if it was queued.
    pub fn dequeue(&mut self, job: &Job) -> bool {
        self.queues
            .get_mut(job.queue_name())
            .map(|entry| entry.jobs.remove(&(job.ctime, job.id)))
            .unwrap_or(false)
    }

    /// IDs of the jobs queued on `name`, oldest first.
    pub fn jobs(&self, name: &[u8]) -> Vec<JobId> {
        self.queues
            .get(name)
            .map(|entry| entry.jobs.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        self.queues.contains_key(name)
    }

    /// Forgets empty queues no job references any more.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.queues.len();
        self.queues.retain(|_, entry| {
            !entry.jobs.is_empty() || entry.handle.refcount() > 1
        });
        before - self.queues.len()
    }
}
