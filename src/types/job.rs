use std::collections::BTreeSet;

use bytes::Bytes;

use super::ids::{JobId, NodeId};
use super::states::JobState;
use crate::queue::Queue;

/// Delivery hints fixed when the job is created.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JobFlags(u8);

impl JobFlags {
    /// The producer didn't wait for replication to complete.
    pub const ASYNC: u8 = 1 << 0;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }
}

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub flags: JobFlags,
    /// Shared handle on the destination queue; dropping the job releases it.
    pub queue: Option<Queue>,
    pub body: Bytes,
    /// Requested replication factor, including this node.
    pub repl: u16,
    /// Creation time in nanoseconds since the epoch.
    pub ctime: u64,
    /// Expiry time in seconds since the epoch.
    pub etime: u32,
    /// Enqueue time in seconds since the epoch, 0 until queued.
    pub qtime: u32,
    /// Retry interval in seconds.
    pub rtime: u32,
    /// Peers that may hold a copy of this job.
    pub nodes_delivered: BTreeSet<NodeId>,
    /// Peers that acknowledged receiving their copy. Never serialised.
    pub nodes_confirmed: BTreeSet<NodeId>,
}

impl Job {
    /// Creates an empty job: only the ID and state are populated.
    pub fn new(id: JobId, state: JobState) -> Self {
        Self {
            id,
            state,
            flags: JobFlags::default(),
            queue: None,
            body: Bytes::new(),
            repl: 1,
            ctime: 0,
            etime: 0,
            qtime: 0,
            rtime: 0,
            nodes_delivered: BTreeSet::new(),
            nodes_confirmed: BTreeSet::new(),
        }
    }

    /// Creation time truncated to whole seconds.
    pub fn ctime_secs(&self) -> u32 {
        u32::try_from(self.ctime / 1_000_000_000).unwrap_or(u32::MAX)
    }

    /// Time to live in seconds, derived from the creation and expiry times.
    pub fn ttl(&self) -> u32 {
        self.etime.saturating_sub(self.ctime_secs())
    }

    pub fn queue_name(&self) -> &[u8] {
        self.queue.as_ref().map(Queue::name).unwrap_or_default()
    }
}
