//! Job admission: validates `ADDJOB`, creates and registers the job, drives
//! replication and decides when the job may enter its queue.
//!
//! Blocking the producer is not done here. When a job must wait for replicas
//! `Node::add_job` returns `AddJobOutcome::Blocked`, and whoever owns the
//! connection later calls `Node::admit` (enough confirmations) or
//! `Node::abandon` (timeout or disconnect).
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterMessage, Envelope};
use crate::id::{IdGenerator, RandomSource, Sha1Counter};
use crate::queue::QueueTable;
use crate::registry::{DuplicateId, JobRegistry};
use crate::replication::Coordinator;
use crate::types::ids::{JobId, NodeId};
use crate::types::job::{Job, JobFlags};
use crate::types::protocol::{AddJobArgs, JobInfo, Response};
use crate::types::states::JobState;

/// Longest replication timeout accepted, one year in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 365 * 24 * 3600 * 1000;

/// Why an `ADDJOB` was refused. No job exists when one of these is returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AddJobError {
    #[error("REPLICATE must be between 1 and 65535")]
    InvalidReplicate,
    #[error("TTL must be a number > 0")]
    InvalidTtl,
    #[error("RETRY count must be a non negative number")]
    InvalidRetry,
    #[error("timeout is negative")]
    NegativeTimeout,
    #[error("timeout must not exceed 31536000000 milliseconds")]
    TimeoutTooLarge,
    #[error(
        "REPLICATE > 1 and RETRY 0 is invalid. For at-most-once semantic \
         (RETRY 0) use REPLICATE 1"
    )]
    AtMostOnceConflict,
    #[error("Not enough reachable nodes for the requested replication level")]
    NoRepl,
    #[error("Internal error creating the job, check server logs")]
    Internal,
}

impl AddJobError {
    /// Error code prefixing the message on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            AddJobError::NoRepl => "NOREPL",
            _ => "ERR",
        }
    }
}

/// How many peer confirmations release a producer waiting on replication.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConfirmPolicy {
    /// Any single confirmation.
    #[default]
    One,
    /// Enough for a majority of the requested copies, counting our own.
    Majority,
    /// Every requested copy.
    All,
}

impl ConfirmPolicy {
    /// Confirmations needed for a job replicated `repl` times in total.
    pub fn required(self, repl: u16) -> usize {
        let peers = usize::from(repl).saturating_sub(1);
        let needed = match self {
            ConfirmPolicy::One => 1,
            ConfirmPolicy::Majority => usize::from(repl) / 2,
            ConfirmPolicy::All => peers,
        };
        needed.clamp(1, peers.max(1))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("expected one of: one, majority, all")]
pub struct BadConfirmPolicy;

impl FromStr for ConfirmPolicy {
    type Err = BadConfirmPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "one" => Ok(Self::One),
            "majority" => Ok(Self::Majority),
            "all" => Ok(Self::All),
            _ => Err(BadConfirmPolicy),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub confirm: ConfirmPolicy,
    /// REPLICATE when the producer doesn't say.
    pub default_replicate: u16,
    /// TTL in seconds when the producer doesn't say.
    pub default_ttl: u32,
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            confirm: ConfirmPolicy::default(),
            default_replicate: 3,
            default_ttl: 3600 * 24,
        }
    }
}

/// A validated `ADDJOB`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddJobRequest {
    pub queue: Vec<u8>,
    pub body: Bytes,
    /// `None` waits for replication forever.
    pub timeout: Option<Duration>,
    pub repl: u16,
    pub ttl: u32,
    pub retry: u32,
    pub asynchronous: bool,
}

impl AddJobRequest {
    pub fn validate(
        args: AddJobArgs,
        config: &NodeConfig,
    ) -> Result<Self, AddJobError> {
        let repl = match args.replicate {
            None => config.default_replicate,
            Some(n) => u16::try_from(n)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or(AddJobError::InvalidReplicate)?,
        };

        let ttl = match args.ttl {
            None => config.default_ttl,
            Some(n) => u32::try_from(n)
                .ok()
                .filter(|n| *n > 0)
                .ok_or(AddJobError::InvalidTtl)?,
        };

        let retry = match args.retry {
            None => None,
            Some(n) => {
                Some(u32::try_from(n).map_err(|_| AddJobError::InvalidRetry)?)
            },
        };

        let timeout = match u64::try_from(args.timeout) {
            Err(_) => return Err(AddJobError::NegativeTimeout),
            Ok(0) => None,
            Ok(ms) if ms > MAX_TIMEOUT_MS => {
                return Err(AddJobError::TimeoutTooLarge)
            },
            Ok(ms) => Some(Duration::from_millis(ms)),
        };

        // Replicating a job that will never be retried buys nothing.
        if repl > 1 && retry == Some(0) {
            return Err(AddJobError::AtMostOnceConflict);
        }

        Ok(Self {
            queue: args.queue,
            body: args.body.into(),
            timeout,
            repl,
            ttl,
            retry: retry.unwrap_or((ttl / 10).max(1)),
            asynchronous: args.asynchronous,
        })
    }
}

/// What became of an `ADDJOB`.
#[derive(Debug)]
pub enum AddJobOutcome {
    /// Reply straight away.
    Done(Response),
    /// The job waits for replicas; the producer must wait too, at most
    /// `timeout`.
    Blocked { id: JobId, timeout: Option<Duration> },
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

fn now_secs() -> u32 {
    u32::try_from(now().as_secs()).unwrap_or(u32::MAX)
}

/// The job state of one node.
#[derive(Debug)]
pub struct Node<C, R = Sha1Counter> {
    config: NodeConfig,
    ids: IdGenerator<R>,
    registry: JobRegistry,
    queues: QueueTable,
    coordinator: Coordinator<C>,
    prev_ctime: u64,
}

impl<C: Cluster> Node<C> {
    pub fn new(config: NodeConfig, cluster: C) -> Self {
        Self::with_source(config, cluster, Sha1Counter::from_entropy())
    }
}

impl<C: Cluster, R: RandomSource> Node<C, R> {
    pub fn with_source(config: NodeConfig, cluster: C, source: R) -> Self {
        Self {
            ids: IdGenerator::new(config.node_id, source),
            config,
            registry: JobRegistry::new(),
            queues: QueueTable::new(),
            coordinator: Coordinator::new(cluster),
            prev_ctime: 0,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn queues(&self) -> &QueueTable {
        &self.queues
    }

    pub fn cluster(&self) -> &C {
        self.coordinator.cluster()
    }

    pub fn cluster_mut(&mut self) -> &mut C {
        self.coordinator.cluster_mut()
    }

    /// Millisecond wall clock scaled to nanoseconds, bumped so that every job
    /// created by this node gets a strictly greater value than the last.
    fn next_ctime(&mut self) -> u64 {
        let millis = u64::try_from(now().as_millis()).unwrap_or(u64::MAX);
        let ctime = millis.saturating_mul(1_000_000).max(self.prev_ctime + 1);
        self.prev_ctime = ctime;
        ctime
    }

    /// Handles an `ADDJOB`.
    pub fn add_job(&mut self, args: AddJobArgs) -> AddJobOutcome {
        match self.try_add_job(args) {
            Ok(outcome) => outcome,
            Err(error) => {
                debug!(%error, "rejected job");
                AddJobOutcome::Done(Response::Rejected(error))
            },
        }
    }

    fn try_add_job(
        &mut self,
        args: AddJobArgs,
    ) -> Result<AddJobOutcome, AddJobError> {
        let req = AddJobRequest::validate(args, &self.config)?;
        let replicas = usize::from(req.repl) - 1;

        if replicas > self.coordinator.reachable_count() {
            return Err(AddJobError::NoRepl);
        }

        let mut job =
            Job::new(self.ids.generate(req.ttl.into()), JobState::WaitRepl);
        job.queue = Some(self.queues.intern(&req.queue));
        job.repl = req.repl;
        job.ctime = self.next_ctime();
        job.etime = job.ctime_secs().saturating_add(req.ttl);
        job.qtime = 0;
        job.rtime = req.retry;
        job.body = req.body;
        if req.asynchronous {
            job.flags = job.flags.with(JobFlags::ASYNC);
        }

        let id = job.id;
        let job = match self.registry.register(job) {
            Ok(job) => job,
            Err(DuplicateId(job)) => {
                warn!(job_id = %job.id, "ID already exists while adding job");
                return Err(AddJobError::Internal);
            },
        };

        if replicas > 0 {
            let sent = self.coordinator.propagate(job, replicas, !req.asynchronous);
            debug!(job_id = %id, requested = replicas, sent, "replicating job");
        }

        if replicas > 0 && !req.asynchronous {
            return Ok(AddJobOutcome::Blocked {
                id,
                timeout: req.timeout,
            });
        }

        self.queues.enqueue(job, now_secs());
        info!(job_id = %id, repl = req.repl, "job added");

        Ok(AddJobOutcome::Done(Response::Added { id }))
    }

    /// Queues a job that was waiting for replication. Returns the reply for
    /// its producer, or `None` if the job no longer exists.
    pub fn admit(&mut self, id: &JobId) -> Option<Response> {
        let job = self.registry.lookup_mut(id)?;

        if job.state == JobState::WaitRepl {
            self.queues.enqueue(job, now_secs());
            info!(
                job_id = %id,
                confirmed = job.nodes_confirmed.len(),
                "job added after replication"
            );
        }

        Some(Response::Added { id: *id })
    }

    /// Gives up on a job whose producer stopped waiting. Jobs still waiting
    /// for replication are deleted cluster-wide; returns whether that
    /// happened.
    pub fn abandon(&mut self, id: &JobId) -> bool {
        let waiting = self
            .registry
            .lookup(id)
            .is_some_and(|job| job.state == JobState::WaitRepl);

        if waiting {
            info!(job_id = %id, "replication not confirmed in time");
            self.coordinator
                .delete_from_cluster(&mut self.registry, &mut self.queues, id)
        } else {
            false
        }
    }

    /// Handles a message from another node. Returns the ID of a waiting job
    /// once it has collected enough confirmations.
    pub fn handle_peer(&mut self, envelope: Envelope) -> Option<JobId> {
        let Envelope { from, msg } = envelope;

        match msg {
            ClusterMessage::ReplJob { record, ask_reply } => {
                if let Err(error) = self.coordinator.receive_replica(
                    &mut self.registry,
                    &mut self.queues,
                    from,
                    &record,
                    ask_reply,
                ) {
                    warn!(%error, node = %from, "discarding bad replica");
                }
                None
            },
            ClusterMessage::GotJob { id } => {
                let job = self.registry.lookup_mut(&id)?;
                if job.state != JobState::WaitRepl {
                    return None;
                }

                self.coordinator.confirm(job, from);
                let required = self.config.confirm.required(job.repl);
                (job.nodes_confirmed.len() >= required).then_some(id)
            },
            ClusterMessage::DelJob { id } => {
                self.coordinator.receive_deletion(
                    &mut self.registry,
                    &mut self.queues,
                    &id,
                );
                None
            },
        }
    }

    /// Handles a `SHOW`.
    pub fn show(&self, id: &[u8]) -> Response {
        JobId::from_bytes(id)
            .and_then(|id| self.registry.lookup(&id))
            .map(|job| Response::Job(JobInfo::from(job)))
            .unwrap_or(Response::NotFound)
    }
}
