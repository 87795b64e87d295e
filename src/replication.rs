//! Copies jobs to peer nodes and tracks who holds them.
//!
//! Everything here is best effort: an unreachable peer only means fewer
//! copies, and deletion never guarantees every remote copy is gone.
use tracing::{debug, trace, warn};

use crate::cluster::{Cluster, ClusterMessage};
use crate::codec::{self, DecodeError};
use crate::queue::QueueTable;
use crate::registry::JobRegistry;
use crate::types::ids::{JobId, NodeId};
use crate::types::job::Job;
use crate::types::states::JobState;

#[derive(Debug)]
pub struct Coordinator<C> {
    cluster: C,
}

impl<C: Cluster> Coordinator<C> {
    pub fn new(cluster: C) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut C {
        &mut self.cluster
    }

    pub fn myself(&self) -> NodeId {
        *self.cluster.myself()
    }

    pub fn reachable_count(&self) -> usize {
        self.cluster.reachable_count()
    }

    /// Sends the job to up to `count` reachable peers that don't already have
    /// it, recording each in `nodes_delivered`. Returns how many copies left.
    pub fn propagate(
        &mut self,
        job: &mut Job,
        count: usize,
        ask_reply: bool,
    ) -> usize {
        let myself = self.myself();
        let targets: Vec<NodeId> = self
            .cluster
            .reachable_nodes()
            .into_iter()
            .filter(|node| *node != myself && !job.nodes_delivered.contains(node))
            .take(count)
            .collect();

        if targets.is_empty() {
            return 0;
        }

        // Receivers learn about every other copy from the record itself.
        job.nodes_delivered.extend(targets.iter().copied());
        let record = codec::encode(job);

        let mut sent = 0;
        for node in targets {
            let msg = ClusterMessage::ReplJob {
                record: record.clone(),
                ask_reply,
            };

            if self.cluster.send(&node, msg) {
                trace!(job_id = %job.id, %node, "replicated job");
                sent += 1;
            } else {
                debug!(job_id = %job.id, %node, "failed to replicate job");
                job.nodes_delivered.remove(&node);
            }
        }

        sent
    }

    /// Records a confirmation from `from`. Only peers the job was delivered
    /// to count; returns whether the confirmation was new.
    pub fn confirm(&self, job: &mut Job, from: NodeId) -> bool {
        if !job.nodes_delivered.contains(&from) {
            trace!(job_id = %job.id, node = %from, "ignoring stray confirmation");
            return false;
        }

        job.nodes_confirmed.insert(from)
    }

    /// Asks every node that may hold a copy of the job to drop it, then
    /// unregisters and frees the local copy. Calling this for a job that is
    /// already gone does nothing and returns false.
    pub fn delete_from_cluster(
        &mut self,
        registry: &mut JobRegistry,
        queues: &mut QueueTable,
        id: &JobId,
    ) -> bool {
        let Some(mut job) = registry.unregister(id) else {
            return false;
        };

        let myself = self.myself();
        for node in job.nodes_delivered.iter().filter(|n| **n != myself) {
            self.cluster.send(node, ClusterMessage::DelJob { id: *id });
        }

        release(queues, &mut job);
        debug!(job_id = %id, copies = job.nodes_delivered.len(), "deleted job from cluster");

        true
    }

    /// Stores a replica received from `from`, answering with a confirmation
    /// when asked. A replica we already hold only refreshes its delivered
    /// set.
    pub fn receive_replica(
        &mut self,
        registry: &mut JobRegistry,
        queues: &mut QueueTable,
        from: NodeId,
        record: &[u8],
        ask_reply: bool,
    ) -> Result<JobId, DecodeError> {
        let mut job = codec::decode(record)?;
        let id = job.id;
        let myself = self.myself();

        job.nodes_delivered.remove(&myself);
        job.nodes_delivered.insert(from);

        if let Some(known) = registry.lookup_mut(&id) {
            known.nodes_delivered.extend(job.nodes_delivered);
            known.nodes_delivered.remove(&myself);
        } else {
            job.queue = job.queue.map(|queue| queues.intern(queue.name()));
            job.state = JobState::Active;
            job.nodes_confirmed.clear();

            if let Err(error) = registry.register(job) {
                // Unreachable: the lookup above just failed.
                warn!(%error, "replica registration raced");
            }
            trace!(job_id = %id, node = %from, "stored replica");
        }

        if ask_reply {
            self.cluster.send(&from, ClusterMessage::GotJob { id });
        }

        Ok(id)
    }

    /// Drops the local copy of a job on request of another node.
    pub fn receive_deletion(
        &mut self,
        registry: &mut JobRegistry,
        queues: &mut QueueTable,
        id: &JobId,
    ) -> bool {
        match registry.unregister(id) {
            Some(mut job) => {
                release(queues, &mut job);
                trace!(job_id = %id, "deleted replica");
                true
            },
            None => false,
        }
    }
}

/// Takes an unregistered job out of its queue before it is dropped.
fn release(queues: &mut QueueTable, job: &mut Job) {
    queues.dequeue(job);
    job.state = JobState::Deleted;
    job.queue = None;
    queues.collect_garbage();
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::cluster::{Envelope, MemoryCluster};

    fn node(c: char) -> NodeId {
        c.to_string().repeat(40).parse().unwrap()
    }

    fn job() -> Job {
        let id = JobId::from_bytes(
            b"DIaaaaaaaa00000000000000000000000000000000003cSQ",
        )
        .unwrap();
        let mut job = Job::new(id, JobState::WaitRepl);
        job.repl = 3;
        job
    }

    struct Net {
        coordinator: Coordinator<MemoryCluster>,
        inboxes: Vec<(NodeId, mpsc::UnboundedReceiver<Envelope>)>,
    }

    fn net(peers: &[char]) -> Net {
        let mut cluster = MemoryCluster::new(node('a'));
        let inboxes = peers
            .iter()
            .map(|&c| {
                let (tx, rx) = mpsc::unbounded_channel();
                cluster.connect(node(c), tx);
                (node(c), rx)
            })
            .collect();

        Net {
            coordinator: Coordinator::new(cluster),
            inboxes,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<ClusterMessage> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.msg).collect()
    }

    #[test]
    fn test_propagate() {
        let mut net = net(&['b', 'c', 'd']);
        let mut job = job();

        assert_eq!(net.coordinator.propagate(&mut job, 2, true), 2);
        assert_eq!(
            job.nodes_delivered.iter().copied().collect::<Vec<_>>(),
            vec![node('b'), node('c')]
        );

        let msgs = drain(&mut net.inboxes[0].1);
        let [ClusterMessage::ReplJob { record, ask_reply }] = &msgs[..] else {
            panic!("unexpected messages {msgs:?}");
        };
        assert!(*ask_reply);
        let copy = codec::decode(record).unwrap();
        assert_eq!(copy.nodes_delivered, job.nodes_delivered);

        // Peers that already have it are skipped.
        assert_eq!(net.coordinator.propagate(&mut job, 2, false), 1);
        assert!(job.nodes_delivered.contains(&node('d')));
        assert!(drain(&mut net.inboxes[0].1).is_empty());
        assert_eq!(drain(&mut net.inboxes[2].1).len(), 1);

        assert_eq!(net.coordinator.propagate(&mut job, 2, false), 0);
    }

    #[test]
    fn test_propagate_tolerates_unreachable_peers() {
        let mut net = net(&['b', 'c']);
        let mut job = job();

        // 'c' hangs up after being counted as reachable.
        let (c, c_rx) = net.inboxes.pop().unwrap();
        drop(c_rx);
        net.coordinator.cluster_mut().set_reachable(&node('b'), false);

        assert_eq!(net.coordinator.propagate(&mut job, 2, true), 0);
        assert!(!job.nodes_delivered.contains(&c));
        assert!(job.nodes_delivered.is_empty());
    }

    #[test]
    fn test_confirm() {
        let net = net(&['b']);
        let mut job = job();
        job.nodes_delivered.insert(node('b'));

        assert!(net.coordinator.confirm(&mut job, node('b')));
        assert!(!net.coordinator.confirm(&mut job, node('b')));
        assert!(!net.coordinator.confirm(&mut job, node('z')));
        assert_eq!(job.nodes_confirmed.len(), 1);
    }

    #[test]
    fn test_delete_from_cluster_is_idempotent() {
        let mut net = net(&['b', 'c']);
        let mut registry = JobRegistry::new();
        let mut queues = QueueTable::new();

        let mut job = job();
        job.queue = Some(queues.intern(b"q"));
        net.coordinator.propagate(&mut job, 2, true);
        let id = job.id;
        registry.register(job).unwrap();
        for (_, rx) in &mut net.inboxes {
            drain(rx);
        }

        assert!(net
            .coordinator
            .delete_from_cluster(&mut registry, &mut queues, &id));
        assert!(!registry.contains(&id));
        assert!(!queues.contains(b"q"));
        for (_, rx) in &mut net.inboxes {
            assert_eq!(drain(rx), vec![ClusterMessage::DelJob { id }]);
        }

        assert!(!net
            .coordinator
            .delete_from_cluster(&mut registry, &mut queues, &id));
        for (_, rx) in &mut net.inboxes {
            assert!(drain(rx).is_empty());
        }
    }

    #[test]
    fn test_receive_replica() {
        let mut origin = net(&['b']);
        let mut job = job();
        job.queue = Some(crate::queue::Queue::detached(&b"q"[..]));
        origin.coordinator.propagate(&mut job, 1, true);
        let msgs = drain(&mut origin.inboxes[0].1);
        let [ClusterMessage::ReplJob { record, .. }] = &msgs[..] else {
            panic!("unexpected messages {msgs:?}");
        };

        // Now play node 'b', with 'a' as its peer.
        let mut cluster = MemoryCluster::new(node('b'));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        cluster.connect(node('a'), a_tx);
        let mut replica = Coordinator::new(cluster);
        let mut registry = JobRegistry::new();
        let mut queues = QueueTable::new();

        let id = replica
            .receive_replica(&mut registry, &mut queues, node('a'), record, true)
            .unwrap();
        assert_eq!(id, job.id);

        let stored = registry.lookup(&id).unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert_eq!(
            stored.nodes_delivered.iter().copied().collect::<Vec<_>>(),
            vec![node('a')]
        );
        assert_eq!(stored.queue.as_ref().unwrap().refcount(), 2);
        assert_eq!(drain(&mut a_rx), vec![ClusterMessage::GotJob { id }]);

        // A re-send is harmless.
        replica
            .receive_replica(&mut registry, &mut queues, node('a'), record, false)
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(drain(&mut a_rx).is_empty());

        assert!(replica.receive_deletion(&mut registry, &mut queues, &id));
        assert!(!replica.receive_deletion(&mut registry, &mut queues, &id));
        assert!(registry.is_empty());

        assert_eq!(
            replica.receive_replica(&mut registry, &mut queues, node('a'), b"\x01", true),
            Err(DecodeError::Truncated {
                needed: 4,
                available: 1
            })
        );
    }
}
