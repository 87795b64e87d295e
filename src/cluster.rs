//! The boundary with cluster membership and the inter-node transport.
use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::ids::{JobId, NodeId};

/// Messages exchanged between nodes about jobs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterMessage {
    /// A serialised job the receiver should keep a copy of. With `ask_reply`
    /// the receiver answers with `GotJob`.
    ReplJob { record: Bytes, ask_reply: bool },
    /// The sender holds a copy of the job.
    GotJob { id: JobId },
    /// The receiver should drop its copy of the job, if any.
    DelJob { id: JobId },
}

/// A message together with the node it came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub from: NodeId,
    pub msg: ClusterMessage,
}

/// What the job core needs from cluster membership and messaging.
pub trait Cluster {
    fn myself(&self) -> &NodeId;

    /// Peers currently believed reachable, this node excluded.
    fn reachable_nodes(&self) -> Vec<NodeId>;

    fn reachable_count(&self) -> usize {
        self.reachable_nodes().len()
    }

    /// Sends `msg` to `to`, returning false if it certainly didn't leave.
    /// Delivery is never guaranteed.
    fn send(&mut self, to: &NodeId, msg: ClusterMessage) -> bool;
}

#[derive(Debug)]
struct Peer {
    tx: mpsc::UnboundedSender<Envelope>,
    reachable: bool,
}

/// An in-process cluster: every peer is a channel feeding that peer's node.
#[derive(Debug)]
pub struct MemoryCluster {
    myself: NodeId,
    peers: BTreeMap<NodeId, Peer>,
}

impl MemoryCluster {
    pub fn new(myself: NodeId) -> Self {
        Self {
            myself,
            peers: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a reachable peer fed by `tx`.
    pub fn connect(&mut self, node: NodeId, tx: mpsc::UnboundedSender<Envelope>) {
        self.peers.insert(node, Peer { tx, reachable: true });
    }

    pub fn set_reachable(&mut self, node: &NodeId, reachable: bool) {
        if let Some(peer) = self.peers.get_mut(node) {
            peer.reachable = reachable;
        }
    }
}

impl Cluster for MemoryCluster {
    fn myself(&self) -> &NodeId {
        &self.myself
    }

    fn reachable_nodes(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.reachable && !peer.tx.is_closed())
            .map(|(node, _)| *node)
            .collect()
    }

    fn send(&mut self, to: &NodeId, msg: ClusterMessage) -> bool {
        let Some(peer) = self.peers.get(to).filter(|peer| peer.reachable) else {
            trace!(%to, "dropping message to unreachable node");
            return false;
        };

        peer.tx
            .send(Envelope {
                from: self.myself,
                msg,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(c: char) -> NodeId {
        c.to_string().repeat(40).parse().unwrap()
    }

    #[test]
    fn test_memory_cluster() {
        let mut cluster = MemoryCluster::new(node('a'));
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (c_tx, c_rx) = mpsc::unbounded_channel();
        cluster.connect(node('b'), b_tx);
        cluster.connect(node('c'), c_tx);

        assert_eq!(cluster.reachable_nodes(), vec![node('b'), node('c')]);

        let id = JobId::from_bytes(
            b"DIaaaaaaaa000000000000000000000000000000000000SQ",
        )
        .unwrap();
        assert!(cluster.send(&node('b'), ClusterMessage::GotJob { id }));
        assert_eq!(
            b_rx.try_recv().unwrap(),
            Envelope {
                from: node('a'),
                msg: ClusterMessage::GotJob { id },
            }
        );

        cluster.set_reachable(&node('b'), false);
        assert!(!cluster.send(&node('b'), ClusterMessage::DelJob { id }));
        assert!(b_rx.try_recv().is_err());
        assert_eq!(cluster.reachable_count(), 1);

        // A node that went away is no longer reachable.
        drop(c_rx);
        assert_eq!(cluster.reachable_count(), 0);
        assert!(!cluster.send(&node('c'), ClusterMessage::DelJob { id }));
        assert!(!cluster.send(&node('d'), ClusterMessage::DelJob { id }));
    }
}
