use std::time::Duration;

use replijob::cluster::{ClusterMessage, Envelope, MemoryCluster};
use replijob::codec;
use replijob::controller::{ConfirmPolicy, Node, NodeConfig};
use replijob::server::{NodeHandle, NodeTask};
use replijob::types::ids::{JobId, NodeId};
use replijob::types::protocol::{AddJobArgs, Command, JobInfo, Response};
use replijob::types::states::JobState;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A fully meshed in-process cluster. Only the first `running` nodes process
/// anything; the rest accept messages and never answer.
struct Mesh {
    ids: Vec<NodeId>,
    handles: Vec<NodeHandle>,
    idle: Vec<mpsc::UnboundedReceiver<Envelope>>,
    _stop: DropGuard,
}

fn mesh(n: usize, running: usize, confirm: ConfirmPolicy) -> Mesh {
    let ids: Vec<NodeId> = (0..n).map(|_| NodeId::random()).collect();
    let (inboxes, receivers): (Vec<_>, Vec<_>) =
        ids.iter().map(|_| mpsc::unbounded_channel()).unzip();

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    let mut idle = Vec::new();

    for (i, peers) in receivers.into_iter().enumerate() {
        if i >= running {
            idle.push(peers);
            continue;
        }

        let mut cluster = MemoryCluster::new(ids[i]);
        for (j, inbox) in inboxes.iter().enumerate() {
            if i != j {
                cluster.connect(ids[j], inbox.clone());
            }
        }

        let config = NodeConfig {
            confirm,
            ..NodeConfig::new(ids[i])
        };
        let (task, handle) = NodeTask::new(Node::new(config, cluster), peers);
        tokio::spawn(task.run(cancel.clone()));
        handles.push(handle);
    }

    Mesh {
        ids,
        handles,
        idle,
        _stop: cancel.drop_guard(),
    }
}

async fn add_job(node: &NodeHandle, args: AddJobArgs) -> Response {
    node.call(node.new_client(), Command::AddJob(args))
        .await
        .unwrap()
}

async fn show(node: &NodeHandle, id: &JobId) -> Option<JobInfo> {
    let command = Command::Show {
        id: id.as_bytes().to_vec(),
    };
    match node.call(node.new_client(), command).await.unwrap() {
        Response::Job(info) => Some(info),
        Response::NotFound => None,
        other => panic!("unexpected reply {other:?}"),
    }
}

/// Polls `node` until `check` holds for what it knows about `id`.
async fn eventually<F>(node: &NodeHandle, id: &JobId, check: F)
where
    F: Fn(Option<&JobInfo>) -> bool,
{
    for _ in 0..200 {
        if check(show(node, id).await.as_ref()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held for {id}");
}

fn replicated(replicate: i64, timeout: i64) -> AddJobArgs {
    AddJobArgs {
        replicate: Some(replicate),
        ..AddJobArgs::new("emails", "hello", timeout)
    }
}

#[tokio::test]
async fn test_synchronous_replication() {
    let mesh = mesh(2, 2, ConfirmPolicy::One);
    let (a, b) = (&mesh.handles[0], &mesh.handles[1]);

    let Response::Added { id } = add_job(a, replicated(2, 5000)).await else {
        panic!("job not added");
    };

    let origin = show(a, &id).await.unwrap();
    assert_eq!(origin.state, JobState::Queued);
    assert_eq!(origin.nodes_delivered, vec![mesh.ids[1]]);
    assert_eq!(origin.nodes_confirmed, vec![mesh.ids[1]]);
    assert_eq!(origin.queue, "emails");

    // The replica arrived before its confirmation did.
    let replica = show(b, &id).await.unwrap();
    assert_eq!(replica.state, JobState::Active);
    assert_eq!(replica.nodes_delivered, vec![mesh.ids[0]]);
    assert_eq!(replica.ctime, origin.ctime);
    assert_eq!(replica.body_len, 5);
}

#[tokio::test]
async fn test_asynchronous_replication() {
    let mesh = mesh(3, 3, ConfirmPolicy::All);
    let a = &mesh.handles[0];

    let mut args = replicated(3, 0);
    args.asynchronous = true;
    let Response::Added { id } = add_job(a, args).await else {
        panic!("job not added");
    };

    let origin = show(a, &id).await.unwrap();
    assert_eq!(origin.state, JobState::Queued);
    assert_eq!(origin.nodes_delivered.len(), 2);
    assert!(origin.asynchronous);

    for replica in &mesh.handles[1..] {
        eventually(replica, &id, |info| {
            info.is_some_and(|info| info.state == JobState::Active)
        })
        .await;
    }

    // Nobody was asked to confirm.
    assert!(show(a, &id).await.unwrap().nodes_confirmed.is_empty());
}

#[tokio::test]
async fn test_policy_decides_when_enough_is_enough() {
    // Node 'c' takes copies but never confirms them.
    let one = mesh(3, 2, ConfirmPolicy::One);
    assert!(matches!(
        add_job(&one.handles[0], replicated(3, 5000)).await,
        Response::Added { .. }
    ));

    let all = mesh(3, 2, ConfirmPolicy::All);
    assert!(matches!(
        add_job(&all.handles[0], replicated(3, 200)).await,
        Response::TimedOut
    ));
}

#[tokio::test]
async fn test_timeout_deletes_replicas() {
    let mut mesh = mesh(3, 2, ConfirmPolicy::All);
    let (a, b) = (&mesh.handles[0], &mesh.handles[1]);

    let pending = a
        .submit(a.new_client(), Command::AddJob(replicated(3, 300)))
        .await
        .unwrap();

    // The silent node 'c' tells us which job this is.
    let Some(Envelope {
        msg: ClusterMessage::ReplJob { record, .. },
        ..
    }) = mesh.idle[0].recv().await
    else {
        panic!("expected a replica");
    };
    let id = codec::decode(&record).unwrap().id;

    // While the producer waits, 'b' holds a replica too.
    eventually(b, &id, |info| info.is_some()).await;
    assert_eq!(
        show(a, &id).await.map(|info| info.state),
        Some(JobState::WaitRepl)
    );

    assert!(matches!(pending.await.unwrap(), Response::TimedOut));
    assert!(show(a, &id).await.is_none());
    eventually(b, &id, |info| info.is_none()).await;

    let Some(Envelope {
        msg: ClusterMessage::DelJob { id: deleted },
        ..
    }) = mesh.idle[0].recv().await
    else {
        panic!("expected a deletion");
    };
    assert_eq!(deleted, id);
}
