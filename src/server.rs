//! The task owning a node's job state, and the connections feeding it.
//!
//! Exactly one `NodeTask` runs per node, so job state is only ever touched
//! from one place. Connections hold a `NodeHandle` and get their replies over
//! oneshot channels; a producer blocked on replication simply doesn't get its
//! reply until the job is confirmed, times out or the producer hangs up.
use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, instrument, trace, Span};

use crate::cluster::{Cluster, Envelope};
use crate::controller::{AddJobOutcome, Node};
use crate::id::{RandomSource, Sha1Counter};
use crate::line_reader::LineReader;
use crate::parser::ParsingError;
use crate::types::ids::JobId;
use crate::types::protocol::{Command, Response};
use crate::types::serialisable::WireSerialisable;
use crate::util::bytes_to_human_str;

pub type ClientId = u64;

#[derive(Debug)]
pub enum Request {
    Command {
        client: ClientId,
        command: Command,
        reply: oneshot::Sender<Response>,
    },
    /// The client went away; anything it was blocked on is abandoned.
    Disconnected { client: ClientId },
}

/// A cheap, cloneable way to talk to a running `NodeTask`.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    tx: mpsc::Sender<Request>,
    next_client: Arc<AtomicU64>,
}

impl NodeHandle {
    pub fn new_client(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Hands `command` to the node. The returned receiver resolves once the
    /// node has a reply, which for a blocked `ADDJOB` may take a while.
    /// Returns `None` if the node has stopped.
    pub async fn submit(
        &self,
        client: ClientId,
        command: Command,
    ) -> Option<oneshot::Receiver<Response>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Command {
                client,
                command,
                reply,
            })
            .await
            .ok()?;
        Some(rx)
    }

    pub async fn call(
        &self,
        client: ClientId,
        command: Command,
    ) -> Option<Response> {
        self.submit(client, command).await?.await.ok()
    }

    pub async fn disconnect(&self, client: ClientId) {
        // A stopped node has nothing left to clean up.
        let _ = self.tx.send(Request::Disconnected { client }).await;
    }
}

#[derive(Debug)]
struct Pending {
    client: ClientId,
    reply: oneshot::Sender<Response>,
    deadline: Option<delay_queue::Key>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Unblock {
    Confirmed,
    TimedOut,
    Disconnected,
}

enum Event {
    Request(Request),
    Peer(Envelope),
    Expired(JobId),
}

pub struct NodeTask<C, R = Sha1Counter> {
    node: Node<C, R>,
    requests: mpsc::Receiver<Request>,
    peers: mpsc::UnboundedReceiver<Envelope>,
    pending: HashMap<JobId, Pending>,
    blocked: HashMap<ClientId, JobId>,
    deadlines: DelayQueue<JobId>,
}

impl<C: Cluster, R: RandomSource> NodeTask<C, R> {
    /// Wraps `node`, which receives other nodes' messages on `peers`.
    pub fn new(
        node: Node<C, R>,
        peers: mpsc::UnboundedReceiver<Envelope>,
    ) -> (Self, NodeHandle) {
        let (tx, requests) = mpsc::channel(1024);

        let task = Self {
            node,
            requests,
            peers,
            pending: HashMap::new(),
            blocked: HashMap::new(),
            deadlines: DelayQueue::new(),
        };
        let handle = NodeHandle {
            tx,
            next_client: Arc::new(AtomicU64::new(1)),
        };

        (task, handle)
    }

    /// Processes requests, peer messages and deadlines until cancelled or
    /// every `NodeHandle` is dropped.
    #[instrument(name = "node", skip_all, fields(node = %self.node.config().node_id))]
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("node started");

        loop {
            let event = select! {
                _ = cancel.cancelled() => break,
                req = self.requests.recv() => match req {
                    Some(req) => Event::Request(req),
                    None => break,
                },
                Some(envelope) = self.peers.recv() => Event::Peer(envelope),
                Some(expired) = poll_fn(|cx| self.deadlines.poll_expired(cx)),
                    if !self.deadlines.is_empty() =>
                {
                    Event::Expired(expired.into_inner())
                },
            };

            match event {
                Event::Request(req) => self.handle_request(req),
                Event::Peer(envelope) => {
                    if let Some(id) = self.node.handle_peer(envelope) {
                        self.unblock(&id, Unblock::Confirmed);
                    }
                },
                Event::Expired(id) => self.unblock(&id, Unblock::TimedOut),
            }
        }

        debug!(blocked = self.pending.len(), "node stopped");
    }

    fn handle_request(&mut self, req: Request) {
        let (client, command, reply) = match req {
            Request::Command {
                client,
                command,
                reply,
            } => (client, command, reply),
            Request::Disconnected { client } => {
                if let Some(id) = self.blocked.remove(&client) {
                    self.unblock(&id, Unblock::Disconnected);
                }
                return;
            },
        };

        let response = match command {
            Command::AddJob(args) => match self.node.add_job(args) {
                AddJobOutcome::Done(response) => response,
                AddJobOutcome::Blocked { id, timeout } => {
                    let deadline =
                        timeout.map(|t| self.deadlines.insert(id, t));
                    trace!(job_id = %id, client, ?timeout, "blocking client");
                    self.pending.insert(
                        id,
                        Pending {
                            client,
                            reply,
                            deadline,
                        },
                    );
                    self.blocked.insert(client, id);
                    return;
                },
            },
            Command::Show { id } => self.node.show(&id),
            Command::Quit => Response::Bye,
        };

        // The client may already be gone.
        let _ = reply.send(response);
    }

    /// Releases the producer waiting on `id`. Later calls for the same job
    /// find nothing pending and do nothing.
    fn unblock(&mut self, id: &JobId, why: Unblock) {
        let Some(pending) = self.pending.remove(id) else {
            return;
        };
        self.blocked.remove(&pending.client);

        // An expired key has already left the queue.
        if let (Some(key), false) = (pending.deadline, why == Unblock::TimedOut)
        {
            self.deadlines.remove(&key);
        }

        let response = match why {
            Unblock::Confirmed => {
                self.node.admit(id).unwrap_or(Response::TimedOut)
            },
            Unblock::TimedOut | Unblock::Disconnected => {
                self.node.abandon(id);
                Response::TimedOut
            },
        };
        debug!(job_id = %id, client = pending.client, ?why, "unblocked client");

        let _ = pending.reply.send(response);
    }
}

/// Serves one client connection until it quits, hangs up or `cancel` fires.
#[instrument(name = "conn", skip_all, fields(client))]
pub async fn serve_conn<S>(
    node: NodeHandle,
    cancel: CancellationToken,
    stream: S,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client = node.new_client();
    Span::current().record("client", client);
    debug!("accepted connection");

    let ret = handle_conn(&node, client, &cancel, stream).await;

    // Whatever happened, don't leave a job waiting on us.
    node.disconnect(client).await;
    debug!("closed connection");

    ret
}

async fn handle_conn<S>(
    node: &NodeHandle,
    client: ClientId,
    cancel: &CancellationToken,
    stream: S,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (r, mut w) = tokio::io::split(stream);
    let mut r: LineReader<_> = r.into();

    // Lines that arrived while blocked, and whether the client has hung up.
    let mut backlog: VecDeque<Bytes> = VecDeque::new();
    let mut eof = false;

    loop {
        let line = match backlog.pop_front() {
            Some(line) => line,
            None if eof => return Ok(()),
            None => select! {
                x = r.read_line() => match x? {
                    Some(x) => x,
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            },
        };

        trace!(line = bytes_to_human_str(&line), "processing command");

        let cmd: Result<Command, ParsingError> = (&line as &[u8]).try_into();
        let (resp, quit) = match cmd {
            Err(error) => (error.serialise_wire(), false),
            Ok(cmd) => {
                let quit = cmd == Command::Quit;
                let Some(mut pending) = node.submit(client, cmd).await else {
                    return Ok(());
                };

                // Keep reading while the node works on it, so that a client
                // hanging up on a blocked ADDJOB is noticed.
                let resp = loop {
                    select! {
                        resp = &mut pending => match resp {
                            Ok(resp) => break resp,
                            Err(_) => return Ok(()),
                        },
                        x = r.read_line(), if !eof => match x? {
                            Some(line) => backlog.push_back(line),
                            None => {
                                eof = true;
                                node.disconnect(client).await;
                            },
                        },
                        _ = cancel.cancelled() => return Ok(()),
                    }
                };

                (resp.serialise_wire(), quit)
            },
        };

        select! {
            x = w.write_all(&resp) => x,
            _ = cancel.cancelled() => return Ok(()),
        }?;

        select! {
            x = w.flush() => x?,
            _ = cancel.cancelled() => return Ok(()),
        };

        if quit {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    use super::*;
    use crate::cluster::{ClusterMessage, MemoryCluster};
    use crate::codec;
    use crate::controller::NodeConfig;
    use crate::types::ids::NodeId;

    fn node(c: char) -> NodeId {
        c.to_string().repeat(40).parse().unwrap()
    }

    /// Starts node 'a' with a single peer 'b' that never answers, returning
    /// a connection to 'a' and the inbox of 'b'.
    fn start() -> (DuplexStream, mpsc::UnboundedReceiver<Envelope>) {
        let mut cluster = MemoryCluster::new(node('a'));
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        cluster.connect(node('b'), b_tx);

        let (_a_tx, a_rx) = mpsc::unbounded_channel();
        let (task, handle) =
            NodeTask::new(Node::new(NodeConfig::new(node('a')), cluster), a_rx);

        let cancel = CancellationToken::new();
        tokio::spawn(task.run(cancel.clone()));

        let (client, server) = duplex(4096);
        tokio::spawn(serve_conn(handle, cancel, server));

        (client, b_rx)
    }

    async fn read_reply(client: &mut DuplexStream) -> String {
        let mut buf = vec![0; 1024];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_replication_timeout() {
        let (mut client, mut b_rx) = start();

        client
            .write_all(b"ADDJOB q body 50 REPLICATE 2\r\n")
            .await
            .unwrap();

        let reply = read_reply(&mut client).await;
        assert_eq!(
            reply,
            "-TIMEOUT Timeout reached before replicating to the requested \
             number of nodes\r\n"
        );

        let Envelope {
            msg: ClusterMessage::ReplJob { record, ask_reply },
            ..
        } = b_rx.recv().await.unwrap()
        else {
            panic!("expected a replica");
        };
        assert!(ask_reply);
        let id = codec::decode(&record).unwrap().id;

        assert_eq!(
            b_rx.recv().await.unwrap().msg,
            ClusterMessage::DelJob { id }
        );

        // The job is gone from 'a' too.
        client
            .write_all(format!("SHOW {id}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, "$-1\r\n");
    }

    #[tokio::test]
    async fn test_hang_up_while_blocked() {
        let (mut client, mut b_rx) = start();

        // No deadline: only the hang-up can end this.
        client
            .write_all(b"ADDJOB q body 0 REPLICATE 2\r\n")
            .await
            .unwrap();

        let Envelope {
            msg: ClusterMessage::ReplJob { record, .. },
            ..
        } = b_rx.recv().await.unwrap()
        else {
            panic!("expected a replica");
        };
        let id = codec::decode(&record).unwrap().id;

        client.shutdown().await.unwrap();

        let deleted = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.msg, ClusterMessage::DelJob { id });
    }

    #[tokio::test]
    async fn test_huge_timeout_is_refused() {
        let (mut client, mut b_rx) = start();

        client
            .write_all(b"ADDJOB q body 9223372036854775807 REPLICATE 2\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_reply(&mut client).await,
            "-ERR timeout must not exceed 31536000000 milliseconds\r\n"
        );
        assert!(b_rx.try_recv().is_err());

        // The node is still serving.
        client.write_all(b"SHOW nope\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "$-1\r\n");

        // The longest timeout allowed still gets a deadline, cancelled here
        // by hanging up.
        client
            .write_all(b"ADDJOB q body 31536000000 REPLICATE 2\r\n")
            .await
            .unwrap();
        let Envelope {
            msg: ClusterMessage::ReplJob { record, .. },
            ..
        } = b_rx.recv().await.unwrap()
        else {
            panic!("expected a replica");
        };
        let id = codec::decode(&record).unwrap().id;

        client.shutdown().await.unwrap();
        let deleted = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.msg, ClusterMessage::DelJob { id });
    }

    #[tokio::test]
    async fn test_simple_replies() {
        let (mut client, _b_rx) = start();

        client.write_all(b"HELLO\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "-ERR unknown command\r\n");

        client.write_all(b"ADDJOB q body 0 TTL 0\r\n").await.unwrap();
        assert_eq!(
            read_reply(&mut client).await,
            "-ERR TTL must be a number > 0\r\n"
        );

        client.write_all(b"ADDJOB q body 0 REPLICATE 3\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("-NOREPL "));

        client.write_all(b"ADDJOB q body 0 REPLICATE 1\r\n").await.unwrap();
        let reply = read_reply(&mut client).await;
        assert!(reply.starts_with("+DI"), "{reply}");
        assert!(reply.ends_with("SQ\r\n"), "{reply}");

        client.write_all(b"QUIT\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "+OK\r\n");
        assert_eq!(read_reply(&mut client).await, "");
    }
}
