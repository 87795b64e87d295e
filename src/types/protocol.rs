use serde::Serialize;

use super::ids::{JobId, NodeId};
use super::serialisable::WireSerialisable;
use super::states::JobState;
use crate::controller::AddJobError;

/// Arguments of an `ADDJOB` command as they appeared on the wire, before
/// validation. Options left out are `None`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddJobArgs {
    pub queue: Vec<u8>,
    pub body: Vec<u8>,
    /// Milliseconds to wait for replication; 0 waits forever.
    pub timeout: i64,
    pub replicate: Option<i64>,
    pub ttl: Option<i64>,
    pub retry: Option<i64>,
    pub asynchronous: bool,
}

impl AddJobArgs {
    pub fn new(
        queue: impl Into<Vec<u8>>,
        body: impl Into<Vec<u8>>,
        timeout: i64,
    ) -> Self {
        Self {
            queue: queue.into(),
            body: body.into(),
            timeout,
            replicate: None,
            ttl: None,
            retry: None,
            asynchronous: false,
        }
    }
}

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Creates a job, replicating it before queueing it unless `ASYNC` is
    /// given or the replication factor is 1.
    ///
    /// On the wire: `ADDJOB <queue> <body> <timeout> [REPLICATE <n>]
    /// [TTL <sec>] [RETRY <sec>] [ASYNC]`
    AddJob(AddJobArgs),
    /// Describes a job known to this node.
    ///
    /// On the wire: `SHOW <id>`
    Show { id: Vec<u8> },
    /// Asks the server to close the connection.
    ///
    /// On the wire: `QUIT`
    Quit,
}

/// All possible replies to a `Command`.
#[derive(Debug)]
pub enum Response {
    /// The job was admitted into its queue.
    ///
    /// On the wire: `+<id>`.
    Added { id: JobId },
    /// The job was not created.
    ///
    /// On the wire: `-ERR <reason>` or `-NOREPL <reason>`.
    Rejected(AddJobError),
    /// The timeout expired before enough replicas confirmed the job.
    ///
    /// On the wire: `-TIMEOUT <reason>`.
    TimedOut,
    /// In response to `SHOW`, the job details as a YAML document.
    ///
    /// On the wire: `$<n_bytes>` plus data.
    Job(JobInfo),
    /// In response to `SHOW`, the job isn't known here.
    ///
    /// On the wire: `$-1`.
    NotFound,
    /// In response to `QUIT`.
    ///
    /// On the wire: `+OK`.
    Bye,
}

impl WireSerialisable for Response {
    fn serialise_wire(&self) -> Vec<u8> {
        use Response::*;

        match self {
            Added { id } => format!("+{id}\r\n").into(),
            Rejected(error) => format!("-{} {error}\r\n", error.code()).into(),
            TimedOut => b"-TIMEOUT Timeout reached before replicating to the \
                requested number of nodes\r\n"
                .to_vec(),
            Job(info) => match serde_yaml::to_string(info) {
                Ok(data) => format!("${}\r\n{data}\r\n", data.len()).into(),
                Err(_) => b"-ERR unable to describe job\r\n".to_vec(),
            },
            NotFound => b"$-1\r\n".to_vec(),
            Bye => b"+OK\r\n".to_vec(),
        }
    }
}

/// Everything `SHOW` reveals about a job.
#[derive(Debug, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub queue: String,
    pub state: JobState,
    pub repl: u16,
    /// time to live in seconds
    pub ttl: u32,
    /// creation time, nanoseconds since the epoch
    pub ctime: u64,
    /// enqueue time, seconds since the epoch
    pub qtime: u32,
    /// retry interval in seconds
    pub rtime: u32,
    #[serde(rename = "body-len")]
    pub body_len: usize,
    #[serde(rename = "async")]
    pub asynchronous: bool,
    #[serde(rename = "nodes-delivered")]
    pub nodes_delivered: Vec<NodeId>,
    #[serde(rename = "nodes-confirmed")]
    pub nodes_confirmed: Vec<NodeId>,
}

impl From<&super::job::Job> for JobInfo {
    fn from(job: &super::job::Job) -> Self {
        Self {
            id: job.id,
            queue: String::from_utf8_lossy(job.queue_name()).into_owned(),
            state: job.state,
            repl: job.repl,
            ttl: job.ttl(),
            ctime: job.ctime,
            qtime: job.qtime,
            rtime: job.rtime,
            body_len: job.body.len(),
            asynchronous: job.flags.contains(super::job::JobFlags::ASYNC),
            nodes_delivered: job.nodes_delivered.iter().copied().collect(),
            nodes_confirmed: job.nodes_confirmed.iter().copied().collect(),
        }
    }
}
