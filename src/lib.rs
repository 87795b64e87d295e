//! The job core of a replicating message broker node: job IDs, the job wire
//! format, the per-node registry, replication to peers and `ADDJOB`
//! admission, plus the small line protocol and task plumbing that serve it.
pub mod cluster;
pub mod codec;
pub mod controller;
pub mod id;
pub mod line_reader;
pub mod parser;
pub mod queue;
pub mod registry;
pub mod replication;
pub mod server;
pub mod types;
pub mod util;
