//! Fixed-length identifiers for jobs and cluster nodes.
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Length of a job ID on the wire and in memory.
pub const JOB_ID_LEN: usize = 48;

/// Length of a node identifier: 40 lowercase hex characters.
pub const NODE_ID_LEN: usize = 40;

/// Number of node identifier bytes embedded in every job ID.
pub const JOB_ID_NODE_PREFIX_LEN: usize = 8;

pub(crate) const HEX_CHARSET: &[u8; 16] = b"0123456789abcdef";

fn is_hex(c: u8) -> bool {
    matches!(c, b'0'..=b'9' | b'a'..=b'f')
}

/// A job identifier, laid out as:
///
/// ```text
/// +--+-------------------+--------------------------------+----+--+
/// |DI| node prefix (8 B) | 16 random bytes (32 hex chars) |TTL |SQ|
/// +--+-------------------+--------------------------------+----+--+
/// ```
///
/// The TTL is the job's time to live in minutes, as a big endian `u16`
/// written in 4 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId([u8; JOB_ID_LEN]);

impl JobId {
    /// Builds an ID from bytes already known to follow the layout.
    pub(crate) fn from_raw(raw: [u8; JOB_ID_LEN]) -> Self {
        Self(raw)
    }

    /// Validates `bytes` against the job ID layout.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; JOB_ID_LEN] = bytes.try_into().ok()?;

        let well_formed = raw.starts_with(b"DI")
            && raw.ends_with(b"SQ")
            && raw[2..JOB_ID_LEN - 2].iter().all(|&c| is_hex(c));

        well_formed.then_some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The first bytes of the identifier of the node that created this job.
    pub fn node_prefix(&self) -> &[u8] {
        &self.0[2..2 + JOB_ID_NODE_PREFIX_LEN]
    }

    /// The coarse TTL hint embedded at creation, in minutes.
    pub fn ttl_minutes(&self) -> u16 {
        self.0[JOB_ID_LEN - 6..JOB_ID_LEN - 2]
            .iter()
            .fold(0u16, |acc, &c| (acc << 4) | hex_value(c))
    }
}

fn hex_value(c: u8) -> u16 {
    match c {
        b'0'..=b'9' => (c - b'0') as u16,
        _ => (c - b'a' + 10) as u16,
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Always ASCII, guaranteed by construction.
        f.write_str(std::str::from_utf8(&self.0).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "JobId({self})")
    }
}

impl Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Identifies a node of the cluster.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Picks a fresh random identifier, as done once at node startup.
    pub fn random() -> Self {
        let entropy: [u8; NODE_ID_LEN / 2] = rand::random();

        let mut raw = [0u8; NODE_ID_LEN];
        for (i, b) in entropy.iter().enumerate() {
            raw[2 * i] = HEX_CHARSET[(b >> 4) as usize];
            raw[2 * i + 1] = HEX_CHARSET[(b & 0xf) as usize];
        }

        Self(raw)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; NODE_ID_LEN] = bytes.try_into().ok()?;
        raw.iter().all(|&c| is_hex(c)).then_some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(std::str::from_utf8(&self.0).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("node IDs must be 40 lowercase hex characters")]
pub struct BadNodeId;

impl FromStr for NodeId {
    type Err = BadNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes()).ok_or(BadNodeId)
    }
}
