//! Job ID generation.
//!
//! Every node mints IDs independently. Uniqueness comes from a per-process
//! seed hashed together with a strictly increasing counter, so no two calls
//! on the same generator ever produce the same random material.
use sha1::{Digest, Sha1};

use crate::types::ids::{
    JobId, NodeId, HEX_CHARSET, JOB_ID_LEN, JOB_ID_NODE_PREFIX_LEN,
};

/// Length of the per-process seed.
pub const SEED_LEN: usize = 20;

/// A source of 16-byte blocks, none of which repeats for the lifetime of the
/// source.
pub trait RandomSource {
    fn next_block(&mut self) -> [u8; 16];
}

/// SHA1 in counter mode over a fixed seed.
#[derive(Debug)]
pub struct Sha1Counter {
    seed: [u8; SEED_LEN],
    counter: u64,
}

impl Sha1Counter {
    pub fn new(seed: [u8; SEED_LEN]) -> Self {
        Self { seed, counter: 0 }
    }

    /// Seeds from the thread-local RNG, as done once at node startup.
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }
}

impl RandomSource for Sha1Counter {
    fn next_block(&mut self) -> [u8; 16] {
        self.counter += 1;

        let digest = Sha1::new()
            .chain_update(self.seed)
            .chain_update(self.counter.to_le_bytes())
            .finalize();

        let mut block = [0u8; 16];
        block.copy_from_slice(&digest[..16]);
        block
    }
}

/// Mints job IDs on behalf of one node.
#[derive(Debug)]
pub struct IdGenerator<R = Sha1Counter> {
    node: NodeId,
    source: R,
}

impl IdGenerator {
    pub fn with_entropy(node: NodeId) -> Self {
        Self::new(node, Sha1Counter::from_entropy())
    }
}

impl<R: RandomSource> IdGenerator<R> {
    pub fn new(node: NodeId, source: R) -> Self {
        Self { node, source }
    }

    /// Generates a new ID for a job living `ttl` seconds. The TTL is embedded
    /// in minutes, saturating at `u16::MAX`.
    pub fn generate(&mut self, ttl: u64) -> JobId {
        let mut material = [0u8; 18];
        material[..16].copy_from_slice(&self.source.next_block());

        let minutes = u16::try_from(ttl / 60).unwrap_or(u16::MAX);
        material[16..].copy_from_slice(&minutes.to_be_bytes());

        let mut raw = [0u8; JOB_ID_LEN];
        raw[..2].copy_from_slice(b"DI");
        raw[2..2 + JOB_ID_NODE_PREFIX_LEN]
            .copy_from_slice(&self.node.as_bytes()[..JOB_ID_NODE_PREFIX_LEN]);

        let hex = &mut raw[2 + JOB_ID_NODE_PREFIX_LEN..JOB_ID_LEN - 2];
        for (i, b) in material.iter().enumerate() {
            hex[2 * i] = HEX_CHARSET[(b >> 4) as usize];
            hex[2 * i + 1] = HEX_CHARSET[(b & 0xf) as usize];
        }

        raw[JOB_ID_LEN - 2..].copy_from_slice(b"SQ");

        JobId::from_raw(raw)
    }
}
