//! Binary job records, used both for replication between nodes and for
//! persistence.
//!
//! All integers are little endian:
//!
//! ```text
//! u32  length of everything below
//!      id(48) state(1) flags(1) repl(2) ctime(8) etime(4) qtime(4) rtime(4)
//! u32  queue name length, then the name
//! u32  body length, then the body
//! u32  delivered node count, then NODE_ID_LEN bytes per node
//! ```
//!
//! The confirmed node set is local replication bookkeeping and is never
//! written.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::queue::Queue;
use crate::types::ids::{JobId, NodeId, JOB_ID_LEN, NODE_ID_LEN};
use crate::types::job::{Job, JobFlags};
use crate::types::states::JobState;

/// Size of the fixed part of a record.
pub const HEADER_LEN: usize = JOB_ID_LEN + 1 + 1 + 2 + 8 + 4 + 4 + 4;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("record truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("malformed job ID")]
    BadJobId,
    #[error("unknown job state {0}")]
    BadState(u8),
    #[error("malformed node ID")]
    BadNodeId,
    #[error("{0} unexpected bytes after the record")]
    TrailingBytes(usize),
}

/// Length of the record for `job`, excluding the length prefix itself.
pub fn encoded_len(job: &Job) -> usize {
    HEADER_LEN
        + 4
        + job.queue_name().len()
        + 4
        + job.body.len()
        + 4
        + job.nodes_delivered.len() * NODE_ID_LEN
}

fn put_len(buf: &mut BytesMut, len: usize) {
    let len = u32::try_from(len)
        .unwrap_or_else(|_| panic!("job record field of {len} bytes"));
    buf.put_u32_le(len);
}

fn put_prefixed(buf: &mut BytesMut, data: &[u8]) {
    put_len(buf, data.len());
    buf.put_slice(data);
}

/// Serialises `job` into a self-delimited record.
///
/// # Panics
///
/// If the bytes written differ from the precomputed length. That can only be
/// a bug, and a corrupt record must never be sent or persisted.
pub fn encode(job: &Job) -> Bytes {
    let len = encoded_len(job);
    let mut buf = BytesMut::with_capacity(4 + len);

    put_len(&mut buf, len);

    buf.put_slice(job.id.as_bytes());
    buf.put_u8(job.state.code());
    buf.put_u8(job.flags.bits());
    buf.put_u16_le(job.repl);
    buf.put_u64_le(job.ctime);
    buf.put_u32_le(job.etime);
    buf.put_u32_le(job.qtime);
    buf.put_u32_le(job.rtime);

    put_prefixed(&mut buf, job.queue_name());
    put_prefixed(&mut buf, &job.body);

    put_len(&mut buf, job.nodes_delivered.len());
    for node in &job.nodes_delivered {
        buf.put_slice(node.as_bytes());
    }

    assert_eq!(buf.len(), 4 + len, "job record length mismatch");

    buf.freeze()
}

fn need(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        Err(DecodeError::Truncated {
            needed,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn take_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;

    let whole: &'a [u8] = *buf;
    let (data, rest) = whole.split_at(len);
    *buf = rest;
    Ok(data)
}

/// Reads one record from the front of `buf`. Bytes past the declared record
/// length are ignored. The decoded job holds a detached queue handle.
pub fn decode(mut buf: &[u8]) -> Result<Job, DecodeError> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;

    let mut rec = &buf[..len];
    need(rec, HEADER_LEN)?;

    let id = JobId::from_bytes(&rec[..JOB_ID_LEN]).ok_or(DecodeError::BadJobId)?;
    rec.advance(JOB_ID_LEN);

    let mut job = Job::new(
        id,
        JobState::try_from(rec.get_u8()).map_err(DecodeError::BadState)?,
    );
    job.flags = JobFlags::from_bits(rec.get_u8());
    job.repl = rec.get_u16_le();
    job.ctime = rec.get_u64_le();
    job.etime = rec.get_u32_le();
    job.qtime = rec.get_u32_le();
    job.rtime = rec.get_u32_le();

    let queue = take_prefixed(&mut rec)?;
    if !queue.is_empty() {
        job.queue = Some(Queue::detached(Bytes::copy_from_slice(queue)));
    }

    job.body = Bytes::copy_from_slice(take_prefixed(&mut rec)?);

    need(rec, 4)?;
    let count = rec.get_u32_le() as usize;
    need(rec, count.saturating_mul(NODE_ID_LEN))?;
    for _ in 0..count {
        let node = NodeId::from_bytes(&rec[..NODE_ID_LEN])
            .ok_or(DecodeError::BadNodeId)?;
        job.nodes_delivered.insert(node);
        rec.advance(NODE_ID_LEN);
    }

    if rec.has_remaining() {
        return Err(DecodeError::TrailingBytes(rec.remaining()));
    }

    Ok(job)
}
