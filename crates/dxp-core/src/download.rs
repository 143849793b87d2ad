//! Chunked transfers and readiness polling.
//!
//! The bus caps the number of words moved per call. [`DownloadEngine`] splits
//! a payload into transfers no larger than that cap, hands each one to a
//! family-supplied closure in ascending order, and polls readiness flags with
//! the bus's own sleep. Family drivers build their FPGA and DSP download
//! sequences from these pieces.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = DownloadEngine::new(board.io());
//! engine.write_chunked(&program[2..], |offset, chunk| {
//!     write_block(board.io(), 1 + offset as u16, chunk)
//! })?;
//! ```

use crate::bus::BoardIo;
use crate::error::Result;
use crate::poll::{poll_until, PollPolicy};
use tracing::trace;

/// One transfer of a chunked payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the first word within the payload
    pub offset: usize,
    /// Number of words
    pub len: usize,
}

/// Split `len` words into transfers of at most `limit` words.
///
/// A `limit` of zero or less means a single transfer. Every chunk but the
/// last is exactly `limit` long.
pub fn chunk_plan(len: usize, limit: i64) -> Vec<Chunk> {
    if len == 0 {
        return Vec::new();
    }
    let maxblk = if limit <= 0 {
        len
    } else {
        usize::try_from(limit).map_or(len, |l| l.min(len))
    };
    let nxfers = (len - 1) / maxblk + 1;
    (0..nxfers)
        .map(|i| Chunk {
            offset: i * maxblk,
            len: if i + 1 == nxfers {
                (len - 1) % maxblk + 1
            } else {
                maxblk
            },
        })
        .collect()
}

/// Chunked transfer and polling helper bound to one board's bus.
#[derive(Debug)]
pub struct DownloadEngine<'a> {
    io: &'a BoardIo,
    chunk_limit: i64,
}

impl<'a> DownloadEngine<'a> {
    /// Engine using the bus's current transfer limit.
    pub fn new(io: &'a BoardIo) -> Self {
        Self {
            chunk_limit: io.max_block(),
            io,
        }
    }

    /// Engine with an explicit transfer limit.
    pub fn with_chunk_limit(io: &'a BoardIo, chunk_limit: i64) -> Self {
        Self { io, chunk_limit }
    }

    /// Transfer limit in effect.
    pub fn chunk_limit(&self) -> i64 {
        self.chunk_limit
    }

    /// Chunk plan for `len` words.
    pub fn chunks(&self, len: usize) -> Vec<Chunk> {
        chunk_plan(len, self.chunk_limit)
    }

    /// Pass `words` to `write` one chunk at a time, in ascending offset order.
    /// Stops at the first failing chunk. Returns the number of transfers.
    pub fn write_chunked<W>(&self, words: &[u16], mut write: W) -> Result<usize>
    where
        W: FnMut(usize, &[u16]) -> Result<()>,
    {
        let plan = self.chunks(words.len());
        for chunk in &plan {
            trace!(
                module = self.io.module(),
                offset = chunk.offset,
                len = chunk.len,
                "Chunk write"
            );
            write(chunk.offset, &words[chunk.offset..chunk.offset + chunk.len])?;
        }
        Ok(plan.len())
    }

    /// Fill `buf` from `read` one chunk at a time, in ascending offset order.
    pub fn read_chunked<R>(&self, buf: &mut [u16], mut read: R) -> Result<usize>
    where
        R: FnMut(usize, &mut [u16]) -> Result<()>,
    {
        let plan = self.chunks(buf.len());
        for chunk in &plan {
            read(chunk.offset, &mut buf[chunk.offset..chunk.offset + chunk.len])?;
        }
        Ok(plan.len())
    }

    /// Poll `predicate` under `policy`, sleeping on the bus between attempts.
    pub fn poll<P>(&self, policy: &PollPolicy, what: &str, predicate: P) -> Result<u32>
    where
        P: FnMut() -> Result<bool>,
    {
        poll_until(policy, what, |d| self.io.wait(d), predicate)
    }
}
