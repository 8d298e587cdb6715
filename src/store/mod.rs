//! Fixed-size block storage backing cached response bodies.
//!
//! The cache engine only talks to the [`BlockStore`] trait. Two backends are
//! provided: an in-memory store used by tests and small deployments, and a
//! single-file store with positional I/O and an optional memory-mapped read
//! path.

mod file;
pub mod layout;
mod memory;

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

pub use file::FileBlockStore;
pub use memory::MemoryBlockStore;

pub type BlockId = u64;

pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block {0} is not allocated")]
    UnknownBlock(BlockId),
    #[error("access at offset {offset} with length {len} exceeds block size {block_size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        block_size: usize,
    },
    #[error("block {0} has been flushed and is read-only")]
    ReadOnly(BlockId),
    #[error("block store i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract for the raw block device underneath cached content.
///
/// Blocks are written while a body is being captured, flushed once the body
/// is sealed, and from then on only read until they are deallocated.
pub trait BlockStore: Send + Sync + fmt::Debug {
    fn block_size(&self) -> usize;

    fn allocate(&self) -> Result<BlockId, StoreError>;

    fn write(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<(), StoreError>;

    fn read(&self, block: BlockId, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;

    fn deallocate(&self, block: BlockId);

    /// Makes the given blocks durable and immutable.
    fn flush(&self, blocks: &[BlockId]) -> Result<(), StoreError>;

    fn is_flushed(&self, block: BlockId) -> bool;

    /// Returns a shared view of a flushed block region without copying, or
    /// `None` when the backend cannot provide one.
    fn read_shared(&self, _block: BlockId, _offset: usize, _len: usize) -> Option<Bytes> {
        None
    }

    fn bytes_in_use(&self) -> u64;
}

pub(crate) fn check_bounds(block_size: usize, offset: usize, len: usize) -> Result<(), StoreError> {
    match offset.checked_add(len) {
        Some(end) if end <= block_size => Ok(()),
        _ => Err(StoreError::OutOfBounds {
            offset,
            len,
            block_size,
        }),
    }
}
