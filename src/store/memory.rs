use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{BlockId, BlockStore, StoreError, check_bounds};

#[derive(Debug)]
enum MemoryBlock {
    Open(Vec<u8>),
    Frozen(Bytes),
}

#[derive(Debug, Default)]
struct MemoryBlocks {
    next_id: BlockId,
    free: Vec<BlockId>,
    blocks: HashMap<BlockId, MemoryBlock>,
}

/// Heap-backed block store. Flushed blocks are frozen into `Bytes` so the
/// shared read path hands out reference-counted slices.
#[derive(Debug)]
pub struct MemoryBlockStore {
    block_size: usize,
    inner: RwLock<MemoryBlocks>,
}

impl MemoryBlockStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            inner: RwLock::new(MemoryBlocks {
                next_id: 1,
                ..MemoryBlocks::default()
            }),
        }
    }

    pub fn allocated_blocks(&self) -> usize {
        self.inner.read().blocks.len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId, StoreError> {
        let mut inner = self.inner.write();
        let id = match inner.free.pop() {
            Some(id) => id,
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                id
            }
        };
        inner
            .blocks
            .insert(id, MemoryBlock::Open(vec![0u8; self.block_size]));
        Ok(id)
    }

    fn write(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        check_bounds(self.block_size, offset, data.len())?;
        let mut inner = self.inner.write();
        match inner.blocks.get_mut(&block) {
            Some(MemoryBlock::Open(buf)) => {
                buf[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            Some(MemoryBlock::Frozen(_)) => Err(StoreError::ReadOnly(block)),
            None => Err(StoreError::UnknownBlock(block)),
        }
    }

    fn read(&self, block: BlockId, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(self.block_size, offset, buf.len())?;
        let inner = self.inner.read();
        let src: &[u8] = match inner.blocks.get(&block) {
            Some(MemoryBlock::Open(data)) => data,
            Some(MemoryBlock::Frozen(data)) => data,
            None => return Err(StoreError::UnknownBlock(block)),
        };
        buf.copy_from_slice(&src[offset..offset + buf.len()]);
        Ok(())
    }

    fn deallocate(&self, block: BlockId) {
        let mut inner = self.inner.write();
        if inner.blocks.remove(&block).is_some() {
            inner.free.push(block);
        }
    }

    fn flush(&self, blocks: &[BlockId]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for id in blocks {
            let slot = inner
                .blocks
                .get_mut(id)
                .ok_or(StoreError::UnknownBlock(*id))?;
            if let MemoryBlock::Open(data) = slot {
                let frozen = Bytes::from(std::mem::take(data));
                *slot = MemoryBlock::Frozen(frozen);
            }
        }
        Ok(())
    }

    fn is_flushed(&self, block: BlockId) -> bool {
        matches!(
            self.inner.read().blocks.get(&block),
            Some(MemoryBlock::Frozen(_))
        )
    }

    fn read_shared(&self, block: BlockId, offset: usize, len: usize) -> Option<Bytes> {
        check_bounds(self.block_size, offset, len).ok()?;
        match self.inner.read().blocks.get(&block) {
            Some(MemoryBlock::Frozen(data)) => Some(data.slice(offset..offset + len)),
            _ => None,
        }
    }

    fn bytes_in_use(&self) -> u64 {
        (self.inner.read().blocks.len() * self.block_size) as u64
    }
}
