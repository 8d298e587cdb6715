use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use memmap2::MmapOptions;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BlockId, BlockStore, StoreError, check_bounds, layout};

#[derive(Debug, Default)]
struct FileBlocks {
    next_index: u64,
    free: Vec<u64>,
    allocated: HashSet<u64>,
    flushed: HashSet<u64>,
}

/// Block store backed by a single file of fixed-size slots.
///
/// Block ids are slot indexes. Freed slots are reused before the file grows.
#[derive(Debug)]
pub struct FileBlockStore {
    path: PathBuf,
    file: File,
    block_size: usize,
    enable_mmap: bool,
    blocks: Mutex<FileBlocks>,
}

impl FileBlockStore {
    pub fn open(root: &Path, block_size: usize, enable_mmap: bool) -> Result<Self> {
        let path = layout::prepare_store_file(root, "blocks")?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to create cache store file {}", path.display()))?;
        debug!(path = %path.display(), block_size, enable_mmap, "opened file block store");
        Ok(Self {
            path,
            file,
            block_size: block_size.max(1),
            enable_mmap,
            blocks: Mutex::new(FileBlocks::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn position(&self, block: BlockId, offset: usize) -> u64 {
        block * self.block_size as u64 + offset as u64
    }

    fn ensure_allocated(&self, block: BlockId) -> Result<bool, StoreError> {
        let blocks = self.blocks.lock();
        if !blocks.allocated.contains(&block) {
            return Err(StoreError::UnknownBlock(block));
        }
        Ok(blocks.flushed.contains(&block))
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId, StoreError> {
        let mut blocks = self.blocks.lock();
        let index = match blocks.free.pop() {
            Some(index) => index,
            None => {
                let index = blocks.next_index;
                blocks.next_index += 1;
                index
            }
        };
        blocks.allocated.insert(index);
        Ok(index)
    }

    fn write(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        check_bounds(self.block_size, offset, data.len())?;
        if self.ensure_allocated(block)? {
            return Err(StoreError::ReadOnly(block));
        }
        self.file
            .write_all_at(data, self.position(block, offset))?;
        Ok(())
    }

    fn read(&self, block: BlockId, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(self.block_size, offset, buf.len())?;
        self.ensure_allocated(block)?;
        self.file.read_exact_at(buf, self.position(block, offset))?;
        Ok(())
    }

    fn deallocate(&self, block: BlockId) {
        let mut blocks = self.blocks.lock();
        if blocks.allocated.remove(&block) {
            blocks.flushed.remove(&block);
            blocks.free.push(block);
        }
    }

    fn flush(&self, ids: &[BlockId]) -> Result<(), StoreError> {
        for id in ids {
            self.ensure_allocated(*id)?;
        }
        self.file.sync_data()?;
        let mut blocks = self.blocks.lock();
        for id in ids {
            if blocks.allocated.contains(id) {
                blocks.flushed.insert(*id);
            }
        }
        Ok(())
    }

    fn is_flushed(&self, block: BlockId) -> bool {
        self.blocks.lock().flushed.contains(&block)
    }

    fn read_shared(&self, block: BlockId, offset: usize, len: usize) -> Option<Bytes> {
        if !self.enable_mmap || len == 0 {
            return None;
        }
        check_bounds(self.block_size, offset, len).ok()?;
        if !self.is_flushed(block) {
            return None;
        }
        // SAFETY: flushed blocks are read-only until deallocated, and every
        // shared chunk handed out by content pins a reader reference, so the
        // slot cannot be freed and rewritten while this mapping is alive.
        let map = unsafe {
            MmapOptions::new()
                .offset(self.position(block, offset))
                .len(len)
                .map(&self.file)
        };
        match map {
            Ok(map) => Some(Bytes::from_owner(map)),
            Err(err) => {
                trace!(error = %err, block, "mmap read unavailable, falling back to copy");
                None
            }
        }
    }

    fn bytes_in_use(&self) -> u64 {
        self.blocks.lock().allocated.len() as u64 * self.block_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blocks_round_trip_through_file() -> Result<()> {
        let temp = TempDir::new()?;
        let store = FileBlockStore::open(temp.path(), 16, false)?;
        let a = store.allocate()?;
        let b = store.allocate()?;
        store.write(b, 0, b"second block")?;
        store.write(a, 4, b"first")?;

        let mut buf = [0u8; 5];
        store.read(a, 4, &mut buf)?;
        assert_eq!(&buf, b"first");
        let mut buf = [0u8; 12];
        store.read(b, 0, &mut buf)?;
        assert_eq!(&buf, b"second block");
        assert_eq!(store.bytes_in_use(), 32);
        Ok(())
    }

    #[test]
    fn freed_slots_are_reused() -> Result<()> {
        let temp = TempDir::new()?;
        let store = FileBlockStore::open(temp.path(), 16, false)?;
        let a = store.allocate()?;
        store.allocate()?;
        store.deallocate(a);
        assert!(matches!(
            store.read(a, 0, &mut [0u8; 1]),
            Err(StoreError::UnknownBlock(_))
        ));
        assert_eq!(store.allocate()?, a);
        Ok(())
    }

    #[test]
    fn mmap_reads_only_flushed_blocks() -> Result<()> {
        let temp = TempDir::new()?;
        let store = FileBlockStore::open(temp.path(), 4096, true)?;
        let id = store.allocate()?;
        let payload = vec![7u8; 4096];
        store.write(id, 0, &payload)?;
        assert!(store.read_shared(id, 0, 4096).is_none());

        store.flush(&[id])?;
        assert!(matches!(store.write(id, 0, b"x"), Err(StoreError::ReadOnly(_))));
        let shared = store.read_shared(id, 100, 200).expect("mapped slice");
        assert_eq!(shared.len(), 200);
        assert!(shared.iter().all(|b| *b == 7));
        Ok(())
    }

    #[test]
    fn mmap_disabled_returns_none() -> Result<()> {
        let temp = TempDir::new()?;
        let store = FileBlockStore::open(temp.path(), 64, false)?;
        let id = store.allocate()?;
        store.write(id, 0, &[1u8; 64])?;
        store.flush(&[id])?;
        assert!(store.read_shared(id, 0, 64).is_none());
        Ok(())
    }
}
