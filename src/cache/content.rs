//! Cached body content stored as a list of blocks.
//!
//! A body is captured through a [`ContentWriter`], which owns its blocks
//! exclusively. Sealing turns it into an immutable, reference-counted
//! [`Content`]; readers take a [`ContentGuard`] for the duration of a read.
//! Blocks go back to the store once the content has been invalidated and the
//! last reader is gone.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::BodySink;
use crate::store::{BlockId, BlockStore, StoreError};

/// Reads shorter than this always copy.
pub const ZERO_COPY_THRESHOLD: u64 = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Bytes,
    /// UTF-16 code units, two big-endian bytes each.
    Chars,
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content store failure: {0}")]
    Store(#[from] StoreError),
    #[error("writing to client failed: {0}")]
    Sink(#[source] io::Error),
    #[error("content already holds {0:?} data")]
    KindMismatch(ContentKind),
    #[error("content does not hold character data")]
    NotText,
}

#[derive(Debug)]
pub struct ContentWriter {
    store: Arc<dyn BlockStore>,
    blocks: Vec<BlockId>,
    length: u64,
    kind: Option<ContentKind>,
}

impl ContentWriter {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self {
            store,
            blocks: Vec::new(),
            length: 0,
            kind: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn kind(&self) -> Option<ContentKind> {
        self.kind
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), ContentError> {
        self.set_kind(ContentKind::Bytes)?;
        self.append(data)?;
        Ok(())
    }

    pub fn write_chars(&mut self, units: &[u16]) -> Result<(), ContentError> {
        self.set_kind(ContentKind::Chars)?;
        let mut encoded = Vec::with_capacity(units.len() * 2);
        for unit in units {
            encoded.extend_from_slice(&unit.to_be_bytes());
        }
        self.append(&encoded)?;
        Ok(())
    }

    pub fn write_str(&mut self, text: &str) -> Result<(), ContentError> {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.write_chars(&units)
    }

    fn set_kind(&mut self, kind: ContentKind) -> Result<(), ContentError> {
        match self.kind {
            Some(current) if current != kind => Err(ContentError::KindMismatch(current)),
            _ => {
                self.kind = Some(kind);
                Ok(())
            }
        }
    }

    fn append(&mut self, mut data: &[u8]) -> Result<(), StoreError> {
        let block_size = self.store.block_size() as u64;
        while !data.is_empty() {
            if self.length == self.blocks.len() as u64 * block_size {
                let block = self.store.allocate()?;
                self.blocks.push(block);
            }
            let Some(&block) = self.blocks.last() else {
                break;
            };
            let offset = (self.length % block_size) as usize;
            let n = (block_size as usize - offset).min(data.len());
            self.store.write(block, offset, &data[..n])?;
            self.length += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Flushes the blocks and freezes the content. On failure the blocks are
    /// released with the writer.
    pub fn seal(mut self) -> Result<Content, ContentError> {
        self.store.flush(&self.blocks)?;
        let blocks = std::mem::take(&mut self.blocks);
        let inner = ContentInner {
            store: self.store.clone(),
            blocks,
            length: self.length,
            kind: self.kind.unwrap_or(ContentKind::Bytes),
            refs: AtomicI64::new(1),
            owner_released: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        };
        Ok(Content {
            inner: Arc::new(inner),
        })
    }
}

impl Drop for ContentWriter {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.store.deallocate(block);
        }
    }
}

#[derive(Debug)]
struct ContentInner {
    store: Arc<dyn BlockStore>,
    blocks: Vec<BlockId>,
    length: u64,
    kind: ContentKind,
    /// Owner reference plus one per active reader.
    refs: AtomicI64,
    owner_released: AtomicBool,
    freed: AtomicBool,
}

impl ContentInner {
    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.free();
        }
    }

    fn free(&self) {
        if self.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        for block in &self.blocks {
            self.store.deallocate(*block);
        }
    }
}

impl Drop for ContentInner {
    fn drop(&mut self) {
        self.free();
    }
}

/// Sealed content shared by a cache entry and its readers.
#[derive(Debug, Clone)]
pub struct Content {
    inner: Arc<ContentInner>,
}

impl Content {
    pub fn len(&self) -> u64 {
        self.inner.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    pub fn kind(&self) -> ContentKind {
        self.inner.kind
    }

    pub fn block_count(&self) -> usize {
        self.inner.blocks.len()
    }

    /// Registers a reader. Fails once the content has been invalidated.
    pub fn acquire(&self) -> Option<ContentGuard> {
        let mut current = self.inner.refs.load(Ordering::Acquire);
        loop {
            if current <= 0 || self.inner.owner_released.load(Ordering::Acquire) {
                return None;
            }
            match self.inner.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ContentGuard {
                        inner: self.inner.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops the owner reference. Safe to call more than once and while
    /// readers are active; blocks are freed after the last reader.
    pub fn invalidate(&self) {
        if !self.inner.owner_released.swap(true, Ordering::AcqRel) {
            self.inner.release();
        }
    }

    pub fn is_live(&self) -> bool {
        !self.inner.owner_released.load(Ordering::Acquire)
            && self.inner.refs.load(Ordering::Acquire) > 0
    }

    pub fn is_freed(&self) -> bool {
        self.inner.freed.load(Ordering::Acquire)
    }
}

/// Active reader of sealed content. Dropping it releases the reference.
#[derive(Debug)]
pub struct ContentGuard {
    inner: Arc<ContentInner>,
}

impl Drop for ContentGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Shared chunk handed to a sink. Holds a reader reference so the blocks it
/// views stay allocated until the sink drops it.
struct PinnedChunk {
    chunk: Bytes,
    _reader: ContentGuard,
}

impl AsRef<[u8]> for PinnedChunk {
    fn as_ref(&self) -> &[u8] {
        &self.chunk
    }
}

impl ContentGuard {
    /// Another reader reference on the same content. The content is live
    /// while `self` exists, so the count cannot be zero here.
    fn pin(&self) -> ContentGuard {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        ContentGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    pub fn kind(&self) -> ContentKind {
        self.inner.kind
    }

    pub fn read_full<S: BodySink + ?Sized>(&self, sink: &mut S) -> Result<u64, ContentError> {
        self.read_range(sink, 0, self.inner.length)
    }

    /// Writes `len` bytes starting at `offset`, clamped to the sealed length.
    /// Returns the number of bytes written.
    pub fn read_range<S: BodySink + ?Sized>(
        &self,
        sink: &mut S,
        offset: u64,
        len: u64,
    ) -> Result<u64, ContentError> {
        let total = self.inner.length;
        if offset >= total {
            return Ok(0);
        }
        let end = offset.saturating_add(len).min(total);
        let block_size = self.inner.store.block_size() as u64;
        let zero_copy = sink.supports_zero_copy() && end - offset >= ZERO_COPY_THRESHOLD;

        let mut buf = Vec::new();
        let mut pos = offset;
        while pos < end {
            let block = self.inner.blocks[(pos / block_size) as usize];
            let block_offset = (pos % block_size) as usize;
            let n = (block_size - block_offset as u64).min(end - pos) as usize;

            let shared = if zero_copy {
                self.inner.store.read_shared(block, block_offset, n)
            } else {
                None
            };
            match shared {
                Some(chunk) => {
                    let pinned = Bytes::from_owner(PinnedChunk {
                        chunk,
                        _reader: self.pin(),
                    });
                    sink.write_shared(pinned).map_err(ContentError::Sink)?;
                }
                None => {
                    buf.resize(n, 0);
                    self.inner.store.read(block, block_offset, &mut buf[..n])?;
                    sink.write_body(&buf[..n]).map_err(ContentError::Sink)?;
                }
            }
            pos += n as u64;
        }
        Ok(end - offset)
    }

    /// Decodes character content.
    pub fn read_text(&self) -> Result<String, ContentError> {
        if self.inner.kind != ContentKind::Chars {
            return Err(ContentError::NotText);
        }
        let mut raw = Vec::with_capacity(self.inner.length as usize);
        let block_size = self.inner.store.block_size() as u64;
        let mut remaining = self.inner.length;
        for block in &self.inner.blocks {
            let n = block_size.min(remaining) as usize;
            let start = raw.len();
            raw.resize(start + n, 0);
            self.inner.store.read(*block, 0, &mut raw[start..])?;
            remaining -= n as u64;
        }
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    pub fn write_text_to<S: BodySink + ?Sized>(&self, sink: &mut S) -> Result<u64, ContentError> {
        let text = self.read_text()?;
        sink.write_text(&text).map_err(ContentError::Sink)?;
        Ok(self.inner.length)
    }
}
