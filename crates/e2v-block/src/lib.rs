#![forbid(unsafe_code)]
//! Read-only block I/O for ext2view.
//!
//! Provides the byte-addressed [`ByteDevice`] (files and in-memory images),
//! the block-addressed [`BlockDevice`] the filesystem reads through, and an
//! optional bounded LRU [`BlockCache`].

use e2v_error::{E2vError, Result};
use e2v_types::{BlockNumber, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

fn short_read(offset: u64, len: usize, total: u64) -> E2vError {
    E2vError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read out of bounds: offset={offset} len={len} device_len={total}"),
    ))
}

fn checked_end(offset: u64, len: usize) -> Result<u64> {
    u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| E2vError::Format("read range overflows u64".to_owned()))
}

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A range that extends past `len_bytes()` is an `Io` error; the device
    /// never pads with zeros.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`-style I/O.
///
/// Opened read-only. `FileExt::read_exact_at` does not share a seek position,
/// so clones can read concurrently.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        if end > self.len {
            return Err(short_read(offset, buf.len(), self.len));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory image, mostly useful for tests and synthetic volumes.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<[u8]>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let total = self.len_bytes();
        let end = checked_end(offset, buf.len())?;
        if end > total {
            return Err(short_read(offset, buf.len(), total));
        }
        let (Ok(start), Ok(end)) = (usize::try_from(offset), usize::try_from(end)) else {
            return Err(short_read(offset, buf.len(), total));
        };
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Box<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// Block-addressed read interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number. The returned buffer is exactly `block_size()`
    /// bytes long.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Number of whole blocks the backing store holds.
    fn block_count(&self) -> u64;
}

/// Adapts a [`ByteDevice`] to block addressing at a fixed block size.
///
/// The image need not be block-aligned: a trailing partial block is simply
/// not readable.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(E2vError::InvalidGeometry(format!(
                "block_size={block_size} (must be power of two)"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| E2vError::Format("block offset overflow".to_owned()))?;
        let len = usize::try_from(self.block_size)
            .map_err(|_| E2vError::Format("block_size does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Read the superblock region (1024 bytes at offset 1024).
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    let offset = u64::try_from(EXT2_SUPERBLOCK_OFFSET)
        .map_err(|_| E2vError::Format("superblock offset does not fit u64".to_owned()))?;
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

#[derive(Debug)]
struct LruState {
    capacity: usize,
    /// Most recently used at the back.
    order: VecDeque<BlockNumber>,
    resident: HashMap<BlockNumber, Vec<u8>>,
    hits: u64,
    misses: u64,
}

impl LruState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            resident: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    fn touch(&mut self, key: BlockNumber) {
        if let Some(pos) = self.order.iter().position(|b| *b == key) {
            let _ = self.order.remove(pos);
        }
        self.order.push_back(key);
    }

    fn insert(&mut self, key: BlockNumber, bytes: Vec<u8>) {
        if !self.resident.contains_key(&key) && self.resident.len() >= self.capacity {
            if let Some(victim) = self.order.pop_front() {
                let _ = self.resident.remove(&victim);
            }
        }
        self.resident.insert(key, bytes);
        self.touch(key);
    }
}

/// Hit/miss counters for a [`BlockCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
}

/// Bounded LRU cache of whole blocks around a [`BlockDevice`].
///
/// Pure memoization: the device is read-only, so cached blocks never go
/// stale for the lifetime of the cache.
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    inner: D,
    state: Mutex<LruState>,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(E2vError::Format(
                "BlockCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(LruState::new(capacity_blocks)),
        })
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        CacheStats {
            hits: guard.hits,
            misses: guard.misses,
            resident: guard.resident.len(),
        }
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.resident.get(&block).cloned() {
                guard.hits += 1;
                guard.touch(block);
                drop(guard);
                return Ok(BlockBuf::new(bytes));
            }
            guard.misses += 1;
        }

        let buf = self.inner.read_block(block)?;
        trace!(block = block.0, "block cache fill");

        let mut guard = self.state.lock();
        guard.insert(block, buf.as_slice().to_vec());
        drop(guard);
        Ok(buf)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}
