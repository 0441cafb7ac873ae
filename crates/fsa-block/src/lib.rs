#![forbid(unsafe_code)]
//! Block I/O collaborator for the free-space subsystem.
//!
//! Provides the `BlockDevice` trait with asynchronous read submission
//! ([`PendingRead`] / [`ReadCompleter`]), a file-backed device using
//! positional reads, and an in-memory device for tests and tooling.

mod completion;
mod mem;

pub use completion::{PendingRead, ReadCompleter, ReadFault, ReadOutcome, read_request};
pub use mem::MemBlockDevice;

use fsa_error::{FsaError, Result};
use fsa_types::{BlockNumber, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE};
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

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed read interface.
///
/// `submit_read` must not block on the transfer; the returned handle is
/// joined with [`PendingRead::wait`].
pub trait BlockDevice: Send + Sync {
    /// Queue a read of `block` and return its completion handle.
    fn submit_read(&self, block: BlockNumber) -> PendingRead;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read a block and wait for it.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.submit_read(block).wait()
    }
}

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
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

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }
}

/// Adapts a [`ByteDevice`] to block addressing. Reads complete synchronously
/// inside `submit_read`.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

/// Block device over an image file.
pub type FileBlockDevice = ByteBlockDevice<FileByteDevice>;

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FsaError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(FsaError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / block_size_u64,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn read_now(&self, block: BlockNumber) -> ReadOutcome {
        if block.0 >= self.block_count {
            return Err(ReadFault::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ),
            ));
        }
        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| ReadFault::new(io::ErrorKind::InvalidInput, "block offset overflow"))?;
        let len = usize::try_from(self.block_size)
            .map_err(|_| ReadFault::new(io::ErrorKind::InvalidInput, "block_size exceeds usize"))?;
        let mut buf = vec![0_u8; len];
        self.inner
            .read_exact_at(offset, &mut buf)
            .map_err(|err| ReadFault::from_io(&err))?;
        Ok(BlockBuf::new(buf))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn submit_read(&self, block: BlockNumber) -> PendingRead {
        trace!(block = block.0, "byte_block_device: read");
        PendingRead::ready(block, self.read_now(block))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

impl FileBlockDevice {
    /// Open an image file as a block device with the given block size.
    pub fn open_image(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        Self::new(FileByteDevice::open(path)?, block_size)
    }
}

/// Read the ext4 superblock region (1024 bytes at byte offset 1024).
pub fn read_ext4_superblock_region(dev: &dyn BlockDevice) -> Result<[u8; EXT4_SUPERBLOCK_SIZE]> {
    let block_size = usize::try_from(dev.block_size())
        .map_err(|_| FsaError::Format("block_size does not fit usize".to_owned()))?;
    if block_size == 0 {
        return Err(FsaError::Format("device block_size is zero".to_owned()));
    }
    let block = EXT4_SUPERBLOCK_OFFSET / block_size;
    let within = EXT4_SUPERBLOCK_OFFSET % block_size;
    let end = within + EXT4_SUPERBLOCK_SIZE;
    if end > block_size {
        return Err(FsaError::Format(format!(
            "superblock region straddles blocks at block_size={block_size}"
        )));
    }

    let raw = dev.read_block(BlockNumber(block as u64))?;
    let Some(bytes) = raw.as_slice().get(within..end) else {
        return Err(FsaError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "superblock read returned {} bytes, need {end}",
                raw.as_slice().len()
            ),
        )));
    };
    let mut region = [0_u8; EXT4_SUPERBLOCK_SIZE];
    region.copy_from_slice(bytes);
    Ok(region)
}
