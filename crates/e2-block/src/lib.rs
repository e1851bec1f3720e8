#![forbid(unsafe_code)]
//! Raw device access for ext2 images.
//!
//! `ByteDevice` is positioned I/O over the image (pread/pwrite semantics).
//! `Ext2BlockDevice` layers the 1-based ext2 block numbering on top of it:
//! block `b` lives at byte `1024 + (b - 1) * block_size`, and block 0 is
//! never addressed.

use e2_error::{E2Error, Result};
use e2_types::{BlockNumber, BlockSize, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == block size of the originating device.
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
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Whether `write_all_at` can succeed.
    fn is_writable(&self) -> bool;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// A range past the end of the device is an I/O failure of the one access,
/// never a reason to drop the mount.
fn checked_end(offset: u64, len: usize, device_len: u64, op: &str) -> Result<u64> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{op} range overflows u64"))
        })?;
    if end > device_len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{op} out of bounds: offset={offset} len={len} device_len={device_len}"),
        )
        .into());
    }
    Ok(end)
}

/// File-backed image using `FileExt` positioned reads and writes.
///
/// Opens read-write when permitted and falls back to read-only.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        trace!(path = %path.as_ref().display(), len, writable, "opened image file");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Open without requesting write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(E2Error::ReadOnly);
        }
        checked_end(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory image. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let device_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_end(offset, buf.len(), device_len, "read")?;
        let (start, end) = usize_range(offset, end)?;
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let device_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_end(offset, buf.len(), device_len, "write")?;
        let (start, end) = usize_range(offset, end)?;
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn usize_range(start: u64, end: u64) -> Result<(usize, usize)> {
    let conv = |v: u64| {
        usize::try_from(v).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))
    };
    Ok((conv(start)?, conv(end)?))
}

/// Block-addressed I/O interface.
pub trait BlockDevice {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    fn block_size(&self) -> BlockSize;

    /// Total number of blocks, including the boot block.
    fn block_count(&self) -> u32;
}

/// ext2 block addressing over a byte device.
pub struct Ext2BlockDevice {
    inner: Box<dyn ByteDevice>,
    block_size: BlockSize,
    block_count: u32,
}

impl std::fmt::Debug for Ext2BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2BlockDevice")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("len_bytes", &self.inner.len_bytes())
            .finish_non_exhaustive()
    }
}

impl Ext2BlockDevice {
    pub fn new(inner: Box<dyn ByteDevice>, block_size: BlockSize, block_count: u32) -> Result<Self> {
        let needed = block_size
            .block_offset(BlockNumber(block_count))
            .ok_or_else(|| E2Error::InvalidGeometry(format!("block_count={block_count}")))?;
        if needed.0 > inner.len_bytes() {
            return Err(E2Error::Format(format!(
                "image truncated: {block_count} blocks of {block_size} bytes need {} bytes, image has {}",
                needed.0,
                inner.len_bytes()
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    /// Byte-level access for records smaller than a block.
    #[must_use]
    pub fn bytes(&self) -> &dyn ByteDevice {
        self.inner.as_ref()
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 == 0 || block.0 >= self.block_count {
            return Err(E2Error::Corruption {
                block: block.0,
                detail: format!("block out of range 1..{}", self.block_count),
            });
        }
        self.block_size
            .block_offset(block)
            .map(|off| off.0)
            .ok_or_else(|| E2Error::Corruption {
                block: block.0,
                detail: "block offset overflows u64".to_owned(),
            })
    }

    /// Byte offset of `block` plus `within`, validated against the device.
    pub fn byte_offset(&self, block: BlockNumber, within: usize) -> Result<u64> {
        let base = self.offset_of(block)?;
        u64::try_from(within)
            .ok()
            .filter(|w| *w < u64::from(self.block_size.get()))
            .and_then(|w| base.checked_add(w))
            .ok_or_else(|| E2Error::Corruption {
                block: block.0,
                detail: format!("offset {within} outside the block"),
            })
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

impl BlockDevice for Ext2BlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, offset, "read block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size.as_usize() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write_block data size mismatch: got={} expected={}",
                    data.len(),
                    self.block_size
                ),
            )
            .into());
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(block = block.0, offset, "wrote block");
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }
}

/// Read the superblock region (1024 bytes at offset 1024).
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    dev.read_exact_at(EXT2_SUPERBLOCK_OFFSET as u64, &mut buf)?;
    Ok(buf)
}

/// Rewrite the whole superblock region.
pub fn write_superblock_region(dev: &dyn ByteDevice, region: &[u8; EXT2_SUPERBLOCK_SIZE]) -> Result<()> {
    dev.write_all_at(EXT2_SUPERBLOCK_OFFSET as u64, region)
}
