#![forbid(unsafe_code)]
//! Shared newtypes and byte-level helpers for the ext2 engine.
//!
//! Everything here is pure: no I/O, no allocation policy. Numbers that mean
//! different things on disk (blocks, inodes, groups, byte offsets) get their
//! own wrapper so they cannot be mixed at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Size of one group descriptor record.
pub const EXT2_GROUP_DESC_SIZE: usize = 32;
/// Inode record size of revision-0 images.
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
pub const EXT2_NAME_LEN: usize = 255;

// Block pointer slots inside `i_block`.
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = 12;
pub const EXT2_DIND_BLOCK: usize = 13;
pub const EXT2_TIND_BLOCK: usize = 14;
pub const EXT2_N_BLOCKS: usize = 15;

// ── Inode mode bits ─────────────────────────────────────────────────────────

/// File type mask.
pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;

/// `i_blocks` is counted in 512-byte sectors regardless of block size.
pub const EXT2_SECTOR_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Validated block size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN: Self = Self(1024);

    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    /// `1024 << log_block_size`, as stored in the superblock.
    pub fn from_log(log_block_size: u32) -> Result<Self, ParseError> {
        let value = 10_u32
            .checked_add(log_block_size)
            .and_then(|shift| 1_u32.checked_shl(shift))
            .ok_or(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "shift overflows",
            })?;
        Self::new(value)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of 32-bit block pointers that fit in one block.
    #[must_use]
    pub fn pointers_per_block(self) -> u32 {
        self.0 / 4
    }

    /// Byte offset of a 1-based block number: `1024 + (block - 1) * size`.
    ///
    /// Block 0 has no location and yields `None`.
    #[must_use]
    pub fn block_offset(self, block: BlockNumber) -> Option<ByteOffset> {
        let index = u64::from(block.0.checked_sub(1)?);
        index
            .checked_mul(u64::from(self.0))?
            .checked_add(EXT2_SUPERBLOCK_OFFSET as u64)
            .map(ByteOffset)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let available = data.len();
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= available)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        })?;
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Narrow a `usize` to `u16` with an explicit error path.
pub fn usize_to_u16(value: usize, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── Group math ──────────────────────────────────────────────────────────────

/// Owning group of an inode: `(ino - 1) / inodes_per_group`.
#[must_use]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(ino.0.saturating_sub(1) / inodes_per_group)
}

/// Slot of an inode inside its group's table and bitmap.
#[must_use]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ino.0.saturating_sub(1) % inodes_per_group
}

/// Owning group of a block, with `first_data_block` subtracted first.
#[must_use]
pub fn block_to_group(
    block: BlockNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> GroupNumber {
    GroupNumber(block.0.saturating_sub(first_data_block) / blocks_per_group)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_u8(&bytes, 7).expect("u8"), 0x90);
    }

    #[test]
    fn test_read_past_end_reports_shortfall() {
        let bytes = [0_u8; 3];
        let err = read_le_u32(&bytes, 1).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn test_write_helpers_roundtrip_in_place() {
        let mut buf = [0_u8; 8];
        write_le_u16(&mut buf, 0, 0xEF53).unwrap();
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF).unwrap();
        write_u8(&mut buf, 7, 9).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0xEF53);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf[6], 0);
        assert_eq!(buf[7], 9);
        assert!(write_le_u32(&mut buf, 6, 1).is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"rootfs\0\0\0\0"), "rootfs");
        assert_eq!(trim_nul_padded(b"\0\0\0"), "");
    }

    #[test]
    fn test_block_size_validation() {
        assert_eq!(BlockSize::from_log(0).unwrap().get(), 1024);
        assert_eq!(BlockSize::from_log(2).unwrap().get(), 4096);
        assert!(BlockSize::from_log(7).is_err());
        assert!(BlockSize::from_log(40).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert_eq!(BlockSize::MIN.pointers_per_block(), 256);
    }

    #[test]
    fn test_block_offset_is_one_based() {
        let bs = BlockSize::MIN;
        assert_eq!(bs.block_offset(BlockNumber(0)), None);
        assert_eq!(bs.block_offset(BlockNumber(1)), Some(ByteOffset(1024)));
        assert_eq!(bs.block_offset(BlockNumber(2)), Some(ByteOffset(2048)));
        assert_eq!(bs.block_offset(BlockNumber(13)), Some(ByteOffset(13 * 1024)));
    }

    #[test]
    fn test_inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 64), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(64), 64), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(65), 64), GroupNumber(1));

        assert_eq!(inode_index_in_group(InodeNumber(1), 64), 0);
        assert_eq!(inode_index_in_group(InodeNumber(64), 64), 63);
        assert_eq!(inode_index_in_group(InodeNumber(65), 64), 0);
    }

    #[test]
    fn test_block_group_math() {
        assert_eq!(block_to_group(BlockNumber(1), 8192, 1), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8192), 8192, 1), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8193), 8192, 1), GroupNumber(1));
    }

    #[test]
    fn test_narrowing_helpers() {
        assert_eq!(usize_to_u16(1024, "rec_len").unwrap(), 1024);
        assert_eq!(
            usize_to_u16(70_000, "rec_len").unwrap_err(),
            ParseError::IntegerConversion { field: "rec_len" }
        );
        assert!(u64_to_u32(u64::from(u32::MAX) + 1, "size").is_err());
    }
}
