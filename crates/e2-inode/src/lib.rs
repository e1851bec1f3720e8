#![forbid(unsafe_code)]
//! Inode table access and block indirection.
//!
//! An inode lives in the table of the group `(ino - 1) / inodes_per_group`,
//! at slot `(ino - 1) % inodes_per_group`. Records are `inode_size` bytes
//! and never straddle a block boundary because the record size is a power
//! of two no larger than the block size.
//!
//! Data is reached through [`BlockMapper`]: twelve direct pointers, one
//! single-indirect and one double-indirect table. The triple-indirect slot
//! is never followed; anything that needs it fails with `FileTooLarge`.

mod indirect;

pub use indirect::{
    BlockMapper, FileReader, ReachableBlocks, max_addressable_blocks, reachable_blocks, stream_to,
    write_within,
};

use e2_alloc::{FsGeometry, GroupStats};
use e2_block::Ext2BlockDevice;
use e2_error::{E2Error, Result};
use e2_ondisk::Ext2Inode;
use e2_types::{BlockNumber, GroupNumber, InodeNumber, inode_index_in_group, inode_to_group};
use tracing::trace;

/// Group that owns `ino`.
#[must_use]
pub fn group_of(geo: &FsGeometry, ino: InodeNumber) -> GroupNumber {
    inode_to_group(ino, geo.inodes_per_group)
}

/// Block and in-block byte offset of an inode record.
///
/// `gs` must be the descriptor of the owning group; a mismatch is reported
/// as corruption.
pub fn inode_location(
    geo: &FsGeometry,
    gs: &GroupStats,
    ino: InodeNumber,
) -> Result<(BlockNumber, usize)> {
    if ino.0 == 0 || ino.0 > geo.total_inodes {
        return Err(E2Error::Corruption {
            block: gs.inode_table_block.0,
            detail: format!("inode {ino} out of range 1..={}", geo.total_inodes),
        });
    }
    let owner = group_of(geo, ino);
    if owner != gs.group {
        return Err(E2Error::Corruption {
            block: gs.inode_table_block.0,
            detail: format!("inode {ino} belongs to group {owner}, not {}", gs.group),
        });
    }

    let index = u64::from(inode_index_in_group(ino, geo.inodes_per_group));
    let byte = index * u64::from(geo.inode_size);
    let bs = u64::from(geo.block_size.get());
    let block = u32::try_from(byte / bs)
        .ok()
        .and_then(|rel| gs.inode_table_block.0.checked_add(rel))
        .ok_or_else(|| E2Error::Corruption {
            block: gs.inode_table_block.0,
            detail: format!("inode {ino} lies past the end of the addressable range"),
        })?;
    // byte % bs < block size, which always fits in usize
    let within = usize::try_from(byte % bs).unwrap_or(0);
    Ok((BlockNumber(block), within))
}

fn record_offset(
    dev: &Ext2BlockDevice,
    geo: &FsGeometry,
    gs: &GroupStats,
    ino: InodeNumber,
) -> Result<(u64, BlockNumber)> {
    let (block, within) = inode_location(geo, gs, ino)?;
    Ok((dev.byte_offset(block, within)?, block))
}

/// Read and decode one inode.
pub fn read_inode(
    dev: &Ext2BlockDevice,
    geo: &FsGeometry,
    gs: &GroupStats,
    ino: InodeNumber,
) -> Result<Ext2Inode> {
    let (offset, block) = record_offset(dev, geo, gs, ino)?;
    let mut raw = vec![0_u8; usize::from(geo.inode_size)];
    dev.bytes().read_exact_at(offset, &mut raw)?;
    trace!(ino = ino.0, block = block.0, offset, "read inode");
    Ext2Inode::parse_from_bytes(&raw).map_err(|e| E2Error::Corruption {
        block: block.0,
        detail: format!("inode {ino}: {e}"),
    })
}

/// Encode `inode` over its on-disk record.
///
/// The record is read first so bytes this engine does not model (OS
/// fields, the extended area of large inodes) survive the rewrite.
pub fn write_inode(
    dev: &Ext2BlockDevice,
    geo: &FsGeometry,
    gs: &GroupStats,
    ino: InodeNumber,
    inode: &Ext2Inode,
) -> Result<()> {
    let (offset, block) = record_offset(dev, geo, gs, ino)?;
    let mut raw = vec![0_u8; usize::from(geo.inode_size)];
    dev.bytes().read_exact_at(offset, &mut raw)?;
    encode_record(dev, offset, block, ino, inode, &mut raw)?;
    trace!(ino = ino.0, block = block.0, offset, "wrote inode");
    Ok(())
}

/// Write a freshly allocated inode over a zeroed record.
///
/// Whatever a previous occupant left in the slot (`i_faddr`, `i_dir_acl`,
/// OS fields, in-inode xattrs) is cleared.
pub fn init_inode(
    dev: &Ext2BlockDevice,
    geo: &FsGeometry,
    gs: &GroupStats,
    ino: InodeNumber,
    inode: &Ext2Inode,
) -> Result<()> {
    let (offset, block) = record_offset(dev, geo, gs, ino)?;
    let mut raw = vec![0_u8; usize::from(geo.inode_size)];
    encode_record(dev, offset, block, ino, inode, &mut raw)?;
    trace!(ino = ino.0, block = block.0, offset, "initialised inode");
    Ok(())
}

fn encode_record(
    dev: &Ext2BlockDevice,
    offset: u64,
    block: BlockNumber,
    ino: InodeNumber,
    inode: &Ext2Inode,
    raw: &mut [u8],
) -> Result<()> {
    inode.write_into(raw).map_err(|e| E2Error::Corruption {
        block: block.0,
        detail: format!("inode {ino}: {e}"),
    })?;
    dev.bytes().write_all_at(offset, raw)?;
    Ok(())
}
