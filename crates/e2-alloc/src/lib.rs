#![forbid(unsafe_code)]
//! Block and inode allocation for ext2.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on one block or inode bitmap,
//!    LSB-first within each byte, 1 = in use.
//! 2. **GroupStats**: the cached descriptor of one group (bitmap and inode
//!    table locations, free counters).
//! 3. **Per-group allocate / free**: one bitmap read-modify-write plus the
//!    paired decrement or increment of both the group's and the superblock's
//!    free counter.
//!
//! Group selection policy lives with the caller; these functions only ever
//! touch the group they are handed. Nothing here writes the superblock; the
//! caller persists it together with the descriptor via
//! [`persist_group_desc`] once the bitmap change is on disk.

use e2_block::{BlockDevice, ByteDevice};
use e2_error::{E2Error, Result};
use e2_ondisk::{Ext2GroupDesc, Ext2Superblock};
use e2_types::{BlockNumber, BlockSize, EXT2_GROUP_DESC_SIZE, GroupNumber, InodeNumber};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        free += (0..remainder).filter(|bit| (byte >> bit) & 1 == 0).count() as u32;
    }

    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// scanning from `start` and wrapping around to 0.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = start.min(count);
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Resource kind ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Block,
    Inode,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Inode => "inode",
        }
    }

    fn exhausted(self, group: GroupNumber) -> E2Error {
        E2Error::BitmapExhausted {
            kind: self.as_str(),
            group: group.0,
        }
    }
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Superblock-derived numbers the allocator needs.
#[derive(Debug, Clone)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub block_size: BlockSize,
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub first_data_block: u32,
    pub group_count: u32,
    pub inode_size: u16,
    pub first_ino: u32,
}

impl FsGeometry {
    #[must_use]
    pub fn from_superblock(sb: &Ext2Superblock) -> Self {
        Self {
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            block_size: sb.block_size,
            total_blocks: sb.blocks_count,
            total_inodes: sb.inodes_count,
            first_data_block: sb.first_data_block,
            group_count: sb.group_count(),
            inode_size: sb.inode_size,
            first_ino: sb.first_ino,
        }
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = u64::from(self.total_blocks).saturating_sub(group_start);
        u32::try_from(remaining.min(u64::from(self.blocks_per_group))).unwrap_or(0)
    }

    /// Number of inodes in a specific group (last group may be shorter).
    #[must_use]
    pub fn inodes_in_group(&self, group: GroupNumber) -> u32 {
        let inode_start = u64::from(group.0) * u64::from(self.inodes_per_group);
        let remaining = u64::from(self.total_inodes).saturating_sub(inode_start);
        u32::try_from(remaining.min(u64::from(self.inodes_per_group))).unwrap_or(0)
    }

    /// `group * blocks_per_group + bit + first_data_block`.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        BlockNumber(
            self.first_data_block
                .saturating_add(group.0.saturating_mul(self.blocks_per_group))
                .saturating_add(rel_block),
        )
    }

    /// Convert absolute block to (group, relative_block).
    #[must_use]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(self.first_data_block);
        (
            GroupNumber(rel / self.blocks_per_group),
            rel % self.blocks_per_group,
        )
    }

    /// `group * inodes_per_group + bit + 1`.
    #[must_use]
    pub fn group_index_to_inode(&self, group: GroupNumber, idx: u32) -> InodeNumber {
        InodeNumber(
            group
                .0
                .saturating_mul(self.inodes_per_group)
                .saturating_add(idx)
                .saturating_add(1),
        )
    }

    /// Blocks occupied by one inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        let bytes = u64::from(self.inodes_per_group) * u64::from(self.inode_size);
        u32::try_from(bytes.div_ceil(u64::from(self.block_size.get()))).unwrap_or(u32::MAX)
    }

    /// Blocks occupied by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        let bytes = u64::from(self.group_count) * EXT2_GROUP_DESC_SIZE as u64;
        u32::try_from(bytes.div_ceil(u64::from(self.block_size.get()))).unwrap_or(u32::MAX)
    }
}

// ── Group stats ─────────────────────────────────────────────────────────────

/// Cached copy of one group descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
    pub block_bitmap_block: BlockNumber,
    pub inode_bitmap_block: BlockNumber,
    pub inode_table_block: BlockNumber,
}

impl GroupStats {
    #[must_use]
    pub fn from_group_desc(group: GroupNumber, gd: &Ext2GroupDesc) -> Self {
        Self {
            group,
            free_blocks: u32::from(gd.free_blocks_count),
            free_inodes: u32::from(gd.free_inodes_count),
            used_dirs: u32::from(gd.used_dirs_count),
            block_bitmap_block: BlockNumber(gd.block_bitmap),
            inode_bitmap_block: BlockNumber(gd.inode_bitmap),
            inode_table_block: BlockNumber(gd.inode_table),
        }
    }
}

/// Result of a block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    pub block: BlockNumber,
    pub group: GroupNumber,
}

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: InodeNumber,
    pub group: GroupNumber,
}

// ── Descriptor persistence ──────────────────────────────────────────────────

fn desc_offset(sb: &Ext2Superblock, group: GroupNumber) -> Result<u64> {
    sb.group_desc_offset(group).ok_or_else(|| {
        E2Error::Format(format!("group descriptor offset overflows for group {group}"))
    })
}

fn gdt_corruption(sb: &Ext2Superblock, group: GroupNumber, detail: String) -> E2Error {
    E2Error::Corruption {
        block: sb.first_data_block.saturating_add(1),
        detail: format!("group descriptor {group}: {detail}"),
    }
}

/// Load one group descriptor from the table.
pub fn read_group_desc(
    dev: &dyn ByteDevice,
    sb: &Ext2Superblock,
    group: GroupNumber,
) -> Result<GroupStats> {
    if group.0 >= sb.group_count() {
        return Err(E2Error::Corruption {
            block: 0,
            detail: format!("group {group} out of range (count {})", sb.group_count()),
        });
    }
    let offset = desc_offset(sb, group)?;
    let mut raw = [0_u8; EXT2_GROUP_DESC_SIZE];
    dev.read_exact_at(offset, &mut raw)?;
    let gd = Ext2GroupDesc::parse_from_bytes(&raw)
        .map_err(|e| gdt_corruption(sb, group, e.to_string()))?;
    trace!(group = group.0, offset, "loaded group descriptor");
    Ok(GroupStats::from_group_desc(group, &gd))
}

/// Write a group's counters back to its descriptor slot.
///
/// Reads the 32-byte record, patches the counters and writes it back, so
/// bitmap and table locations are never rewritten from the cache.
pub fn persist_group_desc(
    dev: &dyn ByteDevice,
    sb: &Ext2Superblock,
    stats: &GroupStats,
) -> Result<()> {
    let group = stats.group;
    let offset = desc_offset(sb, group)?;
    let mut raw = [0_u8; EXT2_GROUP_DESC_SIZE];
    dev.read_exact_at(offset, &mut raw)?;
    let existing = Ext2GroupDesc::parse_from_bytes(&raw)
        .map_err(|e| gdt_corruption(sb, group, e.to_string()))?;

    let narrow = |value: u32, field: &str| {
        u16::try_from(value)
            .map_err(|_| gdt_corruption(sb, group, format!("{field}={value} overflows u16")))
    };
    let updated = Ext2GroupDesc {
        free_blocks_count: narrow(stats.free_blocks, "free_blocks")?,
        free_inodes_count: narrow(stats.free_inodes, "free_inodes")?,
        used_dirs_count: narrow(stats.used_dirs, "used_dirs")?,
        ..existing
    };
    updated
        .write_into(&mut raw)
        .map_err(|e| gdt_corruption(sb, group, e.to_string()))?;
    dev.write_all_at(offset, &raw)?;
    debug!(
        group = group.0,
        free_blocks = stats.free_blocks,
        free_inodes = stats.free_inodes,
        used_dirs = stats.used_dirs,
        "persisted group descriptor"
    );
    Ok(())
}

// ── Reserved metadata ───────────────────────────────────────────────────────

/// Relative offsets of metadata blocks inside `group` that must never be
/// handed out: the bitmaps, the inode table and, in group 0, the
/// superblock and descriptor table.
#[must_use]
pub fn reserved_blocks_in_group(geo: &FsGeometry, gs: &GroupStats) -> Vec<u32> {
    let group_start = u64::from(geo.first_data_block)
        + u64::from(gs.group.0) * u64::from(geo.blocks_per_group);
    let blocks_in_group = u64::from(geo.blocks_in_group(gs.group));
    let mut reserved = Vec::new();

    let mut add_abs = |abs: u64| {
        if let Some(rel) = abs.checked_sub(group_start).filter(|rel| *rel < blocks_in_group) {
            reserved.push(u32::try_from(rel).unwrap_or(u32::MAX));
        }
    };

    add_abs(u64::from(gs.block_bitmap_block.0));
    add_abs(u64::from(gs.inode_bitmap_block.0));
    for i in 0..geo.inode_table_blocks() {
        add_abs(u64::from(gs.inode_table_block.0) + u64::from(i));
    }
    if gs.group.0 == 0 {
        let sb_block = u64::from(geo.first_data_block);
        add_abs(sb_block);
        for i in 0..geo.gdt_blocks() {
            add_abs(sb_block + 1 + u64::from(i));
        }
    }

    reserved.sort_unstable();
    reserved.dedup();
    reserved
}

fn is_reserved(reserved: &[u32], rel_block: u32) -> bool {
    reserved.binary_search(&rel_block).is_ok()
}

/// `counter - 1`, or `Corruption` when the count is already zero. Callers
/// compute this before touching the bitmap so a failure leaves the disk as
/// it was.
fn decremented(counter: u32, what: &str, block: BlockNumber) -> Result<u32> {
    counter.checked_sub(1).ok_or_else(|| E2Error::Corruption {
        block: block.0,
        detail: format!("{what} free count is zero but the bitmap has a clear bit"),
    })
}

// ── Inode allocation ────────────────────────────────────────────────────────

/// Allocate the first free inode of one group.
///
/// Inodes below `first_ino` are never returned. On success the bit is set on
/// disk and both free-inode counters are decremented; `used_dirs` is bumped
/// for directories.
pub fn try_alloc_inode_in_group(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    gs: &mut GroupStats,
    sb: &mut Ext2Superblock,
    is_directory: bool,
) -> Result<InodeAlloc> {
    let group = gs.group;
    if gs.free_inodes == 0 {
        return Err(ResourceKind::Inode.exhausted(group));
    }

    let bitmap_block = gs.inode_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();

    let mut search = bitmap.clone();
    if group.0 == 0 {
        for idx in 0..geo.first_ino.saturating_sub(1) {
            bitmap_set(&mut search, idx);
        }
    }
    let idx = bitmap_find_free(&search, geo.inodes_in_group(group), 0)
        .ok_or_else(|| ResourceKind::Inode.exhausted(group))?;

    let group_free = decremented(gs.free_inodes, "group inode", bitmap_block)?;
    let sb_free = decremented(sb.free_inodes_count, "superblock inode", bitmap_block)?;

    bitmap_set(&mut bitmap, idx);
    dev.write_block(bitmap_block, &bitmap)?;

    gs.free_inodes = group_free;
    sb.free_inodes_count = sb_free;
    if is_directory {
        gs.used_dirs = gs.used_dirs.saturating_add(1);
    }

    let ino = geo.group_index_to_inode(group, idx);
    debug!(ino = ino.0, group = group.0, is_directory, "allocated inode");
    Ok(InodeAlloc { ino, group })
}

/// Clear an inode's bitmap bit and give it back to both free counters.
pub fn free_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    gs: &mut GroupStats,
    sb: &mut Ext2Superblock,
    ino: InodeNumber,
    was_directory: bool,
) -> Result<()> {
    let group = e2_types::inode_to_group(ino, geo.inodes_per_group);
    if group != gs.group {
        return Err(E2Error::Corruption {
            block: gs.inode_bitmap_block.0,
            detail: format!("inode {ino} belongs to group {group}, not {}", gs.group),
        });
    }
    let idx = e2_types::inode_index_in_group(ino, geo.inodes_per_group);

    let bitmap_block = gs.inode_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
    if !bitmap_get(&bitmap, idx) {
        return Err(E2Error::Corruption {
            block: bitmap_block.0,
            detail: format!("double-free: inode {ino} already free in bitmap"),
        });
    }
    bitmap_clear(&mut bitmap, idx);
    dev.write_block(bitmap_block, &bitmap)?;

    gs.free_inodes = gs.free_inodes.saturating_add(1);
    sb.free_inodes_count = sb.free_inodes_count.saturating_add(1);
    if was_directory {
        gs.used_dirs = gs.used_dirs.saturating_sub(1);
    }
    debug!(ino = ino.0, group = group.0, "freed inode");
    Ok(())
}

// ── Block allocation ────────────────────────────────────────────────────────

/// Allocate the first free data block of one group.
///
/// Reserved metadata blocks are skipped even when their bit is clear.
pub fn try_alloc_block_in_group(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    gs: &mut GroupStats,
    sb: &mut Ext2Superblock,
) -> Result<BlockAlloc> {
    let group = gs.group;
    if gs.free_blocks == 0 {
        return Err(ResourceKind::Block.exhausted(group));
    }

    let bitmap_block = gs.block_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();

    let mut search = bitmap.clone();
    for r in reserved_blocks_in_group(geo, gs) {
        bitmap_set(&mut search, r);
    }
    let rel = bitmap_find_free(&search, geo.blocks_in_group(group), 0)
        .ok_or_else(|| ResourceKind::Block.exhausted(group))?;

    let group_free = decremented(gs.free_blocks, "group block", bitmap_block)?;
    let sb_free = decremented(sb.free_blocks_count, "superblock block", bitmap_block)?;

    bitmap_set(&mut bitmap, rel);
    dev.write_block(bitmap_block, &bitmap)?;

    gs.free_blocks = group_free;
    sb.free_blocks_count = sb_free;

    let block = geo.group_block_to_absolute(group, rel);
    debug!(block = block.0, group = group.0, "allocated block");
    Ok(BlockAlloc { block, group })
}

/// Free a batch of blocks that all live in `gs.group`.
///
/// Everything is validated before the bitmap is touched: a reserved block,
/// a block from another group, or one that is already free fails the whole
/// batch. The bitmap is written once.
pub fn free_blocks(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    gs: &mut GroupStats,
    sb: &mut Ext2Superblock,
    blocks: &[BlockNumber],
) -> Result<u32> {
    if blocks.is_empty() {
        return Ok(0);
    }
    let reserved = reserved_blocks_in_group(geo, gs);
    let bitmap_block = gs.block_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();

    let mut rels = Vec::with_capacity(blocks.len());
    for &block in blocks {
        let (group, rel) = geo.absolute_to_group_block(block);
        if group != gs.group || block.0 < geo.first_data_block {
            return Err(E2Error::Corruption {
                block: block.0,
                detail: format!("free_blocks: block not in group {}", gs.group),
            });
        }
        if is_reserved(&reserved, rel) {
            return Err(E2Error::Corruption {
                block: block.0,
                detail: "attempt to free reserved metadata block".into(),
            });
        }
        if !bitmap_get(&bitmap, rel) || rels.contains(&rel) {
            return Err(E2Error::Corruption {
                block: block.0,
                detail: "double-free: block already free in bitmap".into(),
            });
        }
        rels.push(rel);
    }

    for &rel in &rels {
        bitmap_clear(&mut bitmap, rel);
    }
    dev.write_block(bitmap_block, &bitmap)?;

    let count = u32::try_from(rels.len()).unwrap_or(u32::MAX);
    gs.free_blocks = gs.free_blocks.saturating_add(count);
    sb.free_blocks_count = sb.free_blocks_count.saturating_add(count);
    debug!(group = gs.group.0, count, "freed blocks");
    Ok(count)
}
