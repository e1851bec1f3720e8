#![forbid(unsafe_code)]
//! ext2 filesystem context.
//!
//! [`FileSystem`] owns everything one mounted image needs: the device, the
//! cached superblock, the last-loaded group descriptor and the current
//! directory with its path stack. Every operation goes through `&mut self`;
//! there is no global state and no second context may touch the same image.
//!
//! Multi-step mutations (allocate, write entries, persist counters) each
//! live behind a single method so they can later be wrapped as one unit.

mod command;
mod ops;
mod output;
mod path;

pub use command::{Command, CommandOutput, HostFs, SinkProvider};
pub use output::{DirListing, FileAttr, FsInfo, ListEntry, format_mtime, format_size};
pub use path::PathStack;

use e2_alloc::{
    BlockAlloc, FsGeometry, GroupStats, InodeAlloc, free_blocks, free_inode, persist_group_desc,
    read_group_desc, try_alloc_block_in_group, try_alloc_inode_in_group,
};
use e2_block::{
    BlockDevice, ByteDevice, Ext2BlockDevice, FileByteDevice, read_superblock_region,
    write_superblock_region,
};
use e2_dir::DirBlock;
use e2_error::{E2Error, Result};
use e2_inode::group_of;
use e2_ondisk::{Ext2Inode, Ext2Superblock};
use e2_types::{
    BlockNumber, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber, ParseError, block_to_group,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

// ── Open options ────────────────────────────────────────────────────────────

/// Options controlling how an image is mounted.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Refuse every mutating operation with `ReadOnly` before any I/O.
    pub read_only: bool,
    /// Skip geometry validation beyond the magic check. Diagnostics only.
    pub skip_validation: bool,
}

/// Map a superblock decode failure to the mount-time error taxonomy.
fn mount_error(e: &ParseError) -> E2Error {
    match e {
        ParseError::InvalidMagic { actual, .. } => E2Error::NotAnExt2Image {
            actual: u16::try_from(*actual).unwrap_or(u16::MAX),
        },
        ParseError::InvalidField { field, reason } => {
            if field.contains("block_size") {
                E2Error::UnsupportedBlockSize(format!("{field}: {reason}"))
            } else {
                E2Error::InvalidGeometry(format!("{field}: {reason}"))
            }
        }
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            E2Error::Format(e.to_string())
        }
    }
}

/// Seconds since the epoch, saturated to the 32-bit on-disk field.
pub(crate) fn now_epoch() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

// ── FileSystem ──────────────────────────────────────────────────────────────

/// The current directory: inode number plus its decoded inode.
#[derive(Debug, Clone)]
pub(crate) struct Cwd {
    pub(crate) ino: InodeNumber,
    pub(crate) inode: Ext2Inode,
}

/// A mounted ext2 image.
pub struct FileSystem {
    dev: Ext2BlockDevice,
    sb_region: [u8; EXT2_SUPERBLOCK_SIZE],
    sb: Ext2Superblock,
    geo: FsGeometry,
    group: GroupStats,
    cwd: Cwd,
    path: PathStack,
    read_only: bool,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("dev", &self.dev)
            .field("geo", &self.geo)
            .field("group", &self.group.group)
            .field("cwd", &self.cwd.ino)
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl FileSystem {
    /// Mount the image at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = if options.read_only {
            FileByteDevice::open_read_only(path.as_ref())?
        } else {
            FileByteDevice::open(path.as_ref())?
        };
        Self::from_device(Box::new(dev), options)
    }

    /// Mount an already-opened device.
    ///
    /// Fails with `NotAnExt2Image` on a bad magic, `UnsupportedBlockSize`
    /// when the first data block is not 1, and `InvalidGeometry` for
    /// impossible group parameters.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let sb_region = read_superblock_region(&*dev)?;
        let sb = Ext2Superblock::parse_superblock_region(&sb_region).map_err(|e| mount_error(&e))?;

        if sb.first_data_block != 1 {
            return Err(E2Error::UnsupportedBlockSize(format!(
                "block size {} with first data block {}; only 1 KiB-block images are addressable",
                sb.block_size, sb.first_data_block
            )));
        }
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(E2Error::InvalidGeometry(format!(
                "blocks_per_group={} inodes_per_group={}",
                sb.blocks_per_group, sb.inodes_per_group
            )));
        }
        if !options.skip_validation {
            sb.validate_geometry().map_err(|e| mount_error(&e))?;
        }

        let read_only = options.read_only || !dev.is_writable();
        let geo = FsGeometry::from_superblock(&sb);
        let dev = Ext2BlockDevice::new(dev, sb.block_size, sb.blocks_count)?;

        let root_group = group_of(&geo, InodeNumber::ROOT);
        let group = read_group_desc(dev.bytes(), &sb, root_group)?;
        let root = e2_inode::read_inode(&dev, &geo, &group, InodeNumber::ROOT)?;
        if !root.is_dir() {
            return Err(E2Error::Format(format!(
                "root inode has mode {:#o}, not a directory",
                root.mode
            )));
        }

        info!(
            volume = %sb.volume_name,
            block_size = sb.block_size.get(),
            blocks = sb.blocks_count,
            inodes = sb.inodes_count,
            groups = geo.group_count,
            read_only,
            "mounted ext2 image"
        );

        Ok(Self {
            dev,
            sb_region,
            sb,
            geo,
            group,
            cwd: Cwd {
                ino: InodeNumber::ROOT,
                inode: root,
            },
            path: PathStack::default(),
            read_only,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Inode number of the current directory.
    #[must_use]
    pub fn cwd(&self) -> InodeNumber {
        self.cwd.ino
    }

    /// Index of the cached group descriptor.
    #[must_use]
    pub fn current_group(&self) -> GroupNumber {
        self.group.group
    }

    #[must_use]
    pub fn path_stack(&self) -> &PathStack {
        &self.path
    }

    /// Flush the device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    // ── Group cache ──────────────────────────────────────────────────────

    /// Descriptor of `group`, loading it when the cache holds another one.
    pub(crate) fn group_stats(&mut self, group: GroupNumber) -> Result<GroupStats> {
        if self.group.group != group {
            self.group = read_group_desc(self.dev.bytes(), &self.sb, group)?;
            debug!(group = group.0, "switched group");
        }
        Ok(self.group.clone())
    }

    /// Write `gs` to its descriptor slot and the superblock counters to the
    /// superblock, then make `gs` the cached group.
    pub(crate) fn persist(&mut self, gs: &GroupStats) -> Result<()> {
        persist_group_desc(self.dev.bytes(), &self.sb, gs)?;
        self.sb
            .write_counts_into(&mut self.sb_region)
            .map_err(|e| E2Error::Corruption {
                block: 1,
                detail: format!("superblock: {e}"),
            })?;
        write_superblock_region(self.dev.bytes(), &self.sb_region)?;
        self.group = gs.clone();
        debug!(
            group = gs.group.0,
            free_blocks = self.sb.free_blocks_count,
            free_inodes = self.sb.free_inodes_count,
            "persisted superblock"
        );
        Ok(())
    }

    // ── Inodes and directory blocks ──────────────────────────────────────

    pub(crate) fn read_inode(&mut self, ino: InodeNumber) -> Result<Ext2Inode> {
        let gs = self.group_stats(group_of(&self.geo, ino))?;
        e2_inode::read_inode(&self.dev, &self.geo, &gs, ino)
    }

    pub(crate) fn write_inode(&mut self, ino: InodeNumber, inode: &Ext2Inode) -> Result<()> {
        let gs = self.group_stats(group_of(&self.geo, ino))?;
        e2_inode::write_inode(&self.dev, &self.geo, &gs, ino, inode)?;
        if ino == self.cwd.ino {
            self.cwd.inode = inode.clone();
        }
        Ok(())
    }

    /// Write a newly allocated inode over a zeroed record.
    pub(crate) fn init_inode(&mut self, ino: InodeNumber, inode: &Ext2Inode) -> Result<()> {
        let gs = self.group_stats(group_of(&self.geo, ino))?;
        e2_inode::init_inode(&self.dev, &self.geo, &gs, ino, inode)
    }

    /// The single data block of a directory inode.
    pub(crate) fn dir_block(&self, ino: InodeNumber, inode: &Ext2Inode) -> Result<DirBlock> {
        let block = BlockNumber(inode.block[0]);
        if block.0 == 0 {
            return Err(E2Error::Corruption {
                block: 0,
                detail: format!("directory inode {ino} has no data block"),
            });
        }
        let raw = self.dev.read_block(block)?;
        DirBlock::parse(raw.as_slice(), block)
    }

    pub(crate) fn cwd_dir(&self) -> Result<DirBlock> {
        self.dir_block(self.cwd.ino, &self.cwd.inode)
    }

    pub(crate) fn write_dir(&self, dir: &DirBlock) -> Result<()> {
        self.dev.write_block(dir.block(), &dir.encode()?)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(E2Error::ReadOnly);
        }
        Ok(())
    }

    // ── Allocation policy ────────────────────────────────────────────────

    /// `preferred` first, then every other group in ascending order.
    fn group_order(&self, preferred: GroupNumber) -> impl Iterator<Item = GroupNumber> + use<> {
        let preferred = GroupNumber(preferred.0.min(self.geo.group_count.saturating_sub(1)));
        std::iter::once(preferred).chain(
            (0..self.geo.group_count)
                .map(GroupNumber)
                .filter(move |g| *g != preferred),
        )
    }

    pub(crate) fn alloc_inode(
        &mut self,
        preferred: GroupNumber,
        is_directory: bool,
    ) -> Result<InodeAlloc> {
        for group in self.group_order(preferred) {
            let mut gs = self.group_stats(group)?;
            if gs.free_inodes == 0 {
                continue;
            }
            match try_alloc_inode_in_group(&self.dev, &self.geo, &mut gs, &mut self.sb, is_directory)
            {
                Ok(alloc) => {
                    self.persist(&gs)?;
                    return Ok(alloc);
                }
                Err(E2Error::BitmapExhausted { .. }) => {
                    warn!(group = group.0, "free inode count disagrees with bitmap");
                }
                Err(e) => return Err(e),
            }
        }
        Err(E2Error::BitmapExhausted {
            kind: "inode",
            group: preferred.0,
        })
    }

    pub(crate) fn alloc_block(&mut self, preferred: GroupNumber) -> Result<BlockAlloc> {
        for group in self.group_order(preferred) {
            let mut gs = self.group_stats(group)?;
            if gs.free_blocks == 0 {
                continue;
            }
            match try_alloc_block_in_group(&self.dev, &self.geo, &mut gs, &mut self.sb) {
                Ok(alloc) => {
                    self.persist(&gs)?;
                    return Ok(alloc);
                }
                Err(E2Error::BitmapExhausted { .. }) => {
                    warn!(group = group.0, "free block count disagrees with bitmap");
                }
                Err(e) => return Err(e),
            }
        }
        Err(E2Error::BitmapExhausted {
            kind: "block",
            group: preferred.0,
        })
    }

    /// Free blocks, one bitmap write and one persist per touched group.
    pub(crate) fn release_blocks(
        &mut self,
        blocks: impl IntoIterator<Item = BlockNumber>,
    ) -> Result<u32> {
        let mut by_group: BTreeMap<GroupNumber, Vec<BlockNumber>> = BTreeMap::new();
        for block in blocks {
            let group = block_to_group(block, self.geo.blocks_per_group, self.geo.first_data_block);
            by_group.entry(group).or_default().push(block);
        }

        let mut total = 0;
        for (group, blocks) in by_group {
            let mut gs = self.group_stats(group)?;
            total += free_blocks(&self.dev, &self.geo, &mut gs, &mut self.sb, &blocks)?;
            self.persist(&gs)?;
        }
        Ok(total)
    }

    pub(crate) fn release_inode(&mut self, ino: InodeNumber, was_directory: bool) -> Result<()> {
        let mut gs = self.group_stats(group_of(&self.geo, ino))?;
        free_inode(&self.dev, &self.geo, &mut gs, &mut self.sb, ino, was_directory)?;
        self.persist(&gs)
    }
}
