//! The operations of the command surface, on top of [`FileSystem`].
//!
//! Mutations validate names, existence and type before touching a bitmap,
//! and check for room in the directory block before allocating. Deletions
//! rewrite the parent directory first and free blocks and inodes after it.

use crate::command::SinkProvider;
use crate::output::{DirListing, FileAttr, FsInfo, ListEntry};
use crate::{FileSystem, now_epoch};
use e2_block::BlockDevice;
use e2_dir::{init_dir_block, validate_name};
use e2_error::{E2Error, Result};
use e2_inode::{group_of, reachable_blocks, stream_to, write_within};
use e2_ondisk::{Ext2FileType, Ext2Inode};
use e2_types::InodeNumber;
use std::io::Write;
use tracing::{debug, warn};

impl FileSystem {
    /// Resolve `name` in the current directory.
    fn lookup(&mut self, name: &str) -> Result<(InodeNumber, Ext2Inode)> {
        let dir = self.cwd_dir()?;
        let ino = dir
            .lookup(name.as_bytes())
            .map(|e| InodeNumber(e.inode))
            .ok_or_else(|| E2Error::NotFound(name.to_owned()))?;
        let inode = self.read_inode(ino)?;
        Ok((ino, inode))
    }

    // ── Read-only operations ─────────────────────────────────────────────

    #[must_use]
    pub fn info(&self) -> FsInfo {
        FsInfo::new(&self.sb, &self.geo)
    }

    /// Every record of the current directory block, in on-disk order.
    pub fn ls(&self) -> Result<DirListing> {
        let dir = self.cwd_dir()?;
        Ok(DirListing {
            path: self.pwd(),
            entries: dir.entries().iter().map(ListEntry::from).collect(),
        })
    }

    /// Stream the bytes of `name` into `out`. Returns the byte count.
    pub fn cat(&mut self, name: &str, out: &mut dyn Write) -> Result<u64> {
        let (ino, inode) = self.lookup(name)?;
        if inode.is_dir() {
            return Err(E2Error::IsADirectory(name.to_owned()));
        }
        let n = stream_to(&self.dev, &inode, out)?;
        debug!(ino = ino.0, bytes = n, "cat");
        Ok(n)
    }

    /// Copy `name` to a host file opened through `sinks`.
    ///
    /// The source is resolved and type-checked before the sink is opened,
    /// so a failed lookup leaves no host file behind.
    pub fn cp(&mut self, name: &str, dest: &str, sinks: &mut dyn SinkProvider) -> Result<u64> {
        let (ino, inode) = self.lookup(name)?;
        if inode.is_dir() {
            return Err(E2Error::IsADirectory(name.to_owned()));
        }
        let mut sink = sinks.open_sink(dest)?;
        let n = stream_to(&self.dev, &inode, &mut *sink)?;
        debug!(ino = ino.0, dest, bytes = n, "copied to host");
        Ok(n)
    }

    pub fn attr(&mut self, name: &str) -> Result<FileAttr> {
        let (ino, inode) = self.lookup(name)?;
        Ok(FileAttr::new(name, ino, &inode))
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Create an empty regular file in the current directory.
    pub fn touch(&mut self, name: &str) -> Result<InodeNumber> {
        self.ensure_writable()?;
        validate_name(name)?;
        let mut dir = self.cwd_dir()?;
        if dir.lookup(name.as_bytes()).is_some() {
            return Err(E2Error::AlreadyExists(name.to_owned()));
        }
        if !dir.can_append(name.len()) {
            return Err(E2Error::DirectoryFull {
                block: dir.block().0,
            });
        }

        let preferred = group_of(&self.geo, self.cwd.ino);
        let alloc = self.alloc_inode(preferred, false)?;
        self.init_inode(alloc.ino, &Ext2Inode::new_regular_file(now_epoch()))?;

        dir.append(alloc.ino, name.as_bytes(), Ext2FileType::RegFile)?;
        self.write_dir(&dir)?;
        debug!(ino = alloc.ino.0, group = alloc.group.0, entry = name, "created file");
        Ok(alloc.ino)
    }

    /// Create a directory with one data block holding `.` and `..`.
    pub fn mkdir(&mut self, name: &str) -> Result<InodeNumber> {
        self.ensure_writable()?;
        validate_name(name)?;
        let mut dir = self.cwd_dir()?;
        if dir.lookup(name.as_bytes()).is_some() {
            return Err(E2Error::AlreadyExists(name.to_owned()));
        }
        if !dir.can_append(name.len()) {
            return Err(E2Error::DirectoryFull {
                block: dir.block().0,
            });
        }

        let parent = self.cwd.ino;
        let inode_alloc = self.alloc_inode(group_of(&self.geo, parent), true)?;
        let ino = inode_alloc.ino;
        let block_alloc = match self.alloc_block(inode_alloc.group) {
            Ok(b) => b,
            Err(e) => {
                warn!(ino = ino.0, error = %e, "block allocation failed, releasing inode");
                self.release_inode(ino, true)?;
                return Err(e);
            }
        };

        let raw = init_dir_block(ino, parent, self.geo.block_size)?;
        self.dev.write_block(block_alloc.block, &raw)?;
        let inode = Ext2Inode::new_directory(now_epoch(), block_alloc.block.0, self.geo.block_size);
        self.init_inode(ino, &inode)?;

        dir.append(ino, name.as_bytes(), Ext2FileType::Dir)?;
        self.write_dir(&dir)?;

        let mut parent_inode = self.cwd.inode.clone();
        parent_inode.links_count = parent_inode.links_count.saturating_add(1);
        self.write_inode(parent, &parent_inode)?;

        debug!(
            ino = ino.0,
            block = block_alloc.block.0,
            group = inode_alloc.group.0,
            entry = name,
            "created directory"
        );
        Ok(ino)
    }

    // ── Removal ──────────────────────────────────────────────────────────

    /// Unlink a non-directory. The inode and its blocks are freed when the
    /// last link goes.
    pub fn rm(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_name(name)?;
        let (ino, mut inode) = self.lookup(name)?;
        if inode.is_dir() {
            return Err(E2Error::IsADirectory(name.to_owned()));
        }

        let mut dir = self.cwd_dir()?;
        if inode.links_count > 1 {
            dir.remove(name.as_bytes())?;
            self.write_dir(&dir)?;
            inode.links_count -= 1;
            inode.ctime = now_epoch();
            self.write_inode(ino, &inode)?;
            debug!(ino = ino.0, links = inode.links_count, entry = name, "unlinked");
            return Ok(());
        }

        let blocks = reachable_blocks(&self.dev, &inode)?;
        dir.remove(name.as_bytes())?;
        self.write_dir(&dir)?;

        let freed = self.release_blocks(blocks.all())?;
        inode.links_count = 0;
        inode.dtime = now_epoch();
        self.write_inode(ino, &inode)?;
        self.release_inode(ino, false)?;
        debug!(ino = ino.0, freed, entry = name, "removed file");
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_name(name)?;
        let (ino, mut inode) = self.lookup(name)?;
        if !inode.is_dir() {
            return Err(E2Error::NotADirectory(name.to_owned()));
        }
        if self.dir_block(ino, &inode)?.child_count() > 0 {
            return Err(E2Error::DirectoryNotEmpty(name.to_owned()));
        }

        let blocks = reachable_blocks(&self.dev, &inode)?;
        let mut dir = self.cwd_dir()?;
        dir.remove(name.as_bytes())?;
        self.write_dir(&dir)?;

        let freed = self.release_blocks(blocks.all())?;
        inode.links_count = 0;
        inode.dtime = now_epoch();
        self.write_inode(ino, &inode)?;
        self.release_inode(ino, true)?;

        let parent = self.cwd.ino;
        let mut parent_inode = self.cwd.inode.clone();
        parent_inode.links_count = parent_inode.links_count.saturating_sub(1);
        self.write_inode(parent, &parent_inode)?;
        debug!(ino = ino.0, freed, entry = name, "removed directory");
        Ok(())
    }

    // ── In-place edits ───────────────────────────────────────────────────

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_name(old)?;
        validate_name(new)?;
        let mut dir = self.cwd_dir()?;
        if dir.lookup(old.as_bytes()).is_none() {
            return Err(E2Error::NotFound(old.to_owned()));
        }
        dir.rename(old.as_bytes(), new.as_bytes())?;
        self.write_dir(&dir)?;
        debug!(old, new, "renamed");
        Ok(())
    }

    /// Overwrite bytes of a regular file inside its allocated blocks.
    ///
    /// `size` may grow up to the allocated capacity. A range touching an
    /// unallocated block fails with `BlockNotAllocated` and writes nothing.
    pub fn write_file(&mut self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let (ino, mut inode) = self.lookup(name)?;
        if inode.is_dir() {
            return Err(E2Error::IsADirectory(name.to_owned()));
        }
        write_within(&self.dev, ino, &mut inode, offset, data)?;
        inode.mtime = now_epoch();
        self.write_inode(ino, &inode)
    }
}
