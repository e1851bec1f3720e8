//! Serializable results of the read-only operations and their text form.

use e2_alloc::FsGeometry;
use e2_ondisk::{Ext2DirEntry, Ext2Inode, Ext2Superblock};
use e2_types::InodeNumber;
use serde::Serialize;
use std::fmt;
use time::OffsetDateTime;

// ── info ────────────────────────────────────────────────────────────────────

/// Volume summary reported by `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsInfo {
    pub volume_name: String,
    /// `blocks_count * block_size`.
    pub image_size: u64,
    /// Free blocks minus the reserved pool, in KiB.
    pub free_space_kib: u64,
    pub free_inodes: u32,
    pub free_blocks: u32,
    pub block_size: u32,
    pub inode_size: u16,
    pub group_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_table_blocks: u32,
}

impl FsInfo {
    #[must_use]
    pub fn new(sb: &Ext2Superblock, geo: &FsGeometry) -> Self {
        let bs = u64::from(sb.block_size.get());
        let usable = sb.free_blocks_count.saturating_sub(sb.reserved_blocks_count);
        Self {
            volume_name: sb.volume_name.clone(),
            image_size: u64::from(sb.blocks_count) * bs,
            free_space_kib: u64::from(usable) * bs / 1024,
            free_inodes: sb.free_inodes_count,
            free_blocks: sb.free_blocks_count,
            block_size: sb.block_size.get(),
            inode_size: sb.inode_size,
            group_count: geo.group_count,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_table_blocks: geo.inode_table_blocks(),
        }
    }
}

impl fmt::Display for FsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Volume name.....: {}", self.volume_name)?;
        writeln!(f, "Image size......: {} bytes", self.image_size)?;
        writeln!(f, "Free space......: {} KiB", self.free_space_kib)?;
        writeln!(f, "Free inodes.....: {}", self.free_inodes)?;
        writeln!(f, "Free blocks.....: {}", self.free_blocks)?;
        writeln!(f, "Block size......: {} bytes", self.block_size)?;
        writeln!(f, "Inode size......: {} bytes", self.inode_size)?;
        writeln!(f, "Groups count....: {}", self.group_count)?;
        writeln!(f, "Groups size.....: {} blocks", self.blocks_per_group)?;
        writeln!(f, "Groups inodes...: {} inodes", self.inodes_per_group)?;
        write!(f, "Inodetable size.: {} blocks", self.inode_table_blocks)
    }
}

// ── ls ──────────────────────────────────────────────────────────────────────

/// One raw directory record as shown by `ls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

impl From<&Ext2DirEntry> for ListEntry {
    fn from(e: &Ext2DirEntry) -> Self {
        Self {
            name: e.name_str(),
            inode: e.inode,
            rec_len: e.rec_len,
            name_len: e.name_len,
            file_type: e.file_type.as_raw(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<ListEntry>,
}

impl DirListing {
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

impl fmt::Display for DirListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}", e.name)?;
            writeln!(f, "inode: {}", e.inode)?;
            writeln!(f, "record length: {}", e.rec_len)?;
            writeln!(f, "name length: {}", e.name_len)?;
            write!(f, "file type: {}", e.file_type)?;
            if i + 1 < self.entries.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

// ── attr ────────────────────────────────────────────────────────────────────

/// `"<n> B"` up to 1024 bytes, `"<x.y> KiB"` above.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(size: u64) -> String {
    if size <= 1024 {
        format!("{size} B")
    } else {
        format!("{:.1} KiB", size as f64 / 1024.0)
    }
}

/// `dd/mm/yyyy hh:mm`, UTC.
#[must_use]
pub fn format_mtime(epoch: u32) -> String {
    OffsetDateTime::from_unix_timestamp(i64::from(epoch)).map_or_else(
        |_| epoch.to_string(),
        |t| {
            format!(
                "{:02}/{:02}/{:04} {:02}:{:02}",
                t.day(),
                u8::from(t.month()),
                t.year(),
                t.hour(),
                t.minute()
            )
        },
    )
}

const PERMISSION_BITS: [(u16, char); 9] = [
    (0o400, 'r'),
    (0o200, 'w'),
    (0o100, 'x'),
    (0o040, 'r'),
    (0o020, 'w'),
    (0o010, 'x'),
    (0o004, 'r'),
    (0o002, 'w'),
    (0o001, 'x'),
];

/// Attributes reported by `attr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttr {
    pub name: String,
    pub ino: u32,
    /// `d` for directories, `f` for everything else.
    pub kind: char,
    /// Nine `rwx`/`-` characters.
    pub permissions: String,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: u32,
    pub modified: String,
}

impl FileAttr {
    #[must_use]
    pub fn new(name: &str, ino: InodeNumber, inode: &Ext2Inode) -> Self {
        let permissions = PERMISSION_BITS
            .iter()
            .map(|&(bit, c)| if inode.mode & bit != 0 { c } else { '-' })
            .collect();
        Self {
            name: name.to_owned(),
            ino: ino.0,
            kind: if inode.is_dir() { 'd' } else { 'f' },
            permissions,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            mtime: inode.mtime,
            modified: format_mtime(inode.mtime),
        }
    }

    /// Type character followed by the permission string, e.g. `frw-r--r--`.
    #[must_use]
    pub fn mode_string(&self) -> String {
        format!("{}{}", self.kind, self.permissions)
    }
}

impl fmt::Display for FileAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "permissions  uid    gid    size        modified")?;
        write!(
            f,
            "{}   {:<6} {:<6} {:<11} {}",
            self.mode_string(),
            self.uid,
            self.gid,
            format_size(self.size),
            self.modified
        )
    }
}
