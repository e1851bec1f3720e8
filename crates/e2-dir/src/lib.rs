#![forbid(unsafe_code)]
//! Directory block editing.
//!
//! A directory here is exactly one data block holding a packed list of
//! `ext2_dir_entry_2` records. Every edit keeps the records tiling the
//! block: entries sit back to back at their `rec_len` offsets and the last
//! one is stretched to the end, so `Σ rec_len == block_size` always holds.
//!
//! - **append** shrinks the last entry to its minimal size and hands the
//!   rest of the block to the new entry.
//! - **remove** splices the entry out and re-stretches the new last entry.
//!   No zero-inode holes are ever left behind.
//! - **rename** is remove + append, keeping inode number and file type.
//!
//! All edits work on the parsed model; nothing reaches disk until the
//! caller writes [`DirBlock::encode`].

use e2_error::{E2Error, Result};
use e2_ondisk::{DIR_ENTRY_HEADER_LEN, Ext2DirEntry, Ext2FileType, parse_dir_block};
use e2_types::{BlockNumber, BlockSize, EXT2_NAME_LEN, InodeNumber, ParseError, usize_to_u16};
use tracing::{debug, trace};

/// Smallest record for a name of `name_len` bytes: header plus name,
/// rounded up to a multiple of 4.
#[must_use]
pub fn rec_len_for(name_len: usize) -> usize {
    (DIR_ENTRY_HEADER_LEN + name_len + 3) & !3
}

/// Reject names that cannot be stored as a single directory entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(E2Error::InvalidName(name.to_owned()));
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(E2Error::NameTooLong);
    }
    Ok(())
}

/// Parsed, editable view of one directory data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirBlock {
    block: BlockNumber,
    block_size: usize,
    entries: Vec<Ext2DirEntry>,
}

impl DirBlock {
    /// Parse `raw`, the contents of directory block `block`.
    pub fn parse(raw: &[u8], block: BlockNumber) -> Result<Self> {
        let entries = parse_dir_block(raw).map_err(|e| corrupt(block, &e))?;
        trace!(block = block.0, entries = entries.len(), "parsed directory block");
        Ok(Self {
            block,
            block_size: raw.len(),
            entries,
        })
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Entries in on-disk order, `.` and `..` included.
    #[must_use]
    pub fn entries(&self) -> &[Ext2DirEntry] {
        &self.entries
    }

    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<&Ext2DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entries other than `.` and `..`.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.is_dot() && !e.is_dotdot())
            .count()
    }

    /// Byte offset of the last entry.
    fn last_offset(&self) -> usize {
        self.entries
            .iter()
            .rev()
            .skip(1)
            .map(|e| usize::from(e.rec_len))
            .sum()
    }

    /// Free bytes after the last entry once it is shrunk to its minimal size.
    #[must_use]
    pub fn tail_slack(&self) -> usize {
        match self.entries.last() {
            Some(last) => self
                .block_size
                .saturating_sub(self.last_offset() + last.actual_size()),
            None => self.block_size,
        }
    }

    /// Whether a name of `name_len` bytes can be appended.
    #[must_use]
    pub fn can_append(&self, name_len: usize) -> bool {
        rec_len_for(name_len) <= self.tail_slack()
    }

    /// Append a new entry after the current last one.
    pub fn append(
        &mut self,
        inode: InodeNumber,
        name: &[u8],
        file_type: Ext2FileType,
    ) -> Result<()> {
        if self.lookup(name).is_some() {
            return Err(E2Error::AlreadyExists(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }
        let name_len = u8::try_from(name.len()).map_err(|_| E2Error::NameTooLong)?;
        if !self.can_append(name.len()) {
            return Err(E2Error::DirectoryFull { block: self.block.0 });
        }

        let offset = match self.entries.last().map(Ext2DirEntry::actual_size) {
            Some(actual) => {
                let shrunk = self.narrow(actual)?;
                let last_offset = self.last_offset();
                if let Some(last) = self.entries.last_mut() {
                    last.rec_len = shrunk;
                }
                last_offset + actual
            }
            None => 0,
        };
        let rec_len = self.narrow(self.block_size - offset)?;
        self.entries.push(Ext2DirEntry {
            inode: inode.0,
            rec_len,
            name_len,
            file_type,
            name: name.to_vec(),
        });
        debug!(
            block = self.block.0,
            ino = inode.0,
            offset,
            rec_len,
            name = %String::from_utf8_lossy(name),
            "appended directory entry"
        );
        Ok(())
    }

    /// Splice out the entry called `name` and return it.
    pub fn remove(&mut self, name: &[u8]) -> Result<Ext2DirEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| E2Error::EntryNotFound(String::from_utf8_lossy(name).into_owned()))?;
        let removed = self.entries.remove(index);
        self.restretch()?;
        debug!(
            block = self.block.0,
            ino = removed.inode,
            name = %removed.name_str(),
            "removed directory entry"
        );
        Ok(removed)
    }

    /// Rename `old` to `new`. On error the block is left as it was.
    pub fn rename(&mut self, old: &[u8], new: &[u8]) -> Result<()> {
        if self.lookup(new).is_some() {
            return Err(E2Error::AlreadyExists(
                String::from_utf8_lossy(new).into_owned(),
            ));
        }
        let mut next = self.clone();
        let entry = next.remove(old)?;
        next.append(InodeNumber(entry.inode), new, entry.file_type)?;
        *self = next;
        Ok(())
    }

    /// Stretch the last entry so the records end exactly at the block end.
    fn restretch(&mut self) -> Result<()> {
        let offset = self.last_offset();
        let block_size = self.block_size;
        let Some(last) = self.entries.last() else {
            return Ok(());
        };
        if offset + last.actual_size() > block_size {
            return Err(E2Error::DirectoryFull { block: self.block.0 });
        }
        let rec_len = self.narrow(block_size - offset)?;
        if let Some(last) = self.entries.last_mut() {
            last.rec_len = rec_len;
        }
        Ok(())
    }

    fn narrow(&self, len: usize) -> Result<u16> {
        usize_to_u16(len, "rec_len").map_err(|e| corrupt(self.block, &e))
    }

    /// Serialize back to a full block.
    ///
    /// An empty list encodes as one unused record spanning the block.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = vec![0_u8; self.block_size];
        if self.entries.is_empty() {
            let rec_len = self.narrow(self.block_size)?;
            raw[4..6].copy_from_slice(&rec_len.to_le_bytes());
            return Ok(raw);
        }

        let mut offset = 0_usize;
        for entry in &self.entries {
            entry
                .write_into(&mut raw, offset)
                .map_err(|e| corrupt(self.block, &e))?;
            offset += usize::from(entry.rec_len);
        }
        if offset != self.block_size {
            return Err(E2Error::CorruptDirectory {
                block: self.block.0,
                detail: format!("records cover {offset} of {} bytes", self.block_size),
            });
        }
        Ok(raw)
    }
}

fn corrupt(block: BlockNumber, err: &ParseError) -> E2Error {
    E2Error::CorruptDirectory {
        block: block.0,
        detail: err.to_string(),
    }
}

/// Contents of a fresh directory block: `.` (12 bytes) pointing at
/// `self_ino`, then `..` pointing at `parent_ino` and covering the rest.
pub fn init_dir_block(
    self_ino: InodeNumber,
    parent_ino: InodeNumber,
    block_size: BlockSize,
) -> Result<Vec<u8>> {
    let mut dir = DirBlock {
        block: BlockNumber(0),
        block_size: block_size.as_usize(),
        entries: Vec::new(),
    };
    dir.append(self_ino, b".", Ext2FileType::Dir)?;
    dir.append(parent_ino, b"..", Ext2FileType::Dir)?;
    dir.encode()
}
