#![forbid(unsafe_code)]

use e2_types::{
    BlockNumber, BlockSize, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE, EXT2_GROUP_DESC_SIZE,
    EXT2_N_BLOCKS, EXT2_SECTOR_SIZE, EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, GroupNumber,
    ParseError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, read_u8, trim_nul_padded, write_bytes, write_le_u16, write_le_u32, write_u8,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

const SB_FREE_BLOCKS: usize = 0x0C;
const SB_FREE_INODES: usize = 0x10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mount_count: u16,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
}

impl Ext2Superblock {
    /// Parse the 1024-byte superblock region.
    ///
    /// Revision-0 images carry no `s_inode_size`/`s_first_ino`; the fixed
    /// 128-byte record and inode 11 are substituted.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let block_size = BlockSize::from_log(log_block_size)?;
        let rev_level = read_le_u32(region, 0x4C)?;
        let (first_ino, inode_size) = if rev_level == 0 {
            (EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE)
        } else {
            (read_le_u32(region, 0x54)?, read_le_u16(region, 0x58)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, SB_FREE_BLOCKS)?,
            free_inodes_count: read_le_u32(region, SB_FREE_INODES)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            mount_count: read_le_u16(region, 0x34)?,
            magic,
            state: read_le_u16(region, 0x3A)?,
            rev_level,
            first_ino,
            inode_size,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
        })
    }

    /// Check that the geometry fields describe an addressable layout.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let bitmap_bits = self.block_size.get().saturating_mul(8);
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }
        if self.inode_size < EXT2_GOOD_OLD_INODE_SIZE || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        if u32::from(self.inode_size) > self.block_size.get() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "beyond s_blocks_count",
            });
        }
        if u64::from(self.inodes_count)
            > u64::from(self.inodes_per_group) * u64::from(self.group_count())
        {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "exceeds inodes_per_group * group count",
            });
        }
        Ok(())
    }

    /// Number of block groups, counting a trailing partial group.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(self.first_data_block)
            .div_ceil(self.blocks_per_group)
    }

    /// Byte offset of a group's descriptor. The table starts in the block
    /// after the superblock.
    #[must_use]
    pub fn group_desc_offset(&self, group: GroupNumber) -> Option<u64> {
        let table = self
            .block_size
            .block_offset(BlockNumber(self.first_data_block.checked_add(1)?))?;
        let within = u64::from(group.0).checked_mul(EXT2_GROUP_DESC_SIZE as u64)?;
        table.0.checked_add(within)
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        let bytes = u64::from(self.inodes_per_group) * u64::from(self.inode_size);
        let blocks = bytes.div_ceil(u64::from(self.block_size.get()));
        u32::try_from(blocks).unwrap_or(u32::MAX)
    }

    /// Patch the free counters into a raw superblock region.
    pub fn write_counts_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(region, SB_FREE_BLOCKS, self.free_blocks_count)?;
        write_le_u32(region, SB_FREE_INODES, self.free_inodes_count)
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EXT2_GROUP_DESC_SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    /// Overwrite the fields this engine maintains, keeping padding bytes.
    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(bytes, 0x00, self.block_bitmap)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap)?;
        write_le_u32(bytes, 0x08, self.inode_table)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count)
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

const INODE_BLOCK_PTRS: usize = 0x28;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    /// 512-byte sectors, not filesystem blocks.
    pub blocks: u32,
    pub flags: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub block: [u32; EXT2_N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
}

impl Ext2Inode {
    /// Parse the 128-byte base record. Larger records are accepted; the tail
    /// is left to whoever owns the raw bytes.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, usize::from(EXT2_GOOD_OLD_INODE_SIZE))?;

        let mode = read_le_u16(bytes, 0x00)?;
        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_high = u64::from(read_le_u32(bytes, 0x6C)?);
        let size = if mode & S_IFMT == S_IFREG {
            size_lo | (size_high << 32)
        } else {
            size_lo
        };

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, INODE_BLOCK_PTRS + i * 4)?;
        }

        let uid_high = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_high = u32::from(read_le_u16(bytes, 0x7A)?);

        Ok(Self {
            mode,
            uid: u32::from(read_le_u16(bytes, 0x02)?) | (uid_high << 16),
            gid: u32::from(read_le_u16(bytes, 0x18)?) | (gid_high << 16),
            size,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
        })
    }

    /// Write this inode over an existing record, leaving OS-specific and
    /// extended bytes untouched.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(bytes, 0, usize::from(EXT2_GOOD_OLD_INODE_SIZE))?;
        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u16(bytes, 0x02, self.uid as u16)?;
        write_le_u32(bytes, 0x04, self.size as u32)?;
        write_le_u32(bytes, 0x08, self.atime)?;
        write_le_u32(bytes, 0x0C, self.ctime)?;
        write_le_u32(bytes, 0x10, self.mtime)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x18, self.gid as u16)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        for (i, ptr) in self.block.iter().enumerate() {
            write_le_u32(bytes, INODE_BLOCK_PTRS + i * 4, *ptr)?;
        }
        write_le_u32(bytes, 0x64, self.generation)?;
        write_le_u32(bytes, 0x68, self.file_acl)?;
        if self.is_regular() {
            write_le_u32(bytes, 0x6C, (self.size >> 32) as u32)?;
        }
        write_le_u16(bytes, 0x78, (self.uid >> 16) as u16)?;
        write_le_u16(bytes, 0x7A, (self.gid >> 16) as u16)
    }

    /// Empty regular file, mode `0100644`.
    #[must_use]
    pub fn new_regular_file(now: u32) -> Self {
        Self {
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            size: 0,
            links_count: 1,
            blocks: 0,
            flags: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: 0,
            block: [0; EXT2_N_BLOCKS],
            generation: 0,
            file_acl: 0,
        }
    }

    /// Directory backed by one data block, mode `040755`, two links (`.` and
    /// the parent's entry).
    #[must_use]
    pub fn new_directory(now: u32, data_block: u32, block_size: BlockSize) -> Self {
        let mut block = [0; EXT2_N_BLOCKS];
        block[0] = data_block;
        Self {
            mode: S_IFDIR | 0o755,
            size: u64::from(block_size.get()),
            links_count: 2,
            blocks: sectors_per_block(block_size),
            block,
            ..Self::new_regular_file(now)
        }
    }

    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Permission bits (`rwxrwxrwx` plus setuid/setgid/sticky).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    #[must_use]
    pub fn file_type(&self) -> Ext2FileType {
        Ext2FileType::from_mode(self.mode)
    }
}

/// `i_blocks` units consumed by one filesystem block.
#[must_use]
pub fn sectors_per_block(block_size: BlockSize) -> u32 {
    block_size.get() / EXT2_SECTOR_SIZE
}

// ── Directory entries ───────────────────────────────────────────────────────

/// File type tag stored in each directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            0o020_000 => Self::Chrdev,
            0o060_000 => Self::Blkdev,
            0o010_000 => Self::Fifo,
            0o140_000 => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

/// One `ext2_dir_entry_2` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

/// Fixed header in front of every name.
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

impl Ext2DirEntry {
    /// Smallest record that can hold this name (header + name, 4-byte aligned).
    #[must_use]
    pub fn actual_size(&self) -> usize {
        (DIR_ENTRY_HEADER_LEN + usize::from(self.name_len) + 3) & !3
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }

    /// Serialize at `offset`. Bytes between the name and `rec_len` are zeroed.
    pub fn write_into(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        let rec_len = usize::from(self.rec_len);
        ensure_slice(block, offset, rec_len)?;
        if DIR_ENTRY_HEADER_LEN + self.name.len() > rec_len {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "record shorter than its name",
            });
        }
        write_le_u32(block, offset, self.inode)?;
        write_le_u16(block, offset + 4, self.rec_len)?;
        write_u8(block, offset + 6, self.name_len)?;
        write_u8(block, offset + 7, self.file_type.as_raw())?;
        let name_start = offset + DIR_ENTRY_HEADER_LEN;
        write_bytes(block, name_start, &self.name)?;
        block[name_start + self.name.len()..offset + rec_len].fill(0);
        Ok(())
    }
}

/// Parse the entry list packed into one directory block.
///
/// The walk stops at the end of the block or at the first record whose inode
/// is 0. A `rec_len` of zero, one that is misaligned or shorter than its
/// header, or one that runs past the block is rejected.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<Ext2DirEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = 0_usize;

    while offset + DIR_ENTRY_HEADER_LEN <= block.len() {
        let inode = read_le_u32(block, offset)?;
        if inode == 0 {
            break;
        }
        let rec_len = read_le_u16(block, offset + 4)?;
        let name_len = read_u8(block, offset + 6)?;
        let file_type = Ext2FileType::from_raw(read_u8(block, offset + 7)?);

        let rec = usize::from(rec_len);
        if rec == 0 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "zero record length",
            });
        }
        if rec < DIR_ENTRY_HEADER_LEN || rec % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "record length not a multiple of 4 or shorter than the header",
            });
        }
        let entry_end = offset.checked_add(rec).ok_or(ParseError::InvalidField {
            field: "rec_len",
            reason: "overflow",
        })?;
        if entry_end > block.len() {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "record extends past block boundary",
            });
        }
        let name_end = offset + DIR_ENTRY_HEADER_LEN + usize::from(name_len);
        if name_end > entry_end {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name extends past rec_len",
            });
        }

        entries.push(Ext2DirEntry {
            inode,
            rec_len,
            name_len,
            file_type,
            name: block[offset + DIR_ENTRY_HEADER_LEN..name_end].to_vec(),
        });
        offset = entry_end;
    }

    Ok(entries)
}
