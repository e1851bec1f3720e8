#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate: no I/O, no side effects. Turns byte slices into the
//! superblock, group descriptors, inodes and directory entries, and patches
//! mutated fields back into their on-disk records.

pub mod ext2;

pub use ext2::{
    DIR_ENTRY_HEADER_LEN, Ext2DirEntry, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock,
    parse_dir_block, sectors_per_block,
};
