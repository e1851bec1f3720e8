//! Synthetic ext2 image for integration tests.
//!
//! Layout (1 KiB blocks, 1024 blocks, two groups of 512 blocks / 64 inodes):
//!
//! | block | group 0 | | block | group 1 |
//! |-------|---------|-|-------|---------|
//! | 1 | superblock | | 513 | block bitmap |
//! | 2 | descriptor table | | 514 | inode bitmap |
//! | 3 | block bitmap | | 515-522 | inode table |
//! | 4 | inode bitmap | | | |
//! | 5-12 | inode table | | | |
//! | 13 | root directory | | | |
//! | 14 | `hello.txt` data | | | |
//!
//! Inodes 1-11 are in use; 2 is the root, 11 is `hello.txt`.

#![allow(dead_code)]

use e2_block::MemoryByteDevice;
use e2_core::{FileSystem, OpenOptions};

pub const BLOCK_SIZE: usize = 1024;
pub const BLOCKS_COUNT: u32 = 1024;
pub const BLOCKS_PER_GROUP: u32 = 512;
pub const INODES_PER_GROUP: u32 = 64;
pub const INODE_SIZE: usize = 128;
pub const RESERVED_BLOCKS: u32 = 51;

pub const HELLO: &[u8] = b"Hello world!\n";
pub const HELLO_INO: u32 = 11;
pub const HELLO_BLOCK: u32 = 14;
pub const ROOT_BLOCK: u32 = 13;
/// 2023-11-14 22:13:20 UTC
pub const HELLO_MTIME: u32 = 1_700_000_000;

const GDT_BLOCK: u32 = 2;
const SB_FREE_BLOCKS: usize = 1024 + 0x0C;
const SB_FREE_INODES: usize = 1024 + 0x10;

/// Per-group metadata block numbers: (block bitmap, inode bitmap, inode table).
pub const GROUP_META: [(u32, u32, u32); 2] = [(3, 4, 5), (513, 514, 515)];

fn put_u16(img: &mut [u8], at: usize, v: u16) {
    img[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(img: &mut [u8], at: usize, v: u32) {
    img[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(img: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([img[at], img[at + 1]])
}

fn get_u32(img: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([img[at], img[at + 1], img[at + 2], img[at + 3]])
}

pub fn block_at(block: u32) -> usize {
    block as usize * BLOCK_SIZE
}

fn gd_at(group: u32) -> usize {
    block_at(GDT_BLOCK) + group as usize * 32
}

fn blocks_in_group(group: u32) -> u32 {
    (BLOCKS_COUNT - 1 - group * BLOCKS_PER_GROUP).min(BLOCKS_PER_GROUP)
}

fn set_bit(img: &mut [u8], block: u32, idx: u32) {
    img[block_at(block) + (idx / 8) as usize] |= 1 << (idx % 8);
}

pub fn bit(img: &[u8], block: u32, idx: u32) -> bool {
    img[block_at(block) + (idx / 8) as usize] & (1 << (idx % 8)) != 0
}

pub fn inode_at(ino: u32) -> usize {
    let group = (ino - 1) / INODES_PER_GROUP;
    let idx = (ino - 1) % INODES_PER_GROUP;
    block_at(GROUP_META[group as usize].2) + idx as usize * INODE_SIZE
}

struct InodeFixture {
    mode: u16,
    size: u32,
    links: u16,
    mtime: u32,
    block: u32,
}

fn put_inode(img: &mut [u8], ino: u32, fixture: &InodeFixture) {
    let at = inode_at(ino);
    put_u16(img, at, fixture.mode);
    put_u32(img, at + 0x04, fixture.size);
    put_u32(img, at + 0x08, fixture.mtime);
    put_u32(img, at + 0x0C, fixture.mtime);
    put_u32(img, at + 0x10, fixture.mtime);
    put_u16(img, at + 0x1A, fixture.links);
    put_u32(img, at + 0x1C, 2);
    put_u32(img, at + 0x28, fixture.block);
}

fn put_dirent(img: &mut [u8], at: usize, ino: u32, rec_len: u16, name: &[u8], ft: u8) {
    put_u32(img, at, ino);
    put_u16(img, at + 4, rec_len);
    img[at + 6] = name.len() as u8;
    img[at + 7] = ft;
    img[at + 8..at + 8 + name.len()].copy_from_slice(name);
}

/// The fixture image described in the module docs.
pub fn build_image() -> Vec<u8> {
    let mut img = vec![0_u8; BLOCKS_COUNT as usize * BLOCK_SIZE];

    // group 0: blocks 1-14 and inodes 1-11 in use; group 1: 10 metadata blocks
    let used_blocks = [14_u32, 10];
    let used_inodes = [11_u32, 0];
    let free_blocks: Vec<u32> = (0..2)
        .map(|g| blocks_in_group(g) - used_blocks[g as usize])
        .collect();
    let free_inodes: Vec<u32> = used_inodes.iter().map(|u| INODES_PER_GROUP - u).collect();

    // superblock
    let sb = 1024;
    put_u32(&mut img, sb, INODES_PER_GROUP * 2);
    put_u32(&mut img, sb + 0x04, BLOCKS_COUNT);
    put_u32(&mut img, sb + 0x08, RESERVED_BLOCKS);
    put_u32(&mut img, SB_FREE_BLOCKS, free_blocks.iter().sum());
    put_u32(&mut img, SB_FREE_INODES, free_inodes.iter().sum());
    put_u32(&mut img, sb + 0x14, 1);
    put_u32(&mut img, sb + 0x18, 0);
    put_u32(&mut img, sb + 0x20, BLOCKS_PER_GROUP);
    put_u32(&mut img, sb + 0x24, BLOCKS_PER_GROUP);
    put_u32(&mut img, sb + 0x28, INODES_PER_GROUP);
    put_u16(&mut img, sb + 0x38, 0xEF53);
    put_u16(&mut img, sb + 0x3A, 1);
    put_u32(&mut img, sb + 0x4C, 1);
    put_u32(&mut img, sb + 0x54, 11);
    put_u16(&mut img, sb + 0x58, INODE_SIZE as u16);
    img[sb + 0x78..sb + 0x78 + 7].copy_from_slice(b"fixture");

    for group in 0..2_u32 {
        let (bb, ib, it) = GROUP_META[group as usize];
        let gd = gd_at(group);
        put_u32(&mut img, gd, bb);
        put_u32(&mut img, gd + 0x04, ib);
        put_u32(&mut img, gd + 0x08, it);
        put_u16(&mut img, gd + 0x0C, free_blocks[group as usize] as u16);
        put_u16(&mut img, gd + 0x0E, free_inodes[group as usize] as u16);
        put_u16(&mut img, gd + 0x10, u16::from(group == 0));

        for rel in 0..used_blocks[group as usize] {
            set_bit(&mut img, bb, rel);
        }
        // padding past the end of a short last group
        for rel in blocks_in_group(group)..BLOCKS_PER_GROUP {
            set_bit(&mut img, bb, rel);
        }
        for idx in 0..used_inodes[group as usize] {
            set_bit(&mut img, ib, idx);
        }
    }

    put_inode(
        &mut img,
        2,
        &InodeFixture {
            mode: 0o040_755,
            size: BLOCK_SIZE as u32,
            links: 2,
            mtime: HELLO_MTIME,
            block: ROOT_BLOCK,
        },
    );
    put_inode(
        &mut img,
        HELLO_INO,
        &InodeFixture {
            mode: 0o100_644,
            size: HELLO.len() as u32,
            links: 1,
            mtime: HELLO_MTIME,
            block: HELLO_BLOCK,
        },
    );

    let root = block_at(ROOT_BLOCK);
    put_dirent(&mut img, root, 2, 12, b".", 2);
    put_dirent(&mut img, root + 12, 2, 12, b"..", 2);
    put_dirent(&mut img, root + 24, HELLO_INO, 1000, b"hello.txt", 1);

    let data = block_at(HELLO_BLOCK);
    img[data..data + HELLO.len()].copy_from_slice(HELLO);
    img
}

/// Mount `image` in memory. The returned device shares the buffer.
pub fn mount(image: Vec<u8>) -> (FileSystem, MemoryByteDevice) {
    mount_with(image, &OpenOptions::default())
}

pub fn mount_with(image: Vec<u8>, options: &OpenOptions) -> (FileSystem, MemoryByteDevice) {
    let dev = MemoryByteDevice::from_vec(image);
    let fs = FileSystem::from_device(Box::new(dev.clone()), options).expect("mount fixture");
    (fs, dev)
}

// ── On-disk probes ──────────────────────────────────────────────────────────

pub fn sb_free_blocks(img: &[u8]) -> u32 {
    get_u32(img, SB_FREE_BLOCKS)
}

pub fn sb_free_inodes(img: &[u8]) -> u32 {
    get_u32(img, SB_FREE_INODES)
}

pub fn gd_free_blocks(img: &[u8], group: u32) -> u16 {
    get_u16(img, gd_at(group) + 0x0C)
}

pub fn gd_free_inodes(img: &[u8], group: u32) -> u16 {
    get_u16(img, gd_at(group) + 0x0E)
}

pub fn gd_used_dirs(img: &[u8], group: u32) -> u16 {
    get_u16(img, gd_at(group) + 0x10)
}

pub fn inode_in_use(img: &[u8], ino: u32) -> bool {
    let group = (ino - 1) / INODES_PER_GROUP;
    bit(img, GROUP_META[group as usize].1, (ino - 1) % INODES_PER_GROUP)
}

pub fn block_in_use(img: &[u8], block: u32) -> bool {
    let group = (block - 1) / BLOCKS_PER_GROUP;
    bit(img, GROUP_META[group as usize].0, (block - 1) % BLOCKS_PER_GROUP)
}

pub fn inode_links(img: &[u8], ino: u32) -> u16 {
    get_u16(img, inode_at(ino) + 0x1A)
}

pub fn inode_dtime(img: &[u8], ino: u32) -> u32 {
    get_u32(img, inode_at(ino) + 0x14)
}

/// Sum of `rec_len` over the records of one directory block.
pub fn rec_len_sum(img: &[u8], block: u32) -> usize {
    let start = block_at(block);
    let mut off = 0;
    while off < BLOCK_SIZE {
        let rec_len = get_u16(img, start + off + 4) as usize;
        assert!(rec_len >= 8, "zero or short rec_len at offset {off}");
        off += rec_len;
    }
    off
}

// ── Image surgery ───────────────────────────────────────────────────────────

/// Mark every block of `group` used and zero its free counts.
pub fn exhaust_blocks(img: &mut [u8], group: u32) {
    let (bb, _, _) = GROUP_META[group as usize];
    for rel in 0..BLOCKS_PER_GROUP {
        set_bit(img, bb, rel);
    }
    let free = u32::from(gd_free_blocks(img, group));
    put_u16(img, gd_at(group) + 0x0C, 0);
    let total = sb_free_blocks(img) - free;
    put_u32(img, SB_FREE_BLOCKS, total);
}

/// Mark every inode of `group` used and zero its free counts.
pub fn exhaust_inodes(img: &mut [u8], group: u32) {
    let (_, ib, _) = GROUP_META[group as usize];
    for idx in 0..INODES_PER_GROUP {
        set_bit(img, ib, idx);
    }
    let free = u32::from(gd_free_inodes(img, group));
    put_u16(img, gd_at(group) + 0x0E, 0);
    let total = sb_free_inodes(img) - free;
    put_u32(img, SB_FREE_INODES, total);
}

pub fn set_sb_u32(img: &mut [u8], field: usize, v: u32) {
    put_u32(img, 1024 + field, v);
}

pub fn set_sb_u16(img: &mut [u8], field: usize, v: u16) {
    put_u16(img, 1024 + field, v);
}

pub fn set_inode_links(img: &mut [u8], ino: u32, links: u16) {
    put_u16(img, inode_at(ino) + 0x1A, links);
}

/// Fill the unused tail of one inode record's fields with `byte`, the way a
/// previous occupant could have left it: `osd1`, `i_dir_acl`, `i_faddr`.
pub fn dirty_inode_slot(img: &mut [u8], ino: u32, byte: u8) {
    let at = inode_at(ino);
    img[at + 0x24] = byte;
    img[at + 0x6C] = byte;
    img[at + 0x70] = byte;
    img[at + 0x74..at + INODE_SIZE].fill(byte);
}

/// Set a block's bitmap bit and take it off both free counts.
pub fn mark_block_used(img: &mut [u8], block: u32) {
    let group = (block - 1) / BLOCKS_PER_GROUP;
    set_bit(img, GROUP_META[group as usize].0, (block - 1) % BLOCKS_PER_GROUP);
    let gd = gd_at(group) + 0x0C;
    let free = get_u16(img, gd) - 1;
    put_u16(img, gd, free);
    let total = sb_free_blocks(img) - 1;
    put_u32(img, SB_FREE_BLOCKS, total);
}

/// Set an inode's bitmap bit and take it off both free counts.
pub fn mark_inode_used(img: &mut [u8], ino: u32) {
    let group = (ino - 1) / INODES_PER_GROUP;
    set_bit(img, GROUP_META[group as usize].1, (ino - 1) % INODES_PER_GROUP);
    let gd = gd_at(group) + 0x0E;
    let free = get_u16(img, gd) - 1;
    put_u16(img, gd, free);
    let total = sb_free_inodes(img) - 1;
    put_u32(img, SB_FREE_INODES, total);
}

/// Append a record for `ino` to the root directory by splitting its last
/// record.
pub fn link_in_root(img: &mut [u8], name: &[u8], ino: u32, file_type: u8) {
    let root = block_at(ROOT_BLOCK);
    let mut off = 0;
    loop {
        let rec_len = get_u16(img, root + off + 4) as usize;
        if off + rec_len == BLOCK_SIZE {
            break;
        }
        off += rec_len;
    }
    let used = (8 + img[root + off + 6] as usize + 3) & !3;
    put_u16(img, root + off + 4, used as u16);
    let at = off + used;
    put_dirent(img, root + at, ino, (BLOCK_SIZE - at) as u16, name, file_type);
}

/// Blocks of the file built by [`add_mapped_file`].
pub struct MappedFile {
    pub ino: u32,
    pub data: Vec<u32>,
    pub tables: Vec<u32>,
}

pub const MAPPED_INO: u32 = 12;

/// Add `big.bin` (inode 12) to the root. Twelve direct blocks and the
/// single-indirect table live in group 0; the double-indirect chain lives
/// in group 1, so freeing it touches both groups.
///
/// | logical | physical |
/// |---------|----------|
/// | 0-11 | 15-26 |
/// | 12-13 | 28-29 via table 27 |
/// | 268 | 525 via tables 523, 524 |
pub fn add_mapped_file(img: &mut [u8]) -> MappedFile {
    let direct: Vec<u32> = (15..27).collect();
    let (ind, ind_data) = (27_u32, [28_u32, 29]);
    let (dind, dind_inner, dind_data) = (523_u32, 524_u32, 525_u32);

    for (i, &b) in ind_data.iter().enumerate() {
        put_u32(img, block_at(ind) + i * 4, b);
    }
    put_u32(img, block_at(dind), dind_inner);
    put_u32(img, block_at(dind_inner), dind_data);

    let mut data = direct.clone();
    data.extend(ind_data);
    data.push(dind_data);
    let tables = vec![ind, dind, dind_inner];
    for &b in data.iter().chain(&tables) {
        mark_block_used(img, b);
    }
    for (i, &b) in data.iter().enumerate() {
        img[block_at(b) + BLOCK_SIZE - 1] = i as u8 + 1;
    }

    let at = inode_at(MAPPED_INO);
    put_u16(img, at, 0o100_644);
    put_u32(img, at + 0x04, 269 * BLOCK_SIZE as u32);
    put_u32(img, at + 0x10, HELLO_MTIME);
    put_u16(img, at + 0x1A, 1);
    put_u32(img, at + 0x1C, (data.len() + tables.len()) as u32 * 2);
    for (i, &b) in direct.iter().enumerate() {
        put_u32(img, at + 0x28 + i * 4, b);
    }
    put_u32(img, at + 0x28 + 12 * 4, ind);
    put_u32(img, at + 0x28 + 13 * 4, dind);
    mark_inode_used(img, MAPPED_INO);
    link_in_root(img, b"big.bin", MAPPED_INO, 1);

    MappedFile {
        ino: MAPPED_INO,
        data,
        tables,
    }
}
