//! Logical-to-physical block mapping.
//!
//! ```text
//! i_block[0..12]   direct data blocks
//! i_block[12]      -> [p pointers]                      single indirect
//! i_block[13]      -> [p pointers] -> [p pointers]      double indirect
//! i_block[14]      triple indirect, rejected
//! ```
//!
//! `p = block_size / 4`. A zero pointer anywhere on the path is a hole.

use e2_block::BlockDevice;
use e2_error::{E2Error, Result};
use e2_ondisk::Ext2Inode;
use e2_types::{
    BlockNumber, BlockSize, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_N_BLOCKS, EXT2_NDIR_BLOCKS,
    EXT2_TIND_BLOCK, InodeNumber,
};
use std::io::Write;
use tracing::{debug, trace};

/// Largest number of logical blocks reachable without triple indirection.
#[must_use]
pub fn max_addressable_blocks(block_size: BlockSize) -> u64 {
    let p = u64::from(block_size.pointers_per_block());
    EXT2_NDIR_BLOCKS as u64 + p + p * p
}

fn too_large(needed_blocks: u64, block_size: BlockSize) -> E2Error {
    E2Error::FileTooLarge {
        needed_blocks,
        max_blocks: max_addressable_blocks(block_size),
    }
}

fn decode_pointers(raw: &[u8]) -> Vec<u32> {
    raw.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn check_pointer(dev: &dyn BlockDevice, ptr: u32, owner: u32) -> Result<BlockNumber> {
    if ptr >= dev.block_count() {
        return Err(E2Error::Corruption {
            block: owner,
            detail: format!("block pointer {ptr} beyond device ({} blocks)", dev.block_count()),
        });
    }
    Ok(BlockNumber(ptr))
}

// ── Mapper ──────────────────────────────────────────────────────────────────

/// Resolves logical block indices of one inode.
///
/// Keeps the last pointer table read at each indirection depth, so a
/// sequential walk reads every table once.
pub struct BlockMapper<'a> {
    dev: &'a dyn BlockDevice,
    pointers: [u32; EXT2_N_BLOCKS],
    per_block: u64,
    tables: [Option<(u32, Vec<u32>)>; 2],
}

impl<'a> BlockMapper<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice, inode: &Ext2Inode) -> Self {
        Self {
            dev,
            pointers: inode.block,
            per_block: u64::from(dev.block_size().pointers_per_block()),
            tables: [None, None],
        }
    }

    /// Physical block behind `logical`, or `None` for a hole.
    pub fn map(&mut self, logical: u64) -> Result<Option<BlockNumber>> {
        let p = self.per_block;
        if logical < EXT2_NDIR_BLOCKS as u64 {
            // bounded by the check above
            let slot = usize::try_from(logical).unwrap_or(0);
            return self.leaf(self.pointers[slot], 0);
        }
        let rel = logical - EXT2_NDIR_BLOCKS as u64;
        if rel < p {
            return self.walk(self.pointers[EXT2_IND_BLOCK], &[rel]);
        }
        let rel = rel - p;
        if rel < p * p {
            return self.walk(self.pointers[EXT2_DIND_BLOCK], &[rel / p, rel % p]);
        }
        Err(too_large(logical.saturating_add(1), self.dev.block_size()))
    }

    fn leaf(&self, ptr: u32, owner: u32) -> Result<Option<BlockNumber>> {
        if ptr == 0 {
            return Ok(None);
        }
        check_pointer(self.dev, ptr, owner).map(Some)
    }

    fn walk(&mut self, root: u32, indices: &[u64]) -> Result<Option<BlockNumber>> {
        let mut current = root;
        let mut owner = 0;
        for (depth, &index) in indices.iter().enumerate() {
            if current == 0 {
                return Ok(None);
            }
            let next = self.table_entry(depth, current, owner, index)?;
            owner = current;
            current = next;
        }
        self.leaf(current, owner)
    }

    fn table_entry(&mut self, depth: usize, table: u32, owner: u32, index: u64) -> Result<u32> {
        let cached = matches!(&self.tables[depth], Some((block, _)) if *block == table);
        if !cached {
            let block = check_pointer(self.dev, table, owner)?;
            let raw = self.dev.read_block(block)?;
            trace!(table, depth, "loaded pointer table");
            self.tables[depth] = Some((table, decode_pointers(raw.as_slice())));
        }
        let entries = self.tables[depth].as_ref().map(|(_, e)| e.as_slice());
        usize::try_from(index)
            .ok()
            .and_then(|i| entries.and_then(|e| e.get(i)))
            .copied()
            .ok_or_else(|| E2Error::Corruption {
                block: table,
                detail: format!("pointer index {index} outside table"),
            })
    }
}

// ── Streaming read ──────────────────────────────────────────────────────────

/// Lazy, block-at-a-time view of `[0, size)` of one inode.
///
/// Each item is one block's worth of bytes (the last one truncated to the
/// file size). Holes yield zeros. Fast symlinks, whose target is stored in
/// the pointer array itself, yield that target.
pub struct FileReader<'a> {
    dev: &'a dyn BlockDevice,
    mapper: BlockMapper<'a>,
    inline: Option<Vec<u8>>,
    size: u64,
    position: u64,
}

impl<'a> FileReader<'a> {
    pub fn new(dev: &'a dyn BlockDevice, inode: &Ext2Inode) -> Result<Self> {
        let bs = dev.block_size();
        let needed = inode.size.div_ceil(u64::from(bs.get()));
        let inline = is_fast_symlink(inode).then(|| {
            let mut raw: Vec<u8> = inode.block.iter().flat_map(|p| p.to_le_bytes()).collect();
            raw.truncate(usize::try_from(inode.size).unwrap_or(0).min(raw.len()));
            raw
        });
        if inline.is_none() && needed > max_addressable_blocks(bs) {
            return Err(too_large(needed, bs));
        }
        Ok(Self {
            dev,
            mapper: BlockMapper::new(dev, inode),
            inline,
            size: inode.size,
            position: 0,
        })
    }

    /// Bytes left to yield.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.position)
    }

    fn next_chunk(&mut self) -> Result<Vec<u8>> {
        let bs = u64::from(self.dev.block_size().get());
        let logical = self.position / bs;
        let len = usize::try_from(bs.min(self.remaining()))
            .map_err(|_| E2Error::Format("chunk length overflows usize".into()))?;
        let chunk = match self.mapper.map(logical)? {
            Some(block) => {
                let mut data = self.dev.read_block(block)?.into_inner();
                data.truncate(len);
                data
            }
            None => vec![0_u8; len],
        };
        self.position += chunk.len() as u64;
        Ok(chunk)
    }
}

impl Iterator for FileReader<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(inline) = self.inline.take() {
            self.position = self.size;
            return (!inline.is_empty()).then_some(Ok(inline));
        }
        if self.remaining() == 0 {
            return None;
        }
        match self.next_chunk() {
            Ok(chunk) => Some(Ok(chunk)),
            Err(err) => {
                self.position = self.size;
                Some(Err(err))
            }
        }
    }
}

fn is_fast_symlink(inode: &Ext2Inode) -> bool {
    inode.is_symlink() && inode.blocks == 0 && inode.file_acl == 0
}

/// Copy the whole byte stream of `inode` into `sink`. Returns the number of
/// bytes written, which equals `inode.size` on success.
pub fn stream_to(dev: &dyn BlockDevice, inode: &Ext2Inode, sink: &mut dyn Write) -> Result<u64> {
    let mut written = 0_u64;
    for chunk in FileReader::new(dev, inode)? {
        let chunk = chunk?;
        sink.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    sink.flush()?;
    trace!(size = inode.size, written, "streamed inode data");
    Ok(written)
}

// ── In-place write ──────────────────────────────────────────────────────────

/// Overwrite `data` at byte `offset` of an inode whose blocks already exist.
///
/// Every logical block the range touches is mapped before anything is
/// written; a hole fails with `BlockNotAllocated` and leaves the image
/// unchanged. `inode.size` grows to cover the range; the caller persists
/// the inode.
pub fn write_within(
    dev: &dyn BlockDevice,
    ino: InodeNumber,
    inode: &mut Ext2Inode,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let bs = u64::from(dev.block_size().get());
    let end = offset
        .checked_add(data.len() as u64)
        .ok_or_else(|| too_large(u64::MAX, dev.block_size()))?;

    let mut mapper = BlockMapper::new(dev, inode);
    let mut targets = Vec::new();
    for logical in offset / bs..=(end - 1) / bs {
        match mapper.map(logical)? {
            Some(block) => targets.push((logical, block)),
            None => {
                return Err(E2Error::BlockNotAllocated {
                    ino: ino.0,
                    logical,
                });
            }
        }
    }

    for (logical, block) in targets {
        let block_start = logical * bs;
        let from = offset.max(block_start);
        let to = end.min(block_start + bs);
        // all four values are bounded by the block size or data.len()
        let within = usize::try_from(from - block_start).unwrap_or(0);
        let src = usize::try_from(from - offset).unwrap_or(0);
        let len = usize::try_from(to - from).unwrap_or(0);

        let mut buf = dev.read_block(block)?;
        buf.as_mut_slice()[within..within + len].copy_from_slice(&data[src..src + len]);
        dev.write_block(block, buf.as_slice())?;
    }

    inode.size = inode.size.max(end);
    debug!(ino = ino.0, offset, len = data.len(), size = inode.size, "wrote in place");
    Ok(())
}

// ── Reachable blocks ────────────────────────────────────────────────────────

/// Every block an inode holds, split by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReachableBlocks {
    /// Blocks holding file bytes.
    pub data: Vec<BlockNumber>,
    /// Single- and double-indirect pointer tables.
    pub meta: Vec<BlockNumber>,
}

impl ReachableBlocks {
    /// Data and pointer blocks together.
    pub fn all(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.data.iter().chain(self.meta.iter()).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() + self.meta.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.meta.is_empty()
    }
}

/// Enumerate every non-zero pointer reachable from `inode`, regardless of
/// `size`. A set triple-indirect pointer fails with `FileTooLarge` before
/// anything is returned.
pub fn reachable_blocks(dev: &dyn BlockDevice, inode: &Ext2Inode) -> Result<ReachableBlocks> {
    let mut out = ReachableBlocks::default();
    if is_fast_symlink(inode) {
        return Ok(out);
    }
    if inode.block[EXT2_TIND_BLOCK] != 0 {
        let bs = dev.block_size();
        return Err(too_large(max_addressable_blocks(bs) + 1, bs));
    }

    for &ptr in inode.block.iter().take(EXT2_NDIR_BLOCKS) {
        if ptr != 0 {
            out.data.push(check_pointer(dev, ptr, 0)?);
        }
    }

    let ind = inode.block[EXT2_IND_BLOCK];
    if ind != 0 {
        collect_table(dev, ind, 0, 1, &mut out)?;
    }
    let dind = inode.block[EXT2_DIND_BLOCK];
    if dind != 0 {
        collect_table(dev, dind, 0, 2, &mut out)?;
    }

    trace!(
        data = out.data.len(),
        meta = out.meta.len(),
        "enumerated reachable blocks"
    );
    Ok(out)
}

fn collect_table(
    dev: &dyn BlockDevice,
    table: u32,
    owner: u32,
    depth: u8,
    out: &mut ReachableBlocks,
) -> Result<()> {
    let block = check_pointer(dev, table, owner)?;
    out.meta.push(block);
    let pointers = decode_pointers(dev.read_block(block)?.as_slice());
    for ptr in pointers.into_iter().filter(|p| *p != 0) {
        if depth > 1 {
            collect_table(dev, ptr, table, depth - 1, out)?;
        } else {
            out.data.push(check_pointer(dev, ptr, table)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2_block::{Ext2BlockDevice, MemoryByteDevice};

    const BLOCKS: u32 = 128;

    fn device() -> Ext2BlockDevice {
        let mem = MemoryByteDevice::new(BLOCKS as usize * 1024);
        Ext2BlockDevice::new(Box::new(mem), BlockSize::MIN, BLOCKS).unwrap()
    }

    fn put_pointers(dev: &Ext2BlockDevice, table: u32, entries: &[(usize, u32)]) {
        let mut raw = vec![0_u8; 1024];
        for &(i, ptr) in entries {
            raw[i * 4..i * 4 + 4].copy_from_slice(&ptr.to_le_bytes());
        }
        dev.write_block(BlockNumber(table), &raw).unwrap();
    }

    fn fill(dev: &Ext2BlockDevice, block: u32, byte: u8) {
        dev.write_block(BlockNumber(block), &[byte; 1024]).unwrap();
    }

    /// Direct 10; single-indirect table 20 -> [21]; double-indirect table 30
    /// -> [31] -> [32, 33].
    fn layered_inode(dev: &Ext2BlockDevice) -> Ext2Inode {
        put_pointers(dev, 20, &[(0, 21)]);
        put_pointers(dev, 30, &[(0, 31)]);
        put_pointers(dev, 31, &[(0, 32), (1, 33)]);
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.block[0] = 10;
        inode.block[EXT2_IND_BLOCK] = 20;
        inode.block[EXT2_DIND_BLOCK] = 30;
        inode
    }

    #[test]
    fn maps_every_indirection_level() {
        let dev = device();
        let inode = layered_inode(&dev);
        let mut mapper = BlockMapper::new(&dev, &inode);

        assert_eq!(mapper.map(0).unwrap(), Some(BlockNumber(10)));
        assert_eq!(mapper.map(1).unwrap(), None);
        assert_eq!(mapper.map(12).unwrap(), Some(BlockNumber(21)));
        assert_eq!(mapper.map(13).unwrap(), None);
        assert_eq!(mapper.map(12 + 256).unwrap(), Some(BlockNumber(32)));
        assert_eq!(mapper.map(12 + 256 + 1).unwrap(), Some(BlockNumber(33)));
        assert_eq!(mapper.map(12 + 256 + 256).unwrap(), None);
    }

    #[test]
    fn triple_indirect_range_is_too_large() {
        let dev = device();
        let inode = layered_inode(&dev);
        let mut mapper = BlockMapper::new(&dev, &inode);
        let first_triple = 12 + 256 + 256 * 256;
        let err = mapper.map(first_triple).unwrap_err();
        assert!(matches!(
            err,
            E2Error::FileTooLarge {
                needed_blocks,
                max_blocks: 65_804,
            } if needed_blocks == first_triple + 1
        ));
    }

    #[test]
    fn out_of_range_pointer_is_corruption() {
        let dev = device();
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.block[3] = BLOCKS + 5;
        let mut mapper = BlockMapper::new(&dev, &inode);
        assert!(matches!(
            mapper.map(3),
            Err(E2Error::Corruption { .. })
        ));
    }

    #[test]
    fn reader_yields_exactly_size_bytes_with_holes_as_zero() {
        let dev = device();
        fill(&dev, 40, b'a');
        fill(&dev, 42, b'c');
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.block[0] = 40;
        inode.block[2] = 42;
        inode.size = 2 * 1024 + 10;

        let chunks: Vec<Vec<u8>> = FileReader::new(&dev, &inode)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].iter().all(|b| *b == b'a'));
        assert!(chunks[1].iter().all(|b| *b == 0));
        assert_eq!(chunks[2], vec![b'c'; 10]);
    }

    #[test]
    fn stream_to_writes_size_bytes() {
        let dev = device();
        let mut block = vec![0_u8; 1024];
        block[..13].copy_from_slice(b"Hello world!\n");
        dev.write_block(BlockNumber(14), &block).unwrap();
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.block[0] = 14;
        inode.size = 13;

        let mut out = Vec::new();
        assert_eq!(stream_to(&dev, &inode, &mut out).unwrap(), 13);
        assert_eq!(out, b"Hello world!\n");
    }

    #[test]
    fn reader_rejects_sizes_beyond_double_indirect() {
        let dev = device();
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.size = (max_addressable_blocks(BlockSize::MIN) + 1) * 1024;
        assert!(matches!(
            FileReader::new(&dev, &inode),
            Err(E2Error::FileTooLarge { .. })
        ));
    }

    #[test]
    fn fast_symlink_streams_inline_target() {
        let dev = device();
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.mode = e2_types::S_IFLNK | 0o777;
        let target = b"hello.txt";
        let mut raw = [0_u8; 60];
        raw[..target.len()].copy_from_slice(target);
        for (i, slot) in inode.block.iter_mut().enumerate() {
            *slot = u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
        }
        inode.size = target.len() as u64;

        let mut out = Vec::new();
        stream_to(&dev, &inode, &mut out).unwrap();
        assert_eq!(out, target);
        assert!(reachable_blocks(&dev, &inode).unwrap().is_empty());
    }

    #[test]
    fn write_within_spans_block_boundary() {
        let dev = device();
        fill(&dev, 50, b'x');
        fill(&dev, 51, b'x');
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.block[0] = 50;
        inode.block[1] = 51;
        inode.size = 100;

        write_within(&dev, InodeNumber(12), &mut inode, 1020, b"abcdefgh").unwrap();
        assert_eq!(inode.size, 1028);
        let first = dev.read_block(BlockNumber(50)).unwrap();
        let second = dev.read_block(BlockNumber(51)).unwrap();
        assert_eq!(&first.as_slice()[1020..], b"abcd");
        assert_eq!(&second.as_slice()[..4], b"efgh");
        assert_eq!(second.as_slice()[4], b'x');
    }

    #[test]
    fn write_into_hole_changes_nothing() {
        let dev = device();
        fill(&dev, 50, b'x');
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.block[0] = 50;
        inode.size = 1024;

        let err = write_within(&dev, InodeNumber(12), &mut inode, 1000, &[b'y'; 100]).unwrap_err();
        assert!(matches!(
            err,
            E2Error::BlockNotAllocated { ino: 12, logical: 1 }
        ));
        assert_eq!(inode.size, 1024);
        assert!(dev
            .read_block(BlockNumber(50))
            .unwrap()
            .as_slice()
            .iter()
            .all(|b| *b == b'x'));
    }

    #[test]
    fn reachable_blocks_separates_data_and_tables() {
        let dev = device();
        let inode = layered_inode(&dev);
        let blocks = reachable_blocks(&dev, &inode).unwrap();
        assert_eq!(
            blocks.data,
            vec![BlockNumber(10), BlockNumber(21), BlockNumber(32), BlockNumber(33)]
        );
        assert_eq!(
            blocks.meta,
            vec![BlockNumber(20), BlockNumber(30), BlockNumber(31)]
        );
        assert_eq!(blocks.len(), 7);
    }

    #[test]
    fn reachable_blocks_refuses_triple_indirect() {
        let dev = device();
        let mut inode = Ext2Inode::new_regular_file(0);
        inode.block[EXT2_TIND_BLOCK] = 60;
        assert!(matches!(
            reachable_blocks(&dev, &inode),
            Err(E2Error::FileTooLarge { .. })
        ));
    }
}
