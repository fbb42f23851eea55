//! # Image Builder
//!
//! Linearizes an arena into one image:
//!
//! 1. Walk the arena and record every distinct block in traversal order
//! 2. Place blocks at increasing, aligned offsets (root first, no reordering)
//! 3. Copy block bytes; zero transient blocks and run-time fields; replace
//!    every pointer by its offset inside the target block and record a fixup
//! 4. Write header, payload, fixup table and block table
//!
//! Saving the same arena twice produces identical bytes.

use bytemuck::{bytes_of, cast_slice};
use std::io::Write;

use clump_reflect::{align_up, Addr, StableId, TypeDescriptor};

use super::format::{
    image_size, table_offset, FixupEntry, ImageHeader, HEADER_SIZE, POINTER_SIZE, SECTION_ALIGN,
};
use crate::arena::layout::{CLUMP_CLASS, CLUMP_ROOT};
use crate::arena::Arena;
use crate::error::{ClumpError, ClumpResult};
use crate::walker::{GraphVisitor, MemoryBlock};

/// Summary of a save.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageStats {
    /// Bytes of block data.
    pub payload_size: u32,
    /// Number of placed blocks.
    pub block_count: u32,
    /// Number of relocations.
    pub fixup_count: u32,
    /// Bytes reserved for run-time-only blocks.
    pub transient_bytes: u64,
    /// Total bytes written.
    pub image_size: u64,
}

#[derive(Default)]
struct SaveCollector {
    blocks: Vec<MemoryBlock>,
    pointers: Vec<(Addr, Addr)>,
    containers: Vec<(Addr, StableId)>,
    runtime: Vec<(Addr, u64)>,
}

impl GraphVisitor for SaveCollector {
    fn visit_block(&mut self, block: MemoryBlock) -> ClumpResult<()> {
        self.blocks.push(block);
        Ok(())
    }

    fn visit_pointer(&mut self, slot: Addr, target: Addr) -> ClumpResult<()> {
        self.pointers.push((slot, target));
        Ok(())
    }

    fn visit_container(&mut self, instance: Addr, desc: &TypeDescriptor) -> ClumpResult<()> {
        self.containers.push((instance, desc.id()));
        Ok(())
    }

    fn visit_runtime_field(&mut self, addr: Addr, len: u64) -> ClumpResult<()> {
        self.runtime.push((addr, len));
        Ok(())
    }
}

/// Blocks sorted by address, for resolving an address to (block, offset).
struct BlockMap {
    sorted: Vec<(u64, u64, u32)>,
}

impl BlockMap {
    fn new(blocks: &[MemoryBlock]) -> ClumpResult<Self> {
        let mut sorted: Vec<_> = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.addr.get(), b.len, i as u32))
            .collect();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            let (first, len, _) = pair[0];
            let (second, _, _) = pair[1];
            if first + len > second {
                return Err(ClumpError::OverlappingBlocks {
                    first: Addr::new(first),
                    second: Addr::new(second),
                });
            }
        }
        Ok(Self { sorted })
    }

    /// Returns the block containing `addr` and the offset inside it.
    fn find(&self, addr: Addr) -> Option<(u32, u64)> {
        let raw = addr.get();
        let pos = self.sorted.partition_point(|&(start, _, _)| start <= raw);
        let &(start, len, index) = self.sorted.get(pos.checked_sub(1)?)?;
        (raw < start + len).then_some((index, raw - start))
    }
}

/// Saves `arena` as one load-in-place image.
///
/// # Errors
///
/// Fails on an I/O error (returned as soon as it happens), a pointer into
/// no saved block, overlapping blocks, or an image too large for the
/// format's 32-bit offsets.
pub fn save_image<W: Write>(arena: &Arena, writer: &mut W) -> ClumpResult<ImageStats> {
    let registry = arena.registry();
    let memory = arena.memory();

    let mut collector = SaveCollector::default();
    arena.walk(&mut collector)?;
    let SaveCollector {
        blocks,
        pointers,
        containers,
        runtime,
    } = collector;

    let mut offsets = Vec::with_capacity(blocks.len());
    let mut cursor = 0;
    for block in &blocks {
        cursor = align_up(cursor, u64::from(block.align.max(1)));
        offsets.push(cursor);
        cursor += block.len;
    }
    let payload_size = cursor;
    let total = image_size(payload_size, pointers.len() as u64, blocks.len() as u64);
    if total > u64::from(u32::MAX) {
        return Err(ClumpError::ImageTooLarge(total));
    }

    let map = BlockMap::new(&blocks)?;
    let locate = |addr: Addr, len: u64| -> ClumpResult<usize> {
        let (index, within) = map.find(addr).ok_or(ClumpError::BadAddress { addr, len })?;
        let block = &blocks[index as usize];
        if within + len > block.len {
            return Err(ClumpError::BadAddress { addr, len });
        }
        Ok((offsets[index as usize] + within) as usize)
    };

    let mut payload = vec![0u8; payload_size as usize];
    let mut transient_bytes = 0;
    for (block, &offset) in blocks.iter().zip(&offsets) {
        if block.transient {
            transient_bytes += block.len;
            continue;
        }
        let at = offset as usize;
        payload[at..at + block.len as usize].copy_from_slice(memory.bytes(block.addr, block.len)?);
    }

    for (addr, len) in runtime {
        let at = locate(addr, len)?;
        payload[at..at + len as usize].fill(0);
    }

    for (instance, id) in containers {
        let desc = registry.get(id)?;
        let size = u64::from(desc.byte_size());
        let at = locate(instance, size)?;
        if let Some(container) = desc.container() {
            container.clear_externally_allocated(&mut payload[at..at + size as usize]);
        }
    }

    let mut fixups = Vec::with_capacity(pointers.len());
    for (slot, target) in pointers {
        let at = locate(slot, POINTER_SIZE)?;
        let (index, addend) = map
            .find(target)
            .ok_or(ClumpError::DanglingPointer { slot, target })?;
        payload[at..at + POINTER_SIZE as usize].copy_from_slice(&addend.to_ne_bytes());
        fixups.push(FixupEntry {
            write_offset: at as u32,
            target_block_index: index,
        });
    }

    let config = arena.config();
    let class = registry.get(CLUMP_ROOT)?.fourcc().unwrap_or(CLUMP_CLASS);
    let header = ImageHeader {
        filetype_tag: config.image.filetype_tag.to_u32(),
        session_id: config.image.session_id,
        class_fourcc: class.to_u32(),
        payload_size: payload_size as u32,
    };
    let padding = table_offset(payload_size) - HEADER_SIZE - payload_size;
    let block_offsets: Vec<u32> = offsets.iter().map(|&o| o as u32).collect();

    writer.write_all(bytes_of(&header))?;
    writer.write_all(&payload)?;
    writer.write_all(&[0u8; SECTION_ALIGN as usize][..padding as usize])?;
    writer.write_all(&(fixups.len() as u32).to_ne_bytes())?;
    writer.write_all(cast_slice(&fixups))?;
    writer.write_all(&(block_offsets.len() as u32).to_ne_bytes())?;
    writer.write_all(cast_slice(&block_offsets))?;

    let stats = ImageStats {
        payload_size: header.payload_size,
        block_count: block_offsets.len() as u32,
        fixup_count: fixups.len() as u32,
        transient_bytes,
        image_size: total,
    };
    tracing::info!(
        "Saved image: {} blocks, {} fixups, {} payload bytes",
        stats.block_count,
        stats.fixup_count,
        stats.payload_size
    );
    Ok(stats)
}
