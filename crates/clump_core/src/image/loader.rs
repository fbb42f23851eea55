//! # Image Loader
//!
//! Restores an arena with one bulk allocation and one payload read:
//!
//! 1. Read and verify the header
//! 2. Check that the stream holds the payload and both tables, then read the tables
//! 3. Allocate one buffer of `payload_size` bytes and read the payload into it
//! 4. Patch every fixup, range-checking block index, slot and target
//! 5. Give the restored root a fresh identity
//! 6. Mark every container and list as externally allocated
//! 7. Rebuild free-slot stacks and the lookup indices
//!
//! Nothing is allocated before the image is known to be complete, and a
//! failure after allocation releases the buffer before returning.

use bytemuck::{bytes_of_mut, cast_slice_mut, Zeroable};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use clump_reflect::{Addr, TypeRegistry};

use super::format::{
    image_size, table_offset, FixupEntry, ImageHeader, HEADER_SIZE, POINTER_SIZE, SECTION_ALIGN,
};
use crate::arena::layout::{ClumpRoot, CLUMP_CLASS, CLUMP_ROOT, LIST_EXTERNAL, ROOT_LOADED};
use crate::arena::{next_instance_id, Arena};
use crate::config::{ClumpConfig, ImageConfig};
use crate::error::{ClumpError, ClumpResult};
use crate::memory::{Allocator, Memory};
use crate::walker::ContainerCollector;

/// Header and tables of an image, read without its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    /// The image header.
    pub header: ImageHeader,
    /// Relocations in save order.
    pub fixups: Vec<FixupEntry>,
    /// Payload offset of every block, block 0 first.
    pub block_offsets: Vec<u32>,
    /// Total image size in bytes.
    pub image_size: u64,
}

impl ImageInfo {
    /// Checks the header's file type, class and session against `config`
    /// and the root class registered in `registry`.
    ///
    /// # Errors
    ///
    /// The same identity errors [`load_image`] reports.
    pub fn verify_identity(&self, config: &ImageConfig, registry: &TypeRegistry) -> ClumpResult<()> {
        verify_header(&self.header, config, registry)
    }
}

fn read_u32<R: Read>(reader: &mut R) -> ClumpResult<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_ne_bytes(bytes))
}

fn read_header<R: Read + Seek>(reader: &mut R) -> ClumpResult<(u64, u64, ImageHeader)> {
    let start = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(start))?;
    let available = end.saturating_sub(start);

    if available < HEADER_SIZE {
        return Err(ClumpError::Truncated {
            needed: HEADER_SIZE,
            available,
        });
    }
    let mut header = ImageHeader::zeroed();
    reader.read_exact(bytes_of_mut(&mut header))?;
    Ok((start, available, header))
}

fn read_tables<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    available: u64,
    header: ImageHeader,
) -> ClumpResult<ImageInfo> {
    let payload = u64::from(header.payload_size);
    let check = |needed: u64| {
        if needed > available {
            Err(ClumpError::Truncated { needed, available })
        } else {
            Ok(())
        }
    };

    check(table_offset(payload) + 4)?;
    reader.seek(SeekFrom::Start(start + table_offset(payload)))?;
    let fixup_count = read_u32(reader)?;
    check(image_size(payload, u64::from(fixup_count), 0))?;
    let mut fixups = vec![FixupEntry::zeroed(); fixup_count as usize];
    reader.read_exact(cast_slice_mut(&mut fixups))?;

    let block_count = read_u32(reader)?;
    let total = image_size(payload, u64::from(fixup_count), u64::from(block_count));
    check(total)?;
    let mut block_offsets = vec![0u32; block_count as usize];
    reader.read_exact(cast_slice_mut(&mut block_offsets))?;

    reader.seek(SeekFrom::Start(start + HEADER_SIZE))?;
    Ok(ImageInfo {
        header,
        fixups,
        block_offsets,
        image_size: total,
    })
}

/// Reads the header and tables of an image without loading it.
///
/// The reader is left at the start of the payload.
///
/// # Errors
///
/// [`ClumpError::Truncated`] if the stream ends early, or an I/O error.
pub fn read_image_info<R: Read + Seek>(reader: &mut R) -> ClumpResult<ImageInfo> {
    let (start, available, header) = read_header(reader)?;
    read_tables(reader, start, available, header)
}

fn verify_header(header: &ImageHeader, config: &ImageConfig, registry: &TypeRegistry) -> ClumpResult<()> {
    if header.filetype() != config.filetype_tag {
        return Err(ClumpError::WrongFileType {
            expected: config.filetype_tag,
            found: header.filetype(),
        });
    }
    let class = registry.get(CLUMP_ROOT)?.fourcc().unwrap_or(CLUMP_CLASS);
    if header.class() != class {
        return Err(ClumpError::WrongClass {
            expected: class,
            found: header.class(),
        });
    }
    if header.session_id != config.session_id {
        return Err(ClumpError::SessionMismatch {
            expected: config.session_id,
            found: header.session_id,
        });
    }
    Ok(())
}

fn verify_blocks(info: &ImageInfo) -> ClumpResult<()> {
    let payload = info.header.payload_size;
    if u64::from(payload) < std::mem::size_of::<ClumpRoot>() as u64 {
        return Err(ClumpError::MalformedImage(format!(
            "payload of {payload} bytes cannot hold the root record"
        )));
    }
    if info.block_offsets.first() != Some(&0) {
        return Err(ClumpError::MalformedImage("block 0 must start at offset 0".into()));
    }
    let ordered = info.block_offsets.windows(2).all(|w| w[0] < w[1]);
    let last_in_range = info.block_offsets.last().is_some_and(|&o| o < payload);
    if !ordered || !last_in_range {
        return Err(ClumpError::MalformedImage(
            "block offsets must increase and stay inside the payload".into(),
        ));
    }
    Ok(())
}

fn patch_fixups(memory: &mut Memory, base: Addr, info: &ImageInfo) -> ClumpResult<()> {
    let payload = u64::from(info.header.payload_size);
    let block_count = info.block_offsets.len();

    for (entry, fixup) in info.fixups.iter().enumerate() {
        let out_of_range = |reason: String| ClumpError::FixupOutOfRange {
            entry: entry as u32,
            reason,
        };
        let block = info
            .block_offsets
            .get(fixup.target_block_index as usize)
            .ok_or_else(|| out_of_range(format!("block {} of {block_count}", fixup.target_block_index)))?;
        let write = u64::from(fixup.write_offset);
        if write + POINTER_SIZE > payload {
            return Err(out_of_range(format!("slot at {write} of {payload}")));
        }

        let slot = base.offset(write);
        let addend: u64 = memory.read(slot)?;
        let target = u64::from(*block)
            .checked_add(addend)
            .filter(|&t| t < payload)
            .ok_or_else(|| out_of_range(format!("target {block}+{addend} of {payload}")))?;
        memory.write(slot, &base.offset(target))?;
    }
    Ok(())
}

fn reattach(arena: &mut Arena) -> ClumpResult<()> {
    let registry = Arc::clone(arena.registry());
    let root = arena.root();

    let mut record = arena.root_record()?;
    record.instance_id = next_instance_id();
    record.flags = ROOT_LOADED;
    arena.memory_mut().write(root, &record)?;

    let mut collector = ContainerCollector::default();
    arena.walk(&mut collector)?;
    for (instance, id) in collector.containers {
        let desc = registry.get(id)?;
        if let Some(container) = desc.container() {
            let bytes = arena.memory_mut().bytes_mut(instance, u64::from(desc.byte_size()))?;
            container.mark_externally_allocated(bytes);
        }
    }
    for index in 0..arena.list_count()? {
        let mut header = arena.list_header(index)?;
        header.flags |= LIST_EXTERNAL;
        arena.write_list_header(index, &header)?;
    }

    arena.rebuild_runtime_state()
}

/// Loads an image saved by [`save_image`](super::save_image).
///
/// `allocator` receives exactly one request, for the payload buffer; the
/// returned arena uses it for every later growth.
///
/// # Errors
///
/// Fails on a header mismatch, a truncated or inconsistent image, an
/// out-of-range fixup, an allocator failure or an I/O error. No arena is
/// returned on failure.
pub fn load_image<R: Read + Seek>(
    reader: &mut R,
    mut allocator: Box<dyn Allocator>,
    registry: Arc<TypeRegistry>,
    config: &ClumpConfig,
) -> ClumpResult<Arena> {
    config.validate()?;
    let (start, available, header) = read_header(reader)?;
    verify_header(&header, &config.image, &registry)?;
    let info = read_tables(reader, start, available, header)?;
    verify_blocks(&info)?;

    let payload = u64::from(header.payload_size);
    // Memory access is by unaligned copy, so blocks aligned above the
    // section alignment need not be aligned in the bulk buffer.
    let base = allocator.allocate(payload, SECTION_ALIGN)?;
    let mut arena = Arena::adopt(registry, allocator, *config, base, payload)?;

    reader.read_exact(arena.memory_mut().bytes_mut(base, payload)?)?;
    patch_fixups(arena.memory_mut(), base, &info)?;
    reattach(&mut arena)?;

    tracing::info!(
        "Loaded image: {} payload bytes, {} fixups, {} lists, {} live objects",
        payload,
        info.fixups.len(),
        arena.list_count()?,
        arena.live_objects()?
    );
    Ok(arena)
}
