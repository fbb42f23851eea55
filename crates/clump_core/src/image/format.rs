//! # Image Format
//!
//! ```text
//! +---------------------------------------------+ 0
//! | ImageHeader (16 bytes)                      |
//! +---------------------------------------------+ 16
//! | payload: placed blocks, block 0 = root      |
//! +---------------------------------------------+ 16 + payload_size
//! | padding to 16                               |
//! +---------------------------------------------+ table_offset(payload_size)
//! | u32 fixup_count | FixupEntry[fixup_count]   |
//! | u32 block_count | u32 offset[block_count]   |
//! +---------------------------------------------+
//! ```
//!
//! All integers are native byte order. A pointer slot in the payload holds
//! the distance of its target from the start of the target block; the fixup
//! entry names that block.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

use clump_reflect::{align_up, FourCc};

/// Constant image marker.
pub const IMAGE_FILETYPE_TAG: FourCc = FourCc::new(b"LIPI");

/// Session constant of this build. Images saved by another layout of the
/// control records carry another session and are rejected.
pub const SESSION_ID: u32 = 0x0001_0003;

/// Size of [`ImageHeader`].
pub const HEADER_SIZE: u64 = size_of::<ImageHeader>() as u64;

/// Alignment of the payload start and of the tables.
pub const SECTION_ALIGN: u64 = 16;

/// Size of one serialized pointer slot.
pub const POINTER_SIZE: u64 = 8;

/// Fixed-size image header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ImageHeader {
    /// [`IMAGE_FILETYPE_TAG`] as stored.
    pub filetype_tag: u32,
    /// Session of the saving process.
    pub session_id: u32,
    /// Class tag of the root record.
    pub class_fourcc: u32,
    /// Bytes of block data following the header.
    pub payload_size: u32,
}

impl ImageHeader {
    /// Returns the file type tag.
    #[inline]
    #[must_use]
    pub const fn filetype(&self) -> FourCc {
        FourCc::from_u32(self.filetype_tag)
    }

    /// Returns the class tag.
    #[inline]
    #[must_use]
    pub const fn class(&self) -> FourCc {
        FourCc::from_u32(self.class_fourcc)
    }
}

/// One relocation: the pointer slot at `write_offset` targets block
/// `target_block_index`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FixupEntry {
    /// Payload offset of the pointer slot.
    pub write_offset: u32,
    /// Index into the block table.
    pub target_block_index: u32,
}

/// Offset of the fixup table from the start of the image.
#[inline]
#[must_use]
pub const fn table_offset(payload_size: u64) -> u64 {
    align_up(HEADER_SIZE + payload_size, SECTION_ALIGN)
}

/// Total image size for the given section sizes.
#[inline]
#[must_use]
pub const fn image_size(payload_size: u64, fixup_count: u64, block_count: u64) -> u64 {
    table_offset(payload_size) + 4 + fixup_count * size_of::<FixupEntry>() as u64 + 4 + block_count * 4
}
