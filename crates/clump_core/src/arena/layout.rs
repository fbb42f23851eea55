//! # Arena Control Records
//!
//! The arena keeps its own bookkeeping inside its address space, described
//! by registered descriptors like any user type. Saves therefore walk the
//! arena with the same code that walks user objects.
//!
//! ```text
//! ClumpRoot ──lists──▶ [ObjectListHeader; n]
//!                         │ storage ──▶ [T; capacity]
//!                         │ live_bits ──▶ [u64; ⌈capacity/64⌉]
//!                         └ free_slots ──▶ [u32; capacity]   (run-time only)
//! ```

use bytemuck::{Pod, Zeroable};
use std::mem::offset_of;

use clump_reflect::{builtin, Addr, DynArray, FourCc, ReflectResult, RegistryBuilder, StableId};

/// Class tag of the arena root, stamped into every image header.
pub const CLUMP_CLASS: FourCc = FourCc::new(b"CLMP");

/// Descriptor id of [`ClumpRoot`].
pub const CLUMP_ROOT: StableId = StableId(100);
/// Descriptor id of [`ObjectListHeader`].
pub const OBJECT_LIST_HEADER: StableId = StableId(101);
/// Descriptor id of the list-header vector.
pub const LIST_HEADERS: StableId = StableId(102);
/// Descriptor id of a live-slot bitmap.
pub const LIVE_BITS: StableId = StableId(103);
/// Descriptor id of a free-slot stack.
pub const FREE_SLOTS: StableId = StableId(104);
/// Descriptor id of the opaque bytes a list stores its objects in.
pub const OBJECT_STORAGE: StableId = StableId(105);
/// Descriptor id of the pointer to a list's storage.
pub const STORAGE_POINTER: StableId = StableId(106);

/// Root flag: the arena was restored from an image.
pub const ROOT_LOADED: u32 = 1;
/// List flag: the storage belongs to a loaded image.
pub const LIST_EXTERNAL: u32 = 1;

/// Root record of an arena. Always block 0 of an image.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct ClumpRoot {
    /// Process-unique identity (run-time only).
    pub instance_id: u64,
    /// Headers of every object list, in creation order.
    pub lists: DynArray,
    /// Live objects across all lists.
    pub live_objects: u64,
    /// [`ROOT_LOADED`] (run-time only).
    pub flags: u32,
    /// Reserved, always zero.
    pub _reserved: u32,
}

/// Header of one object list.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct ObjectListHeader {
    /// Stable id of the stored type.
    pub type_id: u32,
    /// Number of slots.
    pub capacity: u32,
    /// Number of live slots.
    pub live_count: u32,
    /// Distance between slots.
    pub stride: u32,
    /// Start of the slot array.
    pub storage: Addr,
    /// One bit per slot, set while the slot is live.
    pub live_bits: DynArray,
    /// Stack of free slot indices (run-time only).
    pub free_slots: DynArray,
    /// [`LIST_EXTERNAL`] (run-time only).
    pub flags: u32,
    /// Reserved, always zero.
    pub _reserved: u32,
}

impl ObjectListHeader {
    /// Returns the stored type.
    #[inline]
    #[must_use]
    pub const fn type_id(&self) -> StableId {
        StableId(self.type_id)
    }

    /// Returns the address of `slot`.
    #[inline]
    #[must_use]
    pub const fn slot_addr(&self, slot: u32) -> Addr {
        self.storage.offset(slot as u64 * self.stride as u64)
    }

    /// Returns the size of the slot array in bytes.
    #[inline]
    #[must_use]
    pub const fn storage_size(&self) -> u64 {
        self.capacity as u64 * self.stride as u64
    }

    /// Checks if `addr` lies inside the slot array.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: Addr) -> bool {
        addr.get() >= self.storage.get() && addr.get() < self.storage.get() + self.storage_size()
    }
}

/// Registers the arena's control records.
///
/// Must run on every builder whose registry backs an arena.
///
/// # Errors
///
/// Fails if one of the reserved ids or names is already taken.
pub fn register_control_types(builder: &mut RegistryBuilder) -> ReflectResult<()> {
    builder.scalar("ObjectStorage", OBJECT_STORAGE, 1, 1)?;
    builder.pointer("ObjectStoragePtr", STORAGE_POINTER, OBJECT_STORAGE)?;
    builder.dynamic_array("LiveBits", LIVE_BITS, builtin::U64)?;
    builder.dynamic_array("FreeSlots", FREE_SLOTS, builtin::U32)?;

    builder
        .record::<ObjectListHeader>("ObjectListHeader", OBJECT_LIST_HEADER)
        .field("type_id", offset_of!(ObjectListHeader, type_id), builtin::U32)
        .field("capacity", offset_of!(ObjectListHeader, capacity), builtin::U32)
        .field("live_count", offset_of!(ObjectListHeader, live_count), builtin::U32)
        .field("stride", offset_of!(ObjectListHeader, stride), builtin::U32)
        .field("storage", offset_of!(ObjectListHeader, storage), STORAGE_POINTER)
        .field("live_bits", offset_of!(ObjectListHeader, live_bits), LIVE_BITS)
        .runtime_field("free_slots", offset_of!(ObjectListHeader, free_slots), FREE_SLOTS)
        .runtime_field("flags", offset_of!(ObjectListHeader, flags), builtin::U32)
        .finish()?;

    builder.dynamic_array("ListHeaders", LIST_HEADERS, OBJECT_LIST_HEADER)?;

    builder
        .record::<ClumpRoot>("ClumpRoot", CLUMP_ROOT)
        .fourcc(CLUMP_CLASS)
        .runtime_field("instance_id", offset_of!(ClumpRoot, instance_id), builtin::U64)
        .field("lists", offset_of!(ClumpRoot, lists), LIST_HEADERS)
        .field("live_objects", offset_of!(ClumpRoot, live_objects), builtin::U64)
        .runtime_field("flags", offset_of!(ClumpRoot, flags), builtin::U32)
        .finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_control_record_sizes() {
        assert_eq!(size_of::<ClumpRoot>(), 48);
        assert_eq!(size_of::<ObjectListHeader>(), 80);
    }

    #[test]
    fn test_control_types_register_and_validate() {
        let mut builder = RegistryBuilder::new();
        register_control_types(&mut builder).unwrap();
        let registry = builder.build().unwrap();

        let root = registry.get(CLUMP_ROOT).unwrap();
        assert_eq!(root.fourcc(), Some(CLUMP_CLASS));
        let runtime: Vec<_> = registry
            .fields(OBJECT_LIST_HEADER)
            .unwrap()
            .into_iter()
            .filter(|f| !f.is_plain_data)
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(runtime, ["free_slots", "flags"]);
    }

    #[test]
    fn test_slot_addressing() {
        let header = ObjectListHeader {
            capacity: 4,
            stride: 16,
            storage: Addr::new(0x1000),
            ..ObjectListHeader::default()
        };
        assert_eq!(header.slot_addr(2), Addr::new(0x1020));
        assert!(header.contains(Addr::new(0x103F)));
        assert!(!header.contains(Addr::new(0x1040)));
    }
}
