//! # Container Descriptors
//!
//! A uniform capability set over otherwise unrelated container layouts.
//!
//! The walker, builder and loader never look at a container's bytes
//! directly. They ask its descriptor for the count, the capacity, where the
//! data pointer lives and how to flag the backing block as externally owned.
//!
//! | Descriptor | Instance layout | Dynamic |
//! |---|---|---|
//! | [`DynamicArrayDescriptor`] | [`DynArray`] header | yes |
//! | [`StaticArrayDescriptor`] | `[T; N]` inline | no |
//! | [`DictionaryDescriptor`] | [`Dict`] header | yes |

use bytemuck::{bytes_of, pod_read_unaligned, Pod};
use std::fmt;
use std::mem::{offset_of, size_of};

use crate::descriptor::StableId;
use crate::layout::{Addr, Dict, DynArray, CONTAINER_EXTERNAL};

/// One typed part of a container element, relative to the element start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementPart {
    /// Offset inside the element.
    pub offset: u32,
    /// Type of the part.
    pub ty: StableId,
}

/// Shared contract of every container layout.
///
/// `instance` is always the container's own bytes (its descriptor's
/// `byte_size`), never the backing block.
pub trait ContainerDescriptor: Send + Sync + fmt::Debug {
    /// Checks if items live in a separately allocated block.
    fn is_dynamic(&self) -> bool;

    /// Returns the item type (the entry value type for dictionaries).
    fn item_type(&self) -> StableId;

    /// Returns the typed parts of one element.
    fn elements(&self) -> &[ElementPart];

    /// Returns the distance between consecutive elements.
    fn stride(&self) -> u32;

    /// Returns the alignment of the backing block.
    fn item_align(&self) -> u32;

    /// Returns the number of live elements.
    fn count(&self, instance: &[u8]) -> u32;

    /// Sets the number of live elements.
    fn set_count(&self, instance: &mut [u8], count: u32);

    /// Returns the number of element slots.
    fn capacity(&self, instance: &[u8]) -> u32;

    /// Sets the number of element slots.
    fn set_capacity(&self, instance: &mut [u8], capacity: u32);

    /// Returns where the data pointer lives inside the instance.
    fn data_pointer_offset(&self) -> Option<u32>;

    /// Flags the backing block as owned by someone else.
    fn mark_externally_allocated(&self, instance: &mut [u8]);

    /// Clears the externally-owned flag.
    fn clear_externally_allocated(&self, instance: &mut [u8]);

    /// Checks the externally-owned flag.
    fn is_externally_allocated(&self, instance: &[u8]) -> bool;

    /// Returns the data pointer, or null for static containers.
    fn data_pointer(&self, instance: &[u8]) -> Addr {
        match self.data_pointer_offset() {
            Some(offset) => read_at(instance, offset as usize),
            None => Addr::NULL,
        }
    }

    /// Stores the data pointer. Ignored by static containers.
    fn set_data_pointer(&self, instance: &mut [u8], data: Addr) {
        if let Some(offset) = self.data_pointer_offset() {
            write_at(instance, offset as usize, &data);
        }
    }

    /// Returns the size of the backing block in bytes.
    fn data_size(&self, instance: &[u8]) -> u64 {
        u64::from(self.capacity(instance)) * u64::from(self.stride())
    }
}

#[inline]
fn read_at<T: Pod>(bytes: &[u8], offset: usize) -> T {
    pod_read_unaligned(&bytes[offset..offset + size_of::<T>()])
}

#[inline]
fn write_at<T: Pod>(bytes: &mut [u8], offset: usize, value: &T) {
    bytes[offset..offset + size_of::<T>()].copy_from_slice(bytes_of(value));
}

const ARRAY_COUNT: usize = offset_of!(DynArray, count);
const ARRAY_CAPACITY: usize = offset_of!(DynArray, capacity);
const ARRAY_FLAGS: usize = offset_of!(DynArray, flags);
const ARRAY_DATA: usize = offset_of!(DynArray, data);

/// Growable array over a [`DynArray`] header.
#[derive(Debug)]
pub struct DynamicArrayDescriptor {
    parts: [ElementPart; 1],
    stride: u32,
    align: u32,
}

impl DynamicArrayDescriptor {
    /// Creates a descriptor for items of `item` laid out with `stride`/`align`.
    #[must_use]
    pub const fn new(item: StableId, stride: u32, align: u32) -> Self {
        Self {
            parts: [ElementPart { offset: 0, ty: item }],
            stride,
            align,
        }
    }
}

impl ContainerDescriptor for DynamicArrayDescriptor {
    fn is_dynamic(&self) -> bool {
        true
    }

    fn item_type(&self) -> StableId {
        self.parts[0].ty
    }

    fn elements(&self) -> &[ElementPart] {
        &self.parts
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn item_align(&self) -> u32 {
        self.align
    }

    fn count(&self, instance: &[u8]) -> u32 {
        read_at(instance, ARRAY_COUNT)
    }

    fn set_count(&self, instance: &mut [u8], count: u32) {
        write_at(instance, ARRAY_COUNT, &count);
    }

    fn capacity(&self, instance: &[u8]) -> u32 {
        read_at(instance, ARRAY_CAPACITY)
    }

    fn set_capacity(&self, instance: &mut [u8], capacity: u32) {
        write_at(instance, ARRAY_CAPACITY, &capacity);
    }

    fn data_pointer_offset(&self) -> Option<u32> {
        Some(ARRAY_DATA as u32)
    }

    fn mark_externally_allocated(&self, instance: &mut [u8]) {
        let flags: u32 = read_at(instance, ARRAY_FLAGS);
        write_at(instance, ARRAY_FLAGS, &(flags | CONTAINER_EXTERNAL));
    }

    fn clear_externally_allocated(&self, instance: &mut [u8]) {
        let flags: u32 = read_at(instance, ARRAY_FLAGS);
        write_at(instance, ARRAY_FLAGS, &(flags & !CONTAINER_EXTERNAL));
    }

    fn is_externally_allocated(&self, instance: &[u8]) -> bool {
        read_at::<u32>(instance, ARRAY_FLAGS) & CONTAINER_EXTERNAL != 0
    }
}

/// Fixed-length inline array (`[T; N]`).
#[derive(Debug)]
pub struct StaticArrayDescriptor {
    parts: [ElementPart; 1],
    len: u32,
    stride: u32,
    align: u32,
}

impl StaticArrayDescriptor {
    /// Creates a descriptor for `len` inline items of `item`.
    #[must_use]
    pub const fn new(item: StableId, len: u32, stride: u32, align: u32) -> Self {
        Self {
            parts: [ElementPart { offset: 0, ty: item }],
            len,
            stride,
            align,
        }
    }

    /// Returns the fixed element count.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Checks if the array has no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ContainerDescriptor for StaticArrayDescriptor {
    fn is_dynamic(&self) -> bool {
        false
    }

    fn item_type(&self) -> StableId {
        self.parts[0].ty
    }

    fn elements(&self) -> &[ElementPart] {
        &self.parts
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn item_align(&self) -> u32 {
        self.align
    }

    fn count(&self, _instance: &[u8]) -> u32 {
        self.len
    }

    fn set_count(&self, _instance: &mut [u8], count: u32) {
        debug_assert_eq!(count, self.len, "static array length is fixed");
    }

    fn capacity(&self, _instance: &[u8]) -> u32 {
        self.len
    }

    fn set_capacity(&self, _instance: &mut [u8], capacity: u32) {
        debug_assert_eq!(capacity, self.len, "static array length is fixed");
    }

    fn data_pointer_offset(&self) -> Option<u32> {
        None
    }

    fn mark_externally_allocated(&self, _instance: &mut [u8]) {}

    fn clear_externally_allocated(&self, _instance: &mut [u8]) {}

    fn is_externally_allocated(&self, _instance: &[u8]) -> bool {
        false
    }

    fn data_size(&self, _instance: &[u8]) -> u64 {
        0
    }
}

const DICT_LEN: usize = offset_of!(Dict, len);
const DICT_CAPACITY: usize = offset_of!(Dict, capacity);
const DICT_FLAGS: usize = offset_of!(Dict, flags);
const DICT_ENTRIES: usize = offset_of!(Dict, entries);

/// Key-sorted map over a [`Dict`] header.
///
/// Each entry stores the key at offset zero and the value at
/// `align_up(key_size, value_align)`.
#[derive(Debug)]
pub struct DictionaryDescriptor {
    parts: [ElementPart; 2],
    stride: u32,
    align: u32,
}

impl DictionaryDescriptor {
    /// Creates a descriptor from the key and value layouts.
    #[must_use]
    pub const fn new(
        key: StableId,
        key_size: u32,
        key_align: u32,
        value: StableId,
        value_size: u32,
        value_align: u32,
    ) -> Self {
        let value_offset = (key_size + value_align - 1) & !(value_align - 1);
        let align = if key_align > value_align { key_align } else { value_align };
        let stride = (value_offset + value_size + align - 1) & !(align - 1);
        Self {
            parts: [
                ElementPart { offset: 0, ty: key },
                ElementPart { offset: value_offset, ty: value },
            ],
            stride,
            align,
        }
    }

    /// Returns the key type.
    #[inline]
    #[must_use]
    pub const fn key_type(&self) -> StableId {
        self.parts[0].ty
    }

    /// Returns the value offset inside an entry.
    #[inline]
    #[must_use]
    pub const fn value_offset(&self) -> u32 {
        self.parts[1].offset
    }
}

impl ContainerDescriptor for DictionaryDescriptor {
    fn is_dynamic(&self) -> bool {
        true
    }

    fn item_type(&self) -> StableId {
        self.parts[1].ty
    }

    fn elements(&self) -> &[ElementPart] {
        &self.parts
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn item_align(&self) -> u32 {
        self.align
    }

    fn count(&self, instance: &[u8]) -> u32 {
        read_at(instance, DICT_LEN)
    }

    fn set_count(&self, instance: &mut [u8], count: u32) {
        write_at(instance, DICT_LEN, &count);
    }

    fn capacity(&self, instance: &[u8]) -> u32 {
        read_at(instance, DICT_CAPACITY)
    }

    fn set_capacity(&self, instance: &mut [u8], capacity: u32) {
        write_at(instance, DICT_CAPACITY, &capacity);
    }

    fn data_pointer_offset(&self) -> Option<u32> {
        Some(DICT_ENTRIES as u32)
    }

    fn mark_externally_allocated(&self, instance: &mut [u8]) {
        let flags: u32 = read_at(instance, DICT_FLAGS);
        write_at(instance, DICT_FLAGS, &(flags | CONTAINER_EXTERNAL));
    }

    fn clear_externally_allocated(&self, instance: &mut [u8]) {
        let flags: u32 = read_at(instance, DICT_FLAGS);
        write_at(instance, DICT_FLAGS, &(flags & !CONTAINER_EXTERNAL));
    }

    fn is_externally_allocated(&self, instance: &[u8]) -> bool {
        read_at::<u32>(instance, DICT_FLAGS) & CONTAINER_EXTERNAL != 0
    }
}
