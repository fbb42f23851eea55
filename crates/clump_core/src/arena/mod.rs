//! # Object Arena
//!
//! A clump of typed object lists living in one emulated address space.
//!
//! ## Design Philosophy
//!
//! - Objects of one type live in lists; each list is one contiguous slot array
//! - Lists never move, so object addresses are stable for the arena's lifetime
//! - A full type gets a new, larger list instead of a reallocated one
//! - All bookkeeping that survives a save lives in the address space itself
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut arena = Arena::new(registry, Box::new(BumpAllocator::new(1 << 20)), ClumpConfig::default())?;
//!
//! let goblin = arena.new_object(Monster { hp: 10, ..Monster::default() })?;
//! arena.array_push(goblin, "scores", 42_i32)?;
//!
//! assert_eq!(arena.get::<Monster>(goblin)?.hp, 10);
//! ```

pub mod layout;
pub mod list;

use bytemuck::Pod;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem::{align_of, offset_of, size_of};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clump_reflect::{Addr, DynArray, Reflect, StableId, TypeDescriptor, TypeKind, TypeRegistry};

use crate::config::ClumpConfig;
use crate::error::{ClumpError, ClumpResult};
use crate::memory::{Allocator, Memory};
use crate::walker::{ContainerCollector, GraphVisitor, GraphWalker};
use layout::{ClumpRoot, ObjectListHeader, CLUMP_ROOT, LIST_EXTERNAL, LIST_HEADERS, ROOT_LOADED};

const HEADER_SIZE: u64 = size_of::<ObjectListHeader>() as u64;
const ROOT_LISTS: u64 = offset_of!(ClumpRoot, lists) as u64;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique arena identity.
pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle to a live object: list index and slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    list: u32,
    slot: u32,
}

impl Handle {
    /// Creates a handle.
    #[inline]
    #[must_use]
    pub const fn new(list: u32, slot: u32) -> Self {
        Self { list, slot }
    }

    /// Returns the list index.
    #[inline]
    #[must_use]
    pub const fn list(self) -> u32 {
        self.list
    }

    /// Returns the slot inside the list.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.list, self.slot)
    }
}

/// Metadata of one object list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectListInfo {
    /// Position in creation order.
    pub index: u32,
    /// Stored type.
    pub type_id: StableId,
    /// Number of slots.
    pub capacity: u32,
    /// Number of live slots.
    pub live_count: u32,
    /// Distance between slots.
    pub stride: u32,
    /// Start of the slot array.
    pub storage: Addr,
    /// The slot array belongs to a loaded image.
    pub externally_allocated: bool,
}

/// A live object seen during [`Arena::iterate_objects`].
#[derive(Clone, Copy, Debug)]
pub struct ObjectRef<'a> {
    /// Handle of the object.
    pub handle: Handle,
    /// Address of the object.
    pub addr: Addr,
    /// Descriptor of the object's type.
    pub descriptor: &'a TypeDescriptor,
    /// The object's bytes.
    pub bytes: &'a [u8],
}

/// An object arena ("clump").
///
/// Owns every block it allocated. After a load, the whole image is one
/// block: it is released once, at its base, when the arena drops.
pub struct Arena {
    registry: Arc<TypeRegistry>,
    allocator: Box<dyn Allocator>,
    memory: Memory,
    config: ClumpConfig,
    root: Addr,
    bulk: Option<Addr>,
    lists_by_type: HashMap<StableId, Vec<u32>>,
    storage_ranges: BTreeMap<u64, u32>,
}

impl Arena {
    /// Creates an empty arena.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the registry lacks the control
    /// types, or the allocator cannot hold the root record.
    pub fn new(
        registry: Arc<TypeRegistry>,
        allocator: Box<dyn Allocator>,
        config: ClumpConfig,
    ) -> ClumpResult<Self> {
        config.validate()?;
        registry.get(CLUMP_ROOT)?;

        let mut arena = Self::empty(registry, allocator, config);
        let root = arena.alloc_block(size_of::<ClumpRoot>() as u64, align_of::<ClumpRoot>() as u64)?;
        arena.root = root;

        let slots = config.arena.initial_list_slots;
        let headers = arena.alloc_block(u64::from(slots) * HEADER_SIZE, align_of::<ObjectListHeader>() as u64)?;
        let record = ClumpRoot {
            instance_id: next_instance_id(),
            lists: DynArray {
                data: headers,
                capacity: slots,
                ..DynArray::EMPTY
            },
            ..ClumpRoot::default()
        };
        arena.memory.write(root, &record)?;

        tracing::debug!("Created arena {} at {}", record.instance_id, root);
        Ok(arena)
    }

    fn empty(registry: Arc<TypeRegistry>, allocator: Box<dyn Allocator>, config: ClumpConfig) -> Self {
        Self {
            registry,
            allocator,
            memory: Memory::new(),
            config,
            root: Addr::NULL,
            bulk: None,
            lists_by_type: HashMap::new(),
            storage_ranges: BTreeMap::new(),
        }
    }

    /// Adopts a freshly allocated image buffer of `len` bytes at `bulk`. The
    /// root record is at its start. Run-time state is rebuilt by
    /// [`rebuild_runtime_state`](Self::rebuild_runtime_state).
    pub(crate) fn adopt(
        registry: Arc<TypeRegistry>,
        mut allocator: Box<dyn Allocator>,
        config: ClumpConfig,
        bulk: Addr,
        len: u64,
    ) -> ClumpResult<Self> {
        let mut memory = Memory::new();
        if let Err(err) = memory.map_zeroed(bulk, len) {
            let _ = allocator.deallocate(bulk);
            return Err(err);
        }
        let mut arena = Self::empty(registry, allocator, config);
        arena.memory = memory;
        arena.root = bulk;
        arena.bulk = Some(bulk);
        Ok(arena)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the type registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Returns the address space.
    #[inline]
    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    #[inline]
    pub(crate) fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &ClumpConfig {
        &self.config
    }

    /// Returns the address of the root record.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> Addr {
        self.root
    }

    /// Returns the base of the loaded image, if this arena was loaded.
    #[inline]
    #[must_use]
    pub const fn bulk_base(&self) -> Option<Addr> {
        self.bulk
    }

    /// Checks if this arena was restored from an image.
    ///
    /// # Errors
    ///
    /// Fails if the root record is unreadable.
    pub fn is_loaded(&self) -> ClumpResult<bool> {
        Ok(self.root_record()?.flags & ROOT_LOADED != 0)
    }

    /// Returns the process-unique identity of this arena.
    ///
    /// # Errors
    ///
    /// Fails if the root record is unreadable.
    pub fn instance_id(&self) -> ClumpResult<u64> {
        Ok(self.root_record()?.instance_id)
    }

    /// Returns the number of live objects.
    ///
    /// # Errors
    ///
    /// Fails if the root record is unreadable.
    pub fn live_objects(&self) -> ClumpResult<u64> {
        Ok(self.root_record()?.live_objects)
    }

    /// Returns the number of object lists.
    ///
    /// # Errors
    ///
    /// Fails if the root record is unreadable.
    pub fn list_count(&self) -> ClumpResult<u32> {
        Ok(self.root_record()?.lists.count)
    }

    pub(crate) fn root_record(&self) -> ClumpResult<ClumpRoot> {
        self.memory.read(self.root)
    }

    fn write_root(&mut self, record: &ClumpRoot) -> ClumpResult<()> {
        self.memory.write(self.root, record)
    }

    fn header_addr(&self, index: u32) -> ClumpResult<Addr> {
        let lists = self.root_record()?.lists;
        if index >= lists.count {
            return Err(ClumpError::BadAddress {
                addr: lists.data.offset(u64::from(index) * HEADER_SIZE),
                len: HEADER_SIZE,
            });
        }
        Ok(lists.data.offset(u64::from(index) * HEADER_SIZE))
    }

    pub(crate) fn list_header(&self, index: u32) -> ClumpResult<ObjectListHeader> {
        self.memory.read(self.header_addr(index)?)
    }

    pub(crate) fn write_list_header(&mut self, index: u32, header: &ObjectListHeader) -> ClumpResult<()> {
        let addr = self.header_addr(index)?;
        self.memory.write(addr, header)
    }

    /// Returns metadata of every list in creation order (`GetObjectLists`).
    ///
    /// # Errors
    ///
    /// Fails if a list header is unreadable.
    pub fn object_lists(&self) -> ClumpResult<Vec<ObjectListInfo>> {
        (0..self.list_count()?)
            .map(|index| {
                let header = self.list_header(index)?;
                Ok(ObjectListInfo {
                    index,
                    type_id: header.type_id(),
                    capacity: header.capacity,
                    live_count: header.live_count,
                    stride: header.stride,
                    storage: header.storage,
                    externally_allocated: header.flags & LIST_EXTERNAL != 0,
                })
            })
            .collect()
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    fn alloc_block(&mut self, size: u64, align: u64) -> ClumpResult<Addr> {
        let addr = self.allocator.allocate(size, align)?;
        if let Err(err) = self.memory.map_zeroed(addr, size) {
            let _ = self.allocator.deallocate(addr);
            return Err(err);
        }
        Ok(addr)
    }

    fn alloc_blocks<const N: usize>(&mut self, requests: [(u64, u64); N]) -> ClumpResult<[Addr; N]> {
        let mut out = [Addr::NULL; N];
        for (i, (size, align)) in requests.into_iter().enumerate() {
            match self.alloc_block(size, align) {
                Ok(addr) => out[i] = addr,
                Err(err) => {
                    for &addr in &out[..i] {
                        self.release_block(addr)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    fn release_block(&mut self, addr: Addr) -> ClumpResult<()> {
        self.memory
            .unmap(addr)
            .ok_or(ClumpError::BadAddress { addr, len: 0 })?;
        self.allocator.deallocate(addr)
    }

    // =========================================================================
    // Lists
    // =========================================================================

    fn next_list_capacity(&self, ty: StableId) -> ClumpResult<u32> {
        let settings = &self.config.arena;
        let last = self.lists_by_type.get(&ty).and_then(|lists| lists.last());
        Ok(match last {
            Some(&index) => self
                .list_header(index)?
                .capacity
                .saturating_mul(settings.list_growth_factor)
                .min(settings.max_list_capacity),
            None => settings.initial_list_capacity,
        })
    }

    fn create_list(&mut self, ty: StableId, capacity: u32) -> ClumpResult<u32> {
        let desc = self.registry.get(ty)?;
        let (stride, align) = (desc.stride(), desc.alignment());
        let words = list::bitmap_words(capacity);

        let [storage, bits, stack] = self.alloc_blocks([
            (u64::from(capacity) * u64::from(stride), u64::from(align)),
            (u64::from(words) * 8, 8),
            (u64::from(capacity) * 4, 4),
        ])?;

        let mut header = ObjectListHeader {
            type_id: ty.get(),
            capacity,
            stride,
            storage,
            live_bits: DynArray {
                data: bits,
                count: words,
                capacity: words,
                ..DynArray::EMPTY
            },
            free_slots: DynArray {
                data: stack,
                capacity,
                ..DynArray::EMPTY
            },
            ..ObjectListHeader::default()
        };
        let pushed = list::rebuild_free_stack(&mut self.memory, &mut header)
            .and_then(|()| self.push_list_header(&header));
        let index = match pushed {
            Ok(index) => index,
            Err(err) => {
                for addr in [storage, bits, stack] {
                    self.release_block(addr)?;
                }
                return Err(err);
            }
        };
        self.lists_by_type.entry(ty).or_default().push(index);
        self.storage_ranges.insert(storage.get(), index);

        tracing::debug!("Created object list {} for type {} ({} slots)", index, ty, capacity);
        Ok(index)
    }

    fn push_list_header(&mut self, header: &ObjectListHeader) -> ClumpResult<u32> {
        let registry = Arc::clone(&self.registry);
        let count = self.root_record()?.lists.count;
        self.reserve(self.root.offset(ROOT_LISTS), registry.get(LIST_HEADERS)?, count + 1)?;

        let mut record = self.root_record()?;
        self.memory
            .write(record.lists.data.offset(u64::from(count) * HEADER_SIZE), header)?;
        record.lists.count = count + 1;
        self.write_root(&record)?;
        Ok(count)
    }

    /// Rebuilds free stacks, live counts and the lookup indices from the
    /// persisted list headers and bitmaps.
    pub(crate) fn rebuild_runtime_state(&mut self) -> ClumpResult<()> {
        self.lists_by_type.clear();
        self.storage_ranges.clear();

        let mut live_objects = 0;
        for index in 0..self.list_count()? {
            let mut header = self.list_header(index)?;
            let desc = self.registry.get(header.type_id())?;
            let words = list::bitmap_words(header.capacity);
            let consistent = header.stride == desc.stride()
                && header.live_bits.capacity >= words
                && header.free_slots.capacity >= header.capacity
                && self.memory.contains(header.storage, header.storage_size());
            if !consistent {
                return Err(ClumpError::MalformedImage(format!(
                    "object list {index} of {} is inconsistent",
                    desc.name()
                )));
            }

            list::rebuild_free_stack(&mut self.memory, &mut header)?;
            live_objects += u64::from(header.live_count);
            self.write_list_header(index, &header)?;

            self.lists_by_type.entry(header.type_id()).or_default().push(index);
            self.storage_ranges.insert(header.storage.get(), index);
        }

        let mut record = self.root_record()?;
        record.live_objects = live_objects;
        self.write_root(&record)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    fn acquire_slot(&mut self, ty: StableId) -> ClumpResult<(Handle, Addr)> {
        let candidates = self.lists_by_type.get(&ty).cloned().unwrap_or_default();
        for index in candidates {
            if let Some(found) = self.take_slot(index)? {
                return Ok(found);
            }
        }
        let capacity = self.next_list_capacity(ty)?;
        let index = self.create_list(ty, capacity)?;
        self.take_slot(index)?.ok_or(ClumpError::OutOfMemory {
            requested: u64::from(capacity),
            available: 0,
        })
    }

    fn take_slot(&mut self, index: u32) -> ClumpResult<Option<(Handle, Addr)>> {
        let mut header = self.list_header(index)?;
        let Some(slot) = list::pop_free(&self.memory, &mut header)? else {
            return Ok(None);
        };
        list::set_live(&mut self.memory, &header, slot, true)?;
        header.live_count += 1;
        self.write_list_header(index, &header)?;

        let mut record = self.root_record()?;
        record.live_objects += 1;
        self.write_root(&record)?;
        Ok(Some((Handle::new(index, slot), header.slot_addr(slot))))
    }

    fn live_header(&self, handle: Handle) -> ClumpResult<ObjectListHeader> {
        let dead = ClumpError::DeadObject {
            list: handle.list,
            slot: handle.slot,
        };
        if handle.list >= self.list_count()? {
            return Err(dead);
        }
        let header = self.list_header(handle.list)?;
        if handle.slot >= header.capacity || !list::is_live(&self.memory, &header, handle.slot)? {
            return Err(dead);
        }
        Ok(header)
    }

    fn typed_header<T: Reflect>(&self, handle: Handle) -> ClumpResult<ObjectListHeader> {
        let header = self.live_header(handle)?;
        if header.type_id() != T::TYPE_ID {
            return Err(ClumpError::WrongObjectType {
                expected: T::TYPE_ID,
                found: header.type_id(),
            });
        }
        Ok(header)
    }

    fn check_layout<T>(&self, ty: StableId) -> ClumpResult<()> {
        let desc = self.registry.get(ty)?;
        if desc.byte_size() as usize != size_of::<T>() {
            return Err(ClumpError::TypeMismatch {
                expected: format!("{} ({} bytes)", desc.name(), desc.byte_size()),
                found: format!("{} ({} bytes)", std::any::type_name::<T>(), size_of::<T>()),
            });
        }
        Ok(())
    }

    /// Allocates a live object holding `value` (`New<T>`).
    ///
    /// Reuses a freed slot of the type if there is one, otherwise creates a
    /// new, larger list. Container fields of `value` are ignored: a new
    /// object's containers start empty.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not registered with a matching layout, or with
    /// [`ClumpError::OutOfMemory`] if a new list cannot be allocated.
    pub fn new_object<T: Reflect>(&mut self, value: T) -> ClumpResult<Handle> {
        self.check_layout::<T>(T::TYPE_ID)?;
        let (handle, addr) = self.acquire_slot(T::TYPE_ID)?;
        self.memory.write(addr, &value)?;
        self.reset_containers(addr, T::TYPE_ID)?;
        Ok(handle)
    }

    /// Frees a live object. Dynamic containers it owns are released.
    ///
    /// # Errors
    ///
    /// [`ClumpError::DeadObject`] if the handle is not live.
    pub fn free_object(&mut self, handle: Handle) -> ClumpResult<()> {
        let mut header = self.live_header(handle)?;
        let addr = header.slot_addr(handle.slot);
        self.release_containers(addr, header.type_id())?;
        self.memory.zero(addr, u64::from(header.stride))?;

        list::set_live(&mut self.memory, &header, handle.slot, false)?;
        list::push_free(&mut self.memory, &mut header, handle.slot)?;
        header.live_count -= 1;
        self.write_list_header(handle.list, &header)?;

        let mut record = self.root_record()?;
        record.live_objects = record.live_objects.saturating_sub(1);
        self.write_root(&record)
    }

    /// Checks if `handle` refers to a live object.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.live_header(handle).is_ok()
    }

    /// Returns the type of a live object.
    ///
    /// # Errors
    ///
    /// [`ClumpError::DeadObject`] if the handle is not live.
    pub fn type_of(&self, handle: Handle) -> ClumpResult<StableId> {
        Ok(self.live_header(handle)?.type_id())
    }

    /// Returns the address of a live object.
    ///
    /// # Errors
    ///
    /// [`ClumpError::DeadObject`] if the handle is not live.
    pub fn address_of(&self, handle: Handle) -> ClumpResult<Addr> {
        Ok(self.live_header(handle)?.slot_addr(handle.slot))
    }

    /// Resolves an object address back to its handle.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if `addr` is not the start of a slot, or
    /// [`ClumpError::DeadObject`] if the slot is not live.
    pub fn handle_at(&self, addr: Addr) -> ClumpResult<Handle> {
        let bad = ClumpError::BadAddress { addr, len: 0 };
        let (_, &index) = self.storage_ranges.range(..=addr.get()).next_back().ok_or(bad)?;
        let header = self.list_header(index)?;
        let offset = addr.get() - header.storage.get();
        if !header.contains(addr) || header.stride == 0 || offset % u64::from(header.stride) != 0 {
            return Err(ClumpError::BadAddress { addr, len: 0 });
        }
        let handle = Handle::new(index, (offset / u64::from(header.stride)) as u32);
        self.live_header(handle)?;
        Ok(handle)
    }

    /// Reads a live object.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not live or holds another type.
    pub fn get<T: Reflect>(&self, handle: Handle) -> ClumpResult<T> {
        let header = self.typed_header::<T>(handle)?;
        self.memory.read(header.slot_addr(handle.slot))
    }

    /// Overwrites a live object. Its container fields are left untouched.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not live or holds another type.
    pub fn set<T: Reflect>(&mut self, handle: Handle, value: T) -> ClumpResult<()> {
        let header = self.typed_header::<T>(handle)?;
        let addr = header.slot_addr(handle.slot);

        let mut kept = Vec::new();
        for (offset, size) in self.container_ranges(T::TYPE_ID)? {
            let at = addr.offset(u64::from(offset));
            kept.push((at, self.memory.bytes(at, size)?.to_vec()));
        }
        self.memory.write(addr, &value)?;
        for (at, bytes) in kept {
            self.memory.write_bytes(at, &bytes)?;
        }
        Ok(())
    }

    /// Returns the raw bytes of a live object.
    ///
    /// # Errors
    ///
    /// [`ClumpError::DeadObject`] if the handle is not live.
    pub fn object_bytes(&self, handle: Handle) -> ClumpResult<&[u8]> {
        let header = self.live_header(handle)?;
        let size = self.registry.get(header.type_id())?.byte_size();
        self.memory.bytes(header.slot_addr(handle.slot), u64::from(size))
    }

    /// Returns the handles of every live `T`, in list then slot order.
    ///
    /// # Errors
    ///
    /// Fails if a list is unreadable.
    pub fn objects<T: Reflect>(&self) -> ClumpResult<Vec<Handle>> {
        let mut handles = Vec::new();
        for &index in self.lists_by_type.get(&T::TYPE_ID).into_iter().flatten() {
            let header = self.list_header(index)?;
            handles.extend(
                list::live_slots(&self.memory, &header)?
                    .into_iter()
                    .map(|slot| Handle::new(index, slot)),
            );
        }
        Ok(handles)
    }

    /// Visits every live object, list by list in creation order, slot by slot
    /// within a list.
    ///
    /// # Errors
    ///
    /// Fails if a list or object is unreadable.
    pub fn iterate_objects(&self, mut visitor: impl FnMut(ObjectRef<'_>)) -> ClumpResult<()> {
        for index in 0..self.list_count()? {
            let header = self.list_header(index)?;
            let descriptor = self.registry.get(header.type_id())?;
            for slot in list::live_slots(&self.memory, &header)? {
                let addr = header.slot_addr(slot);
                visitor(ObjectRef {
                    handle: Handle::new(index, slot),
                    addr,
                    descriptor,
                    bytes: self.memory.bytes(addr, u64::from(descriptor.byte_size()))?,
                });
            }
        }
        Ok(())
    }

    /// Walks the whole arena in image order.
    ///
    /// # Errors
    ///
    /// Fails on an inconsistent arena or a visitor error.
    pub fn walk(&self, visitor: &mut dyn GraphVisitor) -> ClumpResult<()> {
        GraphWalker::new(&self.registry, &self.memory).walk_arena(self.root, visitor)
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Offsets and sizes of the dynamic containers embedded in an instance of `ty`.
    fn container_ranges(&self, ty: StableId) -> ClumpResult<Vec<(u32, u64)>> {
        fn collect(registry: &TypeRegistry, ty: StableId, base: u32, out: &mut Vec<(u32, u64)>) -> ClumpResult<()> {
            let desc = registry.get(ty)?;
            if let Some(container) = desc.container() {
                if container.is_dynamic() {
                    out.push((base, u64::from(desc.byte_size())));
                    return Ok(());
                }
                for i in 0..container.capacity(&[]) {
                    for part in container.elements() {
                        collect(registry, part.ty, base + i * container.stride() + part.offset, out)?;
                    }
                }
            } else if desc.kind() == TypeKind::Record {
                for field in registry.fields(ty)? {
                    collect(registry, field.ty, base + field.offset, out)?;
                }
            }
            Ok(())
        }

        let mut out = Vec::new();
        collect(&self.registry, ty, 0, &mut out)?;
        Ok(out)
    }

    fn reset_containers(&mut self, addr: Addr, ty: StableId) -> ClumpResult<()> {
        for (offset, size) in self.container_ranges(ty)? {
            self.memory.zero(addr.offset(u64::from(offset)), size)?;
        }
        Ok(())
    }

    fn release_containers(&mut self, addr: Addr, ty: StableId) -> ClumpResult<()> {
        let mut collector = ContainerCollector::default();
        GraphWalker::new(&self.registry, &self.memory).walk_value(addr, ty, &mut collector)?;

        let registry = Arc::clone(&self.registry);
        let mut owned = Vec::new();
        for (instance, id) in collector.containers {
            let desc = registry.get(id)?;
            let Some(container) = desc.container() else { continue };
            let bytes = self.memory.bytes(instance, u64::from(desc.byte_size()))?;
            let data = container.data_pointer(bytes);
            if !data.is_null() && !container.is_externally_allocated(bytes) {
                owned.push(data);
            }
        }
        for data in owned {
            self.release_block(data)?;
        }
        Ok(())
    }

    /// Grows a dynamic container so that it holds at least `needed` elements.
    ///
    /// The old block is released unless it is externally allocated.
    fn reserve(&mut self, instance: Addr, desc: &TypeDescriptor, needed: u32) -> ClumpResult<()> {
        let container = desc.container().ok_or_else(|| ClumpError::TypeMismatch {
            expected: "container".into(),
            found: desc.name().to_string(),
        })?;
        let mut bytes = self.memory.bytes(instance, u64::from(desc.byte_size()))?.to_vec();
        let capacity = container.capacity(&bytes);
        if needed <= capacity {
            return Ok(());
        }

        let stride = u64::from(container.stride());
        let new_capacity = needed
            .max(capacity.saturating_mul(2))
            .max(self.config.arena.initial_container_capacity);
        let new_data = self.alloc_block(u64::from(new_capacity) * stride, u64::from(container.item_align()))?;

        let old = container.data_pointer(&bytes);
        if !old.is_null() {
            let count = u64::from(container.count(&bytes));
            if count > 0 {
                self.memory.copy(old, new_data, count * stride)?;
            }
            if !container.is_externally_allocated(&bytes) {
                self.release_block(old)?;
            }
        }

        container.set_data_pointer(&mut bytes, new_data);
        container.set_capacity(&mut bytes, new_capacity);
        container.clear_externally_allocated(&mut bytes);
        self.memory.write_bytes(instance, &bytes)
    }

    fn container_field(&self, handle: Handle, field: &str, kind: TypeKind) -> ClumpResult<(Addr, StableId)> {
        let header = self.live_header(handle)?;
        let owner = self.registry.get(header.type_id())?;
        let found = self
            .registry
            .field(header.type_id(), field)?
            .ok_or_else(|| ClumpError::TypeMismatch {
                expected: format!("field `{field}`"),
                found: format!("no such field on {}", owner.name()),
            })?;
        let desc = self.registry.get(found.ty)?;
        if desc.kind() != kind || !desc.container().is_some_and(|c| c.is_dynamic()) {
            return Err(ClumpError::TypeMismatch {
                expected: format!("dynamic {kind:?}"),
                found: format!("{} for field `{field}`", desc.name()),
            });
        }
        let addr = header.slot_addr(handle.slot).offset(u64::from(found.offset));
        Ok((addr, found.ty))
    }

    fn container_state(&self, instance: Addr, ty: StableId) -> ClumpResult<(u32, Addr, u64)> {
        let desc = self.registry.get(ty)?;
        let bytes = self.memory.bytes(instance, u64::from(desc.byte_size()))?;
        let container = desc.container().ok_or_else(|| ClumpError::TypeMismatch {
            expected: "container".into(),
            found: desc.name().to_string(),
        })?;
        Ok((
            container.count(bytes),
            container.data_pointer(bytes),
            u64::from(container.stride()),
        ))
    }

    fn set_container_count(&mut self, instance: Addr, ty: StableId, count: u32) -> ClumpResult<()> {
        let registry = Arc::clone(&self.registry);
        let desc = registry.get(ty)?;
        let mut bytes = self.memory.bytes(instance, u64::from(desc.byte_size()))?.to_vec();
        if let Some(container) = desc.container() {
            container.set_count(&mut bytes, count);
        }
        self.memory.write_bytes(instance, &bytes)
    }

    /// Appends `value` to the dynamic array field `field` of a live object.
    /// Returns the new element's index.
    ///
    /// # Errors
    ///
    /// Fails if the field is not a dynamic array of a type laid out like `V`,
    /// or if the array cannot grow.
    pub fn array_push<V: Pod>(&mut self, handle: Handle, field: &str, value: V) -> ClumpResult<u32> {
        let (instance, ty) = self.container_field(handle, field, TypeKind::Array)?;
        let registry = Arc::clone(&self.registry);
        let desc = registry.get(ty)?;
        let item = registry.item_type(ty)?.unwrap_or(ty);
        self.check_layout::<V>(item)?;

        let (count, _, _) = self.container_state(instance, ty)?;
        self.reserve(instance, desc, count + 1)?;
        let (_, data, stride) = self.container_state(instance, ty)?;

        let element = data.offset(u64::from(count) * stride);
        self.memory.write(element, &value)?;
        self.reset_containers(element, item)?;
        self.set_container_count(instance, ty, count + 1)?;
        Ok(count)
    }

    /// Returns the elements of the dynamic array field `field`.
    ///
    /// # Errors
    ///
    /// Fails if the field is not a dynamic array of a type laid out like `V`.
    pub fn array_items<V: Pod>(&self, handle: Handle, field: &str) -> ClumpResult<Vec<V>> {
        let (instance, ty) = self.container_field(handle, field, TypeKind::Array)?;
        self.check_layout::<V>(self.registry.item_type(ty)?.unwrap_or(ty))?;
        let (count, data, stride) = self.container_state(instance, ty)?;
        (0..u64::from(count))
            .map(|i| self.memory.read(data.offset(i * stride)))
            .collect()
    }

    /// Returns the length of the dynamic array field `field`.
    ///
    /// # Errors
    ///
    /// Fails if the field is not a dynamic array.
    pub fn array_len(&self, handle: Handle, field: &str) -> ClumpResult<u32> {
        let (instance, ty) = self.container_field(handle, field, TypeKind::Array)?;
        Ok(self.container_state(instance, ty)?.0)
    }

    fn dict_layout<K, V>(&self, ty: StableId) -> ClumpResult<u32> {
        let desc = self.registry.get(ty)?;
        let parts = desc.container().map(|c| c.elements()).unwrap_or_default();
        let [key, value] = parts else {
            return Err(ClumpError::TypeMismatch {
                expected: "dictionary entry".into(),
                found: desc.name().to_string(),
            });
        };
        self.check_layout::<K>(key.ty)?;
        self.check_layout::<V>(value.ty)?;
        Ok(value.offset)
    }

    fn dict_search<K: Pod + Ord>(&self, data: Addr, stride: u64, len: u32, key: &K) -> ClumpResult<Result<u32, u32>> {
        let (mut lo, mut hi) = (0, len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe: K = self.memory.read(data.offset(u64::from(mid) * stride))?;
            match probe.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Inserts or replaces an entry of the dictionary field `field`.
    /// Returns the replaced value, if any.
    ///
    /// # Errors
    ///
    /// Fails if the field is not a dictionary laid out like `K -> V`, or if
    /// the dictionary cannot grow.
    pub fn dict_insert<K: Pod + Ord, V: Pod>(
        &mut self,
        handle: Handle,
        field: &str,
        key: K,
        value: V,
    ) -> ClumpResult<Option<V>> {
        let (instance, ty) = self.container_field(handle, field, TypeKind::Dictionary)?;
        let value_offset = u64::from(self.dict_layout::<K, V>(ty)?);
        let value_ty = self.registry.item_type(ty)?.unwrap_or(ty);
        let (len, data, stride) = self.container_state(instance, ty)?;

        let pos = match self.dict_search(data, stride, len, &key)? {
            Ok(found) => {
                let at = data.offset(u64::from(found) * stride + value_offset);
                let old: V = self.memory.read(at)?;
                self.memory.write(at, &value)?;
                return Ok(Some(old));
            }
            Err(pos) => pos,
        };

        let registry = Arc::clone(&self.registry);
        self.reserve(instance, registry.get(ty)?, len + 1)?;
        let (_, data, stride) = self.container_state(instance, ty)?;

        let entry = data.offset(u64::from(pos) * stride);
        if pos < len {
            self.memory
                .copy(entry, entry.offset(stride), u64::from(len - pos) * stride)?;
        }
        self.memory.zero(entry, stride)?;
        self.memory.write(entry, &key)?;
        self.memory.write(entry.offset(value_offset), &value)?;
        self.reset_containers(entry.offset(value_offset), value_ty)?;
        self.set_container_count(instance, ty, len + 1)?;
        Ok(None)
    }

    /// Looks up `key` in the dictionary field `field`.
    ///
    /// # Errors
    ///
    /// Fails if the field is not a dictionary laid out like `K -> V`.
    pub fn dict_get<K: Pod + Ord, V: Pod>(&self, handle: Handle, field: &str, key: &K) -> ClumpResult<Option<V>> {
        let (instance, ty) = self.container_field(handle, field, TypeKind::Dictionary)?;
        let value_offset = u64::from(self.dict_layout::<K, V>(ty)?);
        let (len, data, stride) = self.container_state(instance, ty)?;
        match self.dict_search(data, stride, len, key)? {
            Ok(found) => Ok(Some(
                self.memory
                    .read(data.offset(u64::from(found) * stride + value_offset))?,
            )),
            Err(_) => Ok(None),
        }
    }

    /// Returns every entry of the dictionary field `field`, sorted by key.
    ///
    /// # Errors
    ///
    /// Fails if the field is not a dictionary laid out like `K -> V`.
    pub fn dict_entries<K: Pod + Ord, V: Pod>(&self, handle: Handle, field: &str) -> ClumpResult<Vec<(K, V)>> {
        let (instance, ty) = self.container_field(handle, field, TypeKind::Dictionary)?;
        let value_offset = u64::from(self.dict_layout::<K, V>(ty)?);
        let (len, data, stride) = self.container_state(instance, ty)?;
        (0..u64::from(len))
            .map(|i| {
                let entry = data.offset(i * stride);
                Ok((self.memory.read(entry)?, self.memory.read(entry.offset(value_offset))?))
            })
            .collect()
    }

    /// Returns the number of entries of the dictionary field `field`.
    ///
    /// # Errors
    ///
    /// Fails if the field is not a dictionary.
    pub fn dict_len(&self, handle: Handle, field: &str) -> ClumpResult<u32> {
        let (instance, ty) = self.container_field(handle, field, TypeKind::Dictionary)?;
        Ok(self.container_state(instance, ty)?.0)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Every mapped segment is exactly one allocation; a loaded image is one segment.
        for base in self.memory.segment_bases() {
            self.memory.unmap(base);
            if let Err(err) = self.allocator.deallocate(base) {
                tracing::warn!("Failed to release block {}: {}", base, err);
            }
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("root", &self.root)
            .field("bulk", &self.bulk)
            .field("segments", &self.memory.segment_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::memory::{BumpAllocator, SharedAllocator};
    use bytemuck::Zeroable;
    use clump_reflect::{builtin, Dict};

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Crate {
        weight: u32,
        tag: u32,
        contents: DynArray,
        prices: Dict,
    }

    impl Reflect for Crate {
        const TYPE_ID: StableId = CRATE;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Marker {
        value: u64,
    }

    impl Reflect for Marker {
        const TYPE_ID: StableId = MARKER;
    }

    const CRATE: StableId = StableId(2200);
    const CONTENTS: StableId = StableId(2201);
    const PRICES: StableId = StableId(2202);
    const MARKER: StableId = StableId(2203);

    fn registry() -> Arc<TypeRegistry> {
        let mut b = crate::registry_builder().unwrap();
        b.dynamic_array("Contents", CONTENTS, builtin::U64).unwrap();
        b.dictionary("Prices", PRICES, builtin::U32, builtin::U32).unwrap();
        b.record::<Crate>("Crate", CRATE)
            .field("weight", offset_of!(Crate, weight), builtin::U32)
            .field("tag", offset_of!(Crate, tag), builtin::U32)
            .field("contents", offset_of!(Crate, contents), CONTENTS)
            .field("prices", offset_of!(Crate, prices), PRICES)
            .finish()
            .unwrap();
        b.record::<Marker>("Marker", MARKER)
            .field("value", offset_of!(Marker, value), builtin::U64)
            .finish()
            .unwrap();
        Arc::new(b.build().unwrap())
    }

    fn arena_with(arena: ArenaConfig) -> (Arena, SharedAllocator<BumpAllocator>) {
        let alloc = SharedAllocator::new(BumpAllocator::new(1 << 20));
        let config = ClumpConfig {
            arena,
            ..ClumpConfig::default()
        };
        let arena = Arena::new(registry(), Box::new(alloc.clone()), config).unwrap();
        (arena, alloc)
    }

    fn arena() -> (Arena, SharedAllocator<BumpAllocator>) {
        arena_with(ArenaConfig::default())
    }

    #[test]
    fn test_new_get_free() {
        let (mut arena, _) = arena();
        let h = arena.new_object(Crate { weight: 5, tag: 1, ..Crate::default() }).unwrap();

        assert_eq!(arena.get::<Crate>(h).unwrap().weight, 5);
        assert_eq!(arena.type_of(h).unwrap(), CRATE);
        assert_eq!(arena.live_objects().unwrap(), 1);

        arena.free_object(h).unwrap();
        assert!(!arena.contains(h));
        assert_eq!(arena.live_objects().unwrap(), 0);
        assert!(matches!(arena.get::<Crate>(h), Err(ClumpError::DeadObject { .. })));
        assert!(matches!(arena.free_object(h), Err(ClumpError::DeadObject { .. })));
    }

    #[test]
    fn test_set_keeps_containers() {
        let (mut arena, _) = arena();
        let h = arena.new_object(Crate::default()).unwrap();
        arena.array_push(h, "contents", 7_u64).unwrap();

        arena.set(h, Crate { weight: 9, ..Crate::default() }).unwrap();

        assert_eq!(arena.get::<Crate>(h).unwrap().weight, 9);
        assert_eq!(arena.array_items::<u64>(h, "contents").unwrap(), vec![7]);
    }

    #[test]
    fn test_new_object_ignores_caller_containers() {
        let (mut arena, _) = arena();
        let bogus = DynArray {
            data: Addr::new(0xDEAD_0000),
            count: 3,
            capacity: 3,
            ..DynArray::EMPTY
        };
        let h = arena.new_object(Crate { contents: bogus, ..Crate::default() }).unwrap();
        assert_eq!(arena.array_len(h, "contents").unwrap(), 0);
    }

    #[test]
    fn test_wrong_object_type() {
        let (mut arena, _) = arena();
        let h = arena.new_object(Crate::default()).unwrap();
        assert!(matches!(
            arena.get::<Marker>(h),
            Err(ClumpError::WrongObjectType { expected: MARKER, found: CRATE })
        ));
    }

    #[test]
    fn test_lists_grow_without_moving_objects() {
        let (mut arena, _) = arena_with(ArenaConfig {
            initial_list_capacity: 2,
            ..ArenaConfig::default()
        });
        let first = arena.new_object(Crate::default()).unwrap();
        let addr = arena.address_of(first).unwrap();

        let handles: Vec<Handle> = (0..13)
            .map(|i| arena.new_object(Crate { weight: i, ..Crate::default() }).unwrap())
            .collect();

        let capacities: Vec<u32> = arena.object_lists().unwrap().iter().map(|l| l.capacity).collect();
        assert_eq!(capacities, vec![2, 4, 8]);
        assert_eq!(arena.address_of(first).unwrap(), addr);
        for (i, &h) in handles.iter().enumerate() {
            assert_eq!(arena.get::<Crate>(h).unwrap().weight, i as u32);
            assert_eq!(arena.handle_at(arena.address_of(h).unwrap()).unwrap(), h);
        }
    }

    #[test]
    fn test_list_growth_respects_max_capacity() {
        let (mut arena, _) = arena_with(ArenaConfig {
            initial_list_capacity: 2,
            max_list_capacity: 3,
            ..ArenaConfig::default()
        });
        for _ in 0..8 {
            arena.new_object(Marker::default()).unwrap();
        }
        let capacities: Vec<u32> = arena.object_lists().unwrap().iter().map(|l| l.capacity).collect();
        assert_eq!(capacities, vec![2, 3, 3]);
    }

    #[test]
    fn test_header_vector_grows() {
        let (mut arena, alloc) = arena_with(ArenaConfig {
            initial_list_capacity: 1,
            initial_list_slots: 1,
            ..ArenaConfig::default()
        });
        for i in 0..6 {
            arena.new_object(Marker { value: i }).unwrap();
        }
        arena.new_object(Crate::default()).unwrap();

        assert_eq!(arena.list_count().unwrap(), 4);
        assert!(alloc.with(|a| a.deallocation_count()) > 0, "old header blocks are released");
        let markers: Vec<u64> = arena
            .objects::<Marker>()
            .unwrap()
            .into_iter()
            .map(|h| arena.get::<Marker>(h).unwrap().value)
            .collect();
        assert_eq!(markers, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_handle_at_rejects_interior_address() {
        let (mut arena, _) = arena();
        let h = arena.new_object(Crate::default()).unwrap();
        let addr = arena.address_of(h).unwrap();
        assert!(matches!(arena.handle_at(addr.offset(4)), Err(ClumpError::BadAddress { .. })));
        assert!(matches!(arena.handle_at(Addr::NULL), Err(ClumpError::BadAddress { .. })));
    }

    #[test]
    fn test_array_growth_releases_old_block() {
        let (mut arena, alloc) = arena();
        let h = arena.new_object(Crate::default()).unwrap();
        for i in 0..5_u64 {
            assert_eq!(arena.array_push(h, "contents", i * 10).unwrap(), i as u32);
        }
        assert_eq!(arena.array_items::<u64>(h, "contents").unwrap(), vec![0, 10, 20, 30, 40]);
        assert_eq!(alloc.with(|a| a.deallocation_count()), 1);
    }

    #[test]
    fn test_free_releases_container_blocks() {
        let (mut arena, alloc) = arena();
        let h = arena.new_object(Crate::default()).unwrap();
        arena.array_push(h, "contents", 1_u64).unwrap();
        arena.dict_insert(h, "prices", 3_u32, 30_u32).unwrap();
        let live = alloc.with(|a| a.live_count());

        arena.free_object(h).unwrap();
        assert_eq!(alloc.with(|a| a.live_count()), live - 2);
    }

    #[test]
    fn test_dict_insert_keeps_keys_sorted() {
        let (mut arena, _) = arena();
        let h = arena.new_object(Crate::default()).unwrap();
        for key in [5_u32, 1, 9, 3, 7] {
            assert_eq!(arena.dict_insert(h, "prices", key, key * 100).unwrap(), None::<u32>);
        }
        assert_eq!(arena.dict_insert(h, "prices", 3_u32, 301_u32).unwrap(), Some(300));

        let keys: Vec<u32> = arena
            .dict_entries::<u32, u32>(h, "prices")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
        assert_eq!(arena.dict_get::<u32, u32>(h, "prices", &3).unwrap(), Some(301));
        assert_eq!(arena.dict_len(h, "prices").unwrap(), 5);
    }

    #[test]
    fn test_container_layout_mismatch() {
        let (mut arena, _) = arena();
        let h = arena.new_object(Crate::default()).unwrap();
        assert!(matches!(arena.array_push(h, "contents", 1_u8), Err(ClumpError::TypeMismatch { .. })));
        assert!(matches!(arena.array_push(h, "prices", 1_u64), Err(ClumpError::TypeMismatch { .. })));
        assert!(matches!(arena.array_len(h, "missing"), Err(ClumpError::TypeMismatch { .. })));
    }

    #[test]
    fn test_out_of_memory_rolls_back() {
        // Root and header vector fit, a full list does not.
        let alloc = SharedAllocator::new(BumpAllocator::new(1268));
        let mut arena = Arena::new(registry(), Box::new(alloc.clone()), ClumpConfig::default()).unwrap();
        let live = alloc.with(|a| a.live_count());

        let err = arena.new_object(Crate::default()).unwrap_err();
        assert!(matches!(err, ClumpError::OutOfMemory { .. }));
        assert_eq!(alloc.with(|a| a.live_count()), live);
        assert_eq!(arena.list_count().unwrap(), 0);
    }

    #[test]
    fn test_header_growth_failure_releases_list_blocks() {
        let settings = ArenaConfig {
            initial_list_slots: 1,
            ..ArenaConfig::default()
        };
        let (mut sizing, sizing_alloc) = arena_with(settings);
        sizing.new_object(Crate::default()).unwrap();
        let used = sizing_alloc.with(|a| a.used());

        // Room for a Marker list's three blocks, not for a bigger header vector.
        let alloc = SharedAllocator::new(BumpAllocator::new(used + 216));
        let config = ClumpConfig {
            arena: settings,
            ..ClumpConfig::default()
        };
        let mut arena = Arena::new(registry(), Box::new(alloc.clone()), config).unwrap();
        arena.new_object(Crate::default()).unwrap();
        let live = alloc.with(|a| a.live_count());

        let err = arena.new_object(Marker { value: 1 }).unwrap_err();
        assert!(matches!(err, ClumpError::OutOfMemory { .. }), "{err}");
        assert_eq!(alloc.with(|a| a.live_count()), live);
        assert_eq!(arena.list_count().unwrap(), 1);
        assert!(arena.objects::<Marker>().unwrap().is_empty());
    }
}
