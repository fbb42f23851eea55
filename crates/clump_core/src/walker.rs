//! # Graph Walker
//!
//! Depth-first, descriptor-driven traversal of instances in an arena's
//! address space. The walker never knows concrete types: it reads field
//! lists, container descriptors and pointer fields, and reports what it
//! finds to a [`GraphVisitor`].
//!
//! ## Arena Order
//!
//! [`GraphWalker::walk_arena`] visits blocks in a fixed order that images
//! depend on:
//!
//! 1. The [`ClumpRoot`] record (always block 0)
//! 2. Through the root's list vector, every list header and the blocks it owns
//! 3. Per list in creation order, its slot array followed by the blocks owned
//!    by its live objects
//!
//! Blocks are reported once, keyed by address.

use std::collections::HashSet;
use std::mem::size_of;

use clump_reflect::{Addr, ContainerDescriptor, StableId, TypeDescriptor, TypeKind, TypeRegistry};

use crate::arena::layout::{ClumpRoot, ObjectListHeader, CLUMP_ROOT};
use crate::arena::list;
use crate::error::{ClumpError, ClumpResult};
use crate::memory::Memory;

/// A contiguous range that takes part in a save.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Address in the arena.
    pub addr: Addr,
    /// Length in bytes.
    pub len: u64,
    /// Required alignment.
    pub align: u32,
    /// Contents are run-time state: reserve the space, do not keep the bytes.
    pub transient: bool,
}

/// Receives walker events.
pub trait GraphVisitor {
    /// Called once per distinct block, in traversal order.
    ///
    /// # Errors
    ///
    /// An error aborts the walk.
    fn visit_block(&mut self, block: MemoryBlock) -> ClumpResult<()>;

    /// Called for every non-null pointer, including container data pointers.
    ///
    /// # Errors
    ///
    /// An error aborts the walk.
    fn visit_pointer(&mut self, _slot: Addr, _target: Addr) -> ClumpResult<()> {
        Ok(())
    }

    /// Called for every dynamic container instance.
    ///
    /// # Errors
    ///
    /// An error aborts the walk.
    fn visit_container(&mut self, _instance: Addr, _desc: &TypeDescriptor) -> ClumpResult<()> {
        Ok(())
    }

    /// Called for every run-time-only field that is not a container.
    ///
    /// # Errors
    ///
    /// An error aborts the walk.
    fn visit_runtime_field(&mut self, _addr: Addr, _len: u64) -> ClumpResult<()> {
        Ok(())
    }
}

/// Depth-first walker over one address space.
pub struct GraphWalker<'a> {
    registry: &'a TypeRegistry,
    memory: &'a Memory,
    seen: HashSet<u64>,
}

impl<'a> GraphWalker<'a> {
    /// Creates a walker with no blocks seen yet.
    #[must_use]
    pub fn new(registry: &'a TypeRegistry, memory: &'a Memory) -> Self {
        Self {
            registry,
            memory,
            seen: HashSet::new(),
        }
    }

    /// Walks a whole arena rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown type, an unmapped address, an inconsistent
    /// container or list header, or a visitor error.
    pub fn walk_arena(&mut self, root: Addr, visitor: &mut dyn GraphVisitor) -> ClumpResult<()> {
        let registry = self.registry;
        let memory = self.memory;

        let root_desc = registry.get(CLUMP_ROOT)?;
        self.register(
            MemoryBlock {
                addr: root,
                len: u64::from(root_desc.byte_size()),
                align: root_desc.alignment(),
                transient: false,
            },
            visitor,
        )?;
        self.walk_value(root, CLUMP_ROOT, visitor)?;

        let record: ClumpRoot = memory.read(root)?;
        let header_size = size_of::<ObjectListHeader>() as u64;
        for index in 0..u64::from(record.lists.count) {
            let header: ObjectListHeader = memory.read(record.lists.data.offset(index * header_size))?;
            let desc = registry.get(header.type_id())?;
            if header.stride != desc.stride() {
                return Err(ClumpError::TypeMismatch {
                    expected: format!("{} with stride {}", desc.name(), desc.stride()),
                    found: format!("list {index} with stride {}", header.stride),
                });
            }
            self.register(
                MemoryBlock {
                    addr: header.storage,
                    len: header.storage_size(),
                    align: desc.alignment(),
                    transient: false,
                },
                visitor,
            )?;
            for slot in list::live_slots(memory, &header)? {
                self.walk_value(header.slot_addr(slot), header.type_id(), visitor)?;
            }
        }
        Ok(())
    }

    /// Walks one instance of `ty` at `addr`.
    ///
    /// The instance's own storage is not reported as a block; only blocks it
    /// owns through containers are.
    ///
    /// # Errors
    ///
    /// See [`walk_arena`](Self::walk_arena).
    pub fn walk_value(&mut self, addr: Addr, ty: StableId, visitor: &mut dyn GraphVisitor) -> ClumpResult<()> {
        let registry = self.registry;
        let desc = registry.get(ty)?;
        if let Some(container) = desc.container() {
            return self.walk_container(addr, desc, container, true, visitor);
        }
        match desc.kind() {
            TypeKind::Record => self.walk_record(addr, ty, visitor),
            TypeKind::Pointer => {
                let target: Addr = self.memory.read(addr)?;
                if !target.is_null() {
                    visitor.visit_pointer(addr, target)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn walk_record(&mut self, addr: Addr, ty: StableId, visitor: &mut dyn GraphVisitor) -> ClumpResult<()> {
        let registry = self.registry;
        for field in registry.fields(ty)? {
            let field_addr = addr.offset(u64::from(field.offset));
            let field_desc = registry.get(field.ty)?;
            if field.is_plain_data {
                self.walk_value(field_addr, field.ty, visitor)?;
                continue;
            }
            match field_desc.container().filter(|c| c.is_dynamic()) {
                Some(container) => self.walk_container(field_addr, field_desc, container, false, visitor)?,
                None => visitor.visit_runtime_field(field_addr, u64::from(field_desc.byte_size()))?,
            }
        }
        Ok(())
    }

    fn walk_container(
        &mut self,
        addr: Addr,
        desc: &TypeDescriptor,
        container: &dyn ContainerDescriptor,
        plain: bool,
        visitor: &mut dyn GraphVisitor,
    ) -> ClumpResult<()> {
        let stride = u64::from(container.stride());

        if !container.is_dynamic() {
            for i in 0..u64::from(container.capacity(&[])) {
                self.walk_elements(addr.offset(i * stride), container, visitor)?;
            }
            return Ok(());
        }

        let memory = self.memory;
        let instance = memory.bytes(addr, u64::from(desc.byte_size()))?;
        let count = container.count(instance);
        let capacity = container.capacity(instance);
        let data = container.data_pointer(instance);
        let data_size = container.data_size(instance);
        visitor.visit_container(addr, desc)?;

        if count > capacity || (data.is_null() && count > 0) || (!data.is_null() && capacity == 0) {
            return Err(ClumpError::MalformedImage(format!(
                "{} at {addr}: count {count}, capacity {capacity}, data {data}",
                desc.name()
            )));
        }
        if data.is_null() {
            return Ok(());
        }

        let pointer_slot = addr.offset(u64::from(container.data_pointer_offset().unwrap_or(0)));
        visitor.visit_pointer(pointer_slot, data)?;
        if !self.seen.insert(data.get()) {
            return Ok(());
        }

        if plain {
            for i in 0..u64::from(count) {
                self.walk_elements(data.offset(i * stride), container, visitor)?;
            }
        }
        visitor.visit_block(MemoryBlock {
            addr: data,
            len: data_size,
            align: container.item_align(),
            transient: !plain,
        })
    }

    fn walk_elements(
        &mut self,
        element: Addr,
        container: &dyn ContainerDescriptor,
        visitor: &mut dyn GraphVisitor,
    ) -> ClumpResult<()> {
        for part in container.elements() {
            self.walk_value(element.offset(u64::from(part.offset)), part.ty, visitor)?;
        }
        Ok(())
    }

    fn register(&mut self, block: MemoryBlock, visitor: &mut dyn GraphVisitor) -> ClumpResult<()> {
        if self.seen.insert(block.addr.get()) {
            visitor.visit_block(block)?;
        }
        Ok(())
    }
}

/// Collects every dynamic container instance reachable from a walk.
#[derive(Debug, Default)]
pub(crate) struct ContainerCollector {
    pub(crate) containers: Vec<(Addr, StableId)>,
}

impl GraphVisitor for ContainerCollector {
    fn visit_block(&mut self, _block: MemoryBlock) -> ClumpResult<()> {
        Ok(())
    }

    fn visit_container(&mut self, instance: Addr, desc: &TypeDescriptor) -> ClumpResult<()> {
        self.containers.push((instance, desc.id()));
        Ok(())
    }
}
