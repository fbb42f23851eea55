//! # Type Registry
//!
//! Types are registered on a [`RegistryBuilder`] during startup, then frozen
//! into an immutable [`TypeRegistry`] by [`RegistryBuilder::build`]. The frozen
//! registry is `Send + Sync` and is shared by reference (usually through an
//! `Arc`) with every arena, save and load. Nothing is ever auto-registered:
//! a lookup miss is a defect in the registering code.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut builder = RegistryBuilder::new();
//! let scores = builder.dynamic_array("Scores", StableId(1100), builtin::I32)?;
//! let target = builder.pointer("MonsterRef", StableId(1101), MONSTER)?;
//! builder
//!     .record::<Monster>("Monster", MONSTER)
//!     .field("hp", offset_of!(Monster, hp), builtin::I32)
//!     .field("scores", offset_of!(Monster, scores), scores)
//!     .field("target", offset_of!(Monster, target), target)
//!     .finish()?;
//! let registry = Arc::new(builder.build()?);
//! ```

use bytemuck::Pod;
use std::collections::HashMap;
use std::mem::{align_of, size_of};

use crate::builtin;
use crate::container::{DictionaryDescriptor, DynamicArrayDescriptor, StaticArrayDescriptor};
use crate::descriptor::{Field, StableId, TypeDescriptor, TypeKind};
use crate::error::{ReflectError, ReflectResult};
use crate::layout::{Addr, DynArray, FourCc};

/// Rust types with a registered descriptor.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Copy, Default, Pod, Zeroable)]
/// #[repr(C)]
/// struct Monster {
///     hp: i32,
///     level: u32,
/// }
///
/// impl Reflect for Monster {
///     const TYPE_ID: StableId = StableId(1024);
/// }
/// ```
pub trait Reflect: Pod {
    /// Stable id the type is registered under.
    const TYPE_ID: StableId;
}

/// Collects type registrations before the registry is frozen.
pub struct RegistryBuilder {
    types: Vec<TypeDescriptor>,
    by_id: HashMap<StableId, usize>,
    by_name: HashMap<String, usize>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Creates a builder holding the built-in scalars.
    #[must_use]
    pub fn new() -> Self {
        let mut builder = Self {
            types: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        };
        for (name, id, size) in builtin::SCALARS {
            builder.insert(TypeDescriptor::new(name, id, TypeKind::Scalar, size, size));
        }
        builder.insert(TypeDescriptor::new(
            "AssetRef",
            builtin::ASSET_REF,
            TypeKind::AssetRef,
            8,
            8,
        ));
        builder
    }

    /// Checks if `id` has been registered.
    #[must_use]
    pub fn contains(&self, id: StableId) -> bool {
        self.by_id.contains_key(&id)
    }

    fn insert(&mut self, desc: TypeDescriptor) {
        let index = self.types.len();
        self.by_id.insert(desc.id, index);
        self.by_name.insert(desc.name.clone(), index);
        self.types.push(desc);
    }

    fn checked_insert(&mut self, desc: TypeDescriptor) -> ReflectResult<StableId> {
        if self.by_id.contains_key(&desc.id) {
            return Err(ReflectError::DuplicateId {
                id: desc.id,
                name: desc.name,
            });
        }
        if self.by_name.contains_key(&desc.name) {
            return Err(ReflectError::DuplicateName(desc.name));
        }
        let id = desc.id;
        self.insert(desc);
        Ok(id)
    }

    /// Returns the stride and alignment of a registered container element,
    /// rejecting layouts the stride arithmetic cannot handle.
    fn element_layout(&self, id: StableId) -> ReflectResult<(u32, u32)> {
        let desc = self.lookup(id)?;
        let stride = if desc.alignment.is_power_of_two() && desc.byte_size > 0 {
            desc.byte_size
                .checked_add(desc.alignment - 1)
                .map(|end| end & !(desc.alignment - 1))
        } else {
            None
        };
        stride
            .map(|stride| (stride, desc.alignment))
            .ok_or_else(|| ReflectError::InvalidLayout {
                name: desc.name.clone(),
                size: desc.byte_size,
                align: desc.alignment,
            })
    }

    fn lookup(&self, id: StableId) -> ReflectResult<&TypeDescriptor> {
        self.by_id
            .get(&id)
            .map(|&i| &self.types[i])
            .ok_or(ReflectError::UnknownType(id))
    }

    /// Registers an opaque scalar of the given layout.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate id or name.
    pub fn scalar(&mut self, name: &str, id: StableId, size: u32, align: u32) -> ReflectResult<StableId> {
        self.checked_insert(TypeDescriptor::new(name, id, TypeKind::Scalar, size, align))
    }

    /// Registers an enumeration stored as `T`.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate id or name.
    pub fn enumeration<T: Pod>(&mut self, name: &str, id: StableId) -> ReflectResult<StableId> {
        self.checked_insert(TypeDescriptor::new(
            name,
            id,
            TypeKind::Enum,
            size_of::<T>() as u32,
            align_of::<T>() as u32,
        ))
    }

    /// Registers a bit set stored as `T`.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate id or name.
    pub fn bit_flags<T: Pod>(&mut self, name: &str, id: StableId) -> ReflectResult<StableId> {
        self.checked_insert(TypeDescriptor::new(
            name,
            id,
            TypeKind::BitFlags,
            size_of::<T>() as u32,
            align_of::<T>() as u32,
        ))
    }

    /// Registers a pointer (an [`Addr`]) to `pointee`.
    ///
    /// The pointee may be registered later, which is how records point at
    /// themselves. It is checked by [`build`](Self::build).
    ///
    /// # Errors
    ///
    /// Fails on a duplicate id or name.
    pub fn pointer(&mut self, name: &str, id: StableId, pointee: StableId) -> ReflectResult<StableId> {
        let mut desc = TypeDescriptor::new(
            name,
            id,
            TypeKind::Pointer,
            size_of::<Addr>() as u32,
            align_of::<Addr>() as u32,
        );
        desc.pointee = Some(pointee);
        self.checked_insert(desc)
    }

    /// Registers a dynamic array (a [`DynArray`] header) of `item`.
    ///
    /// # Errors
    ///
    /// Fails if `item` is not registered yet, or on a duplicate id or name.
    pub fn dynamic_array(&mut self, name: &str, id: StableId, item: StableId) -> ReflectResult<StableId> {
        let (stride, align) = self.element_layout(item)?;
        let container = DynamicArrayDescriptor::new(item, stride, align);
        let mut desc = TypeDescriptor::new(
            name,
            id,
            TypeKind::Array,
            size_of::<DynArray>() as u32,
            align_of::<DynArray>() as u32,
        );
        desc.container = Some(Box::new(container));
        self.checked_insert(desc)
    }

    /// Registers an inline array of `len` items (`[T; len]`).
    ///
    /// # Errors
    ///
    /// Fails if `item` is not registered yet, or on a duplicate id or name.
    pub fn static_array(
        &mut self,
        name: &str,
        id: StableId,
        item: StableId,
        len: u32,
    ) -> ReflectResult<StableId> {
        let (stride, align) = self.element_layout(item)?;
        let size = stride.checked_mul(len).ok_or_else(|| ReflectError::InvalidLayout {
            name: name.to_owned(),
            size: u32::MAX,
            align,
        })?;
        let mut desc = TypeDescriptor::new(name, id, TypeKind::Array, size, align);
        desc.container = Some(Box::new(StaticArrayDescriptor::new(item, len, stride, align)));
        self.checked_insert(desc)
    }

    /// Registers a dictionary (a [`Dict`](crate::layout::Dict) header) from `key` to `value`.
    ///
    /// # Errors
    ///
    /// Fails if either type is not registered yet, if the key is not plain
    /// leaf data, or on a duplicate id or name.
    pub fn dictionary(
        &mut self,
        name: &str,
        id: StableId,
        key: StableId,
        value: StableId,
    ) -> ReflectResult<StableId> {
        let key_desc = self.lookup(key)?;
        if !key_desc.kind.is_leaf() {
            return Err(ReflectError::InvalidKind {
                name: key_desc.name.clone(),
                role: "dictionary key",
            });
        }
        let (key_size, key_align) = (key_desc.byte_size, key_desc.alignment);
        let (key_stride, _) = self.element_layout(key)?;
        let (value_stride, value_align) = self.element_layout(value)?;
        let value_size = self.lookup(value)?.byte_size;
        // Entry stride is bounded by both strides plus one alignment step.
        if key_stride
            .checked_add(value_stride)
            .and_then(|s| s.checked_add(key_align.max(value_align)))
            .is_none()
        {
            return Err(ReflectError::InvalidLayout {
                name: name.to_owned(),
                size: u32::MAX,
                align: key_align.max(value_align),
            });
        }
        let container = DictionaryDescriptor::new(key, key_size, key_align, value, value_size, value_align);
        let mut desc = TypeDescriptor::new(
            name,
            id,
            TypeKind::Dictionary,
            size_of::<crate::layout::Dict>() as u32,
            align_of::<crate::layout::Dict>() as u32,
        );
        desc.container = Some(Box::new(container));
        self.checked_insert(desc)
    }

    /// Starts registering a record with the layout of `T`.
    pub fn record<T: Pod>(&mut self, name: &str, id: StableId) -> RecordBuilder<'_> {
        self.record_with_layout(name, id, size_of::<T>() as u32, align_of::<T>() as u32)
    }

    /// Starts registering a record with an explicit layout.
    pub fn record_with_layout(&mut self, name: &str, id: StableId, size: u32, align: u32) -> RecordBuilder<'_> {
        RecordBuilder {
            builder: self,
            desc: TypeDescriptor::new(name, id, TypeKind::Record, size, align),
            error: None,
        }
    }

    /// Validates every registration and freezes the registry.
    ///
    /// # Errors
    ///
    /// Returns the first duplicate registration, unknown referenced type,
    /// invalid layout or out-of-range field.
    pub fn build(self) -> ReflectResult<TypeRegistry> {
        let registry = TypeRegistry {
            types: self.types,
            by_id: self.by_id,
            by_name: self.by_name,
        };
        for desc in &registry.types {
            registry.validate(desc)?;
        }
        Ok(registry)
    }
}

/// Accumulates the fields of one record.
pub struct RecordBuilder<'a> {
    builder: &'a mut RegistryBuilder,
    desc: TypeDescriptor,
    error: Option<ReflectError>,
}

impl RecordBuilder<'_> {
    /// Declares a parent record whose fields prefix this one.
    #[must_use]
    pub fn parent(mut self, parent: StableId) -> Self {
        self.desc.parent = Some(parent);
        self
    }

    /// Tags the record with a class FOURCC (root types).
    #[must_use]
    pub fn fourcc(mut self, tag: FourCc) -> Self {
        self.desc.fourcc = Some(tag);
        self
    }

    /// Adds a persisted field.
    #[must_use]
    pub fn field(self, name: &str, offset: usize, ty: StableId) -> Self {
        self.push(name, offset, ty, true)
    }

    /// Adds a run-time-only field. Saves write it as zeros (or a zero-filled
    /// backing block for containers) and loads re-initialize it.
    #[must_use]
    pub fn runtime_field(self, name: &str, offset: usize, ty: StableId) -> Self {
        self.push(name, offset, ty, false)
    }

    fn push(mut self, name: &str, offset: usize, ty: StableId, is_plain_data: bool) -> Self {
        match u32::try_from(offset) {
            Ok(offset) => self.desc.fields.push(Field {
                name: name.to_string(),
                offset,
                ty,
                is_plain_data,
            }),
            Err(_) => {
                self.error.get_or_insert(ReflectError::FieldOutOfRange {
                    owner: self.desc.name.clone(),
                    field: name.to_string(),
                    offset: u32::MAX,
                    size: 0,
                    owner_size: self.desc.byte_size,
                });
            }
        }
        self
    }

    /// Registers the record.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate id or name, or an unrepresentable field offset.
    pub fn finish(self) -> ReflectResult<StableId> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.builder.checked_insert(self.desc)
    }
}

/// Immutable, validated set of type descriptors.
pub struct TypeRegistry {
    types: Vec<TypeDescriptor>,
    by_id: HashMap<StableId, usize>,
    by_name: HashMap<String, usize>,
}

impl TypeRegistry {
    /// Looks a type up by stable id.
    ///
    /// # Errors
    ///
    /// [`ReflectError::UnknownType`] if the id was never registered.
    #[inline]
    pub fn get(&self, id: StableId) -> ReflectResult<&TypeDescriptor> {
        self.try_get(id).ok_or(ReflectError::UnknownType(id))
    }

    /// Looks a type up without treating a miss as a defect.
    #[inline]
    #[must_use]
    pub fn try_get(&self, id: StableId) -> Option<&TypeDescriptor> {
        self.by_id.get(&id).map(|&i| &self.types[i])
    }

    /// Looks a type up by name.
    ///
    /// # Errors
    ///
    /// [`ReflectError::UnknownTypeName`] if the name was never registered.
    pub fn by_name(&self, name: &str) -> ReflectResult<&TypeDescriptor> {
        self.by_name
            .get(name)
            .map(|&i| &self.types[i])
            .ok_or_else(|| ReflectError::UnknownTypeName(name.to_string()))
    }

    /// Checks if `id` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: StableId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Returns the number of registered types.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Checks if the registry is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterates over every descriptor in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.iter()
    }

    /// Returns every field of a record, parent fields first.
    ///
    /// # Errors
    ///
    /// Fails if the type or one of its parents is unknown.
    pub fn fields(&self, id: StableId) -> ReflectResult<Vec<&Field>> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(ty) = current {
            let desc = self.get(ty)?;
            chain.push(desc);
            current = desc.parent;
        }
        Ok(chain
            .iter()
            .rev()
            .flat_map(|desc| desc.fields.iter())
            .collect())
    }

    /// Finds a field (own or inherited) by name.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown.
    pub fn field(&self, id: StableId, name: &str) -> ReflectResult<Option<&Field>> {
        Ok(self.fields(id)?.into_iter().find(|f| f.name == name))
    }

    /// Checks if the type is an array or dictionary.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown.
    pub fn is_container(&self, id: StableId) -> ReflectResult<bool> {
        Ok(self.get(id)?.is_container())
    }

    /// Returns the item type of a container or the pointee of a pointer.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown.
    pub fn item_type(&self, id: StableId) -> ReflectResult<Option<StableId>> {
        let desc = self.get(id)?;
        Ok(desc
            .container()
            .map(|c| c.item_type())
            .or(desc.pointee))
    }

    /// Returns the array stride of a type.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown.
    pub fn stride(&self, id: StableId) -> ReflectResult<u32> {
        Ok(self.get(id)?.stride())
    }

    /// Returns the instance size plus the size of a container's backing block.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown.
    pub fn data_size(&self, id: StableId, instance: &[u8]) -> ReflectResult<u64> {
        let desc = self.get(id)?;
        let extra = desc.container().map_or(0, |c| c.data_size(instance));
        Ok(u64::from(desc.byte_size) + extra)
    }

    /// Finds the dynamic container whose instance starts `offset` bytes into
    /// an instance of `root`, descending through records and inline arrays.
    ///
    /// # Errors
    ///
    /// Fails if a type on the path is unknown.
    pub fn dynamic_container_at(&self, root: StableId, offset: u32) -> ReflectResult<Option<&TypeDescriptor>> {
        let desc = self.get(root)?;
        if let Some(container) = desc.container() {
            if container.is_dynamic() {
                return Ok((offset == 0).then_some(desc));
            }
            let stride = container.stride();
            if stride == 0 || offset / stride >= container.capacity(&[]) {
                return Ok(None);
            }
            let rel = offset % stride;
            for part in container.elements() {
                let part_desc = self.get(part.ty)?;
                if rel >= part.offset && rel < part.offset + part_desc.byte_size {
                    return self.dynamic_container_at(part.ty, rel - part.offset);
                }
            }
            return Ok(None);
        }
        if desc.kind == TypeKind::Record {
            for field in self.fields(root)? {
                let field_desc = self.get(field.ty)?;
                if offset >= field.offset && offset < field.offset + field_desc.byte_size {
                    return self.dynamic_container_at(field.ty, offset - field.offset);
                }
            }
        }
        Ok(None)
    }

    fn validate(&self, desc: &TypeDescriptor) -> ReflectResult<()> {
        let layout_ok = desc.alignment.is_power_of_two()
            && desc.byte_size > 0
            && desc.byte_size % desc.alignment == 0;
        if !layout_ok {
            return Err(ReflectError::InvalidLayout {
                name: desc.name.clone(),
                size: desc.byte_size,
                align: desc.alignment,
            });
        }

        if let Some(pointee) = desc.pointee {
            self.lookup(pointee)?;
        }

        if let Some(parent) = desc.parent {
            let mut hops = 0;
            let mut current = Some(parent);
            while let Some(ty) = current {
                let parent_desc = self.lookup(ty)?;
                let fits = parent_desc.kind == TypeKind::Record && parent_desc.byte_size <= desc.byte_size;
                hops += 1;
                if !fits || hops > self.types.len() {
                    return Err(ReflectError::InvalidKind {
                        name: parent_desc.name.clone(),
                        role: "parent record",
                    });
                }
                current = parent_desc.parent;
            }
        }

        for field in &desc.fields {
            let field_desc = self.lookup(field.ty)?;
            let end = u64::from(field.offset) + u64::from(field_desc.byte_size);
            if field.offset >= desc.byte_size || end > u64::from(desc.byte_size) {
                return Err(ReflectError::FieldOutOfRange {
                    owner: desc.name.clone(),
                    field: field.name.clone(),
                    offset: field.offset,
                    size: field_desc.byte_size,
                    owner_size: desc.byte_size,
                });
            }
            if field.offset % field_desc.alignment != 0 {
                return Err(ReflectError::MisalignedField {
                    owner: desc.name.clone(),
                    field: field.name.clone(),
                    offset: field.offset,
                    align: field_desc.alignment,
                });
            }
        }
        Ok(())
    }

    fn lookup(&self, id: StableId) -> ReflectResult<&TypeDescriptor> {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};
    use std::mem::offset_of;

    #[derive(Clone, Copy, Default, Pod, Zeroable)]
    #[repr(C)]
    struct Base {
        id: u32,
        flags: u32,
    }

    #[derive(Clone, Copy, Default, Pod, Zeroable)]
    #[repr(C)]
    struct Derived {
        id: u32,
        flags: u32,
        items: DynArray,
        next: Addr,
        pair: [u32; 2],
    }

    const BASE: StableId = StableId(2000);
    const DERIVED: StableId = StableId(2001);
    const ITEMS: StableId = StableId(2002);
    const NEXT: StableId = StableId(2003);
    const PAIR: StableId = StableId(2004);

    fn sample() -> ReflectResult<TypeRegistry> {
        let mut b = RegistryBuilder::new();
        b.record::<Base>("Base", BASE)
            .field("id", offset_of!(Base, id), builtin::U32)
            .field("flags", offset_of!(Base, flags), builtin::U32)
            .finish()?;
        b.dynamic_array("Items", ITEMS, builtin::U64)?;
        b.pointer("DerivedRef", NEXT, DERIVED)?;
        b.static_array("Pair", PAIR, builtin::U32, 2)?;
        b.record::<Derived>("Derived", DERIVED)
            .parent(BASE)
            .field("items", offset_of!(Derived, items), ITEMS)
            .field("next", offset_of!(Derived, next), NEXT)
            .field("pair", offset_of!(Derived, pair), PAIR)
            .finish()?;
        b.build()
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let registry = sample().unwrap();
        assert_eq!(registry.get(DERIVED).unwrap().name(), "Derived");
        assert_eq!(registry.by_name("Items").unwrap().id(), ITEMS);
        assert_eq!(registry.get(builtin::I32).unwrap().byte_size(), 4);
        assert!(registry.try_get(StableId(9999)).is_none());
    }

    #[test]
    fn test_fields_include_parent_first() {
        let registry = sample().unwrap();
        let names: Vec<_> = registry
            .fields(DERIVED)
            .unwrap()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, ["id", "flags", "items", "next", "pair"]);
        assert!(registry.field(DERIVED, "next").unwrap().is_some());
    }

    #[test]
    fn test_item_type_and_container_queries() {
        let registry = sample().unwrap();
        assert!(registry.is_container(ITEMS).unwrap());
        assert!(!registry.is_container(NEXT).unwrap());
        assert_eq!(registry.item_type(ITEMS).unwrap(), Some(builtin::U64));
        assert_eq!(registry.item_type(NEXT).unwrap(), Some(DERIVED));
        assert_eq!(registry.stride(PAIR).unwrap(), 8);
    }

    #[test]
    fn test_dynamic_container_at() {
        let registry = sample().unwrap();
        let items_offset = offset_of!(Derived, items) as u32;
        let found = registry.dynamic_container_at(DERIVED, items_offset).unwrap();
        assert_eq!(found.map(TypeDescriptor::id), Some(ITEMS));
        // Inside the header, not at its start.
        assert!(registry.dynamic_container_at(DERIVED, items_offset + 8).unwrap().is_none());
        // A scalar field is not a container.
        assert!(registry.dynamic_container_at(DERIVED, 0).unwrap().is_none());
    }

    #[test]
    fn test_unknown_pointee_fails_build() {
        let mut b = RegistryBuilder::new();
        b.pointer("Dangling", StableId(3000), StableId(3001)).unwrap();
        assert_eq!(b.build().err(), Some(ReflectError::UnknownType(StableId(3001))));
    }

    #[test]
    fn test_field_out_of_range_fails_build() {
        let mut b = RegistryBuilder::new();
        b.record::<Base>("Base", BASE)
            .field("beyond", 8, builtin::U32)
            .finish()
            .unwrap();
        assert!(matches!(b.build(), Err(ReflectError::FieldOutOfRange { .. })));
    }

    #[test]
    fn test_misaligned_field_fails_build() {
        let mut b = RegistryBuilder::new();
        b.record::<Base>("Base", BASE)
            .field("odd", 2, builtin::U32)
            .finish()
            .unwrap();
        assert!(matches!(b.build(), Err(ReflectError::MisalignedField { .. })));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut b = RegistryBuilder::new();
        let err = b.scalar("again_u8", builtin::U8, 1, 1).unwrap_err();
        assert!(matches!(err, ReflectError::DuplicateId { .. }));
    }

    #[test]
    fn test_array_item_must_exist() {
        let mut b = RegistryBuilder::new();
        let err = b.dynamic_array("Nope", StableId(3000), StableId(4000)).unwrap_err();
        assert_eq!(err, ReflectError::UnknownType(StableId(4000)));
    }

    #[test]
    fn test_zero_layout_item_rejected_before_build() {
        let mut b = RegistryBuilder::new();
        b.scalar("Empty", StableId(3001), 0, 0).unwrap();
        let err = b.dynamic_array("Empties", StableId(3002), StableId(3001)).unwrap_err();
        assert!(matches!(err, ReflectError::InvalidLayout { .. }));
        let err = b.static_array("EmptyRow", StableId(3003), StableId(3001), 4).unwrap_err();
        assert!(matches!(err, ReflectError::InvalidLayout { .. }));
        let err = b.dictionary("EmptyMap", StableId(3004), builtin::U32, StableId(3001)).unwrap_err();
        assert!(matches!(err, ReflectError::InvalidLayout { .. }));
    }

    #[test]
    fn test_static_array_size_overflow_rejected() {
        let mut b = RegistryBuilder::new();
        let err = b.static_array("Huge", StableId(3005), builtin::U64, u32::MAX / 4).unwrap_err();
        assert!(matches!(err, ReflectError::InvalidLayout { .. }));

        b.scalar("Wide", StableId(3006), u32::MAX - 2, 4).unwrap();
        let err = b.dynamic_array("Wides", StableId(3007), StableId(3006)).unwrap_err();
        assert!(matches!(err, ReflectError::InvalidLayout { .. }));
    }

    #[test]
    fn test_dictionary_key_must_be_leaf() {
        let mut b = RegistryBuilder::new();
        b.dynamic_array("Items", ITEMS, builtin::U64).unwrap();
        let err = b.dictionary("Bad", StableId(3000), ITEMS, builtin::U32).unwrap_err();
        assert!(matches!(err, ReflectError::InvalidKind { .. }));
    }
}
