//! # Type Descriptors
//!
//! Run-time layout metadata for one registered type.

use std::fmt;

use crate::container::ContainerDescriptor;
use crate::layout::FourCc;

/// Stable identifier of a registered type.
///
/// Ids are chosen by the registering code and must not change between the
/// process that saves an image and the one that loads it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct StableId(pub u32);

impl StableId {
    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The shape of a type, as far as the graph walker is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Numeric or other opaque plain data.
    Scalar,
    /// Composite with a field list.
    Record,
    /// Static or dynamic array.
    Array,
    /// Key-sorted map.
    Dictionary,
    /// Address of another object.
    Pointer,
    /// Enumeration stored as an integer.
    Enum,
    /// Bit set stored as an integer.
    BitFlags,
    /// Hash of an asset resolved outside the arena. Persisted as plain data.
    AssetRef,
}

impl TypeKind {
    /// Checks if values of this kind are opaque bytes to the walker.
    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Scalar | Self::Enum | Self::BitFlags | Self::AssetRef)
    }
}

/// One member of a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    /// Member name.
    pub name: String,
    /// Byte offset inside the owning record.
    pub offset: u32,
    /// Type of the member.
    pub ty: StableId,
    /// False for run-time-only state the loader re-initializes.
    pub is_plain_data: bool,
}

/// Layout metadata for one type.
pub struct TypeDescriptor {
    pub(crate) name: String,
    pub(crate) id: StableId,
    pub(crate) kind: TypeKind,
    pub(crate) byte_size: u32,
    pub(crate) alignment: u32,
    pub(crate) parent: Option<StableId>,
    pub(crate) fields: Vec<Field>,
    pub(crate) pointee: Option<StableId>,
    pub(crate) container: Option<Box<dyn ContainerDescriptor>>,
    pub(crate) fourcc: Option<FourCc>,
}

impl TypeDescriptor {
    pub(crate) fn new(name: &str, id: StableId, kind: TypeKind, byte_size: u32, alignment: u32) -> Self {
        Self {
            name: name.to_string(),
            id,
            kind,
            byte_size,
            alignment,
            parent: None,
            fields: Vec::new(),
            pointee: None,
            container: None,
            fourcc: None,
        }
    }

    /// Returns the registered name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stable id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> StableId {
        self.id
    }

    /// Returns the kind.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Returns the size of one instance in bytes.
    #[inline]
    #[must_use]
    pub const fn byte_size(&self) -> u32 {
        self.byte_size
    }

    /// Returns the required alignment in bytes.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Returns the distance between consecutive instances in an array.
    #[inline]
    #[must_use]
    pub const fn stride(&self) -> u32 {
        (self.byte_size + self.alignment - 1) & !(self.alignment - 1)
    }

    /// Returns the parent record, if any.
    #[inline]
    #[must_use]
    pub const fn parent(&self) -> Option<StableId> {
        self.parent
    }

    /// Returns the fields declared on this record (parent fields excluded).
    #[inline]
    #[must_use]
    pub fn own_fields(&self) -> &[Field] {
        &self.fields
    }

    /// Returns the pointee type of a pointer.
    #[inline]
    #[must_use]
    pub const fn pointee(&self) -> Option<StableId> {
        self.pointee
    }

    /// Returns the container contract of an array or dictionary.
    #[inline]
    #[must_use]
    pub fn container(&self) -> Option<&dyn ContainerDescriptor> {
        self.container.as_deref()
    }

    /// Checks if this is an array or dictionary.
    #[inline]
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.container.is_some()
    }

    /// Returns the class tag of a root type.
    #[inline]
    #[must_use]
    pub const fn fourcc(&self) -> Option<FourCc> {
        self.fourcc
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("byte_size", &self.byte_size)
            .field("alignment", &self.alignment)
            .field("parent", &self.parent)
            .field("fields", &self.fields)
            .field("pointee", &self.pointee)
            .field("container", &self.container)
            .finish()
    }
}
