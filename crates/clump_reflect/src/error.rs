//! # Reflection Error Types
//!
//! All errors that can occur while registering or looking up types.

use thiserror::Error;

use crate::descriptor::StableId;

/// Errors that can occur in the type registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReflectError {
    /// Lookup of a type that was never registered.
    #[error("unknown type: {0}")]
    UnknownType(StableId),

    /// Lookup of a type name that was never registered.
    #[error("unknown type name: {0}")]
    UnknownTypeName(String),

    /// Two registrations used the same stable id.
    #[error("duplicate type id {id} (\"{name}\")")]
    DuplicateId {
        /// The colliding id.
        id: StableId,
        /// Name of the second registration.
        name: String,
    },

    /// Two registrations used the same name.
    #[error("duplicate type name \"{0}\"")]
    DuplicateName(String),

    /// A field does not fit inside its owner.
    #[error("field {owner}.{field} at offset {offset} (size {size}) exceeds owner size {owner_size}")]
    FieldOutOfRange {
        /// Owning record name.
        owner: String,
        /// Field name.
        field: String,
        /// Field offset.
        offset: u32,
        /// Field size.
        size: u32,
        /// Owner size.
        owner_size: u32,
    },

    /// A field offset violates the alignment of its type.
    #[error("field {owner}.{field} at offset {offset} is not aligned to {align}")]
    MisalignedField {
        /// Owning record name.
        owner: String,
        /// Field name.
        field: String,
        /// Field offset.
        offset: u32,
        /// Required alignment.
        align: u32,
    },

    /// Size or alignment of a descriptor is not a valid layout.
    #[error("invalid layout for {name}: size {size}, align {align}")]
    InvalidLayout {
        /// Type name.
        name: String,
        /// Byte size.
        size: u32,
        /// Alignment.
        align: u32,
    },

    /// A type was used in a role its kind does not allow.
    #[error("type {name} cannot be used as {role}")]
    InvalidKind {
        /// Type name.
        name: String,
        /// The role it was used in.
        role: &'static str,
    },
}

/// Result type for reflection operations.
pub type ReflectResult<T> = Result<T, ReflectError>;
