//! # CLUMP Reflect
//!
//! Run-time type metadata that drives generic object-graph persistence.
//!
//! ## Architecture Rules
//!
//! 1. **Registered once** - All types are registered at startup, then frozen
//! 2. **Layout is truth** - Size, alignment and field offsets mirror `#[repr(C)]`
//! 3. **No per-type code** - Walkers read descriptors, never concrete types
//!
//! ## Example
//!
//! ```rust,ignore
//! use clump_reflect::{builtin, RegistryBuilder, StableId};
//!
//! let mut builder = RegistryBuilder::new();
//! builder.dynamic_array("Scores", StableId(1100), builtin::I32)?;
//! let registry = builder.build()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod builtin;
pub mod container;
pub mod descriptor;
pub mod error;
pub mod layout;
pub mod registry;

pub use container::{
    ContainerDescriptor, DictionaryDescriptor, DynamicArrayDescriptor, ElementPart,
    StaticArrayDescriptor,
};
pub use descriptor::{Field, StableId, TypeDescriptor, TypeKind};
pub use error::{ReflectError, ReflectResult};
pub use layout::{align_up, Addr, Dict, DynArray, FourCc, CONTAINER_EXTERNAL};
pub use registry::{RecordBuilder, Reflect, RegistryBuilder, TypeRegistry};
