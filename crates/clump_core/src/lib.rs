//! # CLUMP Core Engine
//!
//! Object arenas that save to, and load from, a single contiguous image:
//! - One bulk read plus one pointer-patch pass per load
//! - Generic traversal driven by run-time type descriptors
//! - Byte-for-byte reproducible images
//!
//! ## Architecture Rules
//!
//! 1. **Addresses are values** - Pointers are [`Addr`]s into a bounds-checked address space
//! 2. **Lists never move** - Object addresses are stable for the arena's lifetime
//! 3. **Walk, don't serialize** - Saves copy blocks; only pointers are rewritten
//!
//! ## Example
//!
//! ```rust,ignore
//! use clump_core::{registry_builder, Arena, BumpAllocator, ClumpConfig};
//!
//! let mut builder = registry_builder()?;
//! // register user types...
//! let registry = Arc::new(builder.build()?);
//!
//! let mut arena = Arena::new(registry, Box::new(BumpAllocator::new(1 << 20)), ClumpConfig::default())?;
//! let mut image = Vec::new();
//! save_image(&arena, &mut image)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod arena;
pub mod config;
pub mod error;
pub mod image;
pub mod memory;
pub mod walker;

pub use arena::{Arena, Handle, ObjectListInfo, ObjectRef};
pub use config::{ArenaConfig, ClumpConfig, ImageConfig};
pub use error::{ClumpError, ClumpResult};
pub use image::{load_image, read_image_info, save_image, ImageInfo, ImageStats};
pub use memory::{Allocator, BumpAllocator, Memory, SharedAllocator};
pub use walker::{GraphVisitor, GraphWalker, MemoryBlock};

pub use clump_reflect::{Addr, StableId};

/// Returns a registry builder that already holds the arena's control types.
///
/// # Errors
///
/// Fails only if the control types cannot be registered.
pub fn registry_builder() -> ClumpResult<clump_reflect::RegistryBuilder> {
    let mut builder = clump_reflect::RegistryBuilder::new();
    arena::layout::register_control_types(&mut builder)?;
    Ok(builder)
}
