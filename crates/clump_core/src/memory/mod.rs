//! # Memory Management
//!
//! The emulated address space an arena lives in.
//!
//! ## Design Philosophy
//!
//! Persisted pointers are plain [`Addr`](clump_reflect::Addr) values:
//! - Ranges come from an [`Allocator`] collaborator
//! - Bytes live in [`Memory`], one segment per range
//! - Every access is bounds-checked against its segment

mod allocator;
mod space;

pub use allocator::{Allocator, BumpAllocator, SharedAllocator, DEFAULT_BASE};
pub use space::Memory;
