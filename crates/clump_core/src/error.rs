//! # Clump Error Types
//!
//! All errors that can occur while building, saving or loading an arena.
//!
//! | Class | Variants | Recovery |
//! |---|---|---|
//! | Format | `WrongFileType`, `WrongClass`, `SessionMismatch`, `Truncated`, `FixupOutOfRange`, `MalformedImage` | none, image rejected |
//! | I/O | `Io` | caller decides |
//! | Resource | `OutOfMemory` | caller decides |
//! | Defect | `Reflect`, `BadAddress`, `TypeMismatch`, `DanglingPointer`, `OverlappingBlocks`, `ImageTooLarge`, `DeadObject` | fix the caller |

use clump_reflect::{Addr, FourCc, ReflectError, StableId};
use thiserror::Error;

/// Errors that can occur in the persistence engine.
#[derive(Error, Debug)]
pub enum ClumpError {
    /// Type registry lookup or registration failure.
    #[error(transparent)]
    Reflect(#[from] ReflectError),

    /// Failure reported verbatim by the underlying stream.
    #[error("image I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The allocator could not satisfy a request.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
        /// Bytes still available in the allocator's budget.
        available: u64,
    },

    /// The image does not carry the expected file type tag.
    #[error("wrong file type: expected {expected}, found {found}")]
    WrongFileType {
        /// Tag required by the configuration.
        expected: FourCc,
        /// Tag found in the header.
        found: FourCc,
    },

    /// The image was saved from a different root class.
    #[error("wrong class: expected {expected}, found {found}")]
    WrongClass {
        /// Class of the registered arena root.
        expected: FourCc,
        /// Class found in the header.
        found: FourCc,
    },

    /// The image was saved by an incompatible build.
    #[error("session mismatch: expected {expected:#010x}, found {found:#010x}")]
    SessionMismatch {
        /// Session of the running process.
        expected: u32,
        /// Session recorded in the image.
        found: u32,
    },

    /// The stream ends before the image does.
    #[error("truncated image: need {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the header and tables.
        needed: u64,
        /// Bytes left in the stream.
        available: u64,
    },

    /// A relocation entry points outside the image.
    #[error("fixup {entry} out of range: {reason}")]
    FixupOutOfRange {
        /// Index of the offending entry.
        entry: u32,
        /// What was out of range.
        reason: String,
    },

    /// The image is structurally inconsistent.
    #[error("malformed image: {0}")]
    MalformedImage(String),

    /// An address range is not backed by memory.
    #[error("bad address {addr} (+{len} bytes)")]
    BadAddress {
        /// Start of the range.
        addr: Addr,
        /// Length of the range.
        len: u64,
    },

    /// A value does not match the layout its descriptor declares.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type or layout.
        expected: String,
        /// Actual type or layout.
        found: String,
    },

    /// A pointer targets memory outside every saved block.
    #[error("dangling pointer at {slot} to {target}")]
    DanglingPointer {
        /// Address of the pointer field.
        slot: Addr,
        /// Address it points to.
        target: Addr,
    },

    /// Two memory blocks of one save overlap.
    #[error("overlapping blocks at {first} and {second}")]
    OverlappingBlocks {
        /// Lower block.
        first: Addr,
        /// Block starting inside it.
        second: Addr,
    },

    /// The image would not fit the 32-bit offsets of the format.
    #[error("image too large: {0} bytes")]
    ImageTooLarge(u64),

    /// A handle refers to a slot that is not live.
    #[error("object {list}:{slot} is not live")]
    DeadObject {
        /// List index.
        list: u32,
        /// Slot index.
        slot: u32,
    },

    /// A handle refers to a list of another type.
    #[error("object of type {found} accessed as {expected}")]
    WrongObjectType {
        /// Requested type.
        expected: StableId,
        /// Stored type.
        found: StableId,
    },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for persistence operations.
pub type ClumpResult<T> = Result<T, ClumpError>;
