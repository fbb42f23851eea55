//! # Persistent Layout Primitives
//!
//! Plain-old-data building blocks that user records embed to take part in
//! load-in-place persistence:
//!
//! - [`Addr`]: a virtual address inside an arena's address space
//! - [`DynArray`]: header of a growable array whose items live in a separate block
//! - [`Dict`]: header of a key-sorted map whose entries live in a separate block
//! - [`FourCc`]: four-byte identity tag
//!
//! Every struct here is `#[repr(C)]` without implicit padding, so its bytes
//! are a faithful image of its value.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Container flag: the backing block is owned by someone else (a loaded image).
pub const CONTAINER_EXTERNAL: u32 = 1;

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// A virtual address inside an arena's address space.
///
/// Address zero is reserved as the null pointer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Addr(pub u64);

impl Addr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Creates an address from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw address value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Checks if this is the null address.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past this one.
    #[inline]
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Header of a dynamic array.
///
/// Items are stored contiguously in a separate block of `capacity` slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DynArray {
    /// Address of the item block (null while capacity is zero).
    pub data: Addr,
    /// Number of live items.
    pub count: u32,
    /// Number of item slots in the block.
    pub capacity: u32,
    /// Container flags ([`CONTAINER_EXTERNAL`]).
    pub flags: u32,
    /// Reserved, always zero.
    pub _reserved: u32,
}

impl DynArray {
    /// An empty array with no backing block.
    pub const EMPTY: Self = Self {
        data: Addr::NULL,
        count: 0,
        capacity: 0,
        flags: 0,
        _reserved: 0,
    };
}

/// Header of a dictionary.
///
/// Entries are `(key, value)` pairs sorted by key in a separate block.
/// The field order differs from [`DynArray`] on purpose: containers are only
/// ever accessed through their descriptors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Dict {
    /// Number of entry slots in the block.
    pub capacity: u32,
    /// Number of live entries.
    pub len: u32,
    /// Address of the entry block (null while capacity is zero).
    pub entries: Addr,
    /// Container flags ([`CONTAINER_EXTERNAL`]).
    pub flags: u32,
    /// Reserved, always zero.
    pub _reserved: u32,
}

impl Dict {
    /// An empty dictionary with no backing block.
    pub const EMPTY: Self = Self {
        capacity: 0,
        len: 0,
        entries: Addr::NULL,
        flags: 0,
        _reserved: 0,
    };
}

/// Four-byte identity tag (file type, class).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(transparent)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Creates a tag from four bytes.
    #[inline]
    #[must_use]
    pub const fn new(bytes: &[u8; 4]) -> Self {
        Self(*bytes)
    }

    /// Returns the tag as a native-endian `u32`, the way it is stored in images.
    #[inline]
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_ne_bytes(self.0)
    }

    /// Creates a tag from its stored `u32` form.
    #[inline]
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_ne_bytes())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for FourCc {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes: [u8; 4] = value
            .as_bytes()
            .try_into()
            .map_err(|_| format!("fourcc must be exactly 4 bytes, got \"{value}\""))?;
        Ok(Self(bytes))
    }
}

impl From<FourCc> for String {
    fn from(value: FourCc) -> Self {
        value.to_string()
    }
}
