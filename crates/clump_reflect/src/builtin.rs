//! # Built-in Types
//!
//! Stable ids of the scalars every registry starts with.
//! Ids below [`FIRST_USER_ID`] are reserved.

use crate::descriptor::StableId;

/// `u8`
pub const U8: StableId = StableId(1);
/// `u16`
pub const U16: StableId = StableId(2);
/// `u32`
pub const U32: StableId = StableId(3);
/// `u64`
pub const U64: StableId = StableId(4);
/// `i8`
pub const I8: StableId = StableId(5);
/// `i16`
pub const I16: StableId = StableId(6);
/// `i32`
pub const I32: StableId = StableId(7);
/// `i64`
pub const I64: StableId = StableId(8);
/// `f32`
pub const F32: StableId = StableId(9);
/// `f64`
pub const F64: StableId = StableId(10);
/// 64-bit asset hash, resolved outside the arena.
pub const ASSET_REF: StableId = StableId(11);

/// First id available to registering code.
pub const FIRST_USER_ID: u32 = 1024;

/// `(name, id, size)` of every built-in scalar. Alignment equals size.
pub(crate) const SCALARS: [(&str, StableId, u32); 10] = [
    ("u8", U8, 1),
    ("u16", U16, 2),
    ("u32", U32, 4),
    ("u64", U64, 8),
    ("i8", I8, 1),
    ("i16", I16, 2),
    ("i32", I32, 4),
    ("i64", I64, 8),
    ("f32", F32, 4),
    ("f64", F64, 8),
];
