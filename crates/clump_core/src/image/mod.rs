//! # Load-In-Place Images
//!
//! An image is an arena's blocks laid end to end plus a relocation table.
//! Loading it is one allocation, one read and one patch pass.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut bytes = Vec::new();
//! let stats = save_image(&arena, &mut bytes)?;
//!
//! let restored = load_image(
//!     &mut Cursor::new(bytes),
//!     Box::new(BumpAllocator::new(1 << 20)),
//!     Arc::clone(arena.registry()),
//!     arena.config(),
//! )?;
//! ```

mod builder;
pub mod format;
mod loader;

pub use builder::{save_image, ImageStats};
pub use format::{FixupEntry, ImageHeader};
pub use loader::{load_image, read_image_info, ImageInfo};
