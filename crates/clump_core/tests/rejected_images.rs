//! Images the loader must refuse, and the allocator state it leaves behind.

mod common;

use common::*;

use clump_core::image::format::{table_offset, HEADER_SIZE};
use clump_core::{BumpAllocator, ClumpConfig, ClumpError, ImageConfig, SharedAllocator};
use clump_reflect::FourCc;

fn image() -> Vec<u8> {
    let registry = registry();
    let mut arena = new_arena(&registry, &shared_allocator());
    populate(&mut arena);
    save(&arena)
}

fn payload_size(bytes: &[u8]) -> u64 {
    u64::from(u32::from_ne_bytes(bytes[12..16].try_into().unwrap()))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Byte offset of fixup entry `n`.
fn fixup_at(bytes: &[u8], n: usize) -> usize {
    table_offset(payload_size(bytes)) as usize + 4 + n * 8
}

/// Byte offset of the block table's count.
fn block_table_at(bytes: &[u8]) -> usize {
    let fixups = read_u32(bytes, table_offset(payload_size(bytes)) as usize) as usize;
    fixup_at(bytes, fixups)
}

/// Loads `bytes` and checks that nothing stays allocated afterwards.
fn load_rejected(bytes: &[u8]) -> ClumpError {
    let alloc = shared_allocator();
    let err = load(bytes, &registry(), &alloc).unwrap_err();
    alloc.with(|a| {
        assert_eq!(a.live_count(), 0, "failed load leaked its buffer");
        assert_eq!(a.rejected_count(), 0);
    });
    err
}

#[test]
fn test_wrong_filetype_rejected() {
    let mut bytes = image();
    bytes[0..4].copy_from_slice(b"NOPE");

    let alloc = shared_allocator();
    let err = load(&bytes, &registry(), &alloc).unwrap_err();
    assert!(matches!(err, ClumpError::WrongFileType { .. }), "{err}");
    assert_eq!(alloc.with(|a| a.allocation_count()), 0);
}

#[test]
fn test_configured_filetype_must_match() {
    let bytes = image();
    let config = ClumpConfig {
        image: ImageConfig {
            filetype_tag: FourCc::new(b"OTHR"),
            ..ImageConfig::default()
        },
        ..ClumpConfig::default()
    };
    let err = load_with(&bytes, &registry(), &shared_allocator(), &config).unwrap_err();
    assert!(matches!(err, ClumpError::WrongFileType { .. }));
}

#[test]
fn test_wrong_class_rejected() {
    let mut bytes = image();
    bytes[8..12].copy_from_slice(b"XXXX");
    let err = load_rejected(&bytes);
    assert!(matches!(err, ClumpError::WrongClass { .. }), "{err}");
}

#[test]
fn test_session_mismatch_rejected() {
    let mut bytes = image();
    let session = read_u32(&bytes, 4);
    write_u32(&mut bytes, 4, session + 1);
    let err = load_rejected(&bytes);
    assert!(matches!(err, ClumpError::SessionMismatch { .. }), "{err}");

    let config = ClumpConfig {
        image: ImageConfig {
            session_id: 7,
            ..ImageConfig::default()
        },
        ..ClumpConfig::default()
    };
    let err = load_with(&image(), &registry(), &shared_allocator(), &config).unwrap_err();
    assert!(matches!(err, ClumpError::SessionMismatch { found, .. } if found == session));
}

#[test]
fn test_truncated_images_rejected() {
    let bytes = image();
    for len in [0, 10, HEADER_SIZE as usize + 8, bytes.len() / 2, bytes.len() - 1] {
        let err = load_rejected(&bytes[..len]);
        assert!(matches!(err, ClumpError::Truncated { .. }), "len {len}: {err}");
    }
}

#[test]
fn test_out_of_memory_for_image_buffer() {
    let bytes = image();
    let alloc = SharedAllocator::new(BumpAllocator::new(payload_size(&bytes) - 1));

    let err = load(&bytes, &registry(), &alloc).unwrap_err();
    assert!(matches!(err, ClumpError::OutOfMemory { .. }), "{err}");
    assert_eq!(alloc.with(|a| a.live_count()), 0);
}

#[test]
fn test_fixup_block_index_out_of_range() {
    let mut bytes = image();
    let blocks = read_u32(&bytes, block_table_at(&bytes));
    let at = fixup_at(&bytes, 0) + 4;
    write_u32(&mut bytes, at, blocks);

    let err = load_rejected(&bytes);
    assert!(matches!(err, ClumpError::FixupOutOfRange { entry: 0, .. }), "{err}");
}

#[test]
fn test_fixup_slot_past_payload() {
    let mut bytes = image();
    let payload = payload_size(&bytes) as u32;
    let at = fixup_at(&bytes, 3);
    write_u32(&mut bytes, at, payload - 4);

    let err = load_rejected(&bytes);
    assert!(matches!(err, ClumpError::FixupOutOfRange { entry: 3, .. }), "{err}");
}

#[test]
fn test_fixup_target_past_payload() {
    let mut bytes = image();
    let payload = payload_size(&bytes);
    let slot = read_u32(&bytes, fixup_at(&bytes, 1)) as usize;
    let at = HEADER_SIZE as usize + slot;
    bytes[at..at + 8].copy_from_slice(&payload.to_ne_bytes());

    let err = load_rejected(&bytes);
    assert!(matches!(err, ClumpError::FixupOutOfRange { entry: 1, .. }), "{err}");
}

#[test]
fn test_every_bad_block_index_rejected() {
    let clean = image();
    let fixups = read_u32(&clean, table_offset(payload_size(&clean)) as usize) as usize;
    for n in (0..fixups).step_by(7) {
        let mut bytes = clean.clone();
        let at = fixup_at(&bytes, n) + 4;
        write_u32(&mut bytes, at, u32::MAX);

        let err = load_rejected(&bytes);
        assert!(matches!(err, ClumpError::FixupOutOfRange { entry, .. } if entry as usize == n));
    }
}

#[test]
fn test_misdirected_fixups_stay_inside_image() {
    let clean = image();
    let registry = registry();
    let payload = payload_size(&clean);
    let fixups = read_u32(&clean, table_offset(payload) as usize) as usize;
    let blocks = read_u32(&clean, block_table_at(&clean));

    let mut loaded = 0;
    for n in 0..fixups {
        for bit in [1, 2, 4] {
            let mut bytes = clean.clone();
            let at = fixup_at(&bytes, n) + 4;
            let index = read_u32(&bytes, at) ^ bit;
            if index >= blocks {
                continue;
            }
            write_u32(&mut bytes, at, index);

            let alloc = shared_allocator();
            match load(&bytes, &registry, &alloc) {
                Ok(arena) => {
                    loaded += 1;
                    let base = arena.bulk_base().unwrap();
                    let mut bounds = PointerBounds::new(base, payload);
                    // A walk may still refuse the graph; what it reports must be in bounds.
                    let _ = arena.walk(&mut bounds);
                    assert!(
                        bounds.escaped.is_empty(),
                        "fixup {n} ^ {bit}: escaped pointers {:?}",
                        bounds.escaped
                    );
                }
                Err(err) => {
                    assert!(!matches!(err, ClumpError::Io(_)), "fixup {n} ^ {bit}: {err}");
                }
            }
            alloc.with(|a| {
                assert_eq!(a.live_count(), 0, "fixup {n} ^ {bit} leaked");
                assert_eq!(a.rejected_count(), 0);
            });
        }
    }
    assert!(loaded > 0);
}

#[test]
fn test_block_table_must_start_at_zero() {
    let mut bytes = image();
    let at = block_table_at(&bytes) + 4;
    write_u32(&mut bytes, at, 16);

    let err = load_rejected(&bytes);
    assert!(matches!(err, ClumpError::MalformedImage(_)), "{err}");
}

#[test]
fn test_block_table_must_increase() {
    let mut bytes = image();
    let at = block_table_at(&bytes) + 4;
    let second = read_u32(&bytes, at + 4);
    write_u32(&mut bytes, at + 8, second);

    let err = load_rejected(&bytes);
    assert!(matches!(err, ClumpError::MalformedImage(_)), "{err}");
}

#[test]
fn test_image_from_foreign_registry_rejected() {
    let bytes = image();
    let registry = std::sync::Arc::new(clump_core::registry_builder().unwrap().build().unwrap());

    let alloc = shared_allocator();
    let err = load(&bytes, &registry, &alloc).unwrap_err();
    assert!(matches!(err, ClumpError::Reflect(_)), "{err}");
    assert_eq!(alloc.with(|a| a.live_count()), 0);
}
