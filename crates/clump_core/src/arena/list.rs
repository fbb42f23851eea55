//! # Object List Slots
//!
//! Slot bookkeeping of one [`ObjectListHeader`]: the live bitmap and the
//! free-slot stack, both stored in the arena's address space.
//!
//! Allocating pops the stack and freeing pushes it, both O(1). The stack is
//! seeded so that slots are handed out lowest index first.

use clump_reflect::Addr;

use super::layout::ObjectListHeader;
use crate::error::{ClumpError, ClumpResult};
use crate::memory::Memory;

/// Number of `u64` words in the bitmap of a list with `capacity` slots.
#[inline]
#[must_use]
pub const fn bitmap_words(capacity: u32) -> u32 {
    capacity.div_ceil(64)
}

fn bit_addr(header: &ObjectListHeader, slot: u32) -> Addr {
    header.live_bits.data.offset(u64::from(slot / 64) * 8)
}

fn check_slot(header: &ObjectListHeader, slot: u32) -> ClumpResult<()> {
    if slot >= header.capacity {
        return Err(ClumpError::BadAddress {
            addr: header.slot_addr(slot),
            len: u64::from(header.stride),
        });
    }
    Ok(())
}

/// Checks if `slot` is live.
///
/// # Errors
///
/// Fails if the slot or the bitmap is out of range.
pub fn is_live(memory: &Memory, header: &ObjectListHeader, slot: u32) -> ClumpResult<bool> {
    check_slot(header, slot)?;
    let word: u64 = memory.read(bit_addr(header, slot))?;
    Ok(word & (1 << (slot % 64)) != 0)
}

/// Sets or clears the live bit of `slot`.
///
/// # Errors
///
/// Fails if the slot or the bitmap is out of range.
pub fn set_live(memory: &mut Memory, header: &ObjectListHeader, slot: u32, live: bool) -> ClumpResult<()> {
    check_slot(header, slot)?;
    let addr = bit_addr(header, slot);
    let word: u64 = memory.read(addr)?;
    let mask = 1 << (slot % 64);
    let word = if live { word | mask } else { word & !mask };
    memory.write(addr, &word)
}

/// Returns the live slots in index order.
///
/// # Errors
///
/// Fails if the bitmap is out of range.
pub fn live_slots(memory: &Memory, header: &ObjectListHeader) -> ClumpResult<Vec<u32>> {
    let words = bitmap_words(header.capacity);
    let bits = memory.bytes(header.live_bits.data, u64::from(words) * 8)?;
    let mut slots = Vec::with_capacity(header.live_count as usize);
    for (w, chunk) in bits.chunks_exact(8).enumerate() {
        let mut word = u64::from_ne_bytes(chunk.try_into().unwrap_or_default());
        while word != 0 {
            let slot = w as u32 * 64 + word.trailing_zeros();
            if slot < header.capacity {
                slots.push(slot);
            }
            word &= word - 1;
        }
    }
    Ok(slots)
}

/// Pops the next free slot, or `None` if the list is full.
///
/// Updates the stack count in `header`; the caller writes the header back.
///
/// # Errors
///
/// Fails if the stack is out of range.
pub fn pop_free(memory: &Memory, header: &mut ObjectListHeader) -> ClumpResult<Option<u32>> {
    let stack = &mut header.free_slots;
    if stack.count == 0 {
        return Ok(None);
    }
    stack.count -= 1;
    let slot: u32 = memory.read(stack.data.offset(u64::from(stack.count) * 4))?;
    Ok(Some(slot))
}

/// Pushes a freed slot.
///
/// Updates the stack count in `header`; the caller writes the header back.
///
/// # Errors
///
/// Fails if the stack is full or out of range.
pub fn push_free(memory: &mut Memory, header: &mut ObjectListHeader, slot: u32) -> ClumpResult<()> {
    let stack = &mut header.free_slots;
    if stack.count >= stack.capacity {
        return Err(ClumpError::MalformedImage(format!(
            "free-slot stack of {} overflows",
            header.storage
        )));
    }
    memory.write(stack.data.offset(u64::from(stack.count) * 4), &slot)?;
    stack.count += 1;
    Ok(())
}

/// Refills the free-slot stack from the live bitmap and recounts live slots.
///
/// # Errors
///
/// Fails if the bitmap or the stack is out of range.
pub fn rebuild_free_stack(memory: &mut Memory, header: &mut ObjectListHeader) -> ClumpResult<()> {
    let live = live_slots(memory, header)?;
    header.live_count = live.len() as u32;
    header.free_slots.count = 0;

    let mut live = live.into_iter().rev().peekable();
    for slot in (0..header.capacity).rev() {
        if live.next_if_eq(&slot).is_none() {
            push_free(memory, header, slot)?;
        }
    }
    Ok(())
}
