//! # Address Space
//!
//! Byte storage behind every address an arena hands out. Each allocated
//! range is one segment keyed by its base address; an access must fall
//! entirely inside one segment.

use bytemuck::{bytes_of, pod_read_unaligned, Pod};
use clump_reflect::Addr;
use std::collections::BTreeMap;
use std::mem::size_of;

use crate::error::{ClumpError, ClumpResult};

/// Bounds-checked storage for the segments of one arena.
#[derive(Debug, Default)]
pub struct Memory {
    segments: BTreeMap<u64, Vec<u8>>,
}

impl Memory {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`.
    ///
    /// # Errors
    ///
    /// [`ClumpError::OverlappingBlocks`] if the range intersects a mapped segment.
    pub fn map(&mut self, base: Addr, bytes: Vec<u8>) -> ClumpResult<()> {
        let start = base.get();
        let end = start + bytes.len() as u64;
        if let Some((&prev, seg)) = self.segments.range(..=start).next_back() {
            if prev + seg.len() as u64 > start {
                return Err(ClumpError::OverlappingBlocks {
                    first: Addr::new(prev),
                    second: base,
                });
            }
        }
        if let Some((&next, _)) = self.segments.range(start..).next() {
            if next < end {
                return Err(ClumpError::OverlappingBlocks {
                    first: base,
                    second: Addr::new(next),
                });
            }
        }
        self.segments.insert(start, bytes);
        Ok(())
    }

    /// Maps `len` zero bytes at `base`.
    ///
    /// # Errors
    ///
    /// See [`map`](Self::map).
    pub fn map_zeroed(&mut self, base: Addr, len: u64) -> ClumpResult<()> {
        let len = usize::try_from(len).map_err(|_| ClumpError::BadAddress { addr: base, len })?;
        self.map(base, vec![0; len])
    }

    /// Unmaps the segment starting at `base`.
    pub fn unmap(&mut self, base: Addr) -> Option<Vec<u8>> {
        self.segments.remove(&base.get())
    }

    /// Returns the base addresses of every segment in address order.
    #[must_use]
    pub fn segment_bases(&self) -> Vec<Addr> {
        self.segments.keys().map(|&b| Addr::new(b)).collect()
    }

    /// Returns the number of mapped segments.
    #[inline]
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the total number of mapped bytes.
    #[must_use]
    pub fn mapped_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.len() as u64).sum()
    }

    fn locate(&self, addr: Addr, len: u64) -> ClumpResult<(u64, usize)> {
        let bad = || ClumpError::BadAddress { addr, len };
        if addr.is_null() {
            return Err(bad());
        }
        let (&base, seg) = self.segments.range(..=addr.get()).next_back().ok_or_else(bad)?;
        let offset = addr.get() - base;
        let end = offset.checked_add(len).ok_or_else(bad)?;
        if end > seg.len() as u64 {
            return Err(bad());
        }
        Ok((base, offset as usize))
    }

    /// Checks that `len` bytes at `addr` are mapped.
    #[must_use]
    pub fn contains(&self, addr: Addr, len: u64) -> bool {
        self.locate(addr, len).is_ok()
    }

    /// Borrows `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if the range is not inside one segment.
    pub fn bytes(&self, addr: Addr, len: u64) -> ClumpResult<&[u8]> {
        let (base, offset) = self.locate(addr, len)?;
        let seg = &self.segments[&base];
        Ok(&seg[offset..offset + len as usize])
    }

    /// Mutably borrows `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if the range is not inside one segment.
    pub fn bytes_mut(&mut self, addr: Addr, len: u64) -> ClumpResult<&mut [u8]> {
        let (base, offset) = self.locate(addr, len)?;
        let seg = self
            .segments
            .get_mut(&base)
            .ok_or(ClumpError::BadAddress { addr, len })?;
        Ok(&mut seg[offset..offset + len as usize])
    }

    /// Reads a value at `addr`.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if the value is not inside one segment.
    #[inline]
    pub fn read<T: Pod>(&self, addr: Addr) -> ClumpResult<T> {
        Ok(pod_read_unaligned(self.bytes(addr, size_of::<T>() as u64)?))
    }

    /// Writes a value at `addr`.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if the value is not inside one segment.
    #[inline]
    pub fn write<T: Pod>(&mut self, addr: Addr, value: &T) -> ClumpResult<()> {
        self.write_bytes(addr, bytes_of(value))
    }

    /// Copies `src` to `addr`.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if the range is not inside one segment.
    pub fn write_bytes(&mut self, addr: Addr, src: &[u8]) -> ClumpResult<()> {
        self.bytes_mut(addr, src.len() as u64)?.copy_from_slice(src);
        Ok(())
    }

    /// Zeroes `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if the range is not inside one segment.
    pub fn zero(&mut self, addr: Addr, len: u64) -> ClumpResult<()> {
        self.bytes_mut(addr, len)?.fill(0);
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if either range is not inside one segment.
    pub fn copy(&mut self, src: Addr, dst: Addr, len: u64) -> ClumpResult<()> {
        let tmp = self.bytes(src, len)?.to_vec();
        self.write_bytes(dst, &tmp)
    }
}
