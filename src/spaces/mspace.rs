//! The general purpose allocator embedded in every alloc space.
//!
//! Chunks tile `[base, base + footprint)` without gaps. Each chunk starts with a one word header
//! holding its size, the memory handed out begins right after it. Chunk bookkeeping lives out of
//! line so the pages of free chunks can be given back to the kernel at any time. The footprint
//! only grows, through `MoreCore`, and never past the footprint limit.

use crate::utils::*;
use std::collections::{BTreeMap, BTreeSet};

/// Boundary tag in front of every allocation.
pub const CHUNK_OVERHEAD: usize = WORD_SIZE;
pub const MIN_CHUNK_SIZE: usize = 2 * WORD_SIZE;

const IN_USE_BIT: usize = 1;

/// Source of fresh memory for an mspace.
pub(crate) trait MoreCore {
    /// Makes `increment` more bytes available right after the current end and returns the old
    /// end, or null if the memory could not be provided.
    fn more_core(&self, increment: usize) -> Address;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Chunk {
    size: usize,
    in_use: bool,
}

pub(crate) struct MSpace {
    base: Address,
    footprint: usize,
    footprint_limit: usize,
    /// Every chunk, keyed by offset from `base`.
    chunks: BTreeMap<usize, Chunk>,
    /// Free chunks ordered by `(size, offset)` for best fit.
    free_chunks: BTreeSet<(usize, usize)>,
    bytes_allocated: usize,
    objects_allocated: usize,
}

impl MSpace {
    pub fn new(base: Address, footprint_limit: usize) -> Option<Self> {
        if base.is_null() || !base.is_aligned_to(OBJECT_ALIGNMENT) {
            return None;
        }
        let mut mspace = Self {
            base,
            footprint: 0,
            footprint_limit: 0,
            chunks: BTreeMap::new(),
            free_chunks: BTreeSet::new(),
            bytes_allocated: 0,
            objects_allocated: 0,
        };
        mspace.set_footprint_limit(footprint_limit);
        Some(mspace)
    }

    fn request_to_chunk(bytes: usize) -> Option<usize> {
        let padded = bytes.max(1).checked_add(CHUNK_OVERHEAD + OBJECT_ALIGNMENT - 1)?;
        Some(round_down(padded, OBJECT_ALIGNMENT).max(MIN_CHUNK_SIZE))
    }

    fn insert_free(&mut self, offset: usize, size: usize) {
        self.chunks.insert(
            offset,
            Chunk {
                size,
                in_use: false,
            },
        );
        self.free_chunks.insert((size, offset));
    }

    fn remove_free(&mut self, offset: usize, size: usize) {
        self.chunks.remove(&offset);
        self.free_chunks.remove(&(size, offset));
    }

    fn take_free_chunk(&mut self, chunk_size: usize) -> Option<usize> {
        let (size, offset) = self.free_chunks.range((chunk_size, 0)..).next().copied()?;
        self.free_chunks.remove(&(size, offset));
        Some(offset)
    }

    /// Extends the footprint so that the top chunk can hold `chunk_size` bytes. The returned
    /// chunk is not in the free set.
    fn grow(&mut self, chunk_size: usize, source: &dyn MoreCore) -> Option<usize> {
        let (start, available) = match self.chunks.iter().next_back() {
            Some((&offset, chunk)) if !chunk.in_use => (offset, chunk.size),
            _ => (self.footprint, 0),
        };
        let needed = chunk_size - available;
        if needed > self.footprint_limit.saturating_sub(self.footprint) {
            return None;
        }
        // The limit is page aligned, so rounding up cannot pass it.
        let increment = mem::page_align(needed);
        let old_end = source.more_core(increment);
        if old_end.is_null() {
            return None;
        }
        debug_assert_eq!(old_end, self.base.offset(self.footprint));
        self.footprint += increment;
        if available != 0 {
            self.free_chunks.remove(&(available, start));
        }
        self.chunks.insert(
            start,
            Chunk {
                size: available + increment,
                in_use: false,
            },
        );
        Some(start)
    }

    /// Allocates zeroed memory for `bytes` bytes, or returns null when the request cannot be
    /// satisfied within the footprint limit.
    pub fn malloc(&mut self, bytes: usize, source: &dyn MoreCore) -> Address {
        let chunk_size = match Self::request_to_chunk(bytes) {
            Some(size) => size,
            None => return Address::null(),
        };
        let offset = match self.take_free_chunk(chunk_size) {
            Some(offset) => offset,
            None => match self.grow(chunk_size, source) {
                Some(offset) => offset,
                None => return Address::null(),
            },
        };
        let size = self.chunks[&offset].size;
        let used = if size - chunk_size >= MIN_CHUNK_SIZE {
            self.insert_free(offset + chunk_size, size - chunk_size);
            chunk_size
        } else {
            size
        };
        self.chunks.insert(
            offset,
            Chunk {
                size: used,
                in_use: true,
            },
        );
        self.bytes_allocated += used;
        self.objects_allocated += 1;

        let chunk = self.base.offset(offset);
        unsafe {
            *chunk.to_mut_ptr::<usize>() = used | IN_USE_BIT;
            core::ptr::write_bytes(
                chunk.offset(CHUNK_OVERHEAD).to_mut_ptr::<u8>(),
                0,
                used - CHUNK_OVERHEAD,
            );
        }
        chunk.offset(CHUNK_OVERHEAD)
    }

    fn in_use_chunk(&self, mem: Address) -> (usize, usize) {
        assert!(
            mem >= self.base.offset(CHUNK_OVERHEAD) && mem < self.base.offset(self.footprint),
            "{} is outside of the mspace at {}",
            mem,
            self.base
        );
        let offset = mem.offset_from(self.base) - CHUNK_OVERHEAD;
        match self.chunks.get(&offset) {
            Some(chunk) if chunk.in_use => {
                debug_assert_eq!(
                    unsafe { *self.base.offset(offset).to_ptr::<usize>() },
                    chunk.size | IN_USE_BIT
                );
                (offset, chunk.size)
            }
            _ => panic!("{} was not allocated from the mspace at {}", mem, self.base),
        }
    }

    /// Releases the chunk of `mem` and returns its size.
    pub fn free(&mut self, mem: Address) -> usize {
        let (mut offset, freed) = self.in_use_chunk(mem);
        self.bytes_allocated -= freed;
        self.objects_allocated -= 1;
        unsafe { *self.base.offset(offset).to_mut_ptr::<usize>() = 0 };

        let mut size = freed;
        let next = offset + size;
        if let Some(chunk) = self.chunks.get(&next).copied() {
            if !chunk.in_use {
                self.remove_free(next, chunk.size);
                size += chunk.size;
            }
        }
        if let Some((&prev, &chunk)) = self.chunks.range(..offset).next_back() {
            if !chunk.in_use {
                self.remove_free(prev, chunk.size);
                self.chunks.remove(&offset);
                offset = prev;
                size += chunk.size;
            }
        }
        self.insert_free(offset, size);
        freed
    }

    pub fn bulk_free(&mut self, ptrs: &[Address]) -> usize {
        ptrs.iter().map(|ptr| self.free(*ptr)).sum()
    }

    /// Size of the chunk backing `mem`, header included.
    pub fn chunk_size(&self, mem: Address) -> usize {
        self.in_use_chunk(mem).1
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn footprint_limit(&self) -> usize {
        self.footprint_limit
    }

    /// Sets how far the footprint may grow, rounded up to the page size. The limit may be set
    /// below the current footprint, which only stops further growth.
    pub fn set_footprint_limit(&mut self, bytes: usize) {
        self.footprint_limit = mem::checked_page_align(bytes)
            .unwrap_or_else(|| round_down(bytes, os::page_size()));
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }

    /// Calls `handler(start, end, used_bytes)` for every chunk in address order. For chunks in
    /// use `start` is the allocated address, free chunks report `used_bytes == 0`.
    pub fn inspect_all(&self, mut handler: impl FnMut(Address, Address, usize)) {
        for (&offset, chunk) in self.chunks.iter() {
            let start = self.base.offset(offset);
            let end = start.offset(chunk.size);
            if chunk.in_use {
                handler(start.offset(CHUNK_OVERHEAD), end, chunk.size);
            } else {
                handler(start, end, 0);
            }
        }
    }
}
