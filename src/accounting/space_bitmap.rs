use crate::mem_map::*;
use crate::utils::*;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const BITS_PER_INTPTR: usize = core::mem::size_of::<usize>() * 8;

/// Number of addresses `sweep_walk` batches up before calling back.
const SWEEP_BUFFER_SIZE: usize = 4 * BITS_PER_INTPTR;

/// One bit per `OBJECT_ALIGNMENT` granule of `[heap_begin, heap_limit)`. The words live in their
/// own anonymous mapping so large, mostly empty bitmaps cost no physical memory.
pub struct SpaceBitmap {
    name: String,
    mem_map: MemMap,
    words: usize,
    heap_begin: Address,
    heap_limit: AtomicUsize,
}

impl SpaceBitmap {
    pub const ALIGN: usize = OBJECT_ALIGNMENT;

    pub fn offset_to_index(offset: usize) -> usize {
        offset / Self::ALIGN / BITS_PER_INTPTR
    }

    pub fn index_to_offset(index: usize) -> usize {
        index * Self::ALIGN * BITS_PER_INTPTR
    }

    #[inline(always)]
    pub fn offset_bit_index(off: usize) -> usize {
        (off / Self::ALIGN) % BITS_PER_INTPTR
    }

    pub fn offset_to_mask(off: usize) -> usize {
        1 << Self::offset_bit_index(off)
    }

    /// Bytes of bitmap storage needed to cover `cap` bytes of heap.
    pub fn compute_size(cap: usize) -> usize {
        let b = Self::ALIGN * BITS_PER_INTPTR;
        (round_up(cap, b) / b) * core::mem::size_of::<usize>()
    }

    pub fn new(name: &str, heap_begin: Address, heap_capacity: usize) -> io::Result<Self> {
        assert!(heap_begin.is_aligned_to(Self::ALIGN));
        let size = Self::compute_size(heap_capacity).max(core::mem::size_of::<usize>());
        let mem_map = MemMap::map_anonymous(name, None, size, PROT_READ | PROT_WRITE)?;
        Ok(Self {
            name: name.to_string(),
            words: size / core::mem::size_of::<usize>(),
            mem_map,
            heap_begin,
            heap_limit: AtomicUsize::new(heap_begin.offset(heap_capacity).to_usize()),
        })
    }

    fn storage(&self) -> &[AtomicUsize] {
        unsafe { core::slice::from_raw_parts(self.mem_map.begin().to_ptr(), self.words) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }

    pub fn heap_limit(&self) -> Address {
        Address::from(self.heap_limit.load(Ordering::Relaxed))
    }

    pub fn heap_size(&self) -> usize {
        self.heap_limit().offset_from(self.heap_begin)
    }

    /// Shrinks (or regrows, up to the storage reserved at construction) the covered range.
    pub fn set_heap_limit(&self, new_limit: Address) {
        assert!(new_limit >= self.heap_begin);
        assert!(
            Self::compute_size(new_limit.offset_from(self.heap_begin))
                <= self.words * core::mem::size_of::<usize>(),
            "{}: heap limit {} beyond bitmap storage",
            self.name,
            new_limit
        );
        self.heap_limit.store(new_limit.to_usize(), Ordering::Relaxed);
    }

    pub fn has_address(&self, addr: Address) -> bool {
        self.heap_begin <= addr && addr < self.heap_limit()
    }

    fn modify(&self, addr: Address, set_bit: bool) -> bool {
        assert!(
            self.has_address(addr),
            "Address {} out of space bitmap {} bounds ({}-{})",
            addr,
            self.name,
            self.heap_begin,
            self.heap_limit()
        );
        let off = addr.offset_from(self.heap_begin);
        let entry = &self.storage()[Self::offset_to_index(off)];
        let mask = Self::offset_to_mask(off);
        let old_word = if set_bit {
            entry.fetch_or(mask, Ordering::Relaxed)
        } else {
            entry.fetch_and(!mask, Ordering::Relaxed)
        };
        (old_word & mask) != 0
    }

    /// Marks `addr`; returns whether it was already marked.
    #[inline]
    pub fn set(&self, addr: Address) -> bool {
        self.modify(addr, true)
    }

    /// Unmarks `addr`; returns whether it was marked.
    #[inline]
    pub fn clear(&self, addr: Address) -> bool {
        if addr.is_null() {
            return false;
        }
        self.modify(addr, false)
    }

    pub fn test(&self, addr: Address) -> bool {
        if !self.has_address(addr) {
            return false;
        }
        let off = addr.offset_from(self.heap_begin);
        (self.storage()[Self::offset_to_index(off)].load(Ordering::Relaxed)
            & Self::offset_to_mask(off))
            != 0
    }

    pub fn clear_all(&self) -> io::Result<()> {
        self.mem_map.madvise_dontneed_and_zero()
    }

    pub fn clear_range(&self, begin: Address, end: Address) {
        let begin = begin.max(self.heap_begin);
        let end = end.min(self.heap_limit());
        let mut cur = begin;
        while cur < end {
            let off = cur.offset_from(self.heap_begin);
            if Self::offset_bit_index(off) == 0
                && cur.offset(Self::index_to_offset(1)) <= end
            {
                self.storage()[Self::offset_to_index(off)].store(0, Ordering::Relaxed);
                cur = cur.offset(Self::index_to_offset(1));
            } else {
                self.clear(cur);
                cur = cur.offset(Self::ALIGN);
            }
        }
    }

    /// Word indices covering `[begin, end)` together with a function masking off the bits of the
    /// edge words that fall outside of the range.
    fn word_range(&self, begin: Address, end: Address) -> (usize, usize, impl Fn(usize, usize) -> usize) {
        let offset_start = begin.offset_from(self.heap_begin);
        let offset_end = end.offset_from(self.heap_begin) - 1;
        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let first_bit = Self::offset_bit_index(offset_start);
        let last_bit = Self::offset_bit_index(offset_end);
        let mask = move |index: usize, mut word: usize| {
            if index == index_start {
                word &= !((1usize << first_bit) - 1);
            }
            if index == index_end && last_bit + 1 < BITS_PER_INTPTR {
                word &= (1usize << (last_bit + 1)) - 1;
            }
            word
        };
        (index_start, index_end, mask)
    }

    /// Calls `visitor` for every marked address in `[visit_begin, visit_end)`, in address order.
    pub fn visit_marked_range(
        &self,
        visit_begin: Address,
        visit_end: Address,
        mut visitor: impl FnMut(Address),
    ) {
        let visit_begin = visit_begin.max(self.heap_begin);
        let visit_end = visit_end.min(self.heap_limit());
        if visit_end <= visit_begin {
            return;
        }
        let storage = self.storage();
        let (index_start, index_end, mask) = self.word_range(visit_begin, visit_end);
        for index in index_start..=index_end {
            let mut word = mask(index, storage[index].load(Ordering::Relaxed));
            if word == 0 {
                continue;
            }
            let ptr_base = self.heap_begin.offset(Self::index_to_offset(index));
            while word != 0 {
                let shift = word.trailing_zeros() as usize;
                visitor(ptr_base.offset(shift * Self::ALIGN));
                word &= word - 1;
            }
        }
    }

    /// Visits every marked address of the bitmap.
    pub fn walk(&self, visitor: impl FnMut(Address)) {
        self.visit_marked_range(self.heap_begin, self.heap_limit(), visitor)
    }

    pub fn count(&self) -> usize {
        let mut n = 0;
        self.walk(|_| n += 1);
        n
    }

    /// Marks in `self` every address marked in `other`, over the range both bitmaps cover.
    pub fn union_with(&self, other: &SpaceBitmap) {
        let begin = self.heap_begin.max(other.heap_begin);
        let end = self.heap_limit().min(other.heap_limit());
        if end <= begin {
            return;
        }
        if self.heap_begin == other.heap_begin {
            let (index_start, index_end, mask) = self.word_range(begin, end);
            let (ours, theirs) = (self.storage(), other.storage());
            for index in index_start..=index_end {
                let word = mask(index, theirs[index].load(Ordering::Relaxed));
                if word != 0 {
                    ours[index].fetch_or(word, Ordering::Relaxed);
                }
            }
        } else {
            other.visit_marked_range(begin, end, |addr| {
                self.set(addr);
            });
        }
    }

    /// Hands every address in `[sweep_begin, sweep_end)` that is live but not marked to
    /// `callback`, in batches.
    pub fn sweep_walk(
        live: &SpaceBitmap,
        mark: &SpaceBitmap,
        sweep_begin: Address,
        sweep_end: Address,
        mut callback: impl FnMut(&[Address]),
    ) {
        assert_eq!(live.heap_begin, mark.heap_begin);
        let sweep_begin = sweep_begin.max(live.heap_begin);
        let sweep_end = sweep_end.min(live.heap_limit()).min(mark.heap_limit());
        if sweep_end <= sweep_begin {
            return;
        }
        let (index_start, index_end, mask) = live.word_range(sweep_begin, sweep_end);
        let (live_words, mark_words) = (live.storage(), mark.storage());
        let mut pointer_buf = Vec::with_capacity(SWEEP_BUFFER_SIZE);
        for i in index_start..=index_end {
            let mut garbage = mask(
                i,
                live_words[i].load(Ordering::Relaxed) & !mark_words[i].load(Ordering::Relaxed),
            );
            if garbage == 0 {
                continue;
            }
            let ptr_base = live.heap_begin.offset(Self::index_to_offset(i));
            while garbage != 0 {
                let shift = garbage.trailing_zeros() as usize;
                pointer_buf.push(ptr_base.offset(shift * Self::ALIGN));
                garbage &= garbage - 1;
            }
            if pointer_buf.len() >= SWEEP_BUFFER_SIZE {
                callback(&pointer_buf);
                pointer_buf.clear();
            }
        }
        if !pointer_buf.is_empty() {
            callback(&pointer_buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(cap: usize) -> SpaceBitmap {
        // The bitmap never dereferences the heap range, any aligned begin will do.
        SpaceBitmap::new("test bitmap", Address::from(0x1000_0000), cap).unwrap()
    }

    #[test]
    fn test_set_clear_test() {
        let bitmap = bitmap(MB);
        let begin = bitmap.heap_begin();
        let addr = begin.offset(64 * SpaceBitmap::ALIGN);

        assert!(!bitmap.test(addr));
        assert!(!bitmap.set(addr));
        assert!(bitmap.set(addr));
        assert!(bitmap.test(addr));
        assert!(!bitmap.test(addr.offset(SpaceBitmap::ALIGN)));
        assert!(bitmap.clear(addr));
        assert!(!bitmap.clear(addr));
        assert!(!bitmap.test(addr));
        assert!(!bitmap.test(bitmap.heap_limit()));
    }

    #[test]
    #[should_panic]
    fn test_set_out_of_bounds() {
        let bitmap = bitmap(KB);
        bitmap.set(bitmap.heap_limit());
    }

    #[test]
    fn test_visit_marked_range_edges() {
        let bitmap = bitmap(MB);
        let begin = bitmap.heap_begin();
        let marked: Vec<Address> = [0usize, 1, 63, 64, 65, 127, 128, 1000]
            .iter()
            .map(|i| begin.offset(i * SpaceBitmap::ALIGN))
            .collect();
        for addr in &marked {
            bitmap.set(*addr);
        }

        let mut all = vec![];
        bitmap.walk(|addr| all.push(addr));
        assert_eq!(all, marked);

        let mut middle = vec![];
        bitmap.visit_marked_range(
            begin.offset(SpaceBitmap::ALIGN),
            begin.offset(128 * SpaceBitmap::ALIGN),
            |addr| middle.push(addr),
        );
        assert_eq!(middle, marked[1..6].to_vec());
        assert_eq!(bitmap.count(), marked.len());
    }

    #[test]
    fn test_clear_range() {
        let bitmap = bitmap(MB);
        let begin = bitmap.heap_begin();
        for i in 0..512 {
            bitmap.set(begin.offset(i * SpaceBitmap::ALIGN));
        }
        bitmap.clear_range(
            begin.offset(3 * SpaceBitmap::ALIGN),
            begin.offset(500 * SpaceBitmap::ALIGN),
        );
        assert_eq!(bitmap.count(), 3 + 12);
        assert!(bitmap.test(begin.offset(2 * SpaceBitmap::ALIGN)));
        assert!(!bitmap.test(begin.offset(3 * SpaceBitmap::ALIGN)));
        assert!(bitmap.test(begin.offset(500 * SpaceBitmap::ALIGN)));

        bitmap.clear_all().unwrap();
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_union_with() {
        let a = bitmap(MB);
        let b = bitmap(MB);
        let begin = a.heap_begin();
        a.set(begin);
        b.set(begin.offset(8 * SpaceBitmap::ALIGN));
        b.set(begin.offset(4096 * SpaceBitmap::ALIGN));
        a.union_with(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(b.count(), 2);

        // Bitmaps covering a sub-range of another one.
        let inner = SpaceBitmap::new("inner", begin.offset(4096 * SpaceBitmap::ALIGN), 64 * KB)
            .unwrap();
        inner.set(inner.heap_begin().offset(16));
        a.union_with(&inner);
        assert!(a.test(inner.heap_begin().offset(16)));
        assert_eq!(a.count(), 4);
    }

    #[test]
    fn test_sweep_walk() {
        let live = bitmap(MB);
        let mark = bitmap(MB);
        let begin = live.heap_begin();
        for i in 0..1000 {
            live.set(begin.offset(i * SpaceBitmap::ALIGN));
            if i % 3 == 0 {
                mark.set(begin.offset(i * SpaceBitmap::ALIGN));
            }
        }
        let mut garbage = vec![];
        SpaceBitmap::sweep_walk(&live, &mark, begin, live.heap_limit(), |batch| {
            assert!(batch.len() <= SWEEP_BUFFER_SIZE + BITS_PER_INTPTR);
            garbage.extend_from_slice(batch);
        });
        assert_eq!(garbage.len(), 1000 - 334);
        assert!(garbage.iter().all(|addr| !mark.test(*addr) && live.test(*addr)));
    }

    #[test]
    fn test_set_heap_limit() {
        let bitmap = bitmap(MB);
        let begin = bitmap.heap_begin();
        bitmap.set_heap_limit(begin.offset(64 * KB));
        assert_eq!(bitmap.heap_size(), 64 * KB);
        assert!(!bitmap.has_address(begin.offset(64 * KB)));
        bitmap.set_heap_limit(begin.offset(MB));
        assert!(bitmap.has_address(begin.offset(64 * KB)));
    }
}
