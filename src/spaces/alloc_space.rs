use super::continuous_space::ContinuousSpace;
use super::mspace::{MSpace, MoreCore};
use super::GcRetentionPolicy;
use crate::accounting::space_bitmap::SpaceBitmap;
use crate::error::SpaceError;
use crate::locks::Mutex;
use crate::mem_map::*;
use crate::utils::*;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Footprint limit the space created by a zygote split starts out with.
pub const ZYGOTE_ALLOC_SPACE_INITIAL_SIZE: usize = 2 * MB;

static BITMAP_INDEX: AtomicUsize = AtomicUsize::new(0);

/// How much of its reservation an alloc space may use. A space starts constrained (before the
/// zygote forks) and is promoted once to the full reservation; there is no way back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GrowthLimit {
    Constrained(usize),
    Unconstrained,
}

struct AllocState {
    mspace: MSpace,
    growth_limit: GrowthLimit,
}

/// Allocator and bitmaps for a space at `begin`, set up before the space takes its memory.
struct AllocatorParts {
    mspace: MSpace,
    live_bitmap: Arc<SpaceBitmap>,
    mark_bitmap: Arc<SpaceBitmap>,
}

impl AllocatorParts {
    fn new(
        name: &str,
        begin: Address,
        capacity: usize,
        initial_size: usize,
    ) -> Result<AllocatorParts, SpaceError> {
        let mspace = MSpace::new(begin, initial_size).ok_or_else(|| SpaceError::AllocatorInit {
            name: name.to_string(),
        })?;

        let index = BITMAP_INDEX.fetch_add(1, Ordering::Relaxed);
        let create_bitmap = |kind: &str| {
            let bitmap_name = format!("allocspace {} {}-bitmap {}", name, kind, index);
            SpaceBitmap::new(&bitmap_name, begin, capacity)
                .map(Arc::new)
                .map_err(|source| SpaceError::Reservation {
                    name: bitmap_name,
                    size: SpaceBitmap::compute_size(capacity),
                    source,
                })
        };
        Ok(AllocatorParts {
            mspace,
            live_bitmap: create_bitmap("live")?,
            mark_bitmap: create_bitmap("mark")?,
        })
    }
}

/// A space objects are allocated into and freed from.
pub struct AllocSpace {
    pub(crate) c: ContinuousSpace,
    live_bitmap: Arc<SpaceBitmap>,
    mark_bitmap: Arc<SpaceBitmap>,
    /// Serializes everything that touches the allocator.
    lock: Mutex<AllocState>,
}

impl AllocSpace {
    /// Reserves `capacity` bytes and sets up an allocator over it that may use `initial_size`
    /// bytes before the first with-growth allocation. `requested_begin` is a hint; callers that
    /// need a particular address must check `begin()` on the result.
    pub fn create(
        name: &str,
        initial_size: usize,
        growth_limit: usize,
        capacity: usize,
        requested_begin: Option<Address>,
    ) -> Result<AllocSpace, SpaceError> {
        let start = Instant::now();
        log::debug!(
            "Space::create_alloc_space entering {} initial_size={} growth_limit={} capacity={} requested_begin={:?}",
            name,
            formatted_size(initial_size),
            formatted_size(growth_limit),
            formatted_size(capacity),
            requested_begin
        );
        if initial_size > growth_limit || growth_limit > capacity {
            return Err(SpaceError::InvalidSizes {
                name: name.to_string(),
                initial_size,
                growth_limit,
                capacity,
            });
        }
        let mem_map = MemMap::map_anonymous(name, requested_begin, capacity, PROT_NONE)
            .map_err(|source| SpaceError::Reservation {
                name: name.to_string(),
                size: capacity,
                source,
            })?;
        // Cannot overflow: the limit is at most the capacity, which was reserved.
        let growth_limit = mem::page_align(growth_limit);

        let space = Self::from_mem_map(
            name,
            mem_map,
            initial_size,
            GrowthLimit::Constrained(growth_limit),
            GcRetentionPolicy::AlwaysCollect,
        )?;
        log::info!(
            "Space::create_alloc_space exiting ({:?}) {}",
            start.elapsed(),
            space
        );
        Ok(space)
    }

    fn from_mem_map(
        name: &str,
        mem_map: MemMap,
        initial_size: usize,
        growth_limit: GrowthLimit,
        gc_retention_policy: GcRetentionPolicy,
    ) -> Result<AllocSpace, SpaceError> {
        let parts = AllocatorParts::new(name, mem_map.begin(), mem_map.size(), initial_size)?;
        Ok(Self::assemble(name, mem_map, parts, growth_limit, gc_retention_policy))
    }

    fn assemble(
        name: &str,
        mem_map: MemMap,
        parts: AllocatorParts,
        growth_limit: GrowthLimit,
        gc_retention_policy: GcRetentionPolicy,
    ) -> AllocSpace {
        let begin = mem_map.begin();
        debug_assert_eq!(parts.live_bitmap.heap_begin(), begin);
        Self {
            c: ContinuousSpace::new(name, mem_map, begin, gc_retention_policy),
            live_bitmap: parts.live_bitmap,
            mark_bitmap: parts.mark_bitmap,
            lock: Mutex::new(AllocState {
                mspace: parts.mspace,
                growth_limit,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.c.name()
    }

    pub fn begin(&self) -> Address {
        self.c.begin()
    }

    pub fn end(&self) -> Address {
        self.c.end()
    }

    pub fn size(&self) -> usize {
        self.c.size()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.c.contains(addr)
    }

    pub fn region(&self) -> Region {
        self.c.region()
    }

    pub fn gc_retention_policy(&self) -> GcRetentionPolicy {
        self.c.gc_retention_policy()
    }

    pub fn set_gc_retention_policy(&mut self, policy: GcRetentionPolicy) {
        self.c.set_gc_retention_policy(policy)
    }

    pub fn is_alloc_space(&self) -> bool {
        self.gc_retention_policy().is_allocatable()
    }

    pub fn is_zygote_space(&self) -> bool {
        self.gc_retention_policy().is_zygote()
    }

    fn capacity_locked(&self, state: &AllocState) -> usize {
        match state.growth_limit {
            GrowthLimit::Constrained(limit) => limit,
            GrowthLimit::Unconstrained => self.non_growth_limit_capacity(),
        }
    }

    /// The possibly limited capacity: what the space may currently grow to.
    pub fn capacity(&self) -> usize {
        let state = self.lock.lock();
        self.capacity_locked(&state)
    }

    /// The total amount of memory reserved for the space.
    pub fn non_growth_limit_capacity(&self) -> usize {
        self.c.mem_map().size()
    }

    pub fn growth_limit(&self) -> GrowthLimit {
        self.lock.lock().growth_limit
    }

    pub fn live_bitmap(&self) -> &Arc<SpaceBitmap> {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &Arc<SpaceBitmap> {
        &self.mark_bitmap
    }

    /// Swap the live and mark bitmaps of this space, so that everything marked becomes the
    /// live set. Only the bindings move.
    pub fn swap_bitmaps(&mut self) {
        core::mem::swap(&mut self.live_bitmap, &mut self.mark_bitmap);
    }

    /// Allocate `num_bytes` without allowing the footprint to grow past its current limit.
    /// Returns null when the request does not fit; the caller is expected to collect and retry.
    pub fn alloc_without_growth(&self, num_bytes: usize) -> Address {
        let mut state = self.lock.lock();
        state.mspace.malloc(num_bytes, self)
    }

    /// Allocate `num_bytes`, letting the footprint grow up to the growth limit. Returns null
    /// only when the growth limit itself is exhausted.
    pub fn alloc_with_growth(&self, num_bytes: usize) -> Address {
        let mut state = self.lock.lock();
        let max_allowed = self.capacity_locked(&state);
        state.mspace.set_footprint_limit(max_allowed);
        let result = state.mspace.malloc(num_bytes, self);
        // Pin the limit to what was actually used so the next without-growth allocation
        // cannot grow further.
        let footprint = state.mspace.footprint();
        state.mspace.set_footprint_limit(footprint);
        result
    }

    /// Storage used by `obj`, allocator overhead included.
    pub fn allocation_size(&self, obj: Address) -> usize {
        self.lock.lock().mspace.chunk_size(obj)
    }

    fn check_freeable(&self, ptr: Address) {
        assert!(
            self.contains(ptr),
            "{} is not part of {} ({}-{})",
            ptr,
            self.name(),
            self.begin(),
            self.end()
        );
    }

    /// Returns the storage of `ptr` to the allocator; answers the number of bytes released.
    pub fn free(&self, ptr: Address) -> usize {
        if ptr.is_null() {
            return 0;
        }
        self.check_freeable(ptr);
        self.lock.lock().mspace.free(ptr)
    }

    pub fn free_list(&self, ptrs: &[Address]) -> usize {
        for ptr in ptrs {
            self.check_freeable(*ptr);
        }
        self.lock.lock().mspace.bulk_free(ptrs)
    }

    /// Hands the unused pages of free chunks back to the system. Sizes are unaffected.
    pub fn trim(&self) -> usize {
        let state = self.lock.lock();
        let mut reclaimed = 0;
        state.mspace.inspect_all(|start, end, used| {
            reclaimed += madvise_unused(self.c.mem_map(), start, end, used);
        });
        log::debug!(
            "{}: trim reclaimed {}",
            self.name(),
            formatted_size(reclaimed)
        );
        reclaimed
    }

    /// Calls `visitor(start, end, used_bytes)` for every allocator chunk in address order;
    /// `used_bytes == 0` marks a free chunk. The visitor must not allocate from or free into
    /// this space.
    pub fn walk(&self, visitor: impl FnMut(Address, Address, usize)) {
        self.lock.lock().mspace.inspect_all(visitor)
    }

    /// Returns the number of bytes the allocator may currently obtain from the reservation.
    pub fn get_footprint_limit(&self) -> usize {
        self.lock.lock().mspace.footprint_limit()
    }

    /// Sets how far the allocator may grow before a with-growth allocation is needed. The
    /// limit is kept between the current size and the capacity.
    pub fn set_footprint_limit(&self, limit: usize) {
        let mut state = self.lock.lock();
        let limit = limit.max(self.size()).min(self.capacity_locked(&state));
        state.mspace.set_footprint_limit(limit);
    }

    /// Lowers or raises the growth limit while the space is still constrained. Returns false
    /// once the limit has been cleared.
    pub fn set_growth_limit(&self, growth_limit: usize) -> bool {
        let mut state = self.lock.lock();
        if state.growth_limit == GrowthLimit::Unconstrained {
            log::warn!(
                "{}: growth limit already cleared, ignoring new limit {}",
                self.name(),
                formatted_size(growth_limit)
            );
            return false;
        }
        let growth_limit = mem::page_align(
            growth_limit
                .min(self.non_growth_limit_capacity())
                .max(self.size()),
        );
        state.growth_limit = GrowthLimit::Constrained(growth_limit);
        if state.mspace.footprint_limit() > growth_limit {
            state.mspace.set_footprint_limit(growth_limit);
        }
        true
    }

    /// Removes the fork time growth limit on capacity, allowing the space to use all of its
    /// reservation. Returns false if the limit was already cleared.
    pub fn clear_growth_limit(&self) -> bool {
        let mut state = self.lock.lock();
        match state.growth_limit {
            GrowthLimit::Unconstrained => {
                log::warn!("{}: growth limit already cleared", self.name());
                false
            }
            GrowthLimit::Constrained(limit) => {
                state.growth_limit = GrowthLimit::Unconstrained;
                log::info!(
                    "{}: growth limit cleared, capacity {} -> {}",
                    self.name(),
                    formatted_size(limit),
                    formatted_size(self.non_growth_limit_capacity())
                );
                true
            }
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.lock.lock().mspace.bytes_allocated()
    }

    pub fn objects_allocated(&self) -> usize {
        self.lock.lock().mspace.objects_allocated()
    }

    /// Turn this space into a zygote space and return a new alloc space covering the unused rest
    /// of the reservation. Allocation into `self` must stop once this returns. On error `self`
    /// is left as it was.
    pub fn create_zygote_space(&mut self, alloc_space_name: &str) -> Result<AllocSpace, SpaceError> {
        let end = self.end();
        let size = self.size();
        let tail_capacity = self.non_growth_limit_capacity() - size;
        if tail_capacity == 0 {
            return Err(SpaceError::AllocatorInit {
                name: alloc_space_name.to_string(),
            });
        }
        debug_assert!(end.is_page_aligned());

        let (zygote_growth_limit, growth_limit) = match self.lock.get_mut().growth_limit {
            GrowthLimit::Constrained(limit) => (
                GrowthLimit::Constrained(size),
                GrowthLimit::Constrained(limit.saturating_sub(size)),
            ),
            GrowthLimit::Unconstrained => (GrowthLimit::Unconstrained, GrowthLimit::Unconstrained),
        };
        let initial_size = match growth_limit {
            GrowthLimit::Constrained(limit) => ZYGOTE_ALLOC_SPACE_INITIAL_SIZE.min(limit),
            GrowthLimit::Unconstrained => ZYGOTE_ALLOC_SPACE_INITIAL_SIZE.min(tail_capacity),
        };
        // Everything that can fail happens before `self` changes.
        let parts = AllocatorParts::new(alloc_space_name, end, tail_capacity, initial_size)?;
        self.trim();
        let tail = self
            .c
            .mem_map_mut()
            .remap_at_end(end, alloc_space_name, PROT_NONE)
            .map_err(|source| SpaceError::Reservation {
                name: alloc_space_name.to_string(),
                size: tail_capacity,
                source,
            })?;

        let state = self.lock.get_mut();
        state.growth_limit = zygote_growth_limit;
        state.mspace.set_footprint_limit(size);
        self.live_bitmap.set_heap_limit(end);
        self.mark_bitmap.set_heap_limit(end);
        self.c.set_gc_retention_policy(GcRetentionPolicy::FullCollect);
        let zygote_name = format!("{}-zygote-transformed", self.name());
        self.c.rename(zygote_name);

        let alloc_space = Self::assemble(
            alloc_space_name,
            tail,
            parts,
            growth_limit,
            GcRetentionPolicy::AlwaysCollect,
        );
        log::info!("Creating new alloc space {}", alloc_space);
        log::info!("Zygote space {}", self);
        Ok(alloc_space)
    }
}

impl MoreCore for AllocSpace {
    fn more_core(&self, increment: usize) -> Address {
        let orig_end = self.end();
        if increment == 0 {
            return orig_end;
        }
        let new_end = orig_end.offset(increment);
        assert!(
            new_end <= self.c.mem_map().end(),
            "new end {} is beyond the reservation of {} ending at {}",
            new_end,
            self.name(),
            self.c.mem_map().end()
        );
        log::debug!("{}: MoreCore {}", self.name(), formatted_size(increment));
        if let Err(err) = self
            .c
            .mem_map()
            .protect(orig_end, increment, PROT_READ | PROT_WRITE)
        {
            log::error!("{}: failed to commit {}: {}", self.name(), formatted_size(increment), err);
            return Address::null();
        }
        self.c.set_end(new_end);
        orig_end
    }
}

/// Chunk visitor for `trim`: advises the whole pages of free chunks away and answers the
/// number of bytes released.
fn madvise_unused(mem_map: &MemMap, start: Address, end: Address, used_bytes: usize) -> usize {
    if used_bytes != 0 {
        return 0;
    }
    let page = os::page_size();
    let start = round_up(start.to_usize(), page);
    let end = round_down(end.to_usize(), page);
    if end <= start {
        return 0;
    }
    let length = end - start;
    match mem_map.madvise_dontneed(Address::from(start), length) {
        Ok(()) => length,
        Err(err) => {
            log::warn!("madvise failed during heap trim: {}", err);
            0
        }
    }
}

impl fmt::Display for AllocSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} begin={} end={} size={} capacity={} non_growth_limit_capacity={} policy={}",
            self.name(),
            self.begin(),
            self.end(),
            formatted_size(self.size()),
            formatted_size(self.capacity()),
            formatted_size(self.non_growth_limit_capacity()),
            self.gc_retention_policy()
        )
    }
}
