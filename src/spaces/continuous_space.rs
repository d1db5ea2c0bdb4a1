use super::GcRetentionPolicy;
use crate::mem_map::*;
use crate::utils::*;
use core::sync::atomic::{AtomicUsize, Ordering};

/// State shared by every space kind: a name, the reservation backing it and the part of the
/// reservation that is currently filled.
pub struct ContinuousSpace {
    name: String,
    mem_map: MemMap,
    /// Always equals `mem_map.begin()`.
    begin: Address,
    end: AtomicUsize,
    gc_retention_policy: GcRetentionPolicy,
}

impl ContinuousSpace {
    pub(crate) fn new(
        name: &str,
        mem_map: MemMap,
        end: Address,
        gc_retention_policy: GcRetentionPolicy,
    ) -> Self {
        let begin = mem_map.begin();
        assert!(begin <= end && end <= mem_map.end());
        Self {
            name: name.to_string(),
            mem_map,
            begin,
            end: AtomicUsize::new(end.to_usize()),
            gc_retention_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    /// Address at which the space begins.
    pub fn begin(&self) -> Address {
        self.begin
    }

    /// Address at which the space ends, which may vary as the space is filled.
    pub fn end(&self) -> Address {
        Address::from(self.end.load(Ordering::Acquire))
    }

    pub(crate) fn set_end(&self, addr: Address) {
        debug_assert!(self.begin <= addr && addr <= self.mem_map.end());
        self.end.store(addr.to_usize(), Ordering::Release);
    }

    pub fn size(&self) -> usize {
        self.end().offset_from(self.begin)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.begin <= addr && addr < self.end()
    }

    pub fn region(&self) -> Region {
        Region::new(self.begin, self.end())
    }

    pub fn mem_map(&self) -> &MemMap {
        &self.mem_map
    }

    pub(crate) fn mem_map_mut(&mut self) -> &mut MemMap {
        &mut self.mem_map
    }

    pub fn gc_retention_policy(&self) -> GcRetentionPolicy {
        self.gc_retention_policy
    }

    pub(crate) fn set_gc_retention_policy(&mut self, policy: GcRetentionPolicy) {
        self.gc_retention_policy = policy;
    }
}
