pub mod alloc_space;
pub mod continuous_space;
pub mod image;
pub mod image_space;
pub(crate) mod mspace;

use crate::accounting::space_bitmap::SpaceBitmap;
use crate::utils::*;
use alloc_space::AllocSpace;
use core::fmt;
use image_space::ImageSpace;
use std::sync::Arc;

pub use mspace::CHUNK_OVERHEAD;

/// When the collector sweeps a space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GcRetentionPolicy {
    /// Never swept; objects live as long as the process.
    NeverCollect,
    /// Swept by every collection.
    AlwaysCollect,
    /// Swept only by full collections. This is what makes a space a zygote space.
    FullCollect,
}

impl GcRetentionPolicy {
    pub fn is_allocatable(self) -> bool {
        self != GcRetentionPolicy::NeverCollect
    }

    pub fn is_zygote(self) -> bool {
        self == GcRetentionPolicy::FullCollect
    }
}

impl fmt::Display for GcRetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            GcRetentionPolicy::NeverCollect => "NeverCollect",
            GcRetentionPolicy::AlwaysCollect => "AlwaysCollect",
            GcRetentionPolicy::FullCollect => "FullCollect",
        };
        f.write_str(name)
    }
}

/// A named, bounded region of the managed heap.
pub enum Space {
    Alloc(AllocSpace),
    Image(ImageSpace),
}

impl Space {
    pub fn name(&self) -> &str {
        match self {
            Space::Alloc(space) => space.name(),
            Space::Image(space) => space.name(),
        }
    }

    pub fn begin(&self) -> Address {
        match self {
            Space::Alloc(space) => space.begin(),
            Space::Image(space) => space.begin(),
        }
    }

    pub fn end(&self) -> Address {
        match self {
            Space::Alloc(space) => space.end(),
            Space::Image(space) => space.end(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Space::Alloc(space) => space.size(),
            Space::Image(space) => space.size(),
        }
    }

    /// Maximum size of the space.
    pub fn capacity(&self) -> usize {
        match self {
            Space::Alloc(space) => space.capacity(),
            Space::Image(space) => space.capacity(),
        }
    }

    /// Size of the space without a limit on its growth.
    pub fn non_growth_limit_capacity(&self) -> usize {
        match self {
            Space::Alloc(space) => space.non_growth_limit_capacity(),
            Space::Image(space) => space.capacity(),
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        match self {
            Space::Alloc(space) => space.contains(addr),
            Space::Image(space) => space.contains(addr),
        }
    }

    pub fn region(&self) -> Region {
        match self {
            Space::Alloc(space) => space.region(),
            Space::Image(space) => space.region(),
        }
    }

    pub fn gc_retention_policy(&self) -> GcRetentionPolicy {
        match self {
            Space::Alloc(space) => space.gc_retention_policy(),
            Space::Image(_) => GcRetentionPolicy::NeverCollect,
        }
    }

    /// Image spaces are never collected; asking for anything else is a programming error.
    pub fn set_gc_retention_policy(&mut self, policy: GcRetentionPolicy) {
        match self {
            Space::Alloc(space) => space.set_gc_retention_policy(policy),
            Space::Image(space) => assert_eq!(
                policy,
                GcRetentionPolicy::NeverCollect,
                "image space {} cannot be collected",
                space.name()
            ),
        }
    }

    pub fn is_alloc_space(&self) -> bool {
        match self {
            Space::Alloc(space) => space.is_alloc_space(),
            Space::Image(_) => false,
        }
    }

    pub fn is_image_space(&self) -> bool {
        matches!(self, Space::Image(_))
    }

    pub fn is_zygote_space(&self) -> bool {
        match self {
            Space::Alloc(space) => space.is_zygote_space(),
            Space::Image(_) => false,
        }
    }

    pub fn live_bitmap(&self) -> &Arc<SpaceBitmap> {
        match self {
            Space::Alloc(space) => space.live_bitmap(),
            Space::Image(space) => space.live_bitmap(),
        }
    }

    pub fn mark_bitmap(&self) -> &Arc<SpaceBitmap> {
        match self {
            Space::Alloc(space) => space.mark_bitmap(),
            Space::Image(space) => space.mark_bitmap(),
        }
    }

    pub fn as_alloc_space(&self) -> Option<&AllocSpace> {
        match self {
            Space::Alloc(space) => Some(space),
            Space::Image(_) => None,
        }
    }

    pub fn as_alloc_space_mut(&mut self) -> Option<&mut AllocSpace> {
        match self {
            Space::Alloc(space) => Some(space),
            Space::Image(_) => None,
        }
    }

    pub fn as_image_space(&self) -> Option<&ImageSpace> {
        match self {
            Space::Image(space) => Some(space),
            Space::Alloc(_) => None,
        }
    }
}

impl From<AllocSpace> for Space {
    fn from(space: AllocSpace) -> Self {
        Space::Alloc(space)
    }
}

impl From<ImageSpace> for Space {
    fn from(space: ImageSpace) -> Self {
        Space::Image(space)
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Space::Alloc(space) => write!(f, "AllocSpace[{}]", space),
            Space::Image(space) => write!(f, "ImageSpace[{}]", space),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_policy_classification() {
        assert!(!GcRetentionPolicy::NeverCollect.is_allocatable());
        assert!(!GcRetentionPolicy::NeverCollect.is_zygote());
        assert!(GcRetentionPolicy::AlwaysCollect.is_allocatable());
        assert!(!GcRetentionPolicy::AlwaysCollect.is_zygote());
        assert!(GcRetentionPolicy::FullCollect.is_allocatable());
        assert!(GcRetentionPolicy::FullCollect.is_zygote());
        assert_eq!(GcRetentionPolicy::FullCollect.to_string(), "FullCollect");
    }

    #[test]
    fn test_space_dispatch() {
        let mut space: Space = AllocSpace::create("dispatch", MB, 2 * MB, 4 * MB, None)
            .unwrap()
            .into();
        assert!(space.is_alloc_space());
        assert!(!space.is_image_space());
        assert!(!space.is_zygote_space());
        assert_eq!(space.capacity(), 2 * MB);
        assert_eq!(space.non_growth_limit_capacity(), 4 * MB);
        assert!(space.as_image_space().is_none());

        // A never-collected alloc space is no longer allocatable.
        space.set_gc_retention_policy(GcRetentionPolicy::NeverCollect);
        assert!(!space.is_alloc_space());
        space.set_gc_retention_policy(GcRetentionPolicy::FullCollect);
        assert!(space.is_alloc_space());
        assert!(space.is_zygote_space());

        let obj = space.as_alloc_space().unwrap().alloc_without_growth(16);
        assert!(space.contains(space.begin()));
        assert!(space.contains(obj));
        assert!(!space.contains(space.end()));
        assert!(space.to_string().starts_with("AllocSpace[dispatch"));

        space.as_alloc_space_mut().unwrap().swap_bitmaps();
        assert!(!Arc::ptr_eq(space.live_bitmap(), space.mark_bitmap()));
    }
}
