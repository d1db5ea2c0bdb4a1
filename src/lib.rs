//! Heap spaces for a tracing garbage collector: growable allocation spaces carved out of a
//! single reservation, read-only image spaces loaded from disk, and the bitmaps the collector
//! uses to track which of their objects are live.

pub mod accounting;
pub mod error;
pub mod locks;
pub mod mem_map;
pub mod spaces;
pub mod utils;

pub use accounting::space_bitmap::SpaceBitmap;
pub use error::SpaceError;
pub use locks::{mutator_lock, MutatorAccess, MutatorLock};
pub use spaces::alloc_space::{AllocSpace, GrowthLimit};
pub use spaces::image::{ImageHeader, ImageWriter};
pub use spaces::image_space::ImageSpace;
pub use spaces::{GcRetentionPolicy, Space};
pub use utils::Address;

/// Installs `simple_logger` at `level`. Does nothing if a logger is already installed.
pub fn init_logging(level: log::Level) {
    let _ = simple_logger::init_with_level(level);
}
