//! Side tables that record which addresses of a space hold objects.

pub mod space_bitmap;
