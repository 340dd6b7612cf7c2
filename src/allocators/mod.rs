//! The [`ForestMalloc`] allocator.

pub mod forest_malloc;

pub use forest_malloc::ForestMalloc;
