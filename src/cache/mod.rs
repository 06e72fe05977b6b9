//! Bounded caches for search bookkeeping

mod lru;

pub use lru::LruSet;
