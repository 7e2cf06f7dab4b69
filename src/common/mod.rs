//! Shared primitives: value types, caches and measurement points.

mod footprint;
mod hasher;
mod lru;
mod types;

pub use footprint::MemoryFootprint;
pub use hasher::{CachedHasher, FixedInput, HasherPool};
pub use lru::LruCache;
pub use types::{AccountInfo, Address, Balance, Hash, Key, Nonce, Value};
