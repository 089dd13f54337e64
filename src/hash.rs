//! Hash builder selection for the cache indexes and shard routing.

#[cfg(feature = "foldhash")]
pub(crate) use foldhash::fast::RandomState;

#[cfg(all(feature = "ahash", not(feature = "foldhash")))]
pub(crate) use ahash::RandomState;

#[cfg(all(not(feature = "ahash"), not(feature = "foldhash")))]
pub(crate) use std::collections::hash_map::RandomState;
