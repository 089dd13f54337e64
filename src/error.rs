//! Error types for the CAR caches.

use thiserror::Error;

/// The failure half of a cache read that had to call the value producer.
///
/// Nothing is cached and no list is touched when this is returned.
#[derive(Debug, Error)]
pub enum CarError<E> {
    /// The value producer reported a hard failure.
    #[error("value producer failed")]
    Compute(#[source] E),
}

impl<E> CarError<E> {
    /// Unwrap the producer's own error.
    pub fn into_inner(self) -> E {
        match self {
            CarError::Compute(e) => e,
        }
    }
}

/// Reasons a [CarCacheBuilder](crate::carcache::CarCacheBuilder) can refuse to build.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CarBuildError {
    /// No size was set, or the size was zero.
    #[error("cache size must be set and greater than zero")]
    ZeroCapacity,
    /// The size leaves no room to count the ghost lists, which remember up
    /// to twice as many keys.
    #[error("cache size {max} is too large, at most usize::MAX / 2 entries are supported")]
    TooLarge {
        /// Requested cache size.
        max: usize,
    },
    /// Every shard needs room for at least one entry.
    #[error("{shards} shards can not share a cache of {max} entries")]
    TooManyShards {
        /// Requested number of shards.
        shards: usize,
        /// Requested cache size.
        max: usize,
    },
}
