//! Concar - a Concurrently Readable Clock with Adaptive Replacement cache
//!
//! [CAR](https://www.usenix.org/conference/fast-04/car-clock-adaptive-replacement)
//! is a page replacement policy with the scan resistance and self tuning of ARC,
//! where hits touch nothing but a reference bit. That makes a hit cheap enough
//! to serve under a shared lock, so many readers proceed in parallel while a
//! single writer at a time decides what to admit and what to evict.
//!
//! The cache is read-through: you hand it a key and a value producer, and the
//! producer is only called when the key is missing. While a miss is in flight,
//! other misses wait for it, so a key is produced at most once.
//!
//! # Features
//!
//! * `asynch` - an async cache whose producer returns a future
//! * `foldhash` - use the foldhash crate for key hashing
//! * `ahash` - use the cpu accelerated ahash crate for key hashing
//! * `serde` - load cache configuration with serde
//!
//! By default `asynch` and `foldhash` are enabled.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

pub mod carcache;
pub mod error;
mod hash;

pub use carcache::{CarCache, CarCacheBuilder, Compute};
