//! Versioned response cache for offline access.
//!
//! `CacheStorage` holds every cache version of the origin in memory; a
//! `CacheManager` reads and writes one version with a network-first policy.
//! A fresh version is filled from the precache manifest at install, then
//! refreshed opportunistically by every successful same-origin GET.

pub mod manager;
pub mod storage;

pub use manager::{CacheManager, FetchOutcome};
pub use storage::{Cache, CacheStorage};
