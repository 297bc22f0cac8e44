//! Kronos worker core.
//!
//! A host-agnostic service worker for the Kronos student app: versioned
//! offline caching with a network-first read policy, local notification
//! scheduling, and the install/activate lifecycle that swaps cache versions.
//! The browser platform is reached through the traits in [`platform`]; the
//! host drives a [`ServiceWorker`] by dispatching events to it.
//!
//! The [`api`] module holds clients for the app's managed database and its
//! timetable screenshot parser.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod platform;
pub mod scheduler;
pub mod wait_until;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use cache::{CacheManager, CacheStorage, FetchOutcome};
pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use lifecycle::{LifecycleController, LifecycleEvent, Registration, WorkerPhase};
pub use platform::Platform;
pub use scheduler::NotificationScheduler;
pub use wait_until::WaitUntil;
pub use worker::{EventOutcome, ServiceWorker, WorkerEvent};
