//! Test doubles for stiltctl.
//!
//! - [`InMemoryStore`] - transactional store with skip-locked dequeue and
//!   scene row locks
//! - [`MockEngine`] and [`MockCropper`] - scripted external tools
//! - [`fixtures`] - domain configs and seeded meteorology archives

pub mod fixtures;
pub mod mock;
pub mod store;

pub use mock::{CropRecord, EngineBehavior, MockCropper, MockEngine};
pub use store::{InMemoryStore, InMemoryTransaction};
