//! Timewindow - Distributed Sliding-Window Admission Control
//!
//! This crate decides, per call, whether a key has exceeded `capacity`
//! events within a rolling window. Keys that go over are blocked for a
//! cool-down period, and that block can be inspected, extended, shortened
//! or lifted out of band. All state lives in a shared store (Redis), and
//! every multi-step update runs there as one atomic script, so any number
//! of processes can enforce the same limits.

pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod window;

pub use error::{Result, TimeWindowError};
pub use store::{KeyTtl, MemoryStore, RedisStore, WindowStore};
pub use window::{BlockController, KeySpace, Verdict, WindowLimiter};
