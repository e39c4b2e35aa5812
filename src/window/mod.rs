//! Sliding-window admission control and block management.

mod block;
mod keys;
mod limiter;

pub use block::BlockController;
pub use keys::KeySpace;
pub use limiter::{Verdict, WindowLimiter};
