//! Sliding-window admission check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::block::BlockController;
use super::keys::KeySpace;
use crate::clock::{Clock, SystemClock};
use crate::config::WindowConfig;
use crate::error::Result;
use crate::store::{Procedure, WindowStore};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The event was admitted and recorded.
    Allowed,
    /// The key is blocked; nothing was recorded.
    Blocked,
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked)
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Allows at most `capacity` events per key within any rolling window,
/// blocking keys that go over.
///
/// The limiter keeps no state of its own beyond configuration: each check
/// is one atomic procedure against the shared store, so any number of
/// limiter instances in any number of processes can check the same keys.
pub struct WindowLimiter<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    capacity: u64,
    window: Duration,
    block: Duration,
    admit: Procedure,
}

impl<S: WindowStore + ?Sized> WindowLimiter<S> {
    /// Create a limiter over `store`.
    ///
    /// Fails with a configuration error if the capacity is zero, the
    /// window or block is shorter than a second, or the prefix is empty.
    pub fn new(store: Arc<S>, config: &WindowConfig) -> Result<Self> {
        config.validate()?;

        debug!(
            capacity = config.capacity,
            window_secs = config.window_secs,
            block_secs = config.block_secs,
            prefix = %config.prefix,
            "Creating window limiter"
        );

        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            keys: KeySpace::from(config),
            capacity: config.capacity,
            window: config.window(),
            block: config.block(),
            admit: Procedure::admit(),
        })
    }

    /// Replace the clock used to timestamp events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record an event for `key` unless doing so would exceed the rate.
    ///
    /// Returns [`Verdict::Blocked`] if the key is already blocked, or if
    /// this event is the `capacity + 1`-th within one window, in which case
    /// the key's history is discarded and it is blocked for the configured
    /// block duration.
    pub async fn admit_or_block(&self, key: &str) -> Result<Verdict> {
        let events = self.keys.events(key);
        let marker = self.keys.marker(key);
        let now = self.clock.now_secs();

        trace!(key = %key, now = now, "Checking window");

        let reply = self
            .store
            .run_atomic(
                &self.admit,
                &[events.as_str(), marker.as_str()],
                &[
                    clamp_i64(self.capacity),
                    clamp_i64(self.window.as_secs()),
                    clamp_i64(now),
                    clamp_i64(self.block.as_secs()),
                ],
            )
            .await?;

        if reply == 1 {
            debug!(key = %key, "Key blocked");
            Ok(Verdict::Blocked)
        } else {
            Ok(Verdict::Allowed)
        }
    }

    /// A block controller sharing this limiter's store and key space.
    pub fn controller(&self) -> BlockController<S> {
        BlockController::new(Arc::clone(&self.store), self.keys.clone())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn block_duration(&self) -> Duration {
        self.block
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }
}

/// Procedure arguments are signed; validated configs never reach the clamp.
fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
