//! Out-of-band inspection and override of block markers.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{info, warn};

use super::keys::KeySpace;
use crate::error::Result;
use crate::store::{KeyTtl, Procedure, WindowStore};

/// Inspects and overrides the block markers written by a
/// [`WindowLimiter`](super::WindowLimiter).
///
/// Every change goes straight to the store, so it is visible to the next
/// admission check from any process sharing the same key space.
pub struct BlockController<S: ?Sized> {
    store: Arc<S>,
    keys: KeySpace,
    shift_ttl: Procedure,
}

impl<S: WindowStore + ?Sized> BlockController<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            shift_ttl: Procedure::shift_ttl(),
        }
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    /// Whether the key is blocked, treating store failures as "not blocked".
    ///
    /// This fails open: while the store is unreachable every key is reported
    /// as unblocked. Callers that need strict enforcement should use
    /// [`get_block_status`](Self::get_block_status) instead.
    pub async fn is_blocked_fail_open(&self, key: &str) -> bool {
        match self.get_block_status(key).await {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(key = %key, error = %e, "Block status unavailable, failing open");
                false
            }
        }
    }

    /// Whether the key is currently blocked.
    pub async fn get_block_status(&self, key: &str) -> Result<bool> {
        self.store.exists(&self.keys.marker(key)).await
    }

    /// Remove the block marker. Clearing an unblocked key is a no-op.
    pub async fn clear_block_status(&self, key: &str) -> Result<()> {
        self.store.delete(&self.keys.marker(key)).await?;
        info!(key = %key, "Block cleared");
        Ok(())
    }

    /// Block the key for `duration`, replacing any existing block.
    pub async fn set_block(&self, key: &str, duration: Duration) -> Result<()> {
        self.store
            .set_with_expiry(&self.keys.marker(key), duration)
            .await?;
        info!(key = %key, duration = ?duration, "Block set");
        Ok(())
    }

    /// Extend (or, for a negative delta, shorten) an existing block.
    ///
    /// Works in whole seconds; any sub-second part of `delta` is dropped.
    /// Shortening past zero removes the block. Returns `false` without
    /// touching anything if the key is not blocked or its block never
    /// expires.
    pub async fn add_block_time(&self, key: &str, delta: TimeDelta) -> Result<bool> {
        let marker = self.keys.marker(key);
        let moved = self
            .store
            .run_atomic(&self.shift_ttl, &[marker.as_str()], &[delta.num_seconds()])
            .await?;

        let moved = moved == 1;
        if moved {
            info!(key = %key, delta_secs = delta.num_seconds(), "Block time adjusted");
        }
        Ok(moved)
    }

    /// Remaining block time.
    ///
    /// [`KeyTtl::Missing`] means the key is not blocked; [`KeyTtl::Persistent`]
    /// means it is blocked with no expiry.
    pub async fn get_block_ttl(&self, key: &str) -> Result<KeyTtl> {
        self.store.ttl(&self.keys.marker(key)).await
    }
}

impl<S: ?Sized> Clone for BlockController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            shift_ttl: self.shift_ttl.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use tokio_test::{assert_err, assert_ok};

    fn controller() -> (BlockController<MemoryStore>, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::starting_at(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let controller = BlockController::new(store.clone(), KeySpace::new("test", false));
        (controller, store, clock)
    }

    #[tokio::test]
    async fn test_clear_then_status_is_unblocked() {
        let (controller, _, _) = controller();
        controller.set_block("foo", Duration::from_secs(10)).await.unwrap();
        assert!(controller.get_block_status("foo").await.unwrap());

        controller.clear_block_status("foo").await.unwrap();
        assert!(!controller.get_block_status("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (controller, _, _) = controller();
        assert_ok!(controller.clear_block_status("never-blocked").await);
        assert_ok!(controller.clear_block_status("never-blocked").await);
    }

    #[tokio::test]
    async fn test_set_block_reports_ttl() {
        let (controller, _, _) = controller();
        controller.set_block("bar", Duration::from_secs(100)).await.unwrap();

        let ttl = controller.get_block_ttl("bar").await.unwrap();
        assert_eq!(ttl, KeyTtl::Expires(Duration::from_secs(100)));
    }

    #[tokio::test]
    async fn test_sequential_deltas_accumulate() {
        let (controller, _, _) = controller();
        controller.set_block("bar", Duration::from_secs(100)).await.unwrap();

        assert!(controller.add_block_time("bar", TimeDelta::seconds(100)).await.unwrap());
        assert!(controller.add_block_time("bar", TimeDelta::seconds(-50)).await.unwrap());

        let ttl = controller.get_block_ttl("bar").await.unwrap();
        assert_eq!(ttl, KeyTtl::Expires(Duration::from_secs(150)));
    }

    #[tokio::test]
    async fn test_add_block_time_without_marker_is_noop() {
        let (controller, store, _) = controller();

        let moved = controller.add_block_time("ghost", TimeDelta::seconds(100)).await.unwrap();
        assert!(!moved);
        assert!(!controller.get_block_status("ghost").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_shortening_past_zero_unblocks() {
        let (controller, _, _) = controller();
        controller.set_block("baz", Duration::from_secs(30)).await.unwrap();

        controller.add_block_time("baz", TimeDelta::seconds(-60)).await.unwrap();
        assert!(!controller.get_block_status("baz").await.unwrap());
        assert_eq!(controller.get_block_ttl("baz").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_ttl_sentinels_are_distinct() {
        let (controller, store, _) = controller();
        assert_eq!(controller.get_block_ttl("nobody").await.unwrap(), KeyTtl::Missing);

        store.set_persistent(&controller.key_space().marker("forever"));
        assert_eq!(controller.get_block_ttl("forever").await.unwrap(), KeyTtl::Persistent);
        assert!(!controller.add_block_time("forever", TimeDelta::seconds(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_block_expires_naturally() {
        let (controller, _, clock) = controller();
        controller.set_block("temp", Duration::from_millis(1500)).await.unwrap();

        clock.advance(Duration::from_secs(1));
        assert!(controller.get_block_status("temp").await.unwrap());

        clock.advance(Duration::from_millis(500));
        assert!(!controller.get_block_status("temp").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_open_only_on_named_variant() {
        let (controller, store, _) = controller();
        controller.set_block("foo", Duration::from_secs(10)).await.unwrap();
        assert!(controller.is_blocked_fail_open("foo").await);

        store.set_unavailable(true);
        assert!(!controller.is_blocked_fail_open("foo").await);
        let err = assert_err!(controller.get_block_status("foo").await);
        assert!(err.is_unavailable());
        assert_err!(controller.set_block("foo", Duration::from_secs(1)).await);
        assert_err!(controller.clear_block_status("foo").await);
    }
}
