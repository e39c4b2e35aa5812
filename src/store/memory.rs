//! In-process window store.
//!
//! Implements the same list, expiry and procedure semantics as the Redis
//! scripts, with every call serialized behind a single lock. Time comes from
//! a [`Clock`] so expiry can be driven deterministically in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KeyTtl, Procedure, ProcedureKind, WindowStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TimeWindowError};

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<i64>),
    Flag,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Epoch milliseconds at which the entry disappears.
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    unavailable: bool,
}

impl State {
    /// Look up a key, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn list_len(&mut self, key: &str, now: u64) -> Result<usize> {
        match self.live(key, now) {
            None => Ok(0),
            Some(Entry { value: Value::List(list), .. }) => Ok(list.len()),
            Some(_) => Err(wrong_type()),
        }
    }

    fn list_mut(&mut self, key: &str, now: u64) -> Result<&mut VecDeque<i64>> {
        if self.live(key, now).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry { value: Value::List(list), .. }) => Ok(list),
            _ => Err(wrong_type()),
        }
    }

    /// Set the key's expiry in whole seconds; non-positive values delete it.
    fn expire(&mut self, key: &str, secs: i64, now: u64) -> bool {
        if self.live(key, now).is_none() {
            return false;
        }
        if secs <= 0 {
            self.entries.remove(key);
        } else if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(expiry_after(now, secs));
        }
        true
    }

    /// Remaining lifetime in milliseconds, using the -2 / -1 sentinels.
    fn pttl(&mut self, key: &str, now: u64) -> i64 {
        match self.live(key, now) {
            None => -2,
            Some(Entry { expires_at: None, .. }) => -1,
            Some(Entry { expires_at: Some(at), .. }) => {
                i64::try_from(at.saturating_sub(now)).unwrap_or(i64::MAX)
            }
        }
    }

    /// Remaining lifetime in seconds, rounded the way the store rounds.
    fn ttl_secs(&mut self, key: &str, now: u64) -> i64 {
        match self.pttl(key, now) {
            ms if ms < 0 => ms,
            ms => ms.saturating_add(500) / 1000,
        }
    }

    fn admit(&mut self, keys: &[&str], args: &[i64], now_ms: u64) -> Result<i64> {
        let ([events, marker], [capacity, window, now, block]) = (keys, args) else {
            return Err(wrong_arity(ProcedureKind::Admit));
        };
        if *window <= 0 || *block <= 0 {
            return Err(invalid_expire());
        }
        let capacity = usize::try_from(*capacity).unwrap_or(0);

        if self.live(marker, now_ms).is_some() {
            return Ok(1);
        }

        let len = self.list_len(events, now_ms)?;
        if len < capacity {
            self.list_mut(events, now_ms)?.push_front(*now);
            self.expire(events, *window, now_ms);
            return Ok(0);
        }

        let list = self.list_mut(events, now_ms)?;
        list.truncate(capacity);
        let oldest = list.back().copied().unwrap_or(*now);
        if now.saturating_sub(oldest) < *window {
            self.entries.remove(*events);
            self.entries.insert(
                marker.to_string(),
                Entry {
                    value: Value::Flag,
                    expires_at: Some(expiry_after(now_ms, *block)),
                },
            );
            return Ok(1);
        }

        self.expire(events, *window, now_ms);
        let list = self.list_mut(events, now_ms)?;
        list.pop_back();
        list.push_front(*now);
        Ok(0)
    }

    fn shift_ttl(&mut self, keys: &[&str], args: &[i64], now_ms: u64) -> Result<i64> {
        let ([marker], [delta]) = (keys, args) else {
            return Err(wrong_arity(ProcedureKind::ShiftTtl));
        };

        let ttl = self.ttl_secs(marker, now_ms);
        if ttl > 0 {
            self.expire(marker, ttl.saturating_add(*delta), now_ms);
            return Ok(1);
        }
        Ok(0)
    }
}

/// Epoch millis `secs` seconds after `now`, clamped at the end of time.
fn expiry_after(now: u64, secs: i64) -> u64 {
    let secs = u64::try_from(secs).unwrap_or(0);
    now.saturating_add(secs.saturating_mul(1000))
}

fn wrong_type() -> TimeWindowError {
    TimeWindowError::StoreExecution(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn wrong_arity(kind: ProcedureKind) -> TimeWindowError {
    TimeWindowError::StoreExecution(format!(
        "wrong number of keys or arguments for procedure '{}'",
        kind.name()
    ))
}

fn invalid_expire() -> TimeWindowError {
    TimeWindowError::StoreExecution("invalid expire time".to_string())
}

/// A window store living in process memory.
///
/// Clones share the same data. Useful as a store double in tests and for
/// single-process deployments.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Store a flag with no expiry.
    pub fn set_persistent(&self, key: &str) {
        self.state.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Flag,
                expires_at: None,
            },
        );
    }

    /// Current contents of a list key, most recent first.
    pub fn list(&self, key: &str) -> Vec<i64> {
        let now = self.clock.now_millis();
        match self.state.lock().live(key, now) {
            Some(Entry { value: Value::List(list), .. }) => list.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        state
            .entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, State>> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(TimeWindowError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(state)
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn run_atomic(&self, procedure: &Procedure, keys: &[&str], args: &[i64]) -> Result<i64> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        match procedure.kind() {
            ProcedureKind::Admit => state.admit(keys, args, now),
            ProcedureKind::ShiftTtl => state.shift_ttl(keys, args, now),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        Ok(self.lock()?.live(key, now).is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.entries.remove(key);
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Err(invalid_expire());
        }
        let now = self.clock.now_millis();
        self.lock()?.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Flag,
                expires_at: Some(now.saturating_add(millis)),
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = self.clock.now_millis();
        Ok(KeyTtl::from_millis_reply(self.lock()?.pttl(key, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(secs: u64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::starting_at(secs * 1000);
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_flag_expires() {
        let (store, clock) = store_at(100);
        store.set_with_expiry("flag", Duration::from_secs(2)).await.unwrap();
        assert!(store.exists("flag").await.unwrap());

        clock.advance(Duration::from_millis(1999));
        assert!(store.exists("flag").await.unwrap());

        clock.advance(Duration::from_millis(1));
        assert!(!store.exists("flag").await.unwrap());
        assert_eq!(store.ttl("flag").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_zero_expiry_rejected() {
        let (store, _) = store_at(0);
        let err = store.set_with_expiry("flag", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, TimeWindowError::StoreExecution(_)));
        assert!(!store.exists("flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_sentinels() {
        let (store, _) = store_at(0);
        store.set_persistent("forever");
        store.set_with_expiry("soon", Duration::from_millis(1500)).await.unwrap();

        assert_eq!(store.ttl("missing").await.unwrap(), KeyTtl::Missing);
        assert_eq!(store.ttl("forever").await.unwrap(), KeyTtl::Persistent);
        assert_eq!(
            store.ttl("soon").await.unwrap(),
            KeyTtl::Expires(Duration::from_millis(1500))
        );
    }

    #[tokio::test]
    async fn test_admit_fills_then_blocks() {
        let (store, _) = store_at(1000);
        let admit = Procedure::admit();
        let keys = ["events", "marker"];

        assert_eq!(store.run_atomic(&admit, &keys, &[2, 10, 1000, 30]).await.unwrap(), 0);
        assert_eq!(store.run_atomic(&admit, &keys, &[2, 10, 1001, 30]).await.unwrap(), 0);
        assert_eq!(store.list("events"), vec![1001, 1000]);

        assert_eq!(store.run_atomic(&admit, &keys, &[2, 10, 1002, 30]).await.unwrap(), 1);
        assert!(store.list("events").is_empty());
        assert_eq!(
            store.ttl("marker").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_admit_slides_when_oldest_is_outside_window() {
        let (store, _) = store_at(1000);
        let admit = Procedure::admit();
        let keys = ["events", "marker"];

        store.run_atomic(&admit, &keys, &[2, 10, 1000, 30]).await.unwrap();
        store.run_atomic(&admit, &keys, &[2, 10, 1005, 30]).await.unwrap();

        // exactly one window after the oldest entry is not a violation
        assert_eq!(store.run_atomic(&admit, &keys, &[2, 10, 1010, 30]).await.unwrap(), 0);
        assert_eq!(store.list("events"), vec![1010, 1005]);
        assert!(!store.exists("marker").await.unwrap());
    }

    #[tokio::test]
    async fn test_admit_trims_oversized_buffer() {
        let (store, _) = store_at(1000);
        let admit = Procedure::admit();
        let keys = ["events", "marker"];

        for t in [1000, 1001, 1002] {
            store.run_atomic(&admit, &keys, &[5, 100, t, 30]).await.unwrap();
        }
        assert_eq!(store.list("events").len(), 3);

        // capacity lowered to 2: oldest retained entry is 1001, still inside the window
        assert_eq!(store.run_atomic(&admit, &keys, &[2, 100, 1003, 30]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_admit_with_extreme_durations_saturates() {
        let (store, _) = store_at(1000);
        let admit = Procedure::admit();
        let keys = ["events", "marker"];
        let args = [1, i64::MAX, 1000, i64::MAX];

        assert_eq!(store.run_atomic(&admit, &keys, &args).await.unwrap(), 0);
        assert!(matches!(store.ttl("events").await.unwrap(), KeyTtl::Expires(_)));

        assert_eq!(store.run_atomic(&admit, &keys, &args).await.unwrap(), 1);
        assert!(matches!(store.ttl("marker").await.unwrap(), KeyTtl::Expires(_)));
    }

    #[tokio::test]
    async fn test_shift_ttl_with_extreme_delta_saturates() {
        let (store, _) = store_at(0);
        store.set_with_expiry("marker", Duration::from_secs(20)).await.unwrap();

        let moved = store
            .run_atomic(&Procedure::shift_ttl(), &["marker"], &[i64::MAX])
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert!(store.exists("marker").await.unwrap());
    }

    #[tokio::test]
    async fn test_admit_wrong_arity() {
        let (store, _) = store_at(0);
        let err = store
            .run_atomic(&Procedure::admit(), &["events"], &[1, 2])
            .await
            .unwrap_err();
        assert!(matches!(err, TimeWindowError::StoreExecution(_)));
    }

    #[tokio::test]
    async fn test_admit_against_flag_is_wrong_type() {
        let (store, _) = store_at(0);
        store.set_persistent("events");
        let err = store
            .run_atomic(&Procedure::admit(), &["events", "marker"], &[1, 10, 0, 10])
            .await
            .unwrap_err();
        assert!(matches!(err, TimeWindowError::StoreExecution(_)));
    }

    #[tokio::test]
    async fn test_shift_ttl_moves_and_removes() {
        let (store, _) = store_at(0);
        let shift = Procedure::shift_ttl();

        assert_eq!(store.run_atomic(&shift, &["marker"], &[10]).await.unwrap(), 0);
        assert!(store.is_empty());

        store.set_with_expiry("marker", Duration::from_secs(20)).await.unwrap();
        assert_eq!(store.run_atomic(&shift, &["marker"], &[10]).await.unwrap(), 1);
        assert_eq!(
            store.ttl("marker").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(30))
        );

        store.run_atomic(&shift, &["marker"], &[-30]).await.unwrap();
        assert!(!store.exists("marker").await.unwrap());
    }

    #[tokio::test]
    async fn test_shift_ttl_ignores_persistent_key() {
        let (store, _) = store_at(0);
        store.set_persistent("marker");
        let moved = store
            .run_atomic(&Procedure::shift_ttl(), &["marker"], &[10])
            .await
            .unwrap();
        assert_eq!(moved, 0);
        assert_eq!(store.ttl("marker").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let (store, _) = store_at(0);
        store.set_unavailable(true);
        assert!(store.exists("k").await.unwrap_err().is_unavailable());
        assert!(store.delete("k").await.unwrap_err().is_unavailable());

        store.set_unavailable(false);
        assert!(!store.exists("k").await.unwrap());
    }
}
