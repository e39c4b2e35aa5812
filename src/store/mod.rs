//! Store abstraction for window state.
//!
//! All authoritative state lives in the store. The limiter and the block
//! controller only ever hold transient read results, so every multi-step
//! read-modify-write is shipped to the store as a [`Procedure`] that runs
//! atomically on the store side.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

const ADMIT_SOURCE: &str = include_str!("scripts/admit.lua");
const SHIFT_TTL_SOURCE: &str = include_str!("scripts/shift_ttl.lua");

/// Which atomic procedure a [`Procedure`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    /// Sliding-window admission check.
    ///
    /// Keys: `[events, marker]`. Args: `[capacity, window_secs, now_secs, block_secs]`.
    /// Returns `1` if blocked, `0` if admitted.
    Admit,
    /// Move a marker's expiry by a signed number of seconds.
    ///
    /// Keys: `[marker]`. Args: `[delta_secs]`. Returns `1` if moved, `0` otherwise.
    ShiftTtl,
}

impl ProcedureKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProcedureKind::Admit => "admit",
            ProcedureKind::ShiftTtl => "shift_ttl",
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            ProcedureKind::Admit => ADMIT_SOURCE,
            ProcedureKind::ShiftTtl => SHIFT_TTL_SOURCE,
        }
    }
}

/// A named atomic procedure, prepared once and invoked many times.
///
/// Holds the prepared Lua script (its SHA1 is computed on construction) so
/// that a Redis backend can call `EVALSHA` and fall back to `EVAL` only on
/// the first invocation against a fresh server.
#[derive(Clone)]
pub struct Procedure {
    kind: ProcedureKind,
    script: redis::Script,
}

impl Procedure {
    pub fn new(kind: ProcedureKind) -> Self {
        Self {
            kind,
            script: redis::Script::new(kind.source()),
        }
    }

    pub fn admit() -> Self {
        Self::new(ProcedureKind::Admit)
    }

    pub fn shift_ttl() -> Self {
        Self::new(ProcedureKind::ShiftTtl)
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    pub fn script(&self) -> &redis::Script {
        &self.script
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("kind", &self.kind)
            .field("hash", &self.script.get_hash())
            .finish()
    }
}

/// Remaining lifetime of a store key.
///
/// Mirrors the store convention where `-2` means the key does not exist and
/// `-1` means it exists without an expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Interpret a raw millisecond TTL reply.
    pub fn from_millis_reply(reply: i64) -> Self {
        match reply {
            -2 => KeyTtl::Missing,
            r if r < 0 => KeyTtl::Persistent,
            r => KeyTtl::Expires(Duration::from_millis(r as u64)),
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, KeyTtl::Missing)
    }

    /// The remaining duration, if the key has one.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Operations the window components need from the shared store.
///
/// Implementations must be safe for concurrent use by many callers without
/// any client-side queuing. `run_atomic` must execute the whole procedure
/// without interleaving from other callers.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Run an atomic procedure against the given keys and integer args.
    async fn run_atomic(&self, procedure: &Procedure, keys: &[&str], args: &[i64]) -> Result<i64>;

    /// Whether the key currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete the key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Create or overwrite the key as a flag expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remaining lifetime of the key.
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;
}
