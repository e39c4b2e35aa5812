//! Redis-backed window store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{AsyncCommands, Cmd, Pipeline, RedisFuture, Value};
use tracing::{debug, info};

use super::{KeyTtl, Procedure, WindowStore};
use crate::config::RedisConfig;
use crate::error::Result;

/// A connection to either a single server or a cluster.
#[derive(Clone)]
enum RedisConn {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            RedisConn::Single(conn) => conn.req_packed_command(cmd),
            RedisConn::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConn::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConn::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConn::Single(conn) => conn.get_db(),
            RedisConn::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Window store backed by a Redis server or a Redis Cluster.
///
/// A single server is reached through a [`ConnectionManager`], a
/// multiplexed connection that reconnects on failure; a cluster through a
/// [`ClusterConnection`] that routes each command by key slot. Each request
/// works on a cheap clone of the connection, so many tasks can issue
/// requests at once without any queuing here.
///
/// On a cluster, both keys of an admission check must hash to the same
/// slot. Enable [`WindowConfig::hash_tag`](crate::config::WindowConfig)
/// when using one; [`Settings::load`](crate::config::Settings::load) does so
/// automatically.
#[derive(Clone)]
pub struct RedisStore {
    conn: RedisConn,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self {
            conn: RedisConn::Single(conn),
        })
    }

    /// Connect to the cluster reachable through any of the `nodes` URLs.
    pub async fn connect_cluster(nodes: &[String]) -> Result<Self> {
        let client = ClusterClient::new(nodes.to_vec())?;
        let conn = client.get_async_connection().await?;
        info!(nodes = ?nodes, "Connected to Redis Cluster");
        Ok(Self {
            conn: RedisConn::Cluster(conn),
        })
    }

    /// Connect to whatever `config` describes: a cluster when seed nodes
    /// are listed, otherwise the single server at `url`.
    pub async fn connect_with(config: &RedisConfig) -> Result<Self> {
        if config.is_cluster() {
            Self::connect_cluster(&config.cluster_nodes).await
        } else {
            Self::connect(&config.url).await
        }
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn: RedisConn::Single(conn),
        }
    }

    /// Wrap an existing cluster connection.
    pub fn from_cluster(conn: ClusterConnection) -> Self {
        Self {
            conn: RedisConn::Cluster(conn),
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.conn, RedisConn::Cluster(_))
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn run_atomic(&self, procedure: &Procedure, keys: &[&str], args: &[i64]) -> Result<i64> {
        let mut invocation = procedure.script().prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }

        debug!(procedure = procedure.kind().name(), ?keys, "Invoking atomic procedure");

        let mut conn = self.conn.clone();
        let reply: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let _: () = conn.pset_ex(key, 1, millis).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let reply: i64 = conn.pttl(key).await?;
        Ok(KeyTtl::from_millis_reply(reply))
    }
}
