// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis adapter with Sentinel-style primary discovery.
//!
//! Every operation first asks the discovery endpoints for the current primary
//! of `service_name`, then runs against that primary. The primary connection
//! is reused while discovery keeps returning the same address, so a failover
//! is picked up on the next operation.
//!
//! Conditional writes are advisory by default: [`replace_if_equals`] logs a
//! warning and writes unconditionally. Setting `atomic_replace` switches to a
//! server-side compare-and-set script.
//!
//! [`replace_if_equals`]: Adapter::replace_if_equals

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Adapter, AdapterError, Result};

fn default_socket_timeout_ms() -> u64 {
    500
}

// ARGV[1] = "1" when the key must be absent, ARGV[2] = sample, ARGV[3] = new blob.
const COMPARE_AND_SET: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
";

#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct ReplicatedAdapterConfig {
    /// Discovery endpoints as `[host, port]` pairs.
    pub sentinels: Vec<(String, u16)>,
    /// Logical service whose primary is resolved.
    pub service_name: String,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Password of the data nodes.
    #[serde(default)]
    pub password: Option<String>,
    /// Password of the discovery endpoints.
    #[serde(default)]
    pub sentinel_password: Option<String>,
    #[serde(default)]
    pub db: i64,
    /// Use a server-side script for `replace_if_equals`.
    #[serde(default)]
    pub atomic_replace: bool,
}

impl std::fmt::Debug for ReplicatedAdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedAdapterConfig")
            .field("sentinels", &self.sentinels)
            .field("service_name", &self.service_name)
            .field("socket_timeout_ms", &self.socket_timeout_ms)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("sentinel_password", &self.sentinel_password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("atomic_replace", &self.atomic_replace)
            .finish()
    }
}

impl ReplicatedAdapterConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

type PrimaryAddr = (String, u16);

/// Redis adapter resolving its primary through discovery endpoints.
pub struct ReplicatedAdapter {
    config: ReplicatedAdapterConfig,
    primary: Mutex<Option<(PrimaryAddr, MultiplexedConnection)>>,
    script: redis::Script,
}

impl std::fmt::Debug for ReplicatedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedAdapter")
            .field("config", &self.config)
            .finish()
    }
}

fn map_redis_error(err: redis::RedisError) -> AdapterError {
    if err.is_timeout() || err.is_io_error() || err.is_connection_dropped() {
        AdapterError::Transient(err.to_string())
    } else {
        AdapterError::Backend(err.to_string())
    }
}

fn connection_info(host: &str, port: u16, password: Option<&str>, db: i64) -> redis::ConnectionInfo {
    redis::ConnectionInfo {
        addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
        redis: redis::RedisConnectionInfo {
            db,
            password: password.map(str::to_string),
            ..Default::default()
        },
    }
}

impl ReplicatedAdapter {
    pub fn new(config: ReplicatedAdapterConfig) -> Self {
        Self {
            config,
            primary: Mutex::new(None),
            script: redis::Script::new(COMPARE_AND_SET),
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let timeout = self.config.socket_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(AdapterError::Timeout(timeout)),
        }
    }

    async fn connect_to(&self, info: redis::ConnectionInfo) -> Result<MultiplexedConnection> {
        let client = redis::Client::open(info).map_err(map_redis_error)?;
        self.bounded(client.get_multiplexed_async_connection()).await
    }

    /// Ask each discovery endpoint in turn for the current primary.
    async fn discover(&self) -> Result<PrimaryAddr> {
        let mut last_error = String::from("no discovery endpoints configured");
        for (host, port) in &self.config.sentinels {
            let info = connection_info(host, *port, self.config.sentinel_password.as_deref(), 0);
            let mut conn = match self.connect_to(info).await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(%host, port, error = %err, "Discovery endpoint unreachable");
                    last_error = err.to_string();
                    continue;
                }
            };
            let mut cmd = redis::cmd("SENTINEL");
            cmd.arg("get-master-addr-by-name").arg(&self.config.service_name);
            let reply: Result<Option<PrimaryAddr>> =
                self.bounded(cmd.query_async(&mut conn)).await;
            match reply {
                Ok(Some(addr)) => return Ok(addr),
                Ok(None) => {
                    last_error = format!("unknown service '{}'", self.config.service_name);
                }
                Err(err) => {
                    debug!(%host, port, error = %err, "Discovery query failed");
                    last_error = err.to_string();
                }
            }
        }
        Err(AdapterError::Discovery(last_error))
    }

    /// Connection to the current primary, reconnecting after a failover.
    async fn primary(&self) -> Result<MultiplexedConnection> {
        let addr = self.discover().await?;
        {
            let cached = self.primary.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((cached_addr, conn)) = cached.as_ref() {
                if *cached_addr == addr {
                    return Ok(conn.clone());
                }
            }
        }
        info!(host = %addr.0, port = addr.1, service = %self.config.service_name, "Connecting to primary");
        let info = connection_info(
            &addr.0,
            addr.1,
            self.config.password.as_deref(),
            self.config.db,
        );
        let conn = self.connect_to(info).await?;
        *self.primary.lock().unwrap_or_else(|p| p.into_inner()) = Some((addr, conn.clone()));
        Ok(conn)
    }
}

#[async_trait]
impl Adapter for ReplicatedAdapter {
    fn name(&self) -> &'static str {
        "replicated"
    }

    async fn connect(&self) -> Result<()> {
        self.primary().await.map(|_| ())
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.primary().await?;
        let mut cmd = redis::cmd("GET");
        cmd.arg(id);
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn save(&self, id: &str, blob: &[u8]) -> Result<()> {
        let mut conn = self.primary().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(id).arg(blob);
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn replace_if_equals(
        &self,
        id: &str,
        sample: Option<&[u8]>,
        blob: &[u8],
    ) -> Result<bool> {
        if !self.config.atomic_replace {
            warn!(id, "Replicated adapter has no replace_if_equals, saving unconditionally");
            self.save(id, blob).await?;
            return Ok(true);
        }
        let mut conn = self.primary().await?;
        let expect_absent = if sample.is_none() { "1" } else { "0" };
        let mut invocation = self.script.key(id);
        invocation
            .arg(expect_absent)
            .arg(sample.unwrap_or_default())
            .arg(blob);
        let replaced: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(replaced == 1)
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let mut conn = self.primary().await?;
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(path);
        let count: i64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(count > 0)
    }

    async fn is_alive(&self) -> Result<bool> {
        let mut conn = self.primary().await?;
        let cmd = redis::cmd("PING");
        let pong: String = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(pong == "PONG")
    }

    async fn close(&self) -> Result<()> {
        self.primary
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        Ok(())
    }
}
