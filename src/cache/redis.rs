// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis cache backend.
//!
//! Values are JSON strings written with `SETEX`. Pattern invalidation walks
//! the keyspace with `SCAN MATCH` (never `KEYS`) and deletes in batches.

use ::redis::aio::ConnectionManager;
use ::redis::{cmd, AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use std::time::Duration;

use super::{CacheError, CacheStore};
use crate::resilience::retry::{retry, RetryConfig};

const SCAN_COUNT: usize = 200;

pub struct RedisCache {
    connection: ConnectionManager,
    /// Namespace when sharing an instance, e.g. "clinic:" → "clinic:patient:4"
    prefix: String,
}

impl RedisCache {
    pub async fn connect(url: &str, prefix: Option<&str>) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Connect(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: RedisError| CacheError::Connect(e.to_string()))?;

        Ok(Self { connection, prefix: prefix.unwrap_or("").to_string() })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn backend(e: RedisError) -> CacheError {
    CacheError::Backend(e.to_string())
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.prefixed_key(key)).await.map_err(backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let () = cmd("SETEX")
            .arg(self.prefixed_key(key))
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(self.prefixed_key(key)).await.map_err(backend)?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let full = self.prefixed_key(pattern);
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

            if !keys.is_empty() {
                let n: usize = cmd("DEL").arg(&keys).query_async(&mut conn).await.map_err(backend)?;
                removed += n;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
