//! Redis-backed [`CoordinationStore`], shared by every instance.
//!
//! Each trait call is one command, or one MULTI/EXEC block where the trait
//! promises a combined result (`incr`, `sadd`).

use std::{collections::HashMap, time::Duration};

use ::redis::{aio::ConnectionManager, Client, Cmd, ErrorKind, FromRedisValue, RedisError};
use async_trait::async_trait;
use tracing::info;

use super::{CoordinationStore, StoreResult};
use crate::error::StoreError;

/// Cheap to clone; clones share one multiplexed, self-reconnecting connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| backend(&e))?;
        let conn = ConnectionManager::new(client).await.map_err(|e| backend(&e))?;
        info!("connected to redis");
        Ok(Self { conn })
    }

    async fn run<T: FromRedisValue>(&self, key: &str, cmd: Cmd) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(|e| classify(key, e))
    }
}

fn millis(d: Duration) -> u64 { d.as_millis().max(1) as u64 }

fn backend(e: &RedisError) -> StoreError { StoreError::Backend(e.to_string()) }

fn classify(key: &str, e: RedisError) -> StoreError {
    if e.code() == Some("WRONGTYPE") || e.kind() == ErrorKind::TypeError {
        StoreError::WrongType(key.to_string())
    } else {
        backend(&e)
    }
}

fn cmd_on(name: &str, key: &str) -> Cmd {
    let mut c = ::redis::cmd(name);
    c.arg(key);
    c
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let mut c = cmd_on("SET", key);
        c.arg(value);
        if let Some(t) = ttl {
            c.arg("PX").arg(millis(t));
        }
        self.run::<()>(key, c).await
    }

    async fn set_nx(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut c = cmd_on("SET", key);
        c.arg(value).arg("NX");
        if let Some(t) = ttl {
            c.arg("PX").arg(millis(t));
        }
        Ok(self.run::<Option<::redis::Value>>(key, c).await?.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(key, cmd_on("GET", key)).await
    }

    async fn incr(&self, key: &str, window: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let (n,): (i64,) = ::redis::pipe()
            .atomic()
            .cmd("SET").arg(key).arg(0).arg("NX").arg("PX").arg(millis(window)).ignore()
            .cmd("INCR").arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(key, e))?;
        Ok(n)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        Ok(self.run::<i64>(key, cmd_on("DEL", key)).await? > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut c = cmd_on("PEXPIRE", key);
        c.arg(millis(ttl));
        Ok(self.run::<i64>(key, c).await? == 1)
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut c = cmd_on("HSET", key);
        for (f, v) in fields {
            c.arg(*f).arg(v.as_str());
        }
        self.run::<i64>(key, c).await.map(|_| ())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: String) -> StoreResult<bool> {
        let mut c = cmd_on("HSETNX", key);
        c.arg(field).arg(value);
        Ok(self.run::<i64>(key, c).await? == 1)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut c = cmd_on("HDEL", key);
        c.arg(field);
        Ok(self.run::<i64>(key, c).await? > 0)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.run(key, cmd_on("HGETALL", key)).await
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut c = cmd_on("ZADD", key);
        c.arg("NX").arg(score).arg(member);
        Ok(self.run::<i64>(key, c).await? == 1)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut c = cmd_on("ZREM", key);
        c.arg(member);
        Ok(self.run::<i64>(key, c).await? > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut c = cmd_on("ZSCORE", key);
        c.arg(member);
        self.run(key, c).await
    }

    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<usize>> {
        let mut c = cmd_on("ZRANK", key);
        c.arg(member);
        self.run(key, c).await
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut c = cmd_on("ZRANGE", key);
        c.arg(0).arg(-1);
        self.run(key, c).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.run(key, cmd_on("ZCARD", key)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let (mut members,): (Vec<String>,) = ::redis::pipe()
            .atomic()
            .cmd("SADD").arg(key).arg(member).ignore()
            .cmd("SMEMBERS").arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(key, e))?;
        members.sort();
        Ok(members)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut members: Vec<String> = self.run(key, cmd_on("SMEMBERS", key)).await?;
        members.sort();
        Ok(members)
    }
}
