use std::{str::FromStr, time::Duration};

use anyhow::Context;

/// Runtime settings, read once from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr:       String,
    pub jwt_secret:      String,
    pub pong_wait:       Duration,
    pub write_wait:      Duration,
    pub room_cache_ttl:  Duration,
    pub dispatch_workers: usize,
    pub send_buffer:     usize,
    pub dispatch_buffer: usize,
    pub reconnect_grace: Duration,
    /// Shared store; the in-process store is used when unset.
    pub redis_url:       Option<String>,
    pub allowed_origins: Vec<String>,
    /// Requests per client IP per minute.
    pub rate_limit:      i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr:        "0.0.0.0:8080".into(),
            jwt_secret:       String::new(),
            pong_wait:        Duration::from_secs(60),
            write_wait:       Duration::from_secs(10),
            room_cache_ttl:   Duration::from_secs(30),
            dispatch_workers: 4,
            send_buffer:      256,
            dispatch_buffer:  1024,
            reconnect_grace:  Duration::from_millis(100),
            redis_url:        None,
            allowed_origins:  vec!["http://localhost:3000".into()],
            rate_limit:       1000,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        Ok(Self {
            bind_addr:        std::env::var("BIND_ADDR").unwrap_or(d.bind_addr),
            jwt_secret:       std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            pong_wait:        Duration::from_secs(env_or("PONG_WAIT_SECS", 60)?),
            write_wait:       Duration::from_secs(env_or("WRITE_WAIT_SECS", 10)?),
            room_cache_ttl:   Duration::from_secs(env_or("ROOM_CACHE_TTL_SECS", 30)?),
            dispatch_workers: env_or("DISPATCH_WORKERS", d.dispatch_workers)?.max(1),
            send_buffer:      env_or("SEND_BUFFER", d.send_buffer)?.max(1),
            dispatch_buffer:  env_or("DISPATCH_BUFFER", d.dispatch_buffer)?.max(1),
            reconnect_grace:  Duration::from_millis(env_or("RECONNECT_GRACE_MS", 100)?),
            redis_url:        std::env::var("REDIS_URL").ok().filter(|u| !u.trim().is_empty()),
            allowed_origins:  std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| split_origins(&v))
                .filter(|o| !o.is_empty())
                .unwrap_or(d.allowed_origins),
            rate_limit:       env_or("RATE_LIMIT_PER_MIN", d.rate_limit)?.max(1),
        })
    }

    /// Keep-alive ping period: 9/10 of the pong wait.
    pub fn ping_period(&self) -> Duration { self.pong_wait * 9 / 10 }
}

fn split_origins(v: &str) -> Vec<String> {
    v.split(',').map(str::trim).filter(|o| !o.is_empty()).map(String::from).collect()
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().with_context(|| format!("invalid {key}: {v}")),
        _ => Ok(default),
    }
}
