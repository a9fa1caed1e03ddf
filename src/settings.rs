//! Engine configuration
//!
//! Reads config from env vars:
//!   SYNC_DATABASE_URL         — Postgres connection string (required)
//!   SYNC_UPSTREAM_BASE_URL    — base URL of the upstream catalog API (required)
//!   SYNC_UPSTREAM_USERNAME    — upstream login username (required)
//!   SYNC_UPSTREAM_PASSWORD    — upstream login password (required)
//!   SYNC_BLOB_ROOT            — local directory for thumbnails and parts blobs (default: ./blobs)
//!   SYNC_SESSION_POOL_SIZE    — concurrent upstream sessions (default: 2)
//!   SYNC_RATE_LIMIT_RPS       — upstream requests per second (default: 10)
//!   SYNC_TICK_INTERVAL_SECS   — scheduler tick interval (default: 60)
//!   SYNC_PARSER_WORKER_COUNT  — number of parts-blob parser loops (default: 2)
//!   SYNC_ROOT_UPSTREAM_ID     — upstream id of the directory to mirror from (default: zero sentinel)
//!   SYNC_ROOT_PATH            — full path of that directory (default: "/")

use std::time::Duration;

use uuid::Uuid;

use crate::client::Credentials;
use crate::identifiers::{normalize_upstream_id, SENTINEL_ZERO_ID};

/// Everything the binary needs to wire the engine together, assembled once
/// at startup from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub upstream_base_url: String,
    pub upstream_credentials: Credentials,
    pub blob_root: String,
    pub session_pool_size: usize,
    pub rate_limit_rps: u32,
    pub tick_interval: Duration,
    pub parser_worker_count: usize,
    pub root_upstream_id: Uuid,
    pub root_path: String,
}

impl EngineConfig {
    /// Loads config from the environment, panicking with a descriptive
    /// message on a missing required variable. Mirrors the binary's own
    /// startup convention: fail fast, before any connection is attempted.
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("SYNC_DATABASE_URL").expect("SYNC_DATABASE_URL must be set");
        let upstream_base_url =
            std::env::var("SYNC_UPSTREAM_BASE_URL").expect("SYNC_UPSTREAM_BASE_URL must be set");
        let username =
            std::env::var("SYNC_UPSTREAM_USERNAME").expect("SYNC_UPSTREAM_USERNAME must be set");
        let password =
            std::env::var("SYNC_UPSTREAM_PASSWORD").expect("SYNC_UPSTREAM_PASSWORD must be set");

        let blob_root = std::env::var("SYNC_BLOB_ROOT").unwrap_or_else(|_| "./blobs".into());

        let session_pool_size: usize = std::env::var("SYNC_SESSION_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);
        let rate_limit_rps: u32 = std::env::var("SYNC_RATE_LIMIT_RPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let tick_interval_secs: u64 = std::env::var("SYNC_TICK_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        let parser_worker_count: usize = std::env::var("SYNC_PARSER_WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let root_upstream_id = std::env::var("SYNC_ROOT_UPSTREAM_ID")
            .ok()
            .and_then(|v| normalize_upstream_id(&v).ok())
            .unwrap_or(SENTINEL_ZERO_ID);
        let root_path = std::env::var("SYNC_ROOT_PATH").unwrap_or_else(|_| "/".into());

        Self {
            database_url,
            upstream_base_url,
            upstream_credentials: Credentials { username, password },
            blob_root,
            session_pool_size,
            rate_limit_rps,
            tick_interval: Duration::from_secs(tick_interval_secs),
            parser_worker_count,
            root_upstream_id,
            root_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_optional_vars_absent() {
        std::env::set_var("SYNC_DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("SYNC_UPSTREAM_BASE_URL", "https://catalog.example.test");
        std::env::set_var("SYNC_UPSTREAM_USERNAME", "svc-sync");
        std::env::set_var("SYNC_UPSTREAM_PASSWORD", "secret");
        std::env::remove_var("SYNC_SESSION_POOL_SIZE");
        std::env::remove_var("SYNC_RATE_LIMIT_RPS");
        std::env::remove_var("SYNC_TICK_INTERVAL_SECS");
        std::env::remove_var("SYNC_PARSER_WORKER_COUNT");

        let config = EngineConfig::from_env();
        assert_eq!(config.session_pool_size, 2);
        assert_eq!(config.rate_limit_rps, 10);
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.parser_worker_count, 2);
    }
}
