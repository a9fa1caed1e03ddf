//! Upstream Client
//!
//! Thin stateful session over the upstream catalog API: login, path
//! navigation, project/phase selection, child listing, thumbnail and
//! parts-blob fetch. A `Session` carries its own cursor state explicitly
//! (directory path, selected project, selected phase) rather than the
//! source's instance-variable threading, so the cursor can be loaned out
//! and inspected by the orchestrator between calls.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Categorized, ErrorCategory};
use crate::identifiers::normalize_upstream_id;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("entity not found")]
    NotFound,
    #[error("session is corrupt, re-login required")]
    SessionCorrupt,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("empty response body")]
    Empty,
    #[error("malformed identifier in response: {0}")]
    Validation(String),
}

impl Categorized for ClientError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthFailed | Self::SessionCorrupt => ErrorCategory::Auth,
            Self::NotFound => ErrorCategory::NotFound,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Empty | Self::Validation(_) => ErrorCategory::Validation,
        }
    }
}

/// Credentials presented to `login`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A child entry returned by one of the `list_*` calls.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub changed_at: Option<i64>,
}

impl UpstreamEntry {
    /// Normalized id and a decoded `changed_at`, validated together so
    /// callers never see a half-parsed entry.
    pub fn normalized(&self) -> Result<(Uuid, Option<DateTime<Utc>>), ClientError> {
        let id = normalize_upstream_id(&self.id)
            .map_err(|e| ClientError::Validation(format!("bad id {}: {e}", self.id)))?;
        let changed_at = self
            .changed_at
            .and_then(crate::identifiers::parse_upstream_timestamp);
        Ok((id, changed_at))
    }
}

/// Thumbnail fetch options.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailOptions {
    pub size: u32,
    pub format: ThumbnailFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFormat {
    Png,
    Jpeg,
}

/// Explicit in-session cursor state. Pool-owned; loaned to the Cascade
/// Orchestrator for the duration of one session-scoped operation chain.
#[derive(Debug, Clone, Default)]
pub struct SessionCursor {
    pub directory_path: Option<String>,
    pub selected_project: Option<Uuid>,
    pub selected_phase: Option<Uuid>,
}

/// Behavior every upstream call needs: session-state transitions plus data
/// fetches. A `reqwest`-backed implementation wraps one HTTP endpoint set;
/// an in-memory fake backs orchestration tests.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn login(&self, creds: &Credentials) -> Result<(), ClientError>;
    async fn navigate(&self, path: &str) -> Result<(), ClientError>;
    async fn list_directories(&self) -> Result<Vec<UpstreamEntry>, ClientError>;
    async fn list_projects(&self) -> Result<Vec<UpstreamEntry>, ClientError>;
    async fn select_project(&self, id: Uuid) -> Result<(), ClientError>;
    async fn list_phases(&self) -> Result<Vec<UpstreamEntry>, ClientError>;
    async fn select_phase(&self, id: Uuid) -> Result<(), ClientError>;
    async fn list_elevations(&self) -> Result<Vec<UpstreamEntry>, ClientError>;
    async fn fetch_thumbnail(
        &self,
        id: Uuid,
        opts: ThumbnailOptions,
    ) -> Result<Vec<u8>, ClientError>;
    /// Fetch the parts blob for `elevation_id`. Spec names this call as
    /// operating on an implicit "selected elevation" cursor, but the
    /// operations table never defines a `select_elevation` step; we take
    /// the id explicitly instead of inventing a fourth cursor the protocol
    /// doesn't expose (see DESIGN.md open question resolution).
    async fn fetch_parts_blob(&self, elevation_id: Uuid) -> Result<Vec<u8>, ClientError>;
    async fn logout(&self) -> Result<(), ClientError>;

    /// Current cursor state, for the orchestrator to decide what
    /// navigation is still required before the next call.
    fn cursor(&self) -> SessionCursor;
}

type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Retry policy for transport/timeout failures: exponential backoff,
/// base 1s, factor 2, capped at 60s, at most 5 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_multiplier(self.factor)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(Some(self.max_delay * self.max_attempts))
            .build()
    }
}

/// `reqwest`-backed client implementing the session-navigation protocol
/// over the upstream catalog API.
pub struct ReqwestUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    limiter: GlobalLimiter,
    retry: RetryPolicy,
    token: tokio::sync::RwLock<Option<String>>,
    cursor: tokio::sync::RwLock<SessionCursor>,
}

impl ReqwestUpstreamClient {
    /// `rps` is the global token-bucket rate (default 10, per spec §4.1).
    pub fn new(base_url: impl Into<String>, rps: u32) -> Self {
        let rps = NonZeroU32::new(rps).unwrap_or_else(|| NonZeroU32::new(10).unwrap());
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            limiter: RateLimiter::direct(Quota::per_second(rps)),
            retry: RetryPolicy::default(),
            token: tokio::sync::RwLock::new(None),
            cursor: tokio::sync::RwLock::new(SessionCursor::default()),
        }
    }

    async fn bearer(&self) -> Result<String, ClientError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or(ClientError::SessionCorrupt)
    }

    /// Run one logical call through the rate limiter and the retry policy;
    /// `f` performs exactly one HTTP call per invocation.
    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        self.limiter.until_ready().await;
        let started = std::time::Instant::now();

        let result = backoff::future::retry(self.retry.backoff(), || async {
            f().await.map_err(|e| match e.category() {
                ErrorCategory::Transport | ErrorCategory::Timeout => backoff::Error::transient(e),
                _ => backoff::Error::permanent(e),
            })
        })
        .await;

        debug!(
            op,
            duration_ms = started.elapsed().as_millis() as u64,
            "upstream call"
        );

        result.map_err(|e| match e {
            backoff::Error::Permanent(inner) => inner,
            backoff::Error::Transient { err, .. } => err,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ClientError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        handle_status(&resp)?;
        resp.json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn post_empty(&self, path: &str) -> Result<(), ClientError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        handle_status(&resp)
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        handle_status(&resp)?;
        Ok(resp
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .to_vec())
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn login(&self, creds: &Credentials) -> Result<(), ClientError> {
        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }

        let resp = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(&serde_json::json!({
                "username": creds.username,
                "password": creds.password,
            }))
            .send()
            .await
            .map_err(map_reqwest_err)?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::AuthFailed);
        }
        handle_status(&resp)?;

        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        *self.token.write().await = Some(body.token);
        *self.cursor.write().await = SessionCursor::default();
        Ok(())
    }

    async fn navigate(&self, path: &str) -> Result<(), ClientError> {
        self.call("navigate", || self.post_empty("/directories/select"))
            .await?;
        self.cursor.write().await.directory_path = Some(path.to_string());
        Ok(())
    }

    async fn list_directories(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
        self.call("list_directories", || self.get_json("/directories"))
            .await
    }

    async fn list_projects(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
        self.call("list_projects", || self.get_json("/projects"))
            .await
    }

    async fn select_project(&self, id: Uuid) -> Result<(), ClientError> {
        let path = format!("/projects/{id}/select");
        self.call("select_project", || self.post_empty(&path)).await?;
        let mut cursor = self.cursor.write().await;
        cursor.selected_project = Some(id);
        cursor.selected_phase = None;
        Ok(())
    }

    async fn list_phases(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
        self.call("list_phases", || self.get_json("/phases")).await
    }

    async fn select_phase(&self, id: Uuid) -> Result<(), ClientError> {
        let path = format!("/phases/{id}/select");
        self.call("select_phase", || self.post_empty(&path)).await?;
        self.cursor.write().await.selected_phase = Some(id);
        Ok(())
    }

    async fn list_elevations(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
        let cursor = self.cursor();
        if cursor.selected_project.is_none() || cursor.selected_phase.is_none() {
            return Err(ClientError::Validation(
                "list_elevations requires project and phase cursors".into(),
            ));
        }
        self.call("list_elevations", || self.get_json("/elevations"))
            .await
    }

    async fn fetch_thumbnail(
        &self,
        id: Uuid,
        opts: ThumbnailOptions,
    ) -> Result<Vec<u8>, ClientError> {
        let fmt = match opts.format {
            ThumbnailFormat::Png => "png",
            ThumbnailFormat::Jpeg => "jpeg",
        };
        let path = format!(
            "/elevations/{id}/thumbnail?size={}&format={fmt}",
            opts.size
        );
        self.call("fetch_thumbnail", || self.get_bytes(&path)).await
    }

    async fn fetch_parts_blob(&self, elevation_id: Uuid) -> Result<Vec<u8>, ClientError> {
        let cursor = self.cursor();
        if cursor.selected_phase.is_none() {
            return Err(ClientError::Validation(
                "fetch_parts_blob requires a selected phase".into(),
            ));
        }
        let path = format!("/elevations/{elevation_id}/parts-blob");
        let bytes = self.call("fetch_parts_blob", || self.get_bytes(&path)).await?;
        if bytes.is_empty() {
            return Err(ClientError::Empty);
        }
        Ok(bytes)
    }

    async fn logout(&self) -> Result<(), ClientError> {
        *self.token.write().await = None;
        *self.cursor.write().await = SessionCursor::default();
        Ok(())
    }

    fn cursor(&self) -> SessionCursor {
        self.cursor
            .try_read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

fn handle_status(resp: &reqwest::Response) -> Result<(), ClientError> {
    match resp.status() {
        s if s.is_success() => Ok(()),
        reqwest::StatusCode::UNAUTHORIZED => Err(ClientError::SessionCorrupt),
        reqwest::StatusCode::NOT_FOUND => Err(ClientError::NotFound),
        s if s.is_server_error() => Err(ClientError::Transport(format!("status {s}"))),
        s => Err(ClientError::Validation(format!("unexpected status {s}"))),
    }
}

fn map_reqwest_err(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Transport(format!("timeout: {e}"))
    } else {
        ClientError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_entry_rejects_bad_id() {
        let entry = UpstreamEntry {
            id: "not-a-uuid".into(),
            name: "x".into(),
            relative_path: None,
            changed_at: None,
        };
        assert!(entry.normalized().is_err());
    }

    #[test]
    fn normalized_entry_accepts_compact_id_with_timestamp() {
        let entry = UpstreamEntry {
            id: "550e8400e29b41d4a716446655440000".into(),
            name: "x".into(),
            relative_path: None,
            changed_at: Some(1_700_000_000),
        };
        let (id, changed_at) = entry.normalized().unwrap();
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
        assert!(changed_at.is_some());
    }
}
