//! Session pool
//!
//! Bounded set of logged-in upstream sessions, default size 2, matching the
//! source's `ConnectionPool`. Acquire blocks until a session is free;
//! release returns it to the back of the queue (fair, not LIFO) so one
//! session doesn't starve under sustained load. A session the caller marks
//! invalid is dropped and replaced with a fresh login on next acquire
//! rather than handed out again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

use crate::client::{Credentials, UpstreamClient};
use crate::error::{Categorized, ErrorCategory};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("login failed while refilling pool: {0}")]
    LoginFailed(String),
}

impl Categorized for PoolError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Closed => ErrorCategory::System,
            Self::LoginFailed(_) => ErrorCategory::Auth,
        }
    }
}

struct Slot {
    session: Arc<dyn UpstreamClient>,
}

/// A session on loan from the pool. Dropping it without calling
/// [`Leased::invalidate`] returns the session to the pool unconditionally;
/// callers that hit an auth failure should call `invalidate` explicitly so
/// the slot is replaced rather than recycled.
pub struct Leased<'a> {
    pool: &'a SessionPool,
    session: Option<Arc<dyn UpstreamClient>>,
    invalidated: bool,
    _permit: SemaphorePermit<'a>,
}

impl<'a> Leased<'a> {
    pub fn session(&self) -> &Arc<dyn UpstreamClient> {
        self.session.as_ref().expect("session present until drop")
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }
}

impl Drop for Leased<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.invalidated {
                warn!("dropping invalidated session, pool will relogin on next acquire");
                self.pool.needs_relogin.lock().unwrap().push_back(());
            } else {
                self.pool.slots.lock().unwrap().push_back(Slot { session });
            }
        }
    }
}

/// Bounded pool of upstream sessions. A fresh `login` happens lazily the
/// first time a slot is needed and again whenever a leased session is
/// invalidated, mirroring the source's reconnect-on-failure behavior
/// rather than pre-allocating every slot eagerly at startup.
pub struct SessionPool {
    semaphore: Semaphore,
    slots: Mutex<VecDeque<Slot>>,
    needs_relogin: Mutex<VecDeque<()>>,
    factory: Box<dyn Fn() -> Arc<dyn UpstreamClient> + Send + Sync>,
    credentials: Credentials,
}

impl SessionPool {
    /// `size` defaults to 2 per spec; `factory` builds one fresh,
    /// not-yet-logged-in client per slot.
    pub fn new(
        size: usize,
        credentials: Credentials,
        factory: impl Fn() -> Arc<dyn UpstreamClient> + Send + Sync + 'static,
    ) -> Self {
        Self {
            semaphore: Semaphore::new(size),
            slots: Mutex::new(VecDeque::new()),
            needs_relogin: Mutex::new(VecDeque::new()),
            factory: Box::new(factory),
            credentials,
        }
    }

    /// Acquire a logged-in session, blocking until one is available.
    pub async fn acquire(&self) -> Result<Leased<'_>, PoolError> {
        let permit = self.semaphore.acquire().await.map_err(|_| PoolError::Closed)?;

        let existing = self.slots.lock().unwrap().pop_front();
        let session = match existing {
            Some(slot) => slot.session,
            None => {
                if self.needs_relogin.lock().unwrap().pop_front().is_some() {
                    info!("relogging in to replace an invalidated session");
                }
                let session = (self.factory)();
                session
                    .login(&self.credentials)
                    .await
                    .map_err(|e| PoolError::LoginFailed(e.to_string()))?;
                session
            }
        };

        Ok(Leased {
            pool: self,
            session: Some(session),
            invalidated: false,
            _permit: permit,
        })
    }

    /// Number of sessions currently idle in the pool (not leased).
    pub async fn idle_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    use crate::client::{ClientError, SessionCursor, ThumbnailOptions, UpstreamEntry};

    struct FakeClient {
        logins: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for FakeClient {
        async fn login(&self, _creds: &Credentials) -> Result<(), ClientError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn navigate(&self, _path: &str) -> Result<(), ClientError> {
            Ok(())
        }
        async fn list_directories(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            Ok(vec![])
        }
        async fn list_projects(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            Ok(vec![])
        }
        async fn select_project(&self, _id: Uuid) -> Result<(), ClientError> {
            Ok(())
        }
        async fn list_phases(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            Ok(vec![])
        }
        async fn select_phase(&self, _id: Uuid) -> Result<(), ClientError> {
            Ok(())
        }
        async fn list_elevations(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            Ok(vec![])
        }
        async fn fetch_thumbnail(
            &self,
            _id: Uuid,
            _opts: ThumbnailOptions,
        ) -> Result<Vec<u8>, ClientError> {
            Ok(vec![])
        }
        async fn fetch_parts_blob(&self, _elevation_id: Uuid) -> Result<Vec<u8>, ClientError> {
            Ok(vec![])
        }
        async fn logout(&self) -> Result<(), ClientError> {
            Ok(())
        }
        fn cursor(&self) -> SessionCursor {
            SessionCursor::default()
        }
    }

    fn creds() -> Credentials {
        Credentials {
            username: "u".into(),
            password: "p".into(),
        }
    }

    #[tokio::test]
    async fn acquire_reuses_released_session_without_relogin() {
        let pool = SessionPool::new(1, creds(), || {
            Arc::new(FakeClient {
                logins: AtomicUsize::new(0),
            })
        });

        {
            let leased = pool.acquire().await.unwrap();
            assert!(leased.session().navigate("/").await.is_ok());
        }
        assert_eq!(pool.idle_count().await, 1);

        let _leased = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn invalidated_session_is_not_recycled() {
        let pool = SessionPool::new(1, creds(), || {
            Arc::new(FakeClient {
                logins: AtomicUsize::new(0),
            })
        });

        {
            let mut leased = pool.acquire().await.unwrap();
            leased.invalidate();
        }
        assert_eq!(pool.idle_count().await, 0);

        // Next acquire must relogin rather than reuse the invalidated slot.
        let _leased = pool.acquire().await.unwrap();
    }
}
