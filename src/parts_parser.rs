//! Parts Parser Worker
//!
//! Drains the backlog of Elevations with a staged parts-blob and a
//! `pending`/`failed` parse status, opens each blob as an embedded SQLite
//! database, and extracts the enrichment columns the blob carries
//! (dimensions, system description, glass spec, part count). Bounded to
//! two concurrent parses, matching the source's
//! `SQLiteParserWorkerManager.MAX_CONCURRENT_WORKERS`.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::entities::{Elevation, ParseStatus};
use crate::error::{Categorized, ErrorCategory};
use crate::store::{Store, StoreError};

/// Two concurrent parses, mirroring the source's hardcoded worker limit.
const MAX_CONCURRENT_PARSES: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Blob(#[from] crate::blob_store::BlobStoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error staging blob for parsing: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("parts blob missing the expected schema: {0}")]
    Schema(String),
}

impl Categorized for ParseError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Blob(e) => e_category(e),
            Self::Store(e) => e.category(),
            Self::Io(_) => ErrorCategory::Transport,
            Self::Sqlite(e) => {
                if is_retryable_sqlite_message(&e.to_string()) {
                    ErrorCategory::Transport
                } else {
                    ErrorCategory::Validation
                }
            }
            Self::Schema(_) => ErrorCategory::Validation,
        }
    }
}

fn e_category(e: &crate::blob_store::BlobStoreError) -> ErrorCategory {
    use crate::blob_store::BlobStoreError as E;
    match e {
        E::NotFound(_) => ErrorCategory::NotFound,
        E::InvalidRef(_) => ErrorCategory::Validation,
        E::Io(_) | E::Storage(_) => ErrorCategory::Transport,
    }
}

/// String-matched retryable SQLite failure modes, grounded on the
/// source's `_is_retryable_error` substring list.
fn is_retryable_sqlite_message(message: &str) -> bool {
    const RETRYABLE: &[&str] = &[
        "database is locked",
        "temporary failure",
        "connection timeout",
        "file is busy",
        "sqlite error",
        "connection error",
    ];
    let lower = message.to_lowercase();
    RETRYABLE.iter().any(|needle| lower.contains(needle))
}

/// Enrichment columns a parts-blob yields, matching the
/// `Elevations`/`Glass` table shape the upstream CAD tool exports.
struct ParsedParts {
    width_mm: Option<f64>,
    height_mm: Option<f64>,
    system_info: Option<String>,
    glass_spec: Option<String>,
    parts_count: i32,
}

/// Outcome of one parse attempt, used by `run_once`'s summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed,
    Skipped,
    Failed,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub parsed: u32,
    pub skipped: u32,
    pub failed: u32,
}

pub struct PartsParserWorker<S, B> {
    store: S,
    blob_store: B,
    semaphore: Arc<Semaphore>,
    max_retries: i32,
}

impl<S: Store, B: BlobStore> PartsParserWorker<S, B> {
    pub fn new(store: S, blob_store: B, max_retries: i32) -> Self {
        Self {
            store,
            blob_store,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_PARSES)),
            max_retries,
        }
    }

    /// One poll of the backlog: fetch up to `batch_size` ready Elevations
    /// and parse them, bounded to two concurrent parses regardless of
    /// how large `batch_size` is.
    pub async fn run_once(&self, batch_size: u32) -> Result<BatchSummary, ParseError> {
        let candidates = self
            .store
            .find_elevations_pending_parse(self.max_retries, batch_size)
            .await?;

        if candidates.is_empty() {
            return Ok(BatchSummary::default());
        }

        info!(count = candidates.len(), "parts parser backlog picked up");

        let outcomes: Vec<ParseOutcome> = stream::iter(candidates)
            .map(|elevation| self.parse_one(elevation))
            .buffer_unordered(MAX_CONCURRENT_PARSES)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for outcome in outcomes {
            match outcome {
                ParseOutcome::Parsed => summary.parsed += 1,
                ParseOutcome::Skipped => summary.skipped += 1,
                ParseOutcome::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    async fn parse_one(&self, elevation: Elevation) -> ParseOutcome {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        match self.try_parse(&elevation).await {
            Ok(ParseOutcome::Skipped) => ParseOutcome::Skipped,
            Ok(outcome) => outcome,
            Err(e) => {
                let retryable = e.category().is_retriable();
                let next_retry = elevation.parse_retry_count + 1;
                let exhausted = next_retry >= self.max_retries;
                warn!(
                    elevation_id = %elevation.upstream_id,
                    error = %e,
                    retry_count = next_retry,
                    retryable,
                    exhausted,
                    "parts blob parse failed"
                );
                let mut failed = elevation.clone();
                failed.parse_status = ParseStatus::Failed;
                failed.parse_retry_count = next_retry;
                if self.store.upsert_elevation(failed).await.is_err() {
                    warn!(
                        elevation_id = %elevation.upstream_id,
                        "failed to persist parse failure, will be retried next poll"
                    );
                }
                ParseOutcome::Failed
            }
        }
    }

    /// Fetches, re-hashes, and parses one elevation's staged blob. Returns
    /// `Skipped` if the staged blob no longer matches the hash recorded at
    /// sync time (a concurrent re-sync raced this poll) rather than parsing
    /// stale bytes.
    async fn try_parse(&self, elevation: &Elevation) -> Result<ParseOutcome, ParseError> {
        let blob_ref = elevation
            .parts_blob_path
            .as_ref()
            .ok_or_else(|| ParseError::Schema("elevation has no staged blob".into()))?;

        let bytes = self.blob_store.fetch(blob_ref).await?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        if elevation
            .parts_blob_hash
            .as_deref()
            .is_some_and(|recorded| recorded != hash)
        {
            info!(
                elevation_id = %elevation.upstream_id,
                "staged blob hash changed since this poll started, deferring to next pass"
            );
            return Ok(ParseOutcome::Skipped);
        }

        let parsed = parse_sqlite_blob(bytes).await?;

        let mut updated = elevation.clone();
        updated.parse_status = ParseStatus::Ok;
        updated.parse_retry_count = 0;
        updated.width_mm = parsed.width_mm.or(updated.width_mm);
        updated.height_mm = parsed.height_mm.or(updated.height_mm);
        updated.system_info = parsed.system_info;
        updated.glass_spec = parsed.glass_spec;
        updated.parts_count = Some(parsed.parts_count);
        updated.parts_blob_hash = Some(hash);

        self.store.upsert_elevation(updated).await?;
        info!(elevation_id = %elevation.upstream_id, "parts blob parsed");
        Ok(ParseOutcome::Parsed)
    }
}

/// Stages `bytes` to a scratch file and runs the fixed extraction query
/// against it on a blocking thread, since `rusqlite` is synchronous.
async fn parse_sqlite_blob(bytes: Vec<u8>) -> Result<ParsedParts, ParseError> {
    let scratch_path = std::env::temp_dir().join(format!("parts-parse-{}.db", Uuid::new_v4()));
    tokio::fs::write(&scratch_path, &bytes).await?;

    let result = tokio::task::spawn_blocking({
        let scratch_path = scratch_path.clone();
        move || extract_parts(&scratch_path)
    })
    .await
    .map_err(|e| ParseError::Schema(format!("parser task panicked: {e}")))?;

    let _ = tokio::fs::remove_file(&scratch_path).await;
    result
}

/// Known schema extraction: `Elevations` carries dimensions and system
/// description, `Glass` carries one row per glass spec on the elevation.
fn extract_parts(path: &std::path::Path) -> Result<ParsedParts, ParseError> {
    let conn = rusqlite::Connection::open(path)?;

    let (width_mm, height_mm, system_info) = conn
        .query_row(
            "select Width_Out, Heighth_Out, coalesce(SystemLongName, SystemName) from Elevations limit 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<f64>>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ParseError::Schema("Elevations table has no rows".into())
            }
            other => ParseError::Sqlite(other),
        })?;

    let glass_spec: Option<String> = conn
        .query_row("select group_concat(Name, ', ') from Glass", [], |row| {
            row.get(0)
        })
        .unwrap_or(None);

    let parts_count: i32 = conn
        .query_row("select count(*) from Glass", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(ParsedParts {
        width_mm,
        height_mm,
        system_info,
        glass_spec,
        parts_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use crate::entities::{SyncStatus, SyncTimestamps};
    use crate::store::InMemoryStore;

    fn sample_sqlite_bytes() -> Vec<u8> {
        let scratch = std::env::temp_dir().join(format!("parts-test-{}.db", Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&scratch).unwrap();
        conn.execute_batch(
            "create table Elevations (Width_Out real, Heighth_Out real, SystemLongName text, SystemName text);
             insert into Elevations values (1200.5, 800.0, 'Standard Glass System with Frame', 'Standard System');
             create table Glass (GlassID text, Name text);
             insert into Glass values ('GLASS001', 'Clear Glass 6mm');
             insert into Glass values ('GLASS002', 'Tempered Glass 8mm');",
        )
        .unwrap();
        drop(conn);
        let bytes = std::fs::read(&scratch).unwrap();
        let _ = std::fs::remove_file(&scratch);
        bytes
    }

    fn bare_elevation(blob_ref: Option<String>, hash: Option<String>) -> Elevation {
        Elevation {
            id: Uuid::new_v4(),
            upstream_id: Uuid::new_v4(),
            phase_id: Uuid::new_v4(),
            name: "Front Elevation".into(),
            width_mm: None,
            height_mm: None,
            image_path: None,
            parts_blob_path: blob_ref,
            parts_blob_hash: hash,
            parse_status: ParseStatus::Pending,
            parse_retry_count: 0,
            system_info: None,
            glass_spec: None,
            parts_count: None,
            sync_status: SyncStatus::Updated,
            timestamps: SyncTimestamps {
                upstream_changed_at: None,
                local_synced_at: Some(chrono::Utc::now()),
            },
        }
    }

    #[tokio::test]
    async fn parses_known_schema_and_marks_ok() {
        let store = InMemoryStore::new();
        let blob_store = InMemoryBlobStore::new();
        let bytes = sample_sqlite_bytes();
        let hash = format!("{:x}", Sha256::digest(&bytes));
        let blob_ref = blob_store.store("elevations/test.db", &bytes, "application/x-sqlite3").await.unwrap();

        let mut elevation = bare_elevation(Some(blob_ref), Some(hash));
        elevation.phase_id = Uuid::new_v4();
        store.upsert_elevation(elevation.clone()).await.unwrap();

        let worker = PartsParserWorker::new(store, blob_store, 3);
        let summary = worker.run_once(10).await.unwrap();

        assert_eq!(summary.parsed, 1);
        assert_eq!(summary.failed, 0);

        let refetched = worker
            .store
            .find_elevation_by_upstream_id(elevation.phase_id, elevation.upstream_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refetched.parse_status, ParseStatus::Ok);
        assert_eq!(refetched.width_mm, Some(1200.5));
        assert_eq!(refetched.parts_count, Some(2));
        assert!(refetched.glass_spec.unwrap().contains("Clear Glass"));
    }

    #[tokio::test]
    async fn missing_blob_path_is_not_selected_by_the_store_query() {
        let store = InMemoryStore::new();
        let elevation = bare_elevation(None, None);
        store.upsert_elevation(elevation).await.unwrap();

        let pending = store.find_elevations_pending_parse(3, 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn hash_mismatch_against_recorded_hash_is_skipped_not_parsed() {
        let store = InMemoryStore::new();
        let blob_store = InMemoryBlobStore::new();
        let bytes = sample_sqlite_bytes();
        let blob_ref = blob_store.store("elevations/test.db", &bytes, "application/x-sqlite3").await.unwrap();

        // Recorded hash deliberately wrong, simulating a blob that was
        // re-staged by a concurrent sync after this poll listed it.
        let elevation = bare_elevation(Some(blob_ref), Some("stale-hash".into()));
        store.upsert_elevation(elevation.clone()).await.unwrap();

        let worker = PartsParserWorker::new(store, blob_store, 3);
        let summary = worker.run_once(10).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.parsed, 0);
    }

    #[test]
    fn retryable_sqlite_messages_are_recognized() {
        assert!(is_retryable_sqlite_message("database is locked"));
        assert!(is_retryable_sqlite_message("Connection Timeout occurred"));
        assert!(!is_retryable_sqlite_message("no such table: Elevations"));
    }
}
