//! Mirrored entity types
//!
//! The five entity kinds in the strict tree (Directory -> Project -> Phase
//! -> Elevation, Parts-Blob owned by Elevation), plus the supporting
//! ObjectSyncConfig / SyncRun kinds used by the registry and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminates which of the five mirrored kinds a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Directory,
    Project,
    Phase,
    Elevation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Project => "project",
            Self::Phase => "phase",
            Self::Elevation => "elevation",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of comparing an upstream child against its local row, recorded
/// per-entity inside a sweep. Carries no exception; `ParentDeleted` is the
/// explicit variant that replaces the source's `not_found`-exception idiom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    New,
    Updated,
    Unchanged,
    ToRemove,
    Removed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::ToRemove => "to_remove",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Pending,
    Running,
    Ok,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ParseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown parse_status: {s}")),
        }
    }
}

/// Timestamps every entity carries. `local_synced_at` must never decrease;
/// that invariant is enforced by the Store, not by this struct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncTimestamps {
    pub upstream_changed_at: Option<DateTime<Utc>>,
    pub local_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    pub id: Uuid,
    pub upstream_id: Uuid,
    pub full_path: String,
    pub parent_id: Option<Uuid>,
    pub level: i32,
    pub excluded: bool,
    pub sync_status: SyncStatus,
    pub timestamps: SyncTimestamps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub upstream_id: Uuid,
    pub directory_id: Uuid,
    pub name: String,
    pub sync_status: SyncStatus,
    pub timestamps: SyncTimestamps,
}

/// Phase natural key is `(project_id, upstream_id)` — upstream id alone is
/// not globally unique, only unique within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: Uuid,
    pub upstream_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub sync_status: SyncStatus,
    pub timestamps: SyncTimestamps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Elevation {
    pub id: Uuid,
    pub upstream_id: Uuid,
    pub phase_id: Uuid,
    pub name: String,
    pub width_mm: Option<f64>,
    pub height_mm: Option<f64>,
    pub image_path: Option<String>,
    pub parts_blob_path: Option<String>,
    pub parts_blob_hash: Option<String>,
    pub parse_status: ParseStatus,
    pub parse_retry_count: i32,
    /// Populated only once `parse_status == Ok`.
    pub system_info: Option<String>,
    pub glass_spec: Option<String>,
    pub parts_count: Option<i32>,
    pub sync_status: SyncStatus,
    pub timestamps: SyncTimestamps,
}

impl Elevation {
    /// `has_parts = true` iff a blob path is recorded; the Store is
    /// responsible for confirming the file is actually present on disk.
    pub fn has_parts(&self) -> bool {
        self.parts_blob_path.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Done,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub parent_id: Option<Uuid>,
    pub state: AttemptState,
    pub created: i32,
    pub updated: i32,
    pub deleted: i32,
    pub skipped: i32,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub scope_kind: Option<EntityKind>,
    pub scope_root: Option<Uuid>,
    pub state: SyncRunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: Vec<SyncAttempt>,
}

impl SyncRun {
    pub fn error_count(&self) -> usize {
        self.attempts.iter().map(|a| a.errors.len()).sum()
    }
}
