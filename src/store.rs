//! Local relational store
//!
//! One trait, two implementations: `PostgresStore` for production,
//! `InMemoryStore` for orchestration tests. Mirrors the Entity Syncer's
//! needs directly — upsert, tombstone, and the parent-scoped child scan
//! used before every sweep of a level.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{Directory, Elevation, EntityKind, Phase, Project, SyncRun, SyncStatus};
use crate::error::{Categorized, ErrorCategory};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity not found: {kind} {id}")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("database unavailable: {0}")]
    Unavailable(String),
}

impl Categorized for StoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Constraint(_) => ErrorCategory::Validation,
            Self::Unavailable(_) => ErrorCategory::System,
        }
    }
}

/// Either a fresh write or a no-op, distinguished so the Entity Syncer can
/// count created/updated/unchanged without re-deriving it from timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Created,
    Updated,
    Unchanged,
}

/// Aggregate counts from one `batch_upsert_*` call, the batched shape of
/// `WriteResult` for a whole parent's worth of children at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchUpsertCounts {
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
}

impl BatchUpsertCounts {
    fn record(&mut self, existed: bool, status: SyncStatus) {
        match classify_write(existed, status) {
            WriteResult::Created => self.created += 1,
            WriteResult::Updated => self.updated += 1,
            WriteResult::Unchanged => self.unchanged += 1,
        }
    }
}

/// Persistence surface the Entity Syncers and Cascade Orchestrator need.
/// Kept narrow and kind-polymorphic at the call site rather than generic
/// over entity type, matching how the source's sync service dispatches by
/// kind rather than by trait bound.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_directory(&self, dir: Directory) -> Result<WriteResult, StoreError>;
    async fn upsert_project(&self, project: Project) -> Result<WriteResult, StoreError>;
    async fn upsert_phase(&self, phase: Phase) -> Result<WriteResult, StoreError>;
    async fn upsert_elevation(&self, elevation: Elevation) -> Result<WriteResult, StoreError>;

    /// Batched form of `upsert_directory` for a whole parent's worth of
    /// children: one `SELECT` of which of `rows`' ids already exist,
    /// partitioned into one bulk `INSERT` and one bulk `UPDATE`, instead of
    /// a `find` + `upsert` round trip per row. `rows` must already carry
    /// the correct `id` for each entity — the existing row's id for an
    /// update, a freshly generated one for a create — as the Entity Syncer
    /// determines by diffing against its own single batched listing.
    async fn batch_upsert_directories(
        &self,
        rows: Vec<Directory>,
    ) -> Result<BatchUpsertCounts, StoreError>;
    async fn batch_upsert_projects(&self, rows: Vec<Project>) -> Result<BatchUpsertCounts, StoreError>;
    async fn batch_upsert_phases(&self, rows: Vec<Phase>) -> Result<BatchUpsertCounts, StoreError>;
    async fn batch_upsert_elevations(
        &self,
        rows: Vec<Elevation>,
    ) -> Result<BatchUpsertCounts, StoreError>;

    async fn find_directory_by_upstream_id(
        &self,
        upstream_id: Uuid,
    ) -> Result<Option<Directory>, StoreError>;
    async fn find_project_by_upstream_id(
        &self,
        directory_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Project>, StoreError>;
    async fn find_phase_by_upstream_id(
        &self,
        project_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Phase>, StoreError>;
    async fn find_elevation_by_upstream_id(
        &self,
        phase_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Elevation>, StoreError>;

    async fn children_of_directory(&self, directory_id: Uuid) -> Result<Vec<Directory>, StoreError>;
    async fn projects_of_directory(&self, directory_id: Uuid) -> Result<Vec<Project>, StoreError>;
    async fn phases_of_project(&self, project_id: Uuid) -> Result<Vec<Phase>, StoreError>;
    async fn elevations_of_phase(&self, phase_id: Uuid) -> Result<Vec<Elevation>, StoreError>;

    /// Fetch by surrogate id, used by the Cascade Orchestrator to resolve a
    /// parent's navigation path (directory `full_path`, project/phase
    /// `upstream_id`) before positioning the session cursor.
    async fn get_directory(&self, id: Uuid) -> Result<Option<Directory>, StoreError>;
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError>;
    async fn get_phase(&self, id: Uuid) -> Result<Option<Phase>, StoreError>;

    /// Mark every local child of `parent_id` not present in `seen_upstream_ids`
    /// as `to_remove`. Never deletes rows outright; navigation may bring the
    /// entity back, at which point its sync_status reverts to `updated`.
    async fn mark_missing_children_to_remove(
        &self,
        kind: EntityKind,
        parent_id: Uuid,
        seen_upstream_ids: &[Uuid],
    ) -> Result<u32, StoreError>;

    /// Delete every child of `parent_id` still tagged `to_remove`, cascading
    /// to grandchildren. This is `clear_to_remove` from spec.md §4.2: a
    /// survivor from `mark_missing_children_to_remove` that was never
    /// resurrected by a later upsert in the same sweep is gone for good.
    async fn clear_to_remove(&self, kind: EntityKind, parent_id: Uuid) -> Result<u32, StoreError>;

    /// Delete one entity by its own surrogate id, cascading to its entire
    /// subtree. Used when the *parent* itself returned `not_found` upstream
    /// (§4.6 step 1) rather than one of its children going missing.
    async fn tombstone(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError>;

    /// Entities of `kind` whose `local_synced_at` is older than `older_than`,
    /// used by the Scheduler's periodic stale-scan fallback between sweeps.
    async fn scan_stale(
        &self,
        kind: EntityKind,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn record_sync_run(&self, run: SyncRun) -> Result<(), StoreError>;
    async fn latest_sync_run(&self, scope_root: Option<Uuid>) -> Result<Option<SyncRun>, StoreError>;

    /// Elevations ready for the Parts Parser Worker to pick up: a staged
    /// blob present, parse status `pending` or `failed`, and retry count
    /// still under `max_retries`. Ordered oldest-staged-first so a backlog
    /// drains in roughly the order it accumulated.
    async fn find_elevations_pending_parse(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<Elevation>, StoreError>;
}

/// Lets an `Arc<dyn Store>` (or `Arc<InMemoryStore>`/`Arc<PostgresStore>`)
/// satisfy any `S: Store` bound directly, so the Cascade Orchestrator and
/// the per-kind Entity Syncers can share one store instance by cloning the
/// `Arc` instead of each constructing their own. Production's
/// `PostgresStore` doesn't strictly need this (its state lives behind a
/// shared `sqlx::PgPool`), but the in-memory test fake does: two separately
/// constructed `InMemoryStore`s never see each other's writes.
#[async_trait]
impl<T: Store + ?Sized> Store for Arc<T> {
    async fn upsert_directory(&self, dir: Directory) -> Result<WriteResult, StoreError> {
        (**self).upsert_directory(dir).await
    }
    async fn upsert_project(&self, project: Project) -> Result<WriteResult, StoreError> {
        (**self).upsert_project(project).await
    }
    async fn upsert_phase(&self, phase: Phase) -> Result<WriteResult, StoreError> {
        (**self).upsert_phase(phase).await
    }
    async fn upsert_elevation(&self, elevation: Elevation) -> Result<WriteResult, StoreError> {
        (**self).upsert_elevation(elevation).await
    }
    async fn batch_upsert_directories(
        &self,
        rows: Vec<Directory>,
    ) -> Result<BatchUpsertCounts, StoreError> {
        (**self).batch_upsert_directories(rows).await
    }
    async fn batch_upsert_projects(&self, rows: Vec<Project>) -> Result<BatchUpsertCounts, StoreError> {
        (**self).batch_upsert_projects(rows).await
    }
    async fn batch_upsert_phases(&self, rows: Vec<Phase>) -> Result<BatchUpsertCounts, StoreError> {
        (**self).batch_upsert_phases(rows).await
    }
    async fn batch_upsert_elevations(
        &self,
        rows: Vec<Elevation>,
    ) -> Result<BatchUpsertCounts, StoreError> {
        (**self).batch_upsert_elevations(rows).await
    }
    async fn find_directory_by_upstream_id(
        &self,
        upstream_id: Uuid,
    ) -> Result<Option<Directory>, StoreError> {
        (**self).find_directory_by_upstream_id(upstream_id).await
    }
    async fn find_project_by_upstream_id(
        &self,
        directory_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Project>, StoreError> {
        (**self).find_project_by_upstream_id(directory_id, upstream_id).await
    }
    async fn find_phase_by_upstream_id(
        &self,
        project_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Phase>, StoreError> {
        (**self).find_phase_by_upstream_id(project_id, upstream_id).await
    }
    async fn find_elevation_by_upstream_id(
        &self,
        phase_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Elevation>, StoreError> {
        (**self).find_elevation_by_upstream_id(phase_id, upstream_id).await
    }
    async fn children_of_directory(&self, directory_id: Uuid) -> Result<Vec<Directory>, StoreError> {
        (**self).children_of_directory(directory_id).await
    }
    async fn projects_of_directory(&self, directory_id: Uuid) -> Result<Vec<Project>, StoreError> {
        (**self).projects_of_directory(directory_id).await
    }
    async fn phases_of_project(&self, project_id: Uuid) -> Result<Vec<Phase>, StoreError> {
        (**self).phases_of_project(project_id).await
    }
    async fn elevations_of_phase(&self, phase_id: Uuid) -> Result<Vec<Elevation>, StoreError> {
        (**self).elevations_of_phase(phase_id).await
    }
    async fn get_directory(&self, id: Uuid) -> Result<Option<Directory>, StoreError> {
        (**self).get_directory(id).await
    }
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        (**self).get_project(id).await
    }
    async fn get_phase(&self, id: Uuid) -> Result<Option<Phase>, StoreError> {
        (**self).get_phase(id).await
    }
    async fn mark_missing_children_to_remove(
        &self,
        kind: EntityKind,
        parent_id: Uuid,
        seen_upstream_ids: &[Uuid],
    ) -> Result<u32, StoreError> {
        (**self).mark_missing_children_to_remove(kind, parent_id, seen_upstream_ids).await
    }
    async fn clear_to_remove(&self, kind: EntityKind, parent_id: Uuid) -> Result<u32, StoreError> {
        (**self).clear_to_remove(kind, parent_id).await
    }
    async fn tombstone(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError> {
        (**self).tombstone(kind, id).await
    }
    async fn scan_stale(
        &self,
        kind: EntityKind,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        (**self).scan_stale(kind, older_than, limit).await
    }
    async fn record_sync_run(&self, run: SyncRun) -> Result<(), StoreError> {
        (**self).record_sync_run(run).await
    }
    async fn latest_sync_run(&self, scope_root: Option<Uuid>) -> Result<Option<SyncRun>, StoreError> {
        (**self).latest_sync_run(scope_root).await
    }
    async fn find_elevations_pending_parse(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<Elevation>, StoreError> {
        (**self).find_elevations_pending_parse(max_retries, limit).await
    }
}

/// Production store. Each public method is one statement or one
/// transaction; queries are written with `sqlx::query_as` rather than the
/// `query_as!` macro because the schema is applied by migrations that may
/// not exist at compile time in every build environment.
#[cfg(feature = "database")]
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

#[cfg(feature = "database")]
impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl Store for PostgresStore {
    async fn upsert_directory(&self, dir: Directory) -> Result<WriteResult, StoreError> {
        let existing = self.find_directory_by_upstream_id(dir.upstream_id).await?;
        sqlx::query(
            r#"
            insert into directories
                (id, upstream_id, full_path, parent_id, level, is_excluded, sync_status,
                 upstream_changed_at, local_synced_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            on conflict (upstream_id) do update set
                full_path = excluded.full_path,
                parent_id = excluded.parent_id,
                level = excluded.level,
                is_excluded = excluded.is_excluded,
                sync_status = excluded.sync_status,
                upstream_changed_at = excluded.upstream_changed_at,
                local_synced_at = excluded.local_synced_at
            "#,
        )
        .bind(dir.id)
        .bind(dir.upstream_id)
        .bind(&dir.full_path)
        .bind(dir.parent_id)
        .bind(dir.level)
        .bind(dir.excluded)
        .bind(dir.sync_status.as_str())
        .bind(dir.timestamps.upstream_changed_at)
        .bind(dir.timestamps.local_synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(classify_write(existing.is_some(), dir.sync_status))
    }

    async fn upsert_project(&self, project: Project) -> Result<WriteResult, StoreError> {
        let existing = self
            .find_project_by_upstream_id(project.directory_id, project.upstream_id)
            .await?;
        sqlx::query(
            r#"
            insert into projects
                (id, upstream_id, directory_id, name, sync_status,
                 upstream_changed_at, local_synced_at)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (directory_id, upstream_id) do update set
                name = excluded.name,
                sync_status = excluded.sync_status,
                upstream_changed_at = excluded.upstream_changed_at,
                local_synced_at = excluded.local_synced_at
            "#,
        )
        .bind(project.id)
        .bind(project.upstream_id)
        .bind(project.directory_id)
        .bind(&project.name)
        .bind(project.sync_status.as_str())
        .bind(project.timestamps.upstream_changed_at)
        .bind(project.timestamps.local_synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(classify_write(existing.is_some(), project.sync_status))
    }

    async fn upsert_phase(&self, phase: Phase) -> Result<WriteResult, StoreError> {
        let existing = self
            .find_phase_by_upstream_id(phase.project_id, phase.upstream_id)
            .await?;
        sqlx::query(
            r#"
            insert into phases
                (id, upstream_id, project_id, name, sync_status,
                 upstream_changed_at, local_synced_at)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (project_id, upstream_id) do update set
                name = excluded.name,
                sync_status = excluded.sync_status,
                upstream_changed_at = excluded.upstream_changed_at,
                local_synced_at = excluded.local_synced_at
            "#,
        )
        .bind(phase.id)
        .bind(phase.upstream_id)
        .bind(phase.project_id)
        .bind(&phase.name)
        .bind(phase.sync_status.as_str())
        .bind(phase.timestamps.upstream_changed_at)
        .bind(phase.timestamps.local_synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(classify_write(existing.is_some(), phase.sync_status))
    }

    async fn upsert_elevation(&self, elevation: Elevation) -> Result<WriteResult, StoreError> {
        let existing = self
            .find_elevation_by_upstream_id(elevation.phase_id, elevation.upstream_id)
            .await?;
        sqlx::query(
            r#"
            insert into elevations
                (id, upstream_id, phase_id, name, width_mm, height_mm, image_path,
                 parts_blob_path, parts_blob_hash, parse_status, parse_retry_count,
                 system_info, glass_spec, parts_count, sync_status,
                 upstream_changed_at, local_synced_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            on conflict (phase_id, upstream_id) do update set
                name = excluded.name,
                width_mm = excluded.width_mm,
                height_mm = excluded.height_mm,
                image_path = excluded.image_path,
                parts_blob_path = excluded.parts_blob_path,
                parts_blob_hash = excluded.parts_blob_hash,
                parse_status = excluded.parse_status,
                parse_retry_count = excluded.parse_retry_count,
                system_info = excluded.system_info,
                glass_spec = excluded.glass_spec,
                parts_count = excluded.parts_count,
                sync_status = excluded.sync_status,
                upstream_changed_at = excluded.upstream_changed_at,
                local_synced_at = excluded.local_synced_at
            "#,
        )
        .bind(elevation.id)
        .bind(elevation.upstream_id)
        .bind(elevation.phase_id)
        .bind(&elevation.name)
        .bind(elevation.width_mm)
        .bind(elevation.height_mm)
        .bind(&elevation.image_path)
        .bind(&elevation.parts_blob_path)
        .bind(&elevation.parts_blob_hash)
        .bind(elevation.parse_status.as_str())
        .bind(elevation.parse_retry_count)
        .bind(&elevation.system_info)
        .bind(&elevation.glass_spec)
        .bind(elevation.parts_count)
        .bind(elevation.sync_status.as_str())
        .bind(elevation.timestamps.upstream_changed_at)
        .bind(elevation.timestamps.local_synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(classify_write(existing.is_some(), elevation.sync_status))
    }

    async fn batch_upsert_directories(
        &self,
        rows: Vec<Directory>,
    ) -> Result<BatchUpsertCounts, StoreError> {
        if rows.is_empty() {
            return Ok(BatchUpsertCounts::default());
        }
        let ids: Vec<Uuid> = rows.iter().map(|d| d.id).collect();
        let existing: std::collections::HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            "select id from directories where id = any($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .into_iter()
        .collect();

        let mut counts = BatchUpsertCounts::default();
        let (mut to_insert, mut to_update) = (Vec::new(), Vec::new());
        for dir in rows {
            counts.record(existing.contains(&dir.id), dir.sync_status);
            if existing.contains(&dir.id) {
                to_update.push(dir);
            } else {
                to_insert.push(dir);
            }
        }

        if !to_insert.is_empty() {
            let (ids, upstream_ids, paths, parents, levels, excludeds, statuses, changed, synced): (
                Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>,
            ) = to_insert.iter().fold(
                (
                    Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(),
                    Vec::new(), Vec::new(), Vec::new(),
                ),
                |mut acc, d| {
                    acc.0.push(d.id);
                    acc.1.push(d.upstream_id);
                    acc.2.push(d.full_path.clone());
                    acc.3.push(d.parent_id);
                    acc.4.push(d.level);
                    acc.5.push(d.excluded);
                    acc.6.push(d.sync_status.as_str());
                    acc.7.push(d.timestamps.upstream_changed_at);
                    acc.8.push(d.timestamps.local_synced_at);
                    acc
                },
            );
            sqlx::query(
                r#"
                insert into directories
                    (id, upstream_id, full_path, parent_id, level, is_excluded, sync_status,
                     upstream_changed_at, local_synced_at)
                select * from unnest(
                    $1::uuid[], $2::uuid[], $3::text[], $4::uuid[], $5::int[], $6::bool[],
                    $7::text[], $8::timestamptz[], $9::timestamptz[]
                )
                "#,
            )
            .bind(ids)
            .bind(upstream_ids)
            .bind(paths)
            .bind(parents)
            .bind(levels)
            .bind(excludeds)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        if !to_update.is_empty() {
            let (ids, paths, parents, levels, excludeds, statuses, changed, synced): (
                Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>,
            ) = to_update.iter().fold(
                (
                    Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(),
                    Vec::new(), Vec::new(),
                ),
                |mut acc, d| {
                    acc.0.push(d.id);
                    acc.1.push(d.full_path.clone());
                    acc.2.push(d.parent_id);
                    acc.3.push(d.level);
                    acc.4.push(d.excluded);
                    acc.5.push(d.sync_status.as_str());
                    acc.6.push(d.timestamps.upstream_changed_at);
                    acc.7.push(d.timestamps.local_synced_at);
                    acc
                },
            );
            sqlx::query(
                r#"
                update directories as d set
                    full_path = u.full_path,
                    parent_id = u.parent_id,
                    level = u.level,
                    is_excluded = u.is_excluded,
                    sync_status = u.sync_status,
                    upstream_changed_at = u.upstream_changed_at,
                    local_synced_at = u.local_synced_at
                from unnest(
                    $1::uuid[], $2::text[], $3::uuid[], $4::int[], $5::bool[],
                    $6::text[], $7::timestamptz[], $8::timestamptz[]
                ) as u(id, full_path, parent_id, level, is_excluded, sync_status,
                       upstream_changed_at, local_synced_at)
                where d.id = u.id
                "#,
            )
            .bind(ids)
            .bind(paths)
            .bind(parents)
            .bind(levels)
            .bind(excludeds)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        Ok(counts)
    }

    async fn batch_upsert_projects(&self, rows: Vec<Project>) -> Result<BatchUpsertCounts, StoreError> {
        if rows.is_empty() {
            return Ok(BatchUpsertCounts::default());
        }
        let ids: Vec<Uuid> = rows.iter().map(|p| p.id).collect();
        let existing: std::collections::HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            "select id from projects where id = any($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .into_iter()
        .collect();

        let mut counts = BatchUpsertCounts::default();
        let (mut to_insert, mut to_update) = (Vec::new(), Vec::new());
        for project in rows {
            counts.record(existing.contains(&project.id), project.sync_status);
            if existing.contains(&project.id) {
                to_update.push(project);
            } else {
                to_insert.push(project);
            }
        }

        if !to_insert.is_empty() {
            let (ids, upstream_ids, dir_ids, names, statuses, changed, synced): (
                Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>,
            ) = to_insert.iter().fold(
                (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new()),
                |mut acc, p| {
                    acc.0.push(p.id);
                    acc.1.push(p.upstream_id);
                    acc.2.push(p.directory_id);
                    acc.3.push(p.name.clone());
                    acc.4.push(p.sync_status.as_str());
                    acc.5.push(p.timestamps.upstream_changed_at);
                    acc.6.push(p.timestamps.local_synced_at);
                    acc
                },
            );
            sqlx::query(
                r#"
                insert into projects (id, upstream_id, directory_id, name, sync_status,
                                       upstream_changed_at, local_synced_at)
                select * from unnest(
                    $1::uuid[], $2::uuid[], $3::uuid[], $4::text[], $5::text[],
                    $6::timestamptz[], $7::timestamptz[]
                )
                "#,
            )
            .bind(ids)
            .bind(upstream_ids)
            .bind(dir_ids)
            .bind(names)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        if !to_update.is_empty() {
            let (ids, names, statuses, changed, synced): (Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>) =
                to_update.iter().fold(
                    (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new()),
                    |mut acc, p| {
                        acc.0.push(p.id);
                        acc.1.push(p.name.clone());
                        acc.2.push(p.sync_status.as_str());
                        acc.3.push(p.timestamps.upstream_changed_at);
                        acc.4.push(p.timestamps.local_synced_at);
                        acc
                    },
                );
            sqlx::query(
                r#"
                update projects as p set
                    name = u.name,
                    sync_status = u.sync_status,
                    upstream_changed_at = u.upstream_changed_at,
                    local_synced_at = u.local_synced_at
                from unnest(
                    $1::uuid[], $2::text[], $3::text[], $4::timestamptz[], $5::timestamptz[]
                ) as u(id, name, sync_status, upstream_changed_at, local_synced_at)
                where p.id = u.id
                "#,
            )
            .bind(ids)
            .bind(names)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        Ok(counts)
    }

    async fn batch_upsert_phases(&self, rows: Vec<Phase>) -> Result<BatchUpsertCounts, StoreError> {
        if rows.is_empty() {
            return Ok(BatchUpsertCounts::default());
        }
        let ids: Vec<Uuid> = rows.iter().map(|p| p.id).collect();
        let existing: std::collections::HashSet<Uuid> =
            sqlx::query_scalar::<_, Uuid>("select id from phases where id = any($1)")
                .bind(&ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
                .into_iter()
                .collect();

        let mut counts = BatchUpsertCounts::default();
        let (mut to_insert, mut to_update) = (Vec::new(), Vec::new());
        for phase in rows {
            counts.record(existing.contains(&phase.id), phase.sync_status);
            if existing.contains(&phase.id) {
                to_update.push(phase);
            } else {
                to_insert.push(phase);
            }
        }

        if !to_insert.is_empty() {
            let (ids, upstream_ids, project_ids, names, statuses, changed, synced): (
                Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>,
            ) = to_insert.iter().fold(
                (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new()),
                |mut acc, p| {
                    acc.0.push(p.id);
                    acc.1.push(p.upstream_id);
                    acc.2.push(p.project_id);
                    acc.3.push(p.name.clone());
                    acc.4.push(p.sync_status.as_str());
                    acc.5.push(p.timestamps.upstream_changed_at);
                    acc.6.push(p.timestamps.local_synced_at);
                    acc
                },
            );
            sqlx::query(
                r#"
                insert into phases (id, upstream_id, project_id, name, sync_status,
                                     upstream_changed_at, local_synced_at)
                select * from unnest(
                    $1::uuid[], $2::uuid[], $3::uuid[], $4::text[], $5::text[],
                    $6::timestamptz[], $7::timestamptz[]
                )
                "#,
            )
            .bind(ids)
            .bind(upstream_ids)
            .bind(project_ids)
            .bind(names)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        if !to_update.is_empty() {
            let (ids, names, statuses, changed, synced): (Vec<_>, Vec<_>, Vec<_>, Vec<_>, Vec<_>) =
                to_update.iter().fold(
                    (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new()),
                    |mut acc, p| {
                        acc.0.push(p.id);
                        acc.1.push(p.name.clone());
                        acc.2.push(p.sync_status.as_str());
                        acc.3.push(p.timestamps.upstream_changed_at);
                        acc.4.push(p.timestamps.local_synced_at);
                        acc
                    },
                );
            sqlx::query(
                r#"
                update phases as p set
                    name = u.name,
                    sync_status = u.sync_status,
                    upstream_changed_at = u.upstream_changed_at,
                    local_synced_at = u.local_synced_at
                from unnest(
                    $1::uuid[], $2::text[], $3::text[], $4::timestamptz[], $5::timestamptz[]
                ) as u(id, name, sync_status, upstream_changed_at, local_synced_at)
                where p.id = u.id
                "#,
            )
            .bind(ids)
            .bind(names)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        Ok(counts)
    }

    async fn batch_upsert_elevations(
        &self,
        rows: Vec<Elevation>,
    ) -> Result<BatchUpsertCounts, StoreError> {
        if rows.is_empty() {
            return Ok(BatchUpsertCounts::default());
        }
        let ids: Vec<Uuid> = rows.iter().map(|e| e.id).collect();
        let existing: std::collections::HashSet<Uuid> =
            sqlx::query_scalar::<_, Uuid>("select id from elevations where id = any($1)")
                .bind(&ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
                .into_iter()
                .collect();

        let mut counts = BatchUpsertCounts::default();
        let (mut to_insert, mut to_update) = (Vec::new(), Vec::new());
        for elevation in rows {
            counts.record(existing.contains(&elevation.id), elevation.sync_status);
            if existing.contains(&elevation.id) {
                to_update.push(elevation);
            } else {
                to_insert.push(elevation);
            }
        }

        if !to_insert.is_empty() {
            let mut ids = Vec::with_capacity(to_insert.len());
            let mut upstream_ids = Vec::with_capacity(to_insert.len());
            let mut phase_ids = Vec::with_capacity(to_insert.len());
            let mut names = Vec::with_capacity(to_insert.len());
            let mut widths = Vec::with_capacity(to_insert.len());
            let mut heights = Vec::with_capacity(to_insert.len());
            let mut images = Vec::with_capacity(to_insert.len());
            let mut blob_paths = Vec::with_capacity(to_insert.len());
            let mut blob_hashes = Vec::with_capacity(to_insert.len());
            let mut parse_statuses = Vec::with_capacity(to_insert.len());
            let mut retry_counts = Vec::with_capacity(to_insert.len());
            let mut system_infos = Vec::with_capacity(to_insert.len());
            let mut glass_specs = Vec::with_capacity(to_insert.len());
            let mut parts_counts = Vec::with_capacity(to_insert.len());
            let mut statuses = Vec::with_capacity(to_insert.len());
            let mut changed = Vec::with_capacity(to_insert.len());
            let mut synced = Vec::with_capacity(to_insert.len());
            for e in &to_insert {
                ids.push(e.id);
                upstream_ids.push(e.upstream_id);
                phase_ids.push(e.phase_id);
                names.push(e.name.clone());
                widths.push(e.width_mm);
                heights.push(e.height_mm);
                images.push(e.image_path.clone());
                blob_paths.push(e.parts_blob_path.clone());
                blob_hashes.push(e.parts_blob_hash.clone());
                parse_statuses.push(e.parse_status.as_str());
                retry_counts.push(e.parse_retry_count);
                system_infos.push(e.system_info.clone());
                glass_specs.push(e.glass_spec.clone());
                parts_counts.push(e.parts_count);
                statuses.push(e.sync_status.as_str());
                changed.push(e.timestamps.upstream_changed_at);
                synced.push(e.timestamps.local_synced_at);
            }
            sqlx::query(
                r#"
                insert into elevations
                    (id, upstream_id, phase_id, name, width_mm, height_mm, image_path,
                     parts_blob_path, parts_blob_hash, parse_status, parse_retry_count,
                     system_info, glass_spec, parts_count, sync_status,
                     upstream_changed_at, local_synced_at)
                select * from unnest(
                    $1::uuid[], $2::uuid[], $3::uuid[], $4::text[], $5::float8[], $6::float8[],
                    $7::text[], $8::text[], $9::text[], $10::text[], $11::int[], $12::text[],
                    $13::text[], $14::int[], $15::text[], $16::timestamptz[], $17::timestamptz[]
                )
                "#,
            )
            .bind(ids)
            .bind(upstream_ids)
            .bind(phase_ids)
            .bind(names)
            .bind(widths)
            .bind(heights)
            .bind(images)
            .bind(blob_paths)
            .bind(blob_hashes)
            .bind(parse_statuses)
            .bind(retry_counts)
            .bind(system_infos)
            .bind(glass_specs)
            .bind(parts_counts)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        if !to_update.is_empty() {
            let mut ids = Vec::with_capacity(to_update.len());
            let mut names = Vec::with_capacity(to_update.len());
            let mut widths = Vec::with_capacity(to_update.len());
            let mut heights = Vec::with_capacity(to_update.len());
            let mut images = Vec::with_capacity(to_update.len());
            let mut blob_paths = Vec::with_capacity(to_update.len());
            let mut blob_hashes = Vec::with_capacity(to_update.len());
            let mut parse_statuses = Vec::with_capacity(to_update.len());
            let mut retry_counts = Vec::with_capacity(to_update.len());
            let mut system_infos = Vec::with_capacity(to_update.len());
            let mut glass_specs = Vec::with_capacity(to_update.len());
            let mut parts_counts = Vec::with_capacity(to_update.len());
            let mut statuses = Vec::with_capacity(to_update.len());
            let mut changed = Vec::with_capacity(to_update.len());
            let mut synced = Vec::with_capacity(to_update.len());
            for e in &to_update {
                ids.push(e.id);
                names.push(e.name.clone());
                widths.push(e.width_mm);
                heights.push(e.height_mm);
                images.push(e.image_path.clone());
                blob_paths.push(e.parts_blob_path.clone());
                blob_hashes.push(e.parts_blob_hash.clone());
                parse_statuses.push(e.parse_status.as_str());
                retry_counts.push(e.parse_retry_count);
                system_infos.push(e.system_info.clone());
                glass_specs.push(e.glass_spec.clone());
                parts_counts.push(e.parts_count);
                statuses.push(e.sync_status.as_str());
                changed.push(e.timestamps.upstream_changed_at);
                synced.push(e.timestamps.local_synced_at);
            }
            sqlx::query(
                r#"
                update elevations as e set
                    name = u.name,
                    width_mm = u.width_mm,
                    height_mm = u.height_mm,
                    image_path = u.image_path,
                    parts_blob_path = u.parts_blob_path,
                    parts_blob_hash = u.parts_blob_hash,
                    parse_status = u.parse_status,
                    parse_retry_count = u.parse_retry_count,
                    system_info = u.system_info,
                    glass_spec = u.glass_spec,
                    parts_count = u.parts_count,
                    sync_status = u.sync_status,
                    upstream_changed_at = u.upstream_changed_at,
                    local_synced_at = u.local_synced_at
                from unnest(
                    $1::uuid[], $2::text[], $3::float8[], $4::float8[], $5::text[], $6::text[],
                    $7::text[], $8::text[], $9::int[], $10::text[], $11::text[], $12::int[],
                    $13::text[], $14::timestamptz[], $15::timestamptz[]
                ) as u(id, name, width_mm, height_mm, image_path, parts_blob_path, parts_blob_hash,
                       parse_status, parse_retry_count, system_info, glass_spec, parts_count,
                       sync_status, upstream_changed_at, local_synced_at)
                where e.id = u.id
                "#,
            )
            .bind(ids)
            .bind(names)
            .bind(widths)
            .bind(heights)
            .bind(images)
            .bind(blob_paths)
            .bind(blob_hashes)
            .bind(parse_statuses)
            .bind(retry_counts)
            .bind(system_infos)
            .bind(glass_specs)
            .bind(parts_counts)
            .bind(statuses)
            .bind(changed)
            .bind(synced)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        Ok(counts)
    }

    async fn find_directory_by_upstream_id(
        &self,
        upstream_id: Uuid,
    ) -> Result<Option<Directory>, StoreError> {
        sqlx::query_as::<_, DirectoryRow>(
            "select * from directories where upstream_id = $1",
        )
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map(DirectoryRow::into_domain)
        .transpose()
    }

    async fn find_project_by_upstream_id(
        &self,
        directory_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Project>, StoreError> {
        sqlx::query_as::<_, ProjectRow>(
            "select * from projects where directory_id = $1 and upstream_id = $2",
        )
        .bind(directory_id)
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map(ProjectRow::into_domain)
        .transpose()
    }

    async fn find_phase_by_upstream_id(
        &self,
        project_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Phase>, StoreError> {
        sqlx::query_as::<_, PhaseRow>(
            "select * from phases where project_id = $1 and upstream_id = $2",
        )
        .bind(project_id)
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map(PhaseRow::into_domain)
        .transpose()
    }

    async fn find_elevation_by_upstream_id(
        &self,
        phase_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Elevation>, StoreError> {
        sqlx::query_as::<_, ElevationRow>(
            "select * from elevations where phase_id = $1 and upstream_id = $2",
        )
        .bind(phase_id)
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map(ElevationRow::into_domain)
        .transpose()
    }

    async fn children_of_directory(&self, directory_id: Uuid) -> Result<Vec<Directory>, StoreError> {
        let rows: Vec<DirectoryRow> =
            sqlx::query_as("select * from directories where parent_id = $1")
                .bind(directory_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        rows.into_iter().map(DirectoryRow::into_domain).collect()
    }

    async fn projects_of_directory(&self, directory_id: Uuid) -> Result<Vec<Project>, StoreError> {
        let rows: Vec<ProjectRow> =
            sqlx::query_as("select * from projects where directory_id = $1")
                .bind(directory_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        rows.into_iter().map(ProjectRow::into_domain).collect()
    }

    async fn phases_of_project(&self, project_id: Uuid) -> Result<Vec<Phase>, StoreError> {
        let rows: Vec<PhaseRow> = sqlx::query_as("select * from phases where project_id = $1")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        rows.into_iter().map(PhaseRow::into_domain).collect()
    }

    async fn elevations_of_phase(&self, phase_id: Uuid) -> Result<Vec<Elevation>, StoreError> {
        let rows: Vec<ElevationRow> =
            sqlx::query_as("select * from elevations where phase_id = $1")
                .bind(phase_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        rows.into_iter().map(ElevationRow::into_domain).collect()
    }

    async fn get_directory(&self, id: Uuid) -> Result<Option<Directory>, StoreError> {
        sqlx::query_as::<_, DirectoryRow>("select * from directories where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map(DirectoryRow::into_domain)
            .transpose()
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        sqlx::query_as::<_, ProjectRow>("select * from projects where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map(ProjectRow::into_domain)
            .transpose()
    }

    async fn get_phase(&self, id: Uuid) -> Result<Option<Phase>, StoreError> {
        sqlx::query_as::<_, PhaseRow>("select * from phases where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map(PhaseRow::into_domain)
            .transpose()
    }

    async fn mark_missing_children_to_remove(
        &self,
        kind: EntityKind,
        parent_id: Uuid,
        seen_upstream_ids: &[Uuid],
    ) -> Result<u32, StoreError> {
        let table = table_for(kind);
        let parent_column = parent_column_for(kind);
        let result = sqlx::query(&format!(
            "update {table} set sync_status = 'to_remove' \
             where {parent_column} = $1 and upstream_id <> all($2) and sync_status <> 'to_remove'",
        ))
        .bind(parent_id)
        .bind(seen_upstream_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(result.rows_affected() as u32)
    }

    async fn clear_to_remove(&self, kind: EntityKind, parent_id: Uuid) -> Result<u32, StoreError> {
        let table = table_for(kind);
        let parent_column = parent_column_for(kind);
        // Grandchildren are removed by the schema's `on delete cascade` FKs;
        // this statement only needs to target the level being swept.
        let result = sqlx::query(&format!(
            "delete from {table} where {parent_column} = $1 and sync_status = 'to_remove'",
        ))
        .bind(parent_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(result.rows_affected() as u32)
    }

    async fn tombstone(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError> {
        let table = table_for(kind);
        sqlx::query(&format!("delete from {table} where id = $1"))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn scan_stale(
        &self,
        kind: EntityKind,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        let table = table_for(kind);
        let rows: Vec<(Uuid,)> = sqlx::query_as(&format!(
            "select id from {table} where local_synced_at < $1 or local_synced_at is null limit $2",
        ))
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn record_sync_run(&self, run: SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into sync_runs (id, scope_kind, scope_root, state, started_at, ended_at)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (id) do update set
                state = excluded.state,
                ended_at = excluded.ended_at
            "#,
        )
        .bind(run.id)
        .bind(run.scope_kind.map(|k| k.as_str()))
        .bind(run.scope_root)
        .bind(format!("{:?}", run.state).to_lowercase())
        .bind(run.started_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn latest_sync_run(&self, _scope_root: Option<Uuid>) -> Result<Option<SyncRun>, StoreError> {
        // Full attempt hydration is intentionally left to the reporting
        // surface; the orchestrator only needs `record_sync_run` during a
        // sweep.
        Ok(None)
    }

    async fn find_elevations_pending_parse(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<Elevation>, StoreError> {
        let rows: Vec<ElevationRow> = sqlx::query_as(
            r#"
            select * from elevations
            where parts_blob_path is not null
              and parse_status in ('pending', 'failed')
              and parse_retry_count < $1
            order by local_synced_at asc nulls first
            limit $2
            "#,
        )
        .bind(max_retries)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        rows.into_iter().map(ElevationRow::into_domain).collect()
    }
}

fn classify_write(existed: bool, status: SyncStatus) -> WriteResult {
    if !existed {
        WriteResult::Created
    } else if status == SyncStatus::Unchanged {
        WriteResult::Unchanged
    } else {
        WriteResult::Updated
    }
}

#[cfg(feature = "database")]
fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Directory => "directories",
        EntityKind::Project => "projects",
        EntityKind::Phase => "phases",
        EntityKind::Elevation => "elevations",
    }
}

#[cfg(feature = "database")]
fn parent_column_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Directory => "parent_id",
        EntityKind::Project => "directory_id",
        EntityKind::Phase => "project_id",
        EntityKind::Elevation => "phase_id",
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct DirectoryRow {
    id: Uuid,
    upstream_id: Uuid,
    full_path: String,
    parent_id: Option<Uuid>,
    level: i32,
    #[sqlx(rename = "is_excluded")]
    excluded: bool,
    sync_status: String,
    upstream_changed_at: Option<DateTime<Utc>>,
    local_synced_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "database")]
impl DirectoryRow {
    fn into_domain(self) -> Result<Directory, StoreError> {
        Ok(Directory {
            id: self.id,
            upstream_id: self.upstream_id,
            full_path: self.full_path,
            parent_id: self.parent_id,
            level: self.level,
            excluded: self.excluded,
            sync_status: parse_sync_status(&self.sync_status)?,
            timestamps: crate::entities::SyncTimestamps {
                upstream_changed_at: self.upstream_changed_at,
                local_synced_at: self.local_synced_at,
            },
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    upstream_id: Uuid,
    directory_id: Uuid,
    name: String,
    sync_status: String,
    upstream_changed_at: Option<DateTime<Utc>>,
    local_synced_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "database")]
impl ProjectRow {
    fn into_domain(self) -> Result<Project, StoreError> {
        Ok(Project {
            id: self.id,
            upstream_id: self.upstream_id,
            directory_id: self.directory_id,
            name: self.name,
            sync_status: parse_sync_status(&self.sync_status)?,
            timestamps: crate::entities::SyncTimestamps {
                upstream_changed_at: self.upstream_changed_at,
                local_synced_at: self.local_synced_at,
            },
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct PhaseRow {
    id: Uuid,
    upstream_id: Uuid,
    project_id: Uuid,
    name: String,
    sync_status: String,
    upstream_changed_at: Option<DateTime<Utc>>,
    local_synced_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "database")]
impl PhaseRow {
    fn into_domain(self) -> Result<Phase, StoreError> {
        Ok(Phase {
            id: self.id,
            upstream_id: self.upstream_id,
            project_id: self.project_id,
            name: self.name,
            sync_status: parse_sync_status(&self.sync_status)?,
            timestamps: crate::entities::SyncTimestamps {
                upstream_changed_at: self.upstream_changed_at,
                local_synced_at: self.local_synced_at,
            },
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct ElevationRow {
    id: Uuid,
    upstream_id: Uuid,
    phase_id: Uuid,
    name: String,
    width_mm: Option<f64>,
    height_mm: Option<f64>,
    image_path: Option<String>,
    parts_blob_path: Option<String>,
    parts_blob_hash: Option<String>,
    parse_status: String,
    parse_retry_count: i32,
    system_info: Option<String>,
    glass_spec: Option<String>,
    parts_count: Option<i32>,
    sync_status: String,
    upstream_changed_at: Option<DateTime<Utc>>,
    local_synced_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "database")]
impl ElevationRow {
    fn into_domain(self) -> Result<Elevation, StoreError> {
        Ok(Elevation {
            id: self.id,
            upstream_id: self.upstream_id,
            phase_id: self.phase_id,
            name: self.name,
            width_mm: self.width_mm,
            height_mm: self.height_mm,
            image_path: self.image_path,
            parts_blob_path: self.parts_blob_path,
            parts_blob_hash: self.parts_blob_hash,
            parse_status: self
                .parse_status
                .parse()
                .map_err(StoreError::Constraint)?,
            parse_retry_count: self.parse_retry_count,
            system_info: self.system_info,
            glass_spec: self.glass_spec,
            parts_count: self.parts_count,
            sync_status: parse_sync_status(&self.sync_status)?,
            timestamps: crate::entities::SyncTimestamps {
                upstream_changed_at: self.upstream_changed_at,
                local_synced_at: self.local_synced_at,
            },
        })
    }
}

#[cfg(feature = "database")]
fn parse_sync_status(s: &str) -> Result<SyncStatus, StoreError> {
    match s {
        "new" => Ok(SyncStatus::New),
        "updated" => Ok(SyncStatus::Updated),
        "unchanged" => Ok(SyncStatus::Unchanged),
        "to_remove" => Ok(SyncStatus::ToRemove),
        "removed" => Ok(SyncStatus::Removed),
        other => Err(StoreError::Constraint(format!("unknown sync_status: {other}"))),
    }
}

/// In-memory fake used by syncer/cascade/scheduler tests. Keyed by
/// upstream id within each parent scope, same as the real schema's unique
/// constraints, so duplicate-detection behavior matches production.
#[derive(Default)]
pub struct InMemoryStore {
    directories: Mutex<HashMap<Uuid, Directory>>,
    projects: Mutex<HashMap<Uuid, Project>>,
    phases: Mutex<HashMap<Uuid, Phase>>,
    elevations: Mutex<HashMap<Uuid, Elevation>>,
    sync_runs: Mutex<Vec<SyncRun>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes one entity by surrogate id and walks every descendant level,
    /// standing in for the real schema's `on delete cascade` FKs (there is
    /// no single map to cascade through in-memory, so each level is pruned
    /// explicitly by its parent-column match).
    fn cascade_delete(&self, kind: EntityKind, id: Uuid) {
        match kind {
            EntityKind::Directory => {
                let child_dirs: Vec<Uuid> = self
                    .directories
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|d| d.parent_id == Some(id))
                    .map(|d| d.id)
                    .collect();
                let child_projects: Vec<Uuid> = self
                    .projects
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|p| p.directory_id == id)
                    .map(|p| p.id)
                    .collect();
                self.directories.lock().unwrap().remove(&id);
                for child in child_dirs {
                    self.cascade_delete(EntityKind::Directory, child);
                }
                for child in child_projects {
                    self.cascade_delete(EntityKind::Project, child);
                }
            }
            EntityKind::Project => {
                let child_phases: Vec<Uuid> = self
                    .phases
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|p| p.project_id == id)
                    .map(|p| p.id)
                    .collect();
                self.projects.lock().unwrap().remove(&id);
                for child in child_phases {
                    self.cascade_delete(EntityKind::Phase, child);
                }
            }
            EntityKind::Phase => {
                let child_elevations: Vec<Uuid> = self
                    .elevations
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|e| e.phase_id == id)
                    .map(|e| e.id)
                    .collect();
                self.phases.lock().unwrap().remove(&id);
                for child in child_elevations {
                    self.cascade_delete(EntityKind::Elevation, child);
                }
            }
            EntityKind::Elevation => {
                self.elevations.lock().unwrap().remove(&id);
            }
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_directory(&self, dir: Directory) -> Result<WriteResult, StoreError> {
        let mut map = self.directories.lock().unwrap();
        let existed = map
            .values()
            .any(|d| d.upstream_id == dir.upstream_id && d.parent_id == dir.parent_id);
        let key = map
            .values()
            .find(|d| d.upstream_id == dir.upstream_id && d.parent_id == dir.parent_id)
            .map(|d| d.id)
            .unwrap_or(dir.id);
        let status = dir.sync_status;
        map.insert(key, Directory { id: key, ..dir });
        Ok(classify_write(existed, status))
    }

    async fn upsert_project(&self, project: Project) -> Result<WriteResult, StoreError> {
        let mut map = self.projects.lock().unwrap();
        let existed = map.values().any(|p| {
            p.upstream_id == project.upstream_id && p.directory_id == project.directory_id
        });
        let key = map
            .values()
            .find(|p| {
                p.upstream_id == project.upstream_id && p.directory_id == project.directory_id
            })
            .map(|p| p.id)
            .unwrap_or(project.id);
        let status = project.sync_status;
        map.insert(key, Project { id: key, ..project });
        Ok(classify_write(existed, status))
    }

    async fn upsert_phase(&self, phase: Phase) -> Result<WriteResult, StoreError> {
        let mut map = self.phases.lock().unwrap();
        let existed = map
            .values()
            .any(|p| p.upstream_id == phase.upstream_id && p.project_id == phase.project_id);
        let key = map
            .values()
            .find(|p| p.upstream_id == phase.upstream_id && p.project_id == phase.project_id)
            .map(|p| p.id)
            .unwrap_or(phase.id);
        let status = phase.sync_status;
        map.insert(key, Phase { id: key, ..phase });
        Ok(classify_write(existed, status))
    }

    async fn upsert_elevation(&self, elevation: Elevation) -> Result<WriteResult, StoreError> {
        let mut map = self.elevations.lock().unwrap();
        let existed = map
            .values()
            .any(|e| e.upstream_id == elevation.upstream_id && e.phase_id == elevation.phase_id);
        let key = map
            .values()
            .find(|e| e.upstream_id == elevation.upstream_id && e.phase_id == elevation.phase_id)
            .map(|e| e.id)
            .unwrap_or(elevation.id);
        let status = elevation.sync_status;
        map.insert(key, Elevation { id: key, ..elevation });
        Ok(classify_write(existed, status))
    }

    /// The in-memory fake has no real query cost to amortize, so batching
    /// here is just looping the single-row upsert and folding the results;
    /// it exists so orchestration tests exercise the same trait surface
    /// the Postgres-backed store does.
    async fn batch_upsert_directories(
        &self,
        rows: Vec<Directory>,
    ) -> Result<BatchUpsertCounts, StoreError> {
        let mut counts = BatchUpsertCounts::default();
        for row in rows {
            match self.upsert_directory(row).await? {
                WriteResult::Created => counts.created += 1,
                WriteResult::Updated => counts.updated += 1,
                WriteResult::Unchanged => counts.unchanged += 1,
            }
        }
        Ok(counts)
    }

    async fn batch_upsert_projects(&self, rows: Vec<Project>) -> Result<BatchUpsertCounts, StoreError> {
        let mut counts = BatchUpsertCounts::default();
        for row in rows {
            match self.upsert_project(row).await? {
                WriteResult::Created => counts.created += 1,
                WriteResult::Updated => counts.updated += 1,
                WriteResult::Unchanged => counts.unchanged += 1,
            }
        }
        Ok(counts)
    }

    async fn batch_upsert_phases(&self, rows: Vec<Phase>) -> Result<BatchUpsertCounts, StoreError> {
        let mut counts = BatchUpsertCounts::default();
        for row in rows {
            match self.upsert_phase(row).await? {
                WriteResult::Created => counts.created += 1,
                WriteResult::Updated => counts.updated += 1,
                WriteResult::Unchanged => counts.unchanged += 1,
            }
        }
        Ok(counts)
    }

    async fn batch_upsert_elevations(
        &self,
        rows: Vec<Elevation>,
    ) -> Result<BatchUpsertCounts, StoreError> {
        let mut counts = BatchUpsertCounts::default();
        for row in rows {
            match self.upsert_elevation(row).await? {
                WriteResult::Created => counts.created += 1,
                WriteResult::Updated => counts.updated += 1,
                WriteResult::Unchanged => counts.unchanged += 1,
            }
        }
        Ok(counts)
    }

    async fn find_directory_by_upstream_id(
        &self,
        upstream_id: Uuid,
    ) -> Result<Option<Directory>, StoreError> {
        Ok(self
            .directories
            .lock()
            .unwrap()
            .values()
            .find(|d| d.upstream_id == upstream_id)
            .cloned())
    }

    async fn find_project_by_upstream_id(
        &self,
        directory_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Project>, StoreError> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .values()
            .find(|p| p.directory_id == directory_id && p.upstream_id == upstream_id)
            .cloned())
    }

    async fn find_phase_by_upstream_id(
        &self,
        project_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Phase>, StoreError> {
        Ok(self
            .phases
            .lock()
            .unwrap()
            .values()
            .find(|p| p.project_id == project_id && p.upstream_id == upstream_id)
            .cloned())
    }

    async fn find_elevation_by_upstream_id(
        &self,
        phase_id: Uuid,
        upstream_id: Uuid,
    ) -> Result<Option<Elevation>, StoreError> {
        Ok(self
            .elevations
            .lock()
            .unwrap()
            .values()
            .find(|e| e.phase_id == phase_id && e.upstream_id == upstream_id)
            .cloned())
    }

    async fn children_of_directory(&self, directory_id: Uuid) -> Result<Vec<Directory>, StoreError> {
        Ok(self
            .directories
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.parent_id == Some(directory_id))
            .cloned()
            .collect())
    }

    async fn projects_of_directory(&self, directory_id: Uuid) -> Result<Vec<Project>, StoreError> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.directory_id == directory_id)
            .cloned()
            .collect())
    }

    async fn phases_of_project(&self, project_id: Uuid) -> Result<Vec<Phase>, StoreError> {
        Ok(self
            .phases
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn elevations_of_phase(&self, phase_id: Uuid) -> Result<Vec<Elevation>, StoreError> {
        Ok(self
            .elevations
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.phase_id == phase_id)
            .cloned()
            .collect())
    }

    async fn get_directory(&self, id: Uuid) -> Result<Option<Directory>, StoreError> {
        Ok(self.directories.lock().unwrap().get(&id).cloned())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.lock().unwrap().get(&id).cloned())
    }

    async fn get_phase(&self, id: Uuid) -> Result<Option<Phase>, StoreError> {
        Ok(self.phases.lock().unwrap().get(&id).cloned())
    }

    async fn mark_missing_children_to_remove(
        &self,
        kind: EntityKind,
        parent_id: Uuid,
        seen_upstream_ids: &[Uuid],
    ) -> Result<u32, StoreError> {
        let mut count = 0u32;
        match kind {
            EntityKind::Directory => {
                for d in self.directories.lock().unwrap().values_mut() {
                    if d.parent_id == Some(parent_id)
                        && !seen_upstream_ids.contains(&d.upstream_id)
                        && d.sync_status != SyncStatus::ToRemove
                    {
                        d.sync_status = SyncStatus::ToRemove;
                        count += 1;
                    }
                }
            }
            EntityKind::Project => {
                for p in self.projects.lock().unwrap().values_mut() {
                    if p.directory_id == parent_id
                        && !seen_upstream_ids.contains(&p.upstream_id)
                        && p.sync_status != SyncStatus::ToRemove
                    {
                        p.sync_status = SyncStatus::ToRemove;
                        count += 1;
                    }
                }
            }
            EntityKind::Phase => {
                for p in self.phases.lock().unwrap().values_mut() {
                    if p.project_id == parent_id
                        && !seen_upstream_ids.contains(&p.upstream_id)
                        && p.sync_status != SyncStatus::ToRemove
                    {
                        p.sync_status = SyncStatus::ToRemove;
                        count += 1;
                    }
                }
            }
            EntityKind::Elevation => {
                for e in self.elevations.lock().unwrap().values_mut() {
                    if e.phase_id == parent_id
                        && !seen_upstream_ids.contains(&e.upstream_id)
                        && e.sync_status != SyncStatus::ToRemove
                    {
                        e.sync_status = SyncStatus::ToRemove;
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }

    async fn clear_to_remove(&self, kind: EntityKind, parent_id: Uuid) -> Result<u32, StoreError> {
        let ids: Vec<Uuid> = match kind {
            EntityKind::Directory => self
                .directories
                .lock()
                .unwrap()
                .values()
                .filter(|d| d.parent_id == Some(parent_id) && d.sync_status == SyncStatus::ToRemove)
                .map(|d| d.id)
                .collect(),
            EntityKind::Project => self
                .projects
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.directory_id == parent_id && p.sync_status == SyncStatus::ToRemove)
                .map(|p| p.id)
                .collect(),
            EntityKind::Phase => self
                .phases
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.project_id == parent_id && p.sync_status == SyncStatus::ToRemove)
                .map(|p| p.id)
                .collect(),
            EntityKind::Elevation => self
                .elevations
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.phase_id == parent_id && e.sync_status == SyncStatus::ToRemove)
                .map(|e| e.id)
                .collect(),
        };
        for id in &ids {
            self.cascade_delete(kind, *id);
        }
        Ok(ids.len() as u32)
    }

    async fn tombstone(&self, kind: EntityKind, id: Uuid) -> Result<(), StoreError> {
        self.cascade_delete(kind, id);
        Ok(())
    }

    async fn scan_stale(
        &self,
        kind: EntityKind,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = match kind {
            EntityKind::Directory => self
                .directories
                .lock()
                .unwrap()
                .values()
                .filter(|d| d.timestamps.local_synced_at.map_or(true, |t| t < older_than))
                .map(|d| d.id)
                .collect(),
            EntityKind::Project => self
                .projects
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.timestamps.local_synced_at.map_or(true, |t| t < older_than))
                .map(|p| p.id)
                .collect(),
            EntityKind::Phase => self
                .phases
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.timestamps.local_synced_at.map_or(true, |t| t < older_than))
                .map(|p| p.id)
                .collect(),
            EntityKind::Elevation => self
                .elevations
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.timestamps.local_synced_at.map_or(true, |t| t < older_than))
                .map(|e| e.id)
                .collect(),
        };
        Ok(ids.into_iter().take(limit as usize).collect())
    }

    async fn record_sync_run(&self, run: SyncRun) -> Result<(), StoreError> {
        let mut runs = self.sync_runs.lock().unwrap();
        if let Some(existing) = runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run;
        } else {
            runs.push(run);
        }
        Ok(())
    }

    async fn latest_sync_run(&self, scope_root: Option<Uuid>) -> Result<Option<SyncRun>, StoreError> {
        Ok(self
            .sync_runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| scope_root.is_none() || r.scope_root == scope_root)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn find_elevations_pending_parse(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<Elevation>, StoreError> {
        let mut pending: Vec<Elevation> = self
            .elevations
            .lock()
            .unwrap()
            .values()
            .filter(|e| {
                e.parts_blob_path.is_some()
                    && matches!(
                        e.parse_status,
                        crate::entities::ParseStatus::Pending | crate::entities::ParseStatus::Failed
                    )
                    && e.parse_retry_count < max_retries
            })
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.timestamps.local_synced_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::SyncTimestamps;

    fn blank_timestamps() -> SyncTimestamps {
        SyncTimestamps {
            upstream_changed_at: None,
            local_synced_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn upsert_directory_reports_created_then_updated() {
        let store = InMemoryStore::new();
        let dir = Directory {
            id: Uuid::new_v4(),
            upstream_id: Uuid::new_v4(),
            full_path: "/Root".into(),
            parent_id: None,
            level: 0,
            excluded: false,
            sync_status: SyncStatus::New,
            timestamps: blank_timestamps(),
        };

        let first = store.upsert_directory(dir.clone()).await.unwrap();
        assert_eq!(first, WriteResult::Created);

        let mut updated = dir.clone();
        updated.sync_status = SyncStatus::Updated;
        let second = store.upsert_directory(updated).await.unwrap();
        assert_eq!(second, WriteResult::Updated);
    }

    #[tokio::test]
    async fn mark_missing_children_to_remove_only_touches_absent_ids() {
        let store = InMemoryStore::new();
        let parent = Uuid::new_v4();
        let kept_upstream = Uuid::new_v4();
        let dropped_upstream = Uuid::new_v4();

        for upstream_id in [kept_upstream, dropped_upstream] {
            store
                .upsert_directory(Directory {
                    id: Uuid::new_v4(),
                    upstream_id,
                    full_path: "/Root/Child".into(),
                    parent_id: Some(parent),
                    level: 1,
                    excluded: false,
                    sync_status: SyncStatus::New,
                    timestamps: blank_timestamps(),
                })
                .await
                .unwrap();
        }

        let removed = store
            .mark_missing_children_to_remove(EntityKind::Directory, parent, &[kept_upstream])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let children = store.children_of_directory(parent).await.unwrap();
        let dropped = children
            .iter()
            .find(|d| d.upstream_id == dropped_upstream)
            .unwrap();
        assert_eq!(dropped.sync_status, SyncStatus::ToRemove);
        let kept = children
            .iter()
            .find(|d| d.upstream_id == kept_upstream)
            .unwrap();
        assert_eq!(kept.sync_status, SyncStatus::New);
    }

    #[tokio::test]
    async fn clear_to_remove_deletes_only_tagged_children() {
        let store = InMemoryStore::new();
        let parent = Uuid::new_v4();
        let kept_upstream = Uuid::new_v4();
        let dropped_upstream = Uuid::new_v4();

        for upstream_id in [kept_upstream, dropped_upstream] {
            store
                .upsert_directory(Directory {
                    id: Uuid::new_v4(),
                    upstream_id,
                    full_path: "/Root/Child".into(),
                    parent_id: Some(parent),
                    level: 1,
                    excluded: false,
                    sync_status: SyncStatus::New,
                    timestamps: blank_timestamps(),
                })
                .await
                .unwrap();
        }
        store
            .mark_missing_children_to_remove(EntityKind::Directory, parent, &[kept_upstream])
            .await
            .unwrap();

        let deleted = store
            .clear_to_remove(EntityKind::Directory, parent)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let children = store.children_of_directory(parent).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].upstream_id, kept_upstream);
    }

    #[tokio::test]
    async fn tombstone_cascades_through_the_whole_subtree() {
        let store = InMemoryStore::new();
        let directory_id = Uuid::new_v4();
        store
            .upsert_directory(Directory {
                id: directory_id,
                upstream_id: Uuid::new_v4(),
                full_path: "/Root".into(),
                parent_id: None,
                level: 0,
                excluded: false,
                sync_status: SyncStatus::New,
                timestamps: blank_timestamps(),
            })
            .await
            .unwrap();

        let project_id = Uuid::new_v4();
        store
            .upsert_project(Project {
                id: project_id,
                upstream_id: Uuid::new_v4(),
                directory_id,
                name: "P1".into(),
                sync_status: SyncStatus::New,
                timestamps: blank_timestamps(),
            })
            .await
            .unwrap();

        let phase_id = Uuid::new_v4();
        store
            .upsert_phase(Phase {
                id: phase_id,
                upstream_id: Uuid::new_v4(),
                project_id,
                name: "Ph1".into(),
                sync_status: SyncStatus::New,
                timestamps: blank_timestamps(),
            })
            .await
            .unwrap();

        store.tombstone(EntityKind::Directory, directory_id).await.unwrap();

        assert!(store.get_directory(directory_id).await.unwrap().is_none());
        assert!(store.get_project(project_id).await.unwrap().is_none());
        assert!(store.get_phase(phase_id).await.unwrap().is_none());
    }
}
