//! Cascade Orchestrator
//!
//! Walks the dependency-ordered sweep (directory -> project -> phase ->
//! elevation) for one root. Directory is a self-referential tree of
//! arbitrary depth, so it gets its own breadth-first walk that fully
//! exhausts the subtree before the Project sweep starts; Project, Phase,
//! and Elevation are each a single flat level over everything the level
//! above produced. Before every sync call the session cursor is
//! positioned (navigate / select_project / select_phase) to match the
//! parent being synced, since the upstream protocol is session-stateful.
//! A parent update never bumps a child's `local_synced_at`; only the
//! child's own sweep does that. An excluded directory is dropped from the
//! walk before its children are even listed, so exclusion propagates to
//! every descendant for free.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::UpstreamClient;
use crate::config::{PolicyKey, SyncConfigRegistry};
use crate::entities::{AttemptState, EntityKind, SyncAttempt, SyncRun, SyncRunState};
use crate::error::{Categorized, ErrorCategory};
use crate::pool::SessionPool;
use crate::store::Store;
use crate::syncer::{EntitySyncer, Outcome};

/// One syncer per kind, looked up by the orchestrator as it walks the
/// registry's sweep order. Boxed trait objects since the orchestrator
/// is kind-agnostic at the call site, matching how the source's sync
/// service dispatches on a string `object_type` rather than a generic.
pub struct SyncerRegistry {
    directory: Arc<dyn EntitySyncer>,
    project: Arc<dyn EntitySyncer>,
    phase: Arc<dyn EntitySyncer>,
    elevation: Arc<dyn EntitySyncer>,
}

impl SyncerRegistry {
    pub fn new(
        directory: Arc<dyn EntitySyncer>,
        project: Arc<dyn EntitySyncer>,
        phase: Arc<dyn EntitySyncer>,
        elevation: Arc<dyn EntitySyncer>,
    ) -> Self {
        Self {
            directory,
            project,
            phase,
            elevation,
        }
    }

    fn get(&self, kind: EntityKind) -> &Arc<dyn EntitySyncer> {
        match kind {
            EntityKind::Directory => &self.directory,
            EntityKind::Project => &self.project,
            EntityKind::Phase => &self.phase,
            EntityKind::Elevation => &self.elevation,
        }
    }
}

pub struct CascadeOrchestrator<S> {
    store: Arc<S>,
    pool: Arc<SessionPool>,
    registry: Arc<SyncConfigRegistry>,
    syncers: Arc<SyncerRegistry>,
}

impl<S: Store + 'static> CascadeOrchestrator<S> {
    pub fn new(
        store: Arc<S>,
        pool: Arc<SessionPool>,
        registry: Arc<SyncConfigRegistry>,
        syncers: Arc<SyncerRegistry>,
    ) -> Self {
        Self {
            store,
            pool,
            registry,
            syncers,
        }
    }

    /// Run one full cascade starting from `root_directory_id`. The root
    /// must already exist locally (the Scheduler or an initial bootstrap
    /// sync is responsible for having listed it at least once) since its
    /// `full_path` is what positions the very first navigation call.
    pub async fn run(
        &self,
        root_directory_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<SyncRun, StageError> {
        if self
            .store
            .get_directory(root_directory_id)
            .await
            .map_err(StageError::Store)?
            .is_none()
        {
            return Err(StageError::MissingAncestor(EntityKind::Directory, root_directory_id));
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut attempts = Vec::new();

        let all_directories = self
            .sweep_directory_tree(root_directory_id, run_id, &mut attempts, &cancel)
            .await?;

        if cancel.is_cancelled() {
            return Ok(self.finish(run_id, started_at, attempts, SyncRunState::Cancelled));
        }

        let all_projects = self
            .sweep_level(EntityKind::Project, &all_directories, run_id, &mut attempts, &cancel)
            .await?;
        if cancel.is_cancelled() {
            return Ok(self.finish(run_id, started_at, attempts, SyncRunState::Cancelled));
        }

        let all_phases = self
            .sweep_level(EntityKind::Phase, &all_projects, run_id, &mut attempts, &cancel)
            .await?;
        if cancel.is_cancelled() {
            return Ok(self.finish(run_id, started_at, attempts, SyncRunState::Cancelled));
        }

        self.sweep_level(EntityKind::Elevation, &all_phases, run_id, &mut attempts, &cancel)
            .await?;

        // Per-entity failures (recorded as `Failed` attempts above) never
        // force the run itself to `Failed` — only the orchestrator being
        // unable to proceed at all does, and that already short-circuits
        // via `?` before we get here. A run with failed attempts still
        // reaches `Done`; `SyncRun::error_count()` surfaces the failures.
        let state = if cancel.is_cancelled() {
            SyncRunState::Cancelled
        } else {
            SyncRunState::Done
        };

        let run = self.finish(run_id, started_at, attempts, state);
        self.store
            .record_sync_run(run.clone())
            .await
            .map_err(StageError::Store)?;
        Ok(run)
    }

    /// Breadth-first walk of the directory self-tree. Returns every
    /// directory id that was eligible to sweep (i.e. not itself excluded
    /// and not a descendant of an excluded directory), which becomes the
    /// parent list for the Project sweep.
    async fn sweep_directory_tree(
        &self,
        root_directory_id: Uuid,
        run_id: Uuid,
        attempts: &mut Vec<SyncAttempt>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, StageError> {
        let mut all_directories = Vec::new();
        let mut frontier = vec![root_directory_id];

        while !frontier.is_empty() {
            if cancel.is_cancelled() {
                break;
            }

            let mut eligible = Vec::with_capacity(frontier.len());
            for id in frontier {
                match self.store.get_directory(id).await.map_err(StageError::Store)? {
                    Some(dir) if dir.excluded => {
                        info!(directory_id = %id, "directory excluded, skipping subtree");
                        attempts.push(skipped_attempt(run_id, EntityKind::Directory, id));
                    }
                    Some(_) => {
                        eligible.push(id);
                        all_directories.push(id);
                    }
                    None => {
                        // Already tombstoned locally by a prior pass; nothing to descend into.
                    }
                }
            }

            if eligible.is_empty() {
                break;
            }

            let next_frontier = self
                .sweep_level(EntityKind::Directory, &eligible, run_id, attempts, cancel)
                .await?;
            frontier = next_frontier;
        }

        Ok(all_directories)
    }

    /// Fans sibling syncs for `kind` out over every id in `parents`,
    /// bounded by the session pool's size, and returns the ids of every
    /// child the level produced (the next level's `parents`).
    async fn sweep_level(
        &self,
        kind: EntityKind,
        parents: &[Uuid],
        run_id: Uuid,
        attempts: &mut Vec<SyncAttempt>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, StageError> {
        if cancel.is_cancelled() || parents.is_empty() {
            return Ok(Vec::new());
        }

        let syncer = self.syncers.get(kind).clone();
        let store = self.store.clone();
        let pool = self.pool.clone();
        let cancel_inner = cancel.clone();

        let results: Vec<(Uuid, Result<Outcome, StageError>)> = stream::iter(parents.to_vec())
            .map(|parent_id| {
                let syncer = syncer.clone();
                let pool = pool.clone();
                let store = store.clone();
                let cancel = cancel_inner.clone();
                async move {
                    let outcome = sync_one_parent(&*store, &*syncer, &pool, kind, parent_id, &cancel).await;
                    (parent_id, outcome)
                }
            })
            .buffer_unordered(self.pool_size())
            .collect()
            .await;

        let mut next_level = Vec::new();

        for (parent_id, result) in results {
            let attempt_id = Uuid::new_v4();
            let started = Utc::now();
            match result {
                Ok(Outcome::Synced {
                    created,
                    updated,
                    unchanged,
                    removed,
                }) => {
                    attempts.push(SyncAttempt {
                        id: attempt_id,
                        run_id,
                        kind,
                        parent_id: Some(parent_id),
                        state: AttemptState::Done,
                        created: created as i32,
                        updated: updated as i32,
                        deleted: removed as i32,
                        skipped: unchanged as i32,
                        errors: vec![],
                        started_at: started,
                        ended_at: Some(Utc::now()),
                    });
                    next_level.extend(children_for_next_level(&self.store, kind, parent_id).await?);
                }
                Ok(Outcome::ParentDeleted) => {
                    let parent_kind = parent_kind_of(kind);
                    info!(%parent_id, %parent_kind, "parent deleted upstream, tombstoning and skipping subtree");
                    self.store
                        .tombstone(parent_kind, parent_id)
                        .await
                        .map_err(StageError::Store)?;
                    attempts.push(SyncAttempt {
                        id: attempt_id,
                        run_id,
                        kind,
                        parent_id: Some(parent_id),
                        state: AttemptState::Skipped,
                        created: 0,
                        updated: 0,
                        deleted: 0,
                        skipped: 0,
                        errors: vec![],
                        started_at: started,
                        ended_at: Some(Utc::now()),
                    });
                }
                Ok(Outcome::Failed { reason }) => {
                    warn!(%parent_id, %kind, reason, "sweep failed for parent");
                    attempts.push(SyncAttempt {
                        id: attempt_id,
                        run_id,
                        kind,
                        parent_id: Some(parent_id),
                        state: AttemptState::Failed,
                        created: 0,
                        updated: 0,
                        deleted: 0,
                        skipped: 0,
                        errors: vec![reason],
                        started_at: started,
                        ended_at: Some(Utc::now()),
                    });
                }
                Err(e) => {
                    warn!(%parent_id, %kind, error = %e, "sweep failed for parent");
                    attempts.push(SyncAttempt {
                        id: attempt_id,
                        run_id,
                        kind,
                        parent_id: Some(parent_id),
                        state: AttemptState::Failed,
                        created: 0,
                        updated: 0,
                        deleted: 0,
                        skipped: 0,
                        errors: vec![e.to_string()],
                        started_at: started,
                        ended_at: Some(Utc::now()),
                    });
                }
            }
        }

        Ok(next_level)
    }

    fn finish(
        &self,
        id: Uuid,
        started_at: chrono::DateTime<Utc>,
        attempts: Vec<SyncAttempt>,
        state: SyncRunState,
    ) -> SyncRun {
        SyncRun {
            id,
            scope_kind: Some(EntityKind::Directory),
            scope_root: None,
            state,
            started_at,
            ended_at: Some(Utc::now()),
            attempts,
        }
    }

    fn pool_size(&self) -> usize {
        // The pool doesn't expose its configured capacity directly; sibling
        // fan-out is bounded by how many sessions can actually be leased,
        // which `buffer_unordered` enforces implicitly via `acquire()`
        // blocking. A generous upper bound here just caps how many futures
        // are constructed eagerly.
        8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Syncer(#[from] crate::syncer::SyncerError),
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Client(#[from] crate::client::ClientError),
    #[error("local {0} {1} referenced by the sweep has no row in the store")]
    MissingAncestor(EntityKind, Uuid),
}

impl Categorized for StageError {
    fn category(&self) -> crate::error::ErrorCategory {
        match self {
            Self::Syncer(e) => e.category(),
            Self::Pool(e) => e.category(),
            Self::Store(e) => e.category(),
            Self::Client(e) => e.category(),
            Self::MissingAncestor(..) => ErrorCategory::System,
        }
    }
}

/// Which kind `parent_id` itself belongs to, for the level being synced.
/// Directory's own sweep targets directories directly; every level below
/// it targets the kind one rung up the tree.
fn parent_kind_of(kind: EntityKind) -> EntityKind {
    match kind {
        EntityKind::Directory => EntityKind::Directory,
        EntityKind::Project => EntityKind::Directory,
        EntityKind::Phase => EntityKind::Project,
        EntityKind::Elevation => EntityKind::Phase,
    }
}

fn skipped_attempt(run_id: Uuid, kind: EntityKind, parent_id: Uuid) -> SyncAttempt {
    let now = Utc::now();
    SyncAttempt {
        id: Uuid::new_v4(),
        run_id,
        kind,
        parent_id: Some(parent_id),
        state: AttemptState::Skipped,
        created: 0,
        updated: 0,
        deleted: 0,
        skipped: 0,
        errors: vec![],
        started_at: now,
        ended_at: Some(now),
    }
}

/// Positions the session cursor at the scope `parent_id` belongs to before
/// a syncer lists its children. `kind` is the level about to be synced, so
/// `parent_id`'s own kind is one rung up the tree for everything below
/// Directory (see [`parent_kind_of`]).
async fn position_for<S: Store>(
    store: &S,
    client: &dyn UpstreamClient,
    kind: EntityKind,
    parent_id: Uuid,
) -> Result<(), StageError> {
    match kind {
        EntityKind::Directory | EntityKind::Project => {
            let dir = store
                .get_directory(parent_id)
                .await?
                .ok_or(StageError::MissingAncestor(EntityKind::Directory, parent_id))?;
            client.navigate(&dir.full_path).await?;
        }
        EntityKind::Phase => {
            let project = store
                .get_project(parent_id)
                .await?
                .ok_or(StageError::MissingAncestor(EntityKind::Project, parent_id))?;
            let dir = store
                .get_directory(project.directory_id)
                .await?
                .ok_or(StageError::MissingAncestor(EntityKind::Directory, project.directory_id))?;
            client.navigate(&dir.full_path).await?;
            client.select_project(project.upstream_id).await?;
        }
        EntityKind::Elevation => {
            let phase = store
                .get_phase(parent_id)
                .await?
                .ok_or(StageError::MissingAncestor(EntityKind::Phase, parent_id))?;
            let project = store
                .get_project(phase.project_id)
                .await?
                .ok_or(StageError::MissingAncestor(EntityKind::Project, phase.project_id))?;
            let dir = store
                .get_directory(project.directory_id)
                .await?
                .ok_or(StageError::MissingAncestor(EntityKind::Directory, project.directory_id))?;
            client.navigate(&dir.full_path).await?;
            client.select_project(project.upstream_id).await?;
            client.select_phase(phase.upstream_id).await?;
        }
    }
    Ok(())
}

async fn sync_one_parent<S: Store>(
    store: &S,
    syncer: &dyn EntitySyncer,
    pool: &SessionPool,
    kind: EntityKind,
    parent_id: Uuid,
    cancel: &CancellationToken,
) -> Result<Outcome, StageError> {
    if cancel.is_cancelled() {
        return Ok(Outcome::Failed {
            reason: "cancelled".into(),
        });
    }
    let mut leased = pool.acquire().await?;

    if let Err(e) = position_for(store, leased.session().as_ref(), kind, parent_id).await {
        if matches!(e.category(), ErrorCategory::NotFound) {
            return Ok(Outcome::ParentDeleted);
        }
        if matches!(e.category(), ErrorCategory::Auth) {
            leased.invalidate();
        }
        return Err(e);
    }

    let result = syncer.sync_children(leased.session().as_ref(), parent_id).await;
    if let Err(e) = &result {
        if matches!(e.category(), crate::error::ErrorCategory::Auth) {
            leased.invalidate();
        }
    }
    Ok(result?)
}

async fn children_for_next_level<S: Store>(
    store: &S,
    kind: EntityKind,
    parent_id: Uuid,
) -> Result<Vec<Uuid>, StageError> {
    let ids = match kind {
        EntityKind::Directory => store
            .children_of_directory(parent_id)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect(),
        EntityKind::Project => store
            .projects_of_directory(parent_id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect(),
        EntityKind::Phase => store
            .phases_of_project(parent_id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect(),
        EntityKind::Elevation => store
            .elevations_of_phase(parent_id)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect(),
    };
    Ok(ids)
}

/// Resolves a policy key's next-kind-down edge, used when deciding whether
/// the cascade should keep descending past the four mirrored levels into
/// an auxiliary job (sqlite_parser, parsing_errors) at the same root.
pub fn auxiliary_jobs_for(kind: EntityKind) -> Vec<PolicyKey> {
    match kind {
        EntityKind::Elevation => vec![PolicyKey::Auxiliary(crate::config::AuxiliaryJob::SqliteParser)],
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use crate::client::{ClientError, Credentials, SessionCursor, ThumbnailOptions, UpstreamEntry};
    use crate::store::InMemoryStore;
    use crate::syncer::{DirectorySyncer, ElevationSyncer, PhaseSyncer, ProjectSyncer};
    use async_trait::async_trait;

    struct EmptyClient;

    #[async_trait]
    impl UpstreamClient for EmptyClient {
        async fn login(&self, _creds: &Credentials) -> Result<(), ClientError> {
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

    /// A one-child-per-level upstream: directory `A` under the root, one
    /// project in `A`, one phase in that project, one elevation in that
    /// phase. Each `list_*` call answers based on which cursor is
    /// currently selected, mirroring the real protocol's session
    /// statefulness, so the orchestrator's navigation order is what makes
    /// the right listing show up at each level.
    struct ScriptedClient {
        dir_a: Uuid,
        project: Uuid,
        phase: Uuid,
        elevation: Uuid,
        current_path: std::sync::Mutex<String>,
        selected_project: std::sync::Mutex<Option<Uuid>>,
        selected_phase: std::sync::Mutex<Option<Uuid>>,
    }

    impl ScriptedClient {
        fn new() -> Self {
            Self {
                dir_a: Uuid::new_v4(),
                project: Uuid::new_v4(),
                phase: Uuid::new_v4(),
                elevation: Uuid::new_v4(),
                current_path: std::sync::Mutex::new("/".to_string()),
                selected_project: std::sync::Mutex::new(None),
                selected_phase: std::sync::Mutex::new(None),
            }
        }
    }

    fn scripted_entry(id: Uuid, name: &str, relative_path: Option<&str>) -> UpstreamEntry {
        UpstreamEntry {
            id: id.to_string(),
            name: name.to_string(),
            relative_path: relative_path.map(str::to_string),
            changed_at: None,
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedClient {
        async fn login(&self, _creds: &Credentials) -> Result<(), ClientError> {
            Ok(())
        }
        async fn navigate(&self, path: &str) -> Result<(), ClientError> {
            *self.current_path.lock().unwrap() = path.to_string();
            Ok(())
        }
        async fn list_directories(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            let path = self.current_path.lock().unwrap().clone();
            if path == "/" {
                Ok(vec![scripted_entry(self.dir_a, "A", Some("/A"))])
            } else {
                Ok(vec![])
            }
        }
        async fn list_projects(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            let path = self.current_path.lock().unwrap().clone();
            if path == "/A" {
                Ok(vec![scripted_entry(self.project, "P1", None)])
            } else {
                Ok(vec![])
            }
        }
        async fn select_project(&self, id: Uuid) -> Result<(), ClientError> {
            *self.selected_project.lock().unwrap() = Some(id);
            Ok(())
        }
        async fn list_phases(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            if *self.selected_project.lock().unwrap() == Some(self.project) {
                Ok(vec![scripted_entry(self.phase, "Ph1", None)])
            } else {
                Ok(vec![])
            }
        }
        async fn select_phase(&self, id: Uuid) -> Result<(), ClientError> {
            *self.selected_phase.lock().unwrap() = Some(id);
            Ok(())
        }
        async fn list_elevations(&self) -> Result<Vec<UpstreamEntry>, ClientError> {
            if *self.selected_phase.lock().unwrap() == Some(self.phase) {
                Ok(vec![scripted_entry(self.elevation, "E1", None)])
            } else {
                Ok(vec![])
            }
        }
        async fn fetch_thumbnail(
            &self,
            _id: Uuid,
            _opts: ThumbnailOptions,
        ) -> Result<Vec<u8>, ClientError> {
            Ok(vec![])
        }
        async fn fetch_parts_blob(&self, _elevation_id: Uuid) -> Result<Vec<u8>, ClientError> {
            Err(ClientError::Empty)
        }
        async fn logout(&self) -> Result<(), ClientError> {
            Ok(())
        }
        fn cursor(&self) -> SessionCursor {
            SessionCursor::default()
        }
    }

    /// Shares one `Arc<InMemoryStore>` between the orchestrator and every
    /// kind's syncer. Each syncer is generic over `S: Store`, and the
    /// blanket `Store for Arc<T>` impl lets the same `Arc` satisfy that
    /// bound everywhere it's cloned into, so a child upserted by, say,
    /// `ProjectSyncer` is visible to the orchestrator's own
    /// `children_for_next_level` lookup on the very same store.
    fn build_orchestrator(
        store: Arc<InMemoryStore>,
    ) -> CascadeOrchestrator<InMemoryStore> {
        let registry = Arc::new(SyncConfigRegistry::with_defaults());
        let syncers = Arc::new(SyncerRegistry::new(
            Arc::new(DirectorySyncer::new(store.clone())),
            Arc::new(ProjectSyncer::new(store.clone())),
            Arc::new(PhaseSyncer::new(store.clone())),
            Arc::new(ElevationSyncer::new(store.clone(), InMemoryBlobStore::new())),
        ));
        let pool = Arc::new(SessionPool::new(
            2,
            Credentials {
                username: "u".into(),
                password: "p".into(),
            },
            || Arc::new(EmptyClient),
        ));
        CascadeOrchestrator::new(store, pool, registry, syncers)
    }

    /// Same as [`build_orchestrator`] but with a pluggable client and a
    /// single-session pool, so every parent sweep in the run is fully
    /// serialized against the one `ScriptedClient` instance instead of
    /// racing on its shared cursor state.
    fn build_orchestrator_with_client(
        store: Arc<InMemoryStore>,
        client: Arc<ScriptedClient>,
    ) -> CascadeOrchestrator<InMemoryStore> {
        let registry = Arc::new(SyncConfigRegistry::with_defaults());
        let syncers = Arc::new(SyncerRegistry::new(
            Arc::new(DirectorySyncer::new(store.clone())),
            Arc::new(ProjectSyncer::new(store.clone())),
            Arc::new(PhaseSyncer::new(store.clone())),
            Arc::new(ElevationSyncer::new(store.clone(), InMemoryBlobStore::new())),
        ));
        let pool = Arc::new(SessionPool::new(
            1,
            Credentials {
                username: "u".into(),
                password: "p".into(),
            },
            move || client.clone() as Arc<dyn UpstreamClient>,
        ));
        CascadeOrchestrator::new(store, pool, registry, syncers)
    }

    async fn seed_root_directory(store: &InMemoryStore) -> Uuid {
        use crate::entities::{Directory, SyncStatus, SyncTimestamps};
        let id = Uuid::new_v4();
        store
            .upsert_directory(Directory {
                id,
                upstream_id: Uuid::new_v4(),
                full_path: "/".into(),
                parent_id: None,
                level: 0,
                excluded: false,
                sync_status: SyncStatus::New,
                timestamps: SyncTimestamps {
                    upstream_changed_at: None,
                    local_synced_at: None,
                },
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn empty_tree_completes_with_no_attempts_past_the_root() {
        let store = Arc::new(InMemoryStore::new());
        let root = seed_root_directory(&store).await;
        let orchestrator = build_orchestrator(store);

        let run = orchestrator
            .run(root, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.state, SyncRunState::Done);
        // One Directory attempt for the root's own children (empty), then
        // every level below is empty too since nothing was created.
        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.attempts[0].kind, EntityKind::Directory);
    }

    #[tokio::test]
    async fn cancellation_stops_the_sweep_early() {
        let store = Arc::new(InMemoryStore::new());
        let root = seed_root_directory(&store).await;
        let orchestrator = build_orchestrator(store);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = orchestrator.run(root, cancel).await.unwrap();
        assert_eq!(run.state, SyncRunState::Cancelled);
    }

    #[tokio::test]
    async fn missing_root_directory_errors_instead_of_silently_skipping() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = build_orchestrator(store);

        let err = orchestrator
            .run(Uuid::new_v4(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::MissingAncestor(EntityKind::Directory, _)));
    }

    #[tokio::test]
    async fn full_cascade_populates_every_level_and_second_run_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let root = seed_root_directory(&store).await;
        let client = Arc::new(ScriptedClient::new());
        let orchestrator = build_orchestrator_with_client(store.clone(), client);

        let first = orchestrator
            .run(root, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.state, SyncRunState::Done);

        let dirs = store.children_of_directory(root).await.unwrap();
        assert_eq!(dirs.len(), 1, "directory A should be mirrored under root");
        let dir_a = &dirs[0];
        assert_eq!(dir_a.level, 1, "level should be parent's level + 1, not hardcoded");

        let projects = store.projects_of_directory(dir_a.id).await.unwrap();
        assert_eq!(projects.len(), 1);
        let phases = store.phases_of_project(projects[0].id).await.unwrap();
        assert_eq!(phases.len(), 1);
        let elevations = store.elevations_of_phase(phases[0].id).await.unwrap();
        assert_eq!(elevations.len(), 1);
        assert_eq!(elevations[0].name, "E1");

        let total_created: i32 = first.attempts.iter().map(|a| a.created).sum();
        assert_eq!(total_created, 4, "one new row per level: dir, project, phase, elevation");

        // Idempotence (§8 property 1): nothing changed upstream between
        // runs, so the second pass creates/updates/removes nothing.
        let second = orchestrator
            .run(root, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.state, SyncRunState::Done);
        let created: i32 = second.attempts.iter().map(|a| a.created).sum();
        let updated: i32 = second.attempts.iter().map(|a| a.updated).sum();
        let deleted: i32 = second.attempts.iter().map(|a| a.deleted).sum();
        assert_eq!((created, updated, deleted), (0, 0, 0));
    }
}
