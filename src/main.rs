//! logikal-sync-engine binary — wires the orchestration engine together
//! against a live Postgres store and the upstream catalog API, then runs
//! the scheduler, sweep worker, and parts parser loops until interrupted.

use std::sync::Arc;

use logikal_sync_engine::blob_store::LocalBlobStore;
use logikal_sync_engine::cascade::{CascadeOrchestrator, SyncerRegistry};
use logikal_sync_engine::client::{ReqwestUpstreamClient, UpstreamClient};
use logikal_sync_engine::config::{AuxiliaryJob, PolicyKey, SyncConfigRegistry};
use logikal_sync_engine::entities::{Directory, SyncStatus, SyncTimestamps};
use logikal_sync_engine::parts_parser::PartsParserWorker;
use logikal_sync_engine::pool::SessionPool;
use logikal_sync_engine::scheduler::{
    DispatchError, Scheduler, SweepDispatcher, SweepWorker, TracingAlertSink,
};
use logikal_sync_engine::settings::EngineConfig;
use logikal_sync_engine::store::{PostgresStore, Store};
use logikal_sync_engine::syncer::{DirectorySyncer, ElevationSyncer, PhaseSyncer, ProjectSyncer};
use logikal_sync_engine::task_queue::PostgresTaskQueue;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Dispatches one sweep task by kind. Entity kinds run one cascade rooted
/// at `scope_root`; the `sqlite_parser` auxiliary job drains the parts
/// parser backlog instead, ignoring `scope_root` since it scans across
/// the whole store. `parsing_errors` has no cascade of its own — it is
/// handled by the parser's own retry/DLQ bookkeeping — so it is a no-op
/// here besides acknowledging the task.
struct EngineDispatcher<S> {
    cascade: CascadeOrchestrator<S>,
    parser: Arc<PartsParserWorker<PostgresStore, LocalBlobStore>>,
    parser_batch_size: u32,
}

#[async_trait::async_trait]
impl<S: Store + 'static> SweepDispatcher for EngineDispatcher<S> {
    async fn dispatch(
        &self,
        key: PolicyKey,
        scope_root: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        match key {
            PolicyKey::Entity(_) => {
                self.cascade
                    .run(scope_root, cancel)
                    .await
                    .map(|_| ())
                    .map_err(DispatchError::from_categorized)
            }
            PolicyKey::Auxiliary(AuxiliaryJob::SqliteParser) => self
                .parser
                .run_once(self.parser_batch_size)
                .await
                .map(|_| ())
                .map_err(DispatchError::from_categorized),
            PolicyKey::Auxiliary(AuxiliaryJob::ParsingErrors) => Ok(()),
        }
    }
}

/// Ensures the mirrored root directory exists locally so the very first
/// cascade has a `full_path` to navigate to before anything has been
/// listed from upstream yet.
async fn bootstrap_root(store: &PostgresStore, config: &EngineConfig) -> Uuid {
    if let Some(existing) = store
        .find_directory_by_upstream_id(config.root_upstream_id)
        .await
        .expect("failed to look up root directory")
    {
        return existing.id;
    }

    let root = Directory {
        id: Uuid::new_v4(),
        upstream_id: config.root_upstream_id,
        full_path: config.root_path.clone(),
        parent_id: None,
        level: 0,
        excluded: false,
        sync_status: SyncStatus::New,
        timestamps: SyncTimestamps {
            upstream_changed_at: None,
            local_synced_at: None,
        },
    };
    let id = root.id;
    store
        .upsert_directory(root)
        .await
        .expect("failed to bootstrap root directory");
    id
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,logikal_sync_engine=debug".into()),
        )
        .init();

    let config = EngineConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    tracing::info!("connected to database");

    let root_directory_id = bootstrap_root(&PostgresStore::new(pool.clone()), &config).await;

    let base_url = config.upstream_base_url.clone();
    let rps = config.rate_limit_rps;
    let session_pool = Arc::new(SessionPool::new(
        config.session_pool_size,
        config.upstream_credentials.clone(),
        move || Arc::new(ReqwestUpstreamClient::new(base_url.clone(), rps)) as Arc<dyn UpstreamClient>,
    ));

    let blob_store = LocalBlobStore::new(config.blob_root.clone());

    let syncers = Arc::new(SyncerRegistry::new(
        Arc::new(DirectorySyncer::new(PostgresStore::new(pool.clone()))),
        Arc::new(ProjectSyncer::new(PostgresStore::new(pool.clone()))),
        Arc::new(PhaseSyncer::new(PostgresStore::new(pool.clone()))),
        Arc::new(ElevationSyncer::new(
            PostgresStore::new(pool.clone()),
            blob_store.clone(),
        )),
    ));

    let registry = Arc::new(SyncConfigRegistry::with_defaults());

    let cascade = CascadeOrchestrator::new(
        Arc::new(PostgresStore::new(pool.clone())),
        Arc::clone(&session_pool),
        Arc::clone(&registry),
        syncers,
    );

    let parser_batch_size = registry
        .get(PolicyKey::Auxiliary(AuxiliaryJob::SqliteParser))
        .map(|p| p.batch_size)
        .unwrap_or(5);
    let parser_max_retries = registry
        .get(PolicyKey::Auxiliary(AuxiliaryJob::SqliteParser))
        .map(|p| p.max_retries as i32)
        .unwrap_or(3);
    let parser = Arc::new(PartsParserWorker::new(
        PostgresStore::new(pool.clone()),
        blob_store.clone(),
        parser_max_retries,
    ));

    let dispatcher = EngineDispatcher {
        cascade,
        parser: Arc::clone(&parser),
        parser_batch_size,
    };

    let scheduler = Scheduler::with_alerts(
        Arc::clone(&registry),
        PostgresStore::new(pool.clone()),
        PostgresTaskQueue::new(pool.clone()),
        TracingAlertSink,
        root_directory_id,
        config.tick_interval,
    );
    let sweep_worker = SweepWorker::new(PostgresTaskQueue::new(pool.clone()), dispatcher);

    let cancel = CancellationToken::new();

    let scheduler_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });
    let worker_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { sweep_worker.run(cancel).await }
    });
    let parser_tasks: Vec<_> = (0..config.parser_worker_count)
        .map(|_| {
            let cancel = cancel.clone();
            let parser = Arc::clone(&parser);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = parser.run_once(parser_batch_size).await {
                                tracing::error!(error = %e, "parts parser pass failed");
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        })
        .collect();

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutdown signal received");
    cancel.cancel();

    let _ = scheduler_task.await;
    let _ = worker_task.await;
    for task in parser_tasks {
        let _ = task.await;
    }
}
