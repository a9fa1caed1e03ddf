//! Sync config registry
//!
//! Per-entity-kind policy: interval, staleness threshold, priority,
//! dependencies, batch size, retry budget. Seeded with the same defaults
//! the source's object sync config service ships, including the two
//! auxiliary policies (`sqlite_parser`, `parsing_errors`) that aren't one
//! of the four mirrored entity kinds but still need their own schedule.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::EntityKind;
use crate::error::{Categorized, ErrorCategory};

/// Non-entity auxiliary jobs that share the registry's scheduling shape
/// but aren't themselves a mirrored tree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryJob {
    SqliteParser,
    ParsingErrors,
}

impl AuxiliaryJob {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqliteParser => "sqlite_parser",
            Self::ParsingErrors => "parsing_errors",
        }
    }
}

/// Either a mirrored entity kind or an auxiliary job; the registry key
/// space the source covers with one `object_type` string column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKey {
    Entity(EntityKind),
    Auxiliary(AuxiliaryJob),
}

impl PolicyKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity(k) => k.as_str(),
            Self::Auxiliary(j) => j.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectSyncConfig {
    pub key: PolicyKey,
    pub interval: Duration,
    pub priority: i32,
    pub depends_on: Vec<PolicyKey>,
    pub staleness_threshold: Duration,
    pub batch_size: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub enabled: bool,
    /// Last time a sweep for this key completed successfully. `None` means
    /// never synced, which the Scheduler treats as immediately due.
    pub last_sync: Option<DateTime<Utc>>,
    /// Last time the Scheduler enqueued a task for this key, regardless of
    /// outcome; used only to avoid double-enqueueing within one tick.
    pub last_attempt: Option<DateTime<Utc>>,
}

impl ObjectSyncConfig {
    /// Whether this key's sweep interval has elapsed since `last_sync`.
    /// Never synced is always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && match self.last_sync {
                None => true,
                Some(last) => now - last >= self.interval,
            }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown policy key: {0}")]
    UnknownKey(String),
    #[error("dependency cycle introduced at {0}")]
    CyclicDependency(String),
}

impl Categorized for ConfigError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}

/// Holds one policy per key, enforcing that `depends_on` edits never
/// introduce a cycle. Reads are lock-free after the initial seed in the
/// common case since the table changes rarely relative to how often the
/// Cascade Orchestrator consults it.
pub struct SyncConfigRegistry {
    policies: RwLock<HashMap<&'static str, ObjectSyncConfig>>,
}

impl SyncConfigRegistry {
    /// Seeds the seven default rows from the source's
    /// `object_sync_config_service` defaults.
    pub fn with_defaults() -> Self {
        use EntityKind::*;
        use PolicyKey::{Auxiliary as Aux, Entity as Ent};

        let rows = vec![
            ObjectSyncConfig {
                key: Ent(Directory),
                interval: Duration::minutes(60),
                priority: 1,
                depends_on: vec![],
                staleness_threshold: Duration::minutes(120),
                batch_size: 50,
                max_retries: 3,
                retry_delay: Duration::minutes(5),
                enabled: true,
                last_sync: None,
                last_attempt: None,
            },
            ObjectSyncConfig {
                key: Ent(Project),
                interval: Duration::minutes(120),
                priority: 2,
                depends_on: vec![Ent(Directory)],
                staleness_threshold: Duration::minutes(240),
                batch_size: 100,
                max_retries: 3,
                retry_delay: Duration::minutes(5),
                enabled: true,
                last_sync: None,
                last_attempt: None,
            },
            ObjectSyncConfig {
                key: Ent(Phase),
                interval: Duration::minutes(180),
                priority: 3,
                depends_on: vec![Ent(Project)],
                staleness_threshold: Duration::minutes(360),
                batch_size: 100,
                max_retries: 3,
                retry_delay: Duration::minutes(5),
                enabled: true,
                last_sync: None,
                last_attempt: None,
            },
            ObjectSyncConfig {
                key: Ent(Elevation),
                interval: Duration::minutes(240),
                priority: 4,
                depends_on: vec![Ent(Phase)],
                staleness_threshold: Duration::minutes(480),
                batch_size: 50,
                max_retries: 5,
                retry_delay: Duration::minutes(10),
                enabled: true,
                last_sync: None,
                last_attempt: None,
            },
            ObjectSyncConfig {
                key: Aux(AuxiliaryJob::SqliteParser),
                interval: Duration::minutes(10),
                priority: 6,
                depends_on: vec![Ent(Elevation)],
                staleness_threshold: Duration::minutes(30),
                batch_size: 5,
                max_retries: 3,
                retry_delay: Duration::minutes(2),
                enabled: true,
                last_sync: None,
                last_attempt: None,
            },
            ObjectSyncConfig {
                key: Aux(AuxiliaryJob::ParsingErrors),
                interval: Duration::minutes(60),
                priority: 7,
                depends_on: vec![Aux(AuxiliaryJob::SqliteParser)],
                staleness_threshold: Duration::minutes(120),
                batch_size: 50,
                max_retries: 2,
                retry_delay: Duration::minutes(5),
                enabled: true,
                last_sync: None,
                last_attempt: None,
            },
        ];

        let mut policies = HashMap::new();
        for row in rows {
            policies.insert(row.key.as_str(), row);
        }
        Self {
            policies: RwLock::new(policies),
        }
    }

    pub fn get(&self, key: PolicyKey) -> Option<ObjectSyncConfig> {
        self.policies.read().unwrap().get(key.as_str()).cloned()
    }

    /// Every enabled key (mirrored kind or auxiliary job) whose interval has
    /// elapsed since its last successful sync, in priority order — the set
    /// the Scheduler enqueues sweep tasks for on a tick.
    pub fn due_keys(&self, now: DateTime<Utc>) -> Vec<PolicyKey> {
        let policies = self.policies.read().unwrap();
        let mut due: Vec<(PolicyKey, i32)> = policies
            .values()
            .filter(|p| p.is_due(now))
            .map(|p| (p.key, p.priority))
            .collect();
        due.sort_by_key(|(_, priority)| *priority);
        due.into_iter().map(|(k, _)| k).collect()
    }

    /// Record that the Scheduler enqueued a task for `key` at `at`, so a
    /// second tick before the task runs doesn't double-enqueue it.
    pub fn record_attempt(&self, key: PolicyKey, at: DateTime<Utc>) {
        if let Some(policy) = self.policies.write().unwrap().get_mut(key.as_str()) {
            policy.last_attempt = Some(at);
        }
    }

    /// Record that a sweep for `key` completed, successfully or not — the
    /// orchestrator's idempotence makes re-running a partially-failed sweep
    /// safe, so `last_sync` advances regardless of per-entity error counts.
    pub fn record_sync(&self, key: PolicyKey, at: DateTime<Utc>) {
        if let Some(policy) = self.policies.write().unwrap().get_mut(key.as_str()) {
            policy.last_sync = Some(at);
        }
    }

    /// Ordered dependency-respecting sweep order for the four mirrored
    /// entity kinds, derived from `priority` rather than a fresh
    /// topological sort, since the default rows are already consistent
    /// with their declared `depends_on` edges.
    pub fn entity_sweep_order(&self) -> Vec<EntityKind> {
        let policies = self.policies.read().unwrap();
        let mut kinds: Vec<(EntityKind, i32)> = policies
            .values()
            .filter_map(|p| match p.key {
                PolicyKey::Entity(k) if p.enabled => Some((k, p.priority)),
                _ => None,
            })
            .collect();
        kinds.sort_by_key(|(_, priority)| *priority);
        kinds.into_iter().map(|(k, _)| k).collect()
    }

    /// Replace one policy's `depends_on`, rejecting the edit if it would
    /// introduce a cycle anywhere in the registry.
    pub fn set_depends_on(
        &self,
        key: PolicyKey,
        depends_on: Vec<PolicyKey>,
    ) -> Result<(), ConfigError> {
        let mut policies = self.policies.write().unwrap();
        if !policies.contains_key(key.as_str()) {
            return Err(ConfigError::UnknownKey(key.as_str().to_string()));
        }

        let mut trial: HashMap<&'static str, Vec<&'static str>> = policies
            .values()
            .map(|p| {
                (
                    p.key.as_str(),
                    p.depends_on.iter().map(|d| d.as_str()).collect(),
                )
            })
            .collect();
        trial.insert(key.as_str(), depends_on.iter().map(|d| d.as_str()).collect());

        if has_cycle(&trial) {
            return Err(ConfigError::CyclicDependency(key.as_str().to_string()));
        }

        policies.get_mut(key.as_str()).unwrap().depends_on = depends_on;
        Ok(())
    }

    /// Toggle a policy's `enabled` flag, e.g. to pause a noisy entity kind
    /// without restarting the Scheduler.
    pub fn set_enabled(&self, key: PolicyKey, enabled: bool) -> Result<(), ConfigError> {
        let mut policies = self.policies.write().unwrap();
        let policy = policies
            .get_mut(key.as_str())
            .ok_or_else(|| ConfigError::UnknownKey(key.as_str().to_string()))?;
        policy.enabled = enabled;
        Ok(())
    }
}

fn has_cycle(graph: &HashMap<&'static str, Vec<&'static str>>) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'static str, Vec<&'static str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        match marks.get(node) {
            Some(Mark::Done) => return false,
            Some(Mark::InProgress) => return true,
            _ => {}
        }
        marks.insert(node, Mark::InProgress);
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if visit(dep, graph, marks) {
                    return true;
                }
            }
        }
        marks.insert(node, Mark::Done);
        false
    }

    let mut marks = HashMap::new();
    for node in graph.keys() {
        if visit(node, graph, &mut marks) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_seed_exactly_six_rows_with_elevation_last_among_entities() {
        let registry = SyncConfigRegistry::with_defaults();
        let order = registry.entity_sweep_order();
        assert_eq!(
            order,
            vec![
                EntityKind::Directory,
                EntityKind::Project,
                EntityKind::Phase,
                EntityKind::Elevation,
            ]
        );
    }

    #[test]
    fn never_synced_entry_is_immediately_due() {
        let registry = SyncConfigRegistry::with_defaults();
        let now = Utc::now();
        let due = registry.due_keys(now);
        assert!(due.contains(&PolicyKey::Entity(EntityKind::Directory)));
    }

    #[test]
    fn record_sync_pushes_key_out_of_due_set_until_interval_elapses() {
        let registry = SyncConfigRegistry::with_defaults();
        let now = Utc::now();
        let key = PolicyKey::Entity(EntityKind::Directory);

        registry.record_sync(key, now);
        let due = registry.due_keys(now);
        assert!(!due.contains(&key));

        let interval = registry.get(key).unwrap().interval;
        let past_interval = now + interval + Duration::seconds(1);
        let due = registry.due_keys(past_interval);
        assert!(due.contains(&key));
    }

    #[test]
    fn record_attempt_does_not_affect_due_keys() {
        let registry = SyncConfigRegistry::with_defaults();
        let now = Utc::now();
        let key = PolicyKey::Entity(EntityKind::Directory);

        registry.record_attempt(key, now);
        assert!(registry.due_keys(now).contains(&key));
    }

    #[test]
    fn disabled_entry_is_never_due() {
        let registry = SyncConfigRegistry::with_defaults();
        let key = PolicyKey::Auxiliary(AuxiliaryJob::ParsingErrors);
        registry.set_enabled(key, false).unwrap();
        assert!(!registry.due_keys(Utc::now()).contains(&key));
    }

    #[test]
    fn due_keys_are_sorted_by_priority() {
        let registry = SyncConfigRegistry::with_defaults();
        let now = Utc::now();
        let due = registry.due_keys(now);

        let priorities: Vec<i32> = due
            .iter()
            .map(|k| registry.get(*k).unwrap().priority)
            .collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn sqlite_parser_depends_on_elevation() {
        let registry = SyncConfigRegistry::with_defaults();
        let cfg = registry
            .get(PolicyKey::Auxiliary(AuxiliaryJob::SqliteParser))
            .unwrap();
        assert_eq!(cfg.depends_on, vec![PolicyKey::Entity(EntityKind::Elevation)]);
        assert_eq!(cfg.batch_size, 5);
    }

    #[test]
    fn rejects_self_referential_dependency() {
        let registry = SyncConfigRegistry::with_defaults();
        let result = registry.set_depends_on(
            PolicyKey::Entity(EntityKind::Directory),
            vec![PolicyKey::Entity(EntityKind::Directory)],
        );
        assert!(matches!(result, Err(ConfigError::CyclicDependency(_))));
    }

    #[test]
    fn rejects_cycle_introduced_two_hops_away() {
        let registry = SyncConfigRegistry::with_defaults();
        // Directory -> Elevation would close a cycle since Elevation already
        // (transitively) depends on Directory via Phase -> Project -> Directory.
        let result = registry.set_depends_on(
            PolicyKey::Entity(EntityKind::Directory),
            vec![PolicyKey::Entity(EntityKind::Elevation)],
        );
        assert!(matches!(result, Err(ConfigError::CyclicDependency(_))));
    }
}
