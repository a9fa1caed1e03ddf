//! Staleness Evaluator
//!
//! One consolidated predicate. The original system split this logic across
//! a "smart sync" service and an "advanced sync" service with subtly
//! different thresholds; there is exactly one rule set here.

use chrono::{DateTime, Duration, Utc};

/// Inputs the evaluator needs about a local entity; deliberately narrow so
/// callers don't have to construct a full entity row just to ask "stale?".
#[derive(Debug, Clone, Copy)]
pub struct LocalFreshness {
    pub local_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Stale,
    Fresh,
}

/// Decide stale/fresh per the documented rule set:
///
/// 1. Never synced locally -> stale.
/// 2. Upstream gives no `changed_at` -> fresh (nothing to compare against).
/// 3. Upstream changed after our last sync -> stale.
/// 4. Our last sync is older than the staleness threshold -> stale.
/// 5. Otherwise fresh.
pub fn evaluate(
    local: LocalFreshness,
    upstream_changed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    staleness_threshold: Duration,
) -> Freshness {
    let Some(local_synced_at) = local.local_synced_at else {
        return Freshness::Stale;
    };

    let Some(upstream_changed_at) = upstream_changed_at else {
        return Freshness::Fresh;
    };

    if upstream_changed_at > local_synced_at {
        return Freshness::Stale;
    }

    if now - local_synced_at > staleness_threshold {
        return Freshness::Stale;
    }

    Freshness::Fresh
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold() -> Duration {
        Duration::minutes(120)
    }

    #[test]
    fn never_synced_is_stale() {
        let local = LocalFreshness {
            local_synced_at: None,
        };
        assert_eq!(
            evaluate(local, Some(Utc::now()), Utc::now(), threshold()),
            Freshness::Stale
        );
    }

    #[test]
    fn silent_upstream_is_fresh() {
        let now = Utc::now();
        let local = LocalFreshness {
            local_synced_at: Some(now),
        };
        assert_eq!(evaluate(local, None, now, threshold()), Freshness::Fresh);
    }

    #[test]
    fn newer_upstream_change_is_stale() {
        let now = Utc::now();
        let local = LocalFreshness {
            local_synced_at: Some(now - Duration::minutes(10)),
        };
        let upstream_changed = now - Duration::minutes(1);
        assert_eq!(
            evaluate(local, Some(upstream_changed), now, threshold()),
            Freshness::Stale
        );
    }

    #[test]
    fn exceeding_threshold_is_stale_even_without_upstream_change() {
        let now = Utc::now();
        let synced_at = now - Duration::minutes(130);
        let local = LocalFreshness {
            local_synced_at: Some(synced_at),
        };
        assert_eq!(
            evaluate(local, Some(synced_at), now, threshold()),
            Freshness::Stale
        );
    }

    #[test]
    fn within_threshold_and_no_upstream_change_is_fresh() {
        let now = Utc::now();
        let synced_at = now - Duration::minutes(5);
        let local = LocalFreshness {
            local_synced_at: Some(synced_at),
        };
        assert_eq!(
            evaluate(local, Some(synced_at), now, threshold()),
            Freshness::Fresh
        );
    }
}
