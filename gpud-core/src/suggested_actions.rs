//! Suggested actions store
//!
//! TTL-keyed cache of which components currently warrant which repair action.
//! Expired entries are dropped lazily the next time their action is queried;
//! there is no background sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::api::RepairActionType;
use crate::metrics::MetricsRegistry;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Live repair action suggestions keyed by action, then by component
pub struct SuggestedActionsStore {
    actions: RwLock<HashMap<RepairActionType, HashMap<String, DateTime<Utc>>>>,
    now: Clock,
    metrics: MetricsRegistry,
}

impl SuggestedActionsStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Create a store reading the current time from `now`
    pub fn with_clock(now: Clock) -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            now,
            metrics: MetricsRegistry::new(),
        }
    }

    /// Suggest `action` for `component` until `ttl` from now, overwriting any
    /// previous expiry for the same pair
    pub fn suggest(&self, component: &str, action: RepairActionType, ttl: Duration) {
        let now = (self.now)();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut actions = self.actions.write();
        let bucket = actions.entry(action).or_default();
        bucket.insert(component.to_string(), expires_at);
        self.metrics.set_suggested_components(action, bucket.len());
        drop(actions);

        debug!(component, action = %action, expires_at = %expires_at, "Suggested repair action");
    }

    /// Components with a live suggestion for `action`, sorted by name
    ///
    /// An entry stays live up to and including its expiry instant. Expired
    /// entries found along the way are removed, as is the action itself
    /// once nothing live remains.
    pub fn has_suggested(&self, action: RepairActionType) -> Vec<String> {
        let now = (self.now)();

        let mut actions = self.actions.write();
        let Some(bucket) = actions.get_mut(&action) else {
            return Vec::new();
        };

        bucket.retain(|_, expires_at| *expires_at >= now);
        let mut components: Vec<String> = bucket.keys().cloned().collect();
        if bucket.is_empty() {
            actions.remove(&action);
        }
        self.metrics.set_suggested_components(action, components.len());
        drop(actions);

        components.sort();
        components
    }

    #[cfg(test)]
    fn has_bucket(&self, action: RepairActionType) -> bool {
        self.actions.read().contains_key(&action)
    }
}

impl Default for SuggestedActionsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct MockClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        fn new() -> Self {
            Self {
                now: Arc::new(Mutex::new(
                    Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap(),
                )),
            }
        }

        fn store(&self) -> SuggestedActionsStore {
            let now = self.now.clone();
            SuggestedActionsStore::with_clock(Arc::new(move || *now.lock()))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_suggest_then_expire() {
        let clock = MockClock::new();
        let store = clock.store();

        store.suggest("gpu0", RepairActionType::RebootSystem, Duration::from_secs(1));
        assert_eq!(
            store.has_suggested(RepairActionType::RebootSystem),
            vec!["gpu0"]
        );

        clock.advance(Duration::from_secs(2));
        assert!(store.has_suggested(RepairActionType::RebootSystem).is_empty());
        assert!(!store.has_bucket(RepairActionType::RebootSystem));
        assert!(store.has_suggested(RepairActionType::RebootSystem).is_empty());
    }

    #[test]
    fn test_live_at_expiry_instant() {
        let clock = MockClock::new();
        let store = clock.store();

        store.suggest("gpu0", RepairActionType::RebootSystem, HOUR);
        clock.advance(HOUR);
        assert_eq!(
            store.has_suggested(RepairActionType::RebootSystem),
            vec!["gpu0"]
        );

        clock.advance(Duration::from_secs(1));
        assert!(store.has_suggested(RepairActionType::RebootSystem).is_empty());
    }

    #[test]
    fn test_gauge_tracks_live_suggestions() {
        let clock = MockClock::new();
        let store = clock.store();
        let gauge = || {
            prometheus::gather()
                .into_iter()
                .find(|family| family.get_name() == "gpud_suggested_actions")
                .and_then(|family| {
                    family
                        .get_metric()
                        .iter()
                        .find(|m| {
                            m.get_label()
                                .iter()
                                .any(|l| l.get_value() == "CHECK_USER_APP_AND_GPU")
                        })
                        .map(|m| m.get_gauge().get_value())
                })
        };

        store.suggest("a", RepairActionType::CheckUserAppAndGpu, MINUTE);
        store.suggest("b", RepairActionType::CheckUserAppAndGpu, HOUR);
        assert_eq!(gauge(), Some(2.0));

        clock.advance(2 * MINUTE);
        assert_eq!(
            store.has_suggested(RepairActionType::CheckUserAppAndGpu),
            vec!["b"]
        );
        assert_eq!(gauge(), Some(1.0));
    }

    #[test]
    fn test_never_suggested() {
        let store = SuggestedActionsStore::new();
        assert!(store
            .has_suggested(RepairActionType::IgnoreNoActionRequired)
            .is_empty());
    }

    #[test]
    fn test_actions_are_independent() {
        let store = SuggestedActionsStore::new();
        store.suggest("component1", RepairActionType::RebootSystem, HOUR);
        store.suggest("component2", RepairActionType::RebootSystem, HOUR);
        store.suggest("component3", RepairActionType::HardwareInspection, HOUR);

        assert_eq!(
            store.has_suggested(RepairActionType::RebootSystem),
            vec!["component1", "component2"]
        );
        assert_eq!(
            store.has_suggested(RepairActionType::HardwareInspection),
            vec!["component3"]
        );
    }

    #[test]
    fn test_overwrite_extends_expiry() {
        let clock = MockClock::new();
        let store = clock.store();

        store.suggest("component1", RepairActionType::RebootSystem, HOUR);
        clock.advance(30 * MINUTE);
        store.suggest("component1", RepairActionType::RebootSystem, 2 * HOUR);

        // 90 minutes after the first suggestion, the first TTL has passed
        clock.advance(60 * MINUTE);
        assert_eq!(
            store.has_suggested(RepairActionType::RebootSystem),
            vec!["component1"]
        );

        clock.advance(90 * MINUTE);
        assert!(store.has_suggested(RepairActionType::RebootSystem).is_empty());
    }

    #[test]
    fn test_partial_expiration() {
        let clock = MockClock::new();
        let store = clock.store();

        store.suggest("shortLived", RepairActionType::RebootSystem, 30 * MINUTE);
        store.suggest("longLived1", RepairActionType::RebootSystem, 2 * HOUR);
        store.suggest("longLived2", RepairActionType::RebootSystem, 3 * HOUR);

        clock.advance(45 * MINUTE);
        assert_eq!(
            store.has_suggested(RepairActionType::RebootSystem),
            vec!["longLived1", "longLived2"]
        );
        assert!(store.has_bucket(RepairActionType::RebootSystem));
        assert_eq!(
            store.actions.read()[&RepairActionType::RebootSystem].len(),
            2
        );
    }

    #[test]
    fn test_results_sorted_with_expiration() {
        let clock = MockClock::new();
        let store = clock.store();

        store.suggest("zebra", RepairActionType::RebootSystem, HOUR);
        store.suggest("alpha", RepairActionType::RebootSystem, 30 * MINUTE);
        store.suggest("beta", RepairActionType::RebootSystem, HOUR);
        store.suggest("gamma", RepairActionType::RebootSystem, 45 * MINUTE);
        store.suggest("delta", RepairActionType::RebootSystem, 2 * HOUR);

        assert_eq!(
            store.has_suggested(RepairActionType::RebootSystem),
            vec!["alpha", "beta", "delta", "gamma", "zebra"]
        );

        clock.advance(50 * MINUTE);
        assert_eq!(
            store.has_suggested(RepairActionType::RebootSystem),
            vec!["beta", "delta", "zebra"]
        );
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let store = SuggestedActionsStore::new();
        store.suggest("gpu0", RepairActionType::HardwareInspection, Duration::MAX);
        assert_eq!(
            store.has_suggested(RepairActionType::HardwareInspection),
            vec!["gpu0"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let store = Arc::new(SuggestedActionsStore::new());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        store.suggest(
                            &format!("component{}", i),
                            RepairActionType::RebootSystem,
                            HOUR,
                        );
                        store.has_suggested(RepairActionType::RebootSystem);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.has_suggested(RepairActionType::RebootSystem).len(), 10);
    }
}
