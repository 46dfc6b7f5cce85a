//! Periodic component runtime
//!
//! [`PeriodicComponent`] wraps a domain-specific [`Checker`] and provides the
//! rest of the [`Component`] contract: one background worker per instance,
//! a last-result cell guarded by a reader/writer lock, and a cancellable
//! lifecycle derived from the instance root.
//!
//! Concurrent checks on the same component are not serialized. Each one runs
//! to completion and the last to finish wins the cell.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CheckResult, Component, Debuggable, Deregisterable, GpudInstance, HealthSettable,
};
use crate::api::{Event, HealthState, HealthStateType};
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;

/// Default interval between two periodic checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Scheduling policy of the background worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPolicy {
    /// Time between two checks
    pub interval: Duration,
    /// Run the first check right away instead of after the first interval
    pub check_on_start: bool,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
            check_on_start: true,
        }
    }
}

impl CheckPolicy {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }
}

/// Domain-specific part of a periodic component
///
/// `check` must fold every failure into its output; it never returns an error.
/// Sub-operations should be bounded with [`with_timeout`] on the given token.
#[async_trait]
pub trait Checker: Send + Sync + 'static {
    type Output: CheckResult + 'static;

    fn name(&self) -> &str;

    fn tags(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn check(&self, token: &CancellationToken) -> Self::Output;

    async fn events(&self, _since: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    fn as_health_settable(&self) -> Option<&dyn HealthSettable> {
        None
    }

    fn as_deregisterable(&self) -> Option<&dyn Deregisterable> {
        None
    }

    fn as_debuggable(&self) -> Option<&dyn Debuggable> {
        None
    }
}

/// Cell holding the most recent check result
pub struct LastCheckResult<T> {
    cell: RwLock<Option<Arc<T>>>,
}

impl<T> LastCheckResult<T> {
    pub fn new() -> Self {
        Self {
            cell: RwLock::new(None),
        }
    }

    /// Replace the cached result
    pub fn store(&self, result: Arc<T>) {
        *self.cell.write() = Some(result);
    }

    /// Latest cached result, if any check completed
    pub fn load(&self) -> Option<Arc<T>> {
        self.cell.read().clone()
    }
}

impl<T> Default for LastCheckResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consecutive failure counter shared by concurrent checks
#[derive(Debug)]
pub struct FailureCounter {
    count: AtomicU32,
    threshold: u32,
}

impl FailureCounter {
    /// Create a counter that trips after `threshold` consecutive failures
    pub fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Record a failure, returns true once the threshold is reached
    pub fn record_failure(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        count >= self.threshold
    }

    /// Record a success, resetting the streak
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// Run `fut` bounded by `timeout` and by the lifecycle `token`
///
/// Cancellation takes precedence over completion.
pub async fn with_timeout<F, T>(token: &CancellationToken, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Unavailable("component lifecycle cancelled".to_string())),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| Error::Timeout(timeout)),
    }
}

struct Inner<C: Checker> {
    checker: C,
    token: CancellationToken,
    policy: CheckPolicy,
    last: LastCheckResult<C::Output>,
    started: AtomicBool,
    metrics: MetricsRegistry,
}

impl<C: Checker> Inner<C> {
    async fn run_check(&self) -> Arc<C::Output> {
        let name = self.checker.name();
        let start = Instant::now();

        let result = Arc::new(self.checker.check(&self.token).await);
        let elapsed = start.elapsed();
        let health = result.health_state_type();

        self.metrics.observe_check(name, health, elapsed.as_secs_f64());
        match health {
            HealthStateType::Healthy | HealthStateType::Initializing => {
                debug!(component = name, health = %health, duration = ?elapsed, summary = %result.summary(), "Check complete");
            }
            HealthStateType::Unhealthy | HealthStateType::Degraded => {
                warn!(component = name, health = %health, duration = ?elapsed, summary = %result.summary(), "Check reported a problem");
            }
        }

        self.last.store(result.clone());
        result
    }

    async fn run(self: Arc<Self>) {
        let name = self.checker.name();
        info!(component = name, interval = ?self.policy.interval, "Starting check loop");

        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick completes immediately
        ticker.tick().await;

        if self.policy.check_on_start && !self.token.is_cancelled() {
            self.run_check().await;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!(component = name, "Component closed, stopping check loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_check().await;
                }
            }
        }
    }
}

/// Component that runs a [`Checker`] on a periodic schedule
pub struct PeriodicComponent<C: Checker> {
    inner: Arc<Inner<C>>,
}

impl<C: Checker> PeriodicComponent<C> {
    /// Wrap a checker, deriving the component lifecycle from the instance root
    pub fn new(instance: &GpudInstance, checker: C, policy: CheckPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                checker,
                token: instance.root_token.child_token(),
                policy,
                last: LastCheckResult::new(),
                started: AtomicBool::new(false),
                metrics: MetricsRegistry::new(),
            }),
        }
    }

    pub fn checker(&self) -> &C {
        &self.inner.checker
    }

    pub fn policy(&self) -> CheckPolicy {
        self.inner.policy
    }

    /// Latest typed result, if any
    pub fn last_result(&self) -> Option<Arc<C::Output>> {
        self.inner.last.load()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }
}

#[async_trait]
impl<C: Checker> Component for PeriodicComponent<C> {
    fn name(&self) -> &str {
        self.inner.checker.name()
    }

    fn tags(&self) -> Vec<String> {
        self.inner.checker.tags()
    }

    fn is_supported(&self) -> bool {
        self.inner.checker.is_supported()
    }

    fn start(&self) -> Result<()> {
        if self.inner.token.is_cancelled() {
            return Err(Error::Unavailable(format!(
                "component {} is closed",
                self.name()
            )));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!(component = self.name(), "Check loop already running");
            return Ok(());
        }

        tokio::spawn(self.inner.clone().run());
        Ok(())
    }

    async fn check(&self) -> Arc<dyn CheckResult> {
        self.inner.run_check().await
    }

    fn last_health_states(&self) -> Vec<HealthState> {
        match self.inner.last.load() {
            Some(result) => result.health_states(),
            None => vec![HealthState::no_data_yet(self.name())],
        }
    }

    async fn events(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        self.inner.checker.events(since).await
    }

    fn close(&self) -> Result<()> {
        if !self.inner.token.is_cancelled() {
            debug!(component = self.name(), "Closing component");
            self.inner.token.cancel();
        }
        Ok(())
    }

    fn as_health_settable(&self) -> Option<&dyn HealthSettable> {
        self.inner.checker.as_health_settable()
    }

    fn as_deregisterable(&self) -> Option<&dyn Deregisterable> {
        self.inner.checker.as_deregisterable()
    }

    fn as_debuggable(&self) -> Option<&dyn Debuggable> {
        self.inner.checker.as_debuggable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    struct TestResult {
        id: u32,
        health: HealthStateType,
    }

    impl fmt::Display for TestResult {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "result #{}", self.id)
        }
    }

    impl CheckResult for TestResult {
        fn component_name(&self) -> &str {
            "counting"
        }

        fn summary(&self) -> String {
            format!("check {}", self.id)
        }

        fn health_state_type(&self) -> HealthStateType {
            self.health
        }

        fn health_states(&self) -> Vec<HealthState> {
            vec![HealthState {
                component: "counting".to_string(),
                health: self.health,
                reason: format!("check {}", self.id),
                ..Default::default()
            }]
        }
    }

    struct CountingChecker {
        calls: AtomicU32,
        failures: FailureCounter,
        fail: AtomicBool,
    }

    impl CountingChecker {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: FailureCounter::new(3),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Checker for CountingChecker {
        type Output = TestResult;

        fn name(&self) -> &str {
            "counting"
        }

        async fn check(&self, _token: &CancellationToken) -> TestResult {
            let id = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            // Stagger completion so concurrent checks interleave
            tokio::time::sleep(Duration::from_millis(u64::from(id % 5))).await;

            let health = if self.fail.load(Ordering::SeqCst) {
                if self.failures.record_failure() {
                    HealthStateType::Unhealthy
                } else {
                    HealthStateType::Healthy
                }
            } else {
                self.failures.reset();
                HealthStateType::Healthy
            };
            TestResult { id, health }
        }
    }

    fn instance() -> GpudInstance {
        GpudInstance::new(CancellationToken::new(), "test-machine")
    }

    #[tokio::test]
    async fn test_last_health_states_before_first_check() {
        let component =
            PeriodicComponent::new(&instance(), CountingChecker::new(), CheckPolicy::default());

        let states = component.last_health_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].health, HealthStateType::Healthy);
        assert_eq!(states[0].reason, "no data yet");
    }

    #[tokio::test]
    async fn test_check_caches_result() {
        let component =
            PeriodicComponent::new(&instance(), CountingChecker::new(), CheckPolicy::default());

        let result = component.check().await;
        assert_eq!(result.summary(), "check 1");
        assert_eq!(component.last_health_states()[0].reason, "check 1");
        assert_eq!(component.last_result().unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checks_run_on_interval() {
        let component = PeriodicComponent::new(
            &instance(),
            CountingChecker::new(),
            CheckPolicy::with_interval(Duration::from_secs(60)),
        );
        assert_ok!(component.start());
        // Second start does not spawn another worker
        assert_ok!(component.start());

        tokio::time::sleep(Duration::from_secs(150)).await;
        // t=0, t=60, t=120
        assert_eq!(component.checker().calls.load(Ordering::SeqCst), 3);

        component.close().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_after_first_tick_policy() {
        let policy = CheckPolicy {
            interval: Duration::from_secs(60),
            check_on_start: false,
        };
        let component = PeriodicComponent::new(&instance(), CountingChecker::new(), policy);
        component.start().unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(component.checker().calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(component.checker().calls.load(Ordering::SeqCst), 1);

        component.close().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_checks_after_close() {
        let component = PeriodicComponent::new(
            &instance(),
            CountingChecker::new(),
            CheckPolicy::with_interval(Duration::from_secs(60)),
        );
        component.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = component.checker().calls.load(Ordering::SeqCst);
        assert_eq!(before, 1);

        component.close().unwrap();
        // Idempotent
        component.close().unwrap();
        assert!(component.is_closed());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(component.checker().calls.load(Ordering::SeqCst), before);

        // A closed component cannot be restarted
        assert_err!(component.start());
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_cancellation_stops_component() {
        let root = CancellationToken::new();
        let instance = GpudInstance::new(root.clone(), "test-machine");
        let component = PeriodicComponent::new(
            &instance,
            CountingChecker::new(),
            CheckPolicy::with_interval(Duration::from_secs(10)),
        );
        component.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        root.cancel();
        assert!(component.is_closed());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(component.checker().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_last_write_wins() {
        let component = Arc::new(PeriodicComponent::new(
            &instance(),
            CountingChecker::new(),
            CheckPolicy::default(),
        ));

        let results = join_all((0..16).map(|_| {
            let component = component.clone();
            async move { component.check().await.summary() }
        }))
        .await;

        let cached = component.last_health_states();
        assert_eq!(cached.len(), 1);
        assert!(results.contains(&cached[0].reason));
    }

    #[tokio::test]
    async fn test_failure_threshold_before_unhealthy() {
        let component =
            PeriodicComponent::new(&instance(), CountingChecker::new(), CheckPolicy::default());
        component.checker().fail.store(true, Ordering::SeqCst);

        for _ in 0..2 {
            let result = component.check().await;
            assert_eq!(result.health_state_type(), HealthStateType::Healthy);
        }
        let result = component.check().await;
        assert_eq!(result.health_state_type(), HealthStateType::Unhealthy);

        // A success resets the streak
        component.checker().fail.store(false, Ordering::SeqCst);
        component.check().await;
        assert_eq!(component.checker().failures.count(), 0);
    }

    #[test]
    fn test_failure_counter_zero_threshold() {
        let counter = FailureCounter::new(0);
        assert_eq!(counter.threshold(), 1);
        assert!(counter.record_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let token = CancellationToken::new();

        let ok = with_timeout(&token, Duration::from_secs(5), async { 42 }).await;
        assert_eq!(ok.unwrap(), 42);

        let slow = with_timeout(
            &token,
            Duration::from_secs(5),
            tokio::time::sleep(Duration::from_secs(30)),
        )
        .await;
        assert!(matches!(slow, Err(Error::Timeout(d)) if d == Duration::from_secs(5)));

        token.cancel();
        let cancelled = with_timeout(&token, Duration::from_secs(5), async { 1 }).await;
        assert!(matches!(cancelled, Err(Error::Unavailable(_))));
    }
}
