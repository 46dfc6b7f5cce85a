//! Command check component
//!
//! Runs a health-check program under a timeout; a zero exit status is healthy.
//! After `failure_threshold` consecutive failures the component turns
//! unhealthy, records a failure event and asks the escalation engine which
//! repair action to suggest, given the reboots seen in the lookback window.

use std::fmt;
use std::process::Output;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gpud_core::component::{
    with_timeout, CheckResult, Checker, Debuggable, Deregisterable, FailureCounter, HealthSettable,
};
use gpud_core::escalation::evaluate_suggested_actions;
use gpud_core::eventstore::EventStore;
use gpud_core::{
    Error, Event, EventType, HealthState, HealthStateType, SuggestedActions,
    SuggestedActionsStore,
};

use super::CheckerError;

/// Event name recorded when the check turns unhealthy
pub const CHECK_FAILED_EVENT: &str = "check_failed";

const STDERR_LIMIT: usize = 512;

/// How recurring failures are escalated
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    pub lookback: Duration,
    pub sequence_threshold: i32,
    pub suggestion_ttl: Duration,
}

/// Outcome of running the program once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Passed,
    Failed {
        code: Option<i32>,
        stderr: String,
    },
    /// Program is not installed
    NotFound,
    /// Component lifecycle ended before the program finished
    Cancelled,
    Error(String),
}

/// Result of one command check
#[derive(Debug, Clone)]
pub struct CommandCheckResult {
    component: String,
    time: DateTime<Utc>,
    duration: Duration,
    outcome: CommandOutcome,
    consecutive_failures: u32,
    failure_threshold: u32,
    suggested_actions: Option<SuggestedActions>,
}

impl CommandCheckResult {
    pub fn outcome(&self) -> &CommandOutcome {
        &self.outcome
    }

    pub fn suggested_actions(&self) -> Option<&SuggestedActions> {
        self.suggested_actions.as_ref()
    }

    fn tripped(&self) -> bool {
        self.consecutive_failures >= self.failure_threshold
    }

    fn error_text(&self) -> String {
        match &self.outcome {
            CommandOutcome::Failed { stderr, .. } => stderr.clone(),
            CommandOutcome::Error(e) => e.clone(),
            CommandOutcome::Passed | CommandOutcome::NotFound | CommandOutcome::Cancelled => {
                String::new()
            }
        }
    }
}

impl fmt::Display for CommandCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            CommandOutcome::Passed => write!(f, "check passed in {:?}", self.duration),
            CommandOutcome::Failed { code: Some(code), .. } => {
                write!(f, "check exited with status {}", code)
            }
            CommandOutcome::Failed { code: None, .. } => write!(f, "check killed by signal"),
            CommandOutcome::NotFound => write!(f, "check program not found, skipped"),
            CommandOutcome::Cancelled => write!(f, "check cancelled"),
            CommandOutcome::Error(e) => write!(f, "check could not run: {}", e),
        }
    }
}

impl CheckResult for CommandCheckResult {
    fn component_name(&self) -> &str {
        &self.component
    }

    fn summary(&self) -> String {
        match &self.outcome {
            CommandOutcome::Passed | CommandOutcome::NotFound | CommandOutcome::Cancelled => {
                self.to_string()
            }
            _ => format!(
                "{} ({}/{} consecutive failures)",
                self, self.consecutive_failures, self.failure_threshold
            ),
        }
    }

    fn health_state_type(&self) -> HealthStateType {
        match &self.outcome {
            CommandOutcome::Passed | CommandOutcome::NotFound | CommandOutcome::Cancelled => {
                HealthStateType::Healthy
            }
            _ if self.tripped() => HealthStateType::Unhealthy,
            _ => HealthStateType::Healthy,
        }
    }

    fn health_states(&self) -> Vec<HealthState> {
        let mut state = HealthState {
            time: self.time,
            component: self.component.clone(),
            name: self.component.clone(),
            health: self.health_state_type(),
            reason: self.summary(),
            error: self.error_text(),
            suggested_actions: self.suggested_actions.clone(),
            ..Default::default()
        };
        state.extra_info.insert(
            "consecutive_failures".to_string(),
            self.consecutive_failures.to_string(),
        );
        state
            .extra_info
            .insert("duration".to_string(), format!("{:?}", self.duration));
        vec![state]
    }
}

/// Checker running an external health-check program
pub struct CommandChecker {
    name: String,
    command: String,
    args: Vec<String>,
    timeout: Duration,
    failures: FailureCounter,
    escalation: EscalationPolicy,
    event_store: Option<Arc<EventStore>>,
    suggested_actions: Option<Arc<SuggestedActionsStore>>,
}

impl CommandChecker {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        failure_threshold: u32,
        escalation: EscalationPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            timeout,
            failures: FailureCounter::new(failure_threshold),
            escalation,
            event_store: None,
            suggested_actions: None,
        }
    }

    pub fn with_event_store(mut self, store: Option<Arc<EventStore>>) -> Self {
        self.event_store = store;
        self
    }

    pub fn with_suggested_actions(mut self, store: Option<Arc<SuggestedActionsStore>>) -> Self {
        self.suggested_actions = store;
        self
    }

    async fn run_command(&self, token: &CancellationToken) -> CommandOutcome {
        let output = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        match with_timeout(token, self.timeout, output).await {
            Ok(Ok(output)) => outcome_of(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(component = %self.name, command = %self.command, "Check program not found, skipping");
                CommandOutcome::NotFound
            }
            Ok(Err(source)) => CommandOutcome::Error(
                CheckerError::Spawn {
                    command: self.command.clone(),
                    source,
                }
                .to_string(),
            ),
            Err(e @ Error::Timeout(_)) => {
                warn!(component = %self.name, timeout = ?self.timeout, "Check program timed out");
                CommandOutcome::Error(e.to_string())
            }
            Err(Error::Unavailable(_)) => {
                debug!(component = %self.name, "Check cancelled");
                CommandOutcome::Cancelled
            }
            Err(e) => CommandOutcome::Error(e.to_string()),
        }
    }

    /// Record the failure and evaluate it against the reboot history
    fn escalate(&self, now: DateTime<Utc>, outcome: &CommandOutcome) -> Option<SuggestedActions> {
        let store = self.event_store.as_ref()?;

        let message = match outcome {
            CommandOutcome::Failed { stderr, .. } if !stderr.is_empty() => stderr.clone(),
            CommandOutcome::Error(e) => e.clone(),
            _ => format!("{} failed", self.command),
        };
        let bucket = store.bucket(&self.name);
        bucket.insert(Event::new(
            &self.name,
            now,
            CHECK_FAILED_EVENT,
            EventType::Critical,
            message,
        ));

        let since = chrono::Duration::from_std(self.escalation.lookback)
            .ok()
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reboots = store.reboot_events(since);
        let failures: Vec<Event> = bucket
            .get(since)
            .into_iter()
            .filter(|e| e.event_type.is_failure())
            .collect();

        let actions = match evaluate_suggested_actions(
            &reboots,
            &failures,
            self.escalation.sequence_threshold,
        ) {
            Ok(actions) => actions?,
            Err(e) => {
                warn!(component = %self.name, error = %e, "Failed to evaluate suggested actions");
                return None;
            }
        };

        if let Some(suggested) = &self.suggested_actions {
            for action in &actions.repair_actions {
                suggested.suggest(&self.name, *action, self.escalation.suggestion_ttl);
            }
        }
        info!(
            component = %self.name,
            actions = ?actions.repair_actions,
            reboots = reboots.len(),
            failures = failures.len(),
            "Suggested repair actions"
        );
        Some(actions)
    }
}

fn outcome_of(output: Output) -> CommandOutcome {
    if output.status.success() {
        return CommandOutcome::Passed;
    }
    let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.len() > STDERR_LIMIT {
        let mut cut = STDERR_LIMIT;
        while !stderr.is_char_boundary(cut) {
            cut -= 1;
        }
        stderr.truncate(cut);
    }
    CommandOutcome::Failed {
        code: output.status.code(),
        stderr,
    }
}

#[async_trait]
impl Checker for CommandChecker {
    type Output = CommandCheckResult;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> Vec<String> {
        vec![self.name.clone(), "command".to_string()]
    }

    async fn check(&self, token: &CancellationToken) -> CommandCheckResult {
        let time = Utc::now();
        let start = Instant::now();
        let outcome = self.run_command(token).await;
        let duration = start.elapsed();

        let (consecutive_failures, tripped) = match &outcome {
            CommandOutcome::Passed | CommandOutcome::NotFound => {
                self.failures.reset();
                (0, false)
            }
            // Shutdown says nothing about the hardware, keep the streak as is
            CommandOutcome::Cancelled => (self.failures.count(), false),
            _ => {
                let tripped = self.failures.record_failure();
                (self.failures.count(), tripped)
            }
        };

        let suggested_actions = if tripped {
            self.escalate(time, &outcome)
        } else {
            None
        };

        CommandCheckResult {
            component: self.name.clone(),
            time,
            duration,
            outcome,
            consecutive_failures,
            failure_threshold: self.failures.threshold(),
            suggested_actions,
        }
    }

    async fn events(&self, since: DateTime<Utc>) -> gpud_core::Result<Vec<Event>> {
        Ok(self
            .event_store
            .as_ref()
            .map(|store| store.bucket(&self.name).get(since))
            .unwrap_or_default())
    }

    fn as_health_settable(&self) -> Option<&dyn HealthSettable> {
        Some(self)
    }

    fn as_deregisterable(&self) -> Option<&dyn Deregisterable> {
        Some(self)
    }

    fn as_debuggable(&self) -> Option<&dyn Debuggable> {
        Some(self)
    }
}

impl HealthSettable for CommandChecker {
    /// Forget the failure streak and recorded failure events
    fn set_healthy(&self) -> gpud_core::Result<()> {
        self.failures.reset();
        if let Some(store) = &self.event_store {
            let purged = store.bucket(&self.name).purge(DateTime::<Utc>::MAX_UTC);
            info!(component = %self.name, purged, "Health reset by operator");
        }
        Ok(())
    }
}

impl Deregisterable for CommandChecker {
    fn can_deregister(&self) -> bool {
        true
    }
}

impl Debuggable for CommandChecker {
    fn debug(&self) -> serde_json::Value {
        serde_json::json!({
            "command": self.command,
            "args": self.args,
            "timeout": humantime::format_duration(self.timeout).to_string(),
            "consecutive_failures": self.failures.count(),
            "failure_threshold": self.failures.threshold(),
        })
    }
}
