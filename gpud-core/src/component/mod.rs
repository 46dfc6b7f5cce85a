//! Component contract
//!
//! Every diagnostic checker is a [`Component`]: it has a unique name, runs a
//! periodic [`Component::check`] in the background once started, caches the
//! latest verdict and exposes it through [`Component::last_health_states`].
//!
//! Optional capabilities ([`HealthSettable`], [`Deregisterable`],
//! [`Debuggable`]) are separate traits reached through the `as_*` methods.

mod registry;
mod runtime;

pub use registry::Registry;
pub use runtime::{
    with_timeout, CheckPolicy, Checker, FailureCounter, LastCheckResult, PeriodicComponent,
    DEFAULT_CHECK_INTERVAL,
};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::api::{Event, HealthState, HealthStateType};
use crate::error::Result;
use crate::eventstore::EventStore;
use crate::suggested_actions::SuggestedActionsStore;

/// Shared handle passed to every component constructor
#[derive(Clone)]
pub struct GpudInstance {
    /// Root lifecycle; components derive child tokens from it
    pub root_token: CancellationToken,
    /// Identifier of the machine this daemon runs on
    pub machine_id: String,
    /// Event history, if the daemon keeps one
    pub event_store: Option<Arc<EventStore>>,
    /// Where components publish suggested repair actions
    pub suggested_actions: Option<Arc<SuggestedActionsStore>>,
}

impl GpudInstance {
    /// Create an instance with only the required collaborators
    pub fn new(root_token: CancellationToken, machine_id: impl Into<String>) -> Self {
        Self {
            root_token,
            machine_id: machine_id.into(),
            event_store: None,
            suggested_actions: None,
        }
    }

    pub fn with_event_store(mut self, store: Arc<EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn with_suggested_actions(mut self, store: Arc<SuggestedActionsStore>) -> Self {
        self.suggested_actions = Some(store);
        self
    }
}

/// Snapshot produced by a single check
///
/// The `Display` implementation renders the human-readable description.
pub trait CheckResult: fmt::Display + Send + Sync {
    /// Name of the component that produced the result
    fn component_name(&self) -> &str;

    /// One-line summary of the outcome
    fn summary(&self) -> String;

    /// Overall health level of the result
    fn health_state_type(&self) -> HealthStateType;

    /// Detailed health states
    fn health_states(&self) -> Vec<HealthState>;
}

/// A diagnostic component
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique name of the component
    fn name(&self) -> &str;

    /// Tags used to group components
    fn tags(&self) -> Vec<String>;

    /// Whether the component can run on this machine
    fn is_supported(&self) -> bool;

    /// Spawn the background check loop
    fn start(&self) -> Result<()>;

    /// Run a check now, cache and return its result
    async fn check(&self) -> Arc<dyn CheckResult>;

    /// Health states of the latest cached result
    fn last_health_states(&self) -> Vec<HealthState>;

    /// Events recorded by the component since the given time
    async fn events(&self, since: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Cancel the component lifecycle without waiting for the worker
    fn close(&self) -> Result<()>;

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

/// Component whose health can be reset by an operator
pub trait HealthSettable: Send + Sync {
    /// Clear the failure history and report healthy again
    fn set_healthy(&self) -> Result<()>;
}

/// Component that may be removed from the registry at runtime
pub trait Deregisterable: Send + Sync {
    fn can_deregister(&self) -> bool;
}

/// Component exposing internal state for troubleshooting
pub trait Debuggable: Send + Sync {
    fn debug(&self) -> serde_json::Value;
}
