//! GPUd Core Library
//!
//! Diagnostic component runtime and remediation escalation for GPUd.
//! This crate provides the component registry, the periodic check runtime,
//! the suggested actions store and the escalation engine.

pub mod api;
pub mod component;
pub mod error;
pub mod escalation;
pub mod eventstore;
pub mod metrics;
pub mod suggested_actions;

// Re-export common types
pub use api::{
    Event, EventType, HealthState, HealthStateType, RepairActionType, SuggestedActions,
};
pub use component::{CheckResult, Component, GpudInstance, Registry};
pub use error::{Error, Result};
pub use escalation::{aggregate_suggested_actions, evaluate_suggested_actions};
pub use eventstore::{EventBucket, EventStore};
pub use suggested_actions::SuggestedActionsStore;
