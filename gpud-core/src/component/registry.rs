//! Component registry
//!
//! Directory of live components keyed by their unique name. Owned by the
//! daemon's composition root and shared by reference; one reader/writer lock
//! guards the whole map.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{CheckResult, Component, GpudInstance};
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;

/// Registry of live components
pub struct Registry {
    instance: GpudInstance,
    components: RwLock<HashMap<String, Arc<dyn Component>>>,
    metrics: MetricsRegistry,
}

impl Registry {
    /// Create an empty registry bound to the shared instance handle
    pub fn new(instance: GpudInstance) -> Self {
        Self {
            instance,
            components: RwLock::new(HashMap::new()),
            metrics: MetricsRegistry::new(),
        }
    }

    pub fn instance(&self) -> &GpudInstance {
        &self.instance
    }

    /// Copy of the full name to component mapping
    pub fn all_components(&self) -> HashMap<String, Arc<dyn Component>> {
        self.components.read().clone()
    }

    /// All components sorted by name
    pub fn all(&self) -> Vec<Arc<dyn Component>> {
        let mut components: Vec<_> = self.components.read().values().cloned().collect();
        components.sort_by(|a, b| a.name().cmp(b.name()));
        components
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.components.read().contains_key(name)
    }

    /// Look up a component by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Component>> {
        self.components
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Register a component under its own name
    pub fn register(&self, component: Arc<dyn Component>) -> Result<()> {
        let name = component.name().to_string();
        let mut components = self.components.write();
        if components.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        components.insert(name.clone(), component);
        self.metrics.set_registered_components(components.len());
        drop(components);

        debug!(component = %name, "Registered component");
        Ok(())
    }

    /// Build a component with the shared instance handle and register it
    ///
    /// A component built under an already registered name is closed before
    /// the error is returned.
    pub fn register_with<F>(&self, init: F) -> Result<Arc<dyn Component>>
    where
        F: FnOnce(&GpudInstance) -> Result<Arc<dyn Component>>,
    {
        let component = init(&self.instance)?;
        if let Err(e) = self.register(component.clone()) {
            if let Err(close_err) = component.close() {
                warn!(component = component.name(), error = %close_err, "Failed to close duplicate component");
            }
            return Err(e);
        }
        Ok(component)
    }

    /// Insert or replace a component, closing the one it replaces
    pub fn set(&self, component: Arc<dyn Component>) {
        let name = component.name().to_string();
        let mut components = self.components.write();
        let previous = components.insert(name.clone(), component);
        self.metrics.set_registered_components(components.len());
        drop(components);

        if let Some(previous) = previous {
            info!(component = %name, "Replacing registered component");
            if let Err(e) = previous.close() {
                warn!(component = %name, error = %e, "Failed to close replaced component");
            }
        }
    }

    /// Remove a component without closing it
    pub fn deregister(&self, name: &str) -> Option<Arc<dyn Component>> {
        let mut components = self.components.write();
        let removed = components.remove(name);
        self.metrics.set_registered_components(components.len());
        removed
    }

    /// Remove a component and close it; unknown names are a no-op
    pub fn stop_deregister(&self, name: &str) -> Result<()> {
        let Some(component) = self.deregister(name) else {
            debug!(component = name, "Component not registered, nothing to stop");
            return Ok(());
        };
        component.close()?;
        info!(component = name, "Stopped and deregistered component");
        Ok(())
    }

    /// Close and remove every component
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.components.write().drain().collect();
        self.metrics.set_registered_components(0);

        for (name, component) in drained {
            if let Err(e) = component.close() {
                warn!(component = %name, error = %e, "Failed to close component");
            }
        }
    }

    /// Run every registered check once, concurrently
    pub async fn check_all(&self) -> Vec<Arc<dyn CheckResult>> {
        let components = self.all();
        join_all(components.iter().map(|c| c.check())).await
    }
}
