//! [`LifecycleRegistry`]: ordered start and reverse-ordered stop of every
//! managed resource in the process.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::executor::ExecutorBuilder;
use super::managed::Managed;
use super::state::LifecycleState;

/// Errors produced by the registry.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The same resource instance was registered twice.
    #[error("{name} is already registered")]
    Duplicate { name: String },

    /// Resources cannot be added while the registry is running.
    #[error("cannot register {name} while the lifecycle is {state}")]
    RegistrationClosed { name: String, state: LifecycleState },

    /// A previous `start` failed and the registry has not been stopped since.
    #[error("lifecycle previously failed to start; stop it before starting again")]
    PreviouslyFailed,

    #[error("failed to start {name}")]
    Start {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to stop {name}")]
    Stop {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A state change reported to lifecycle listeners.
#[derive(Debug, Clone, Copy)]
pub enum LifecycleEvent<'a> {
    /// One resource changed state.
    Resource {
        name: &'a str,
        state: LifecycleState,
    },
    /// The registry as a whole changed state. `managed` lists every
    /// registered resource in registration order.
    Registry {
        state: LifecycleState,
        managed: &'a [String],
    },
}

type Listener = Box<dyn Fn(&LifecycleEvent<'_>) + Send + Sync>;

struct Entry {
    name: String,
    resource: Arc<dyn Managed>,
    state: LifecycleState,
}

/// Starts resources in registration order and stops them in reverse.
///
/// Listeners are invoked synchronously, in the order they were added, on
/// every resource transition and every aggregate transition.
pub struct LifecycleRegistry {
    entries: Vec<Entry>,
    names: Vec<String>,
    listeners: Vec<Listener>,
    state: LifecycleState,
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleRegistry")
            .field("state", &self.state)
            .field("managed", &self.names)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl LifecycleRegistry {
    /// An empty registry that logs a summary of its resources when starting.
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
            names: Vec::new(),
            listeners: Vec::new(),
            state: LifecycleState::New,
        };
        registry.add_listener(log_summary);
        registry
    }

    /// Append `resource` to the start order.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Duplicate`] if this exact instance is already
    /// registered, [`LifecycleError::RegistrationClosed`] while the registry
    /// is starting, started or stopping.
    pub fn register(&mut self, resource: Arc<dyn Managed>) -> Result<(), LifecycleError> {
        let name = resource.name();
        if matches!(
            self.state,
            LifecycleState::Starting | LifecycleState::Started | LifecycleState::Stopping
        ) {
            return Err(LifecycleError::RegistrationClosed {
                name,
                state: self.state,
            });
        }
        let candidate = Arc::as_ptr(&resource);
        if self
            .entries
            .iter()
            .any(|e| std::ptr::addr_eq(Arc::as_ptr(&e.resource), candidate))
        {
            return Err(LifecycleError::Duplicate { name });
        }
        debug!(resource = %name, position = self.entries.len(), "registered managed resource");
        self.names.push(name.clone());
        self.entries.push(Entry {
            name,
            resource,
            state: LifecycleState::New,
        });
        Ok(())
    }

    /// Add a synchronous listener for lifecycle events.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: Fn(&LifecycleEvent<'_>) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Builder for a worker pool that is registered here on `build`.
    pub fn executor_service(&mut self, name_format: impl Into<String>) -> ExecutorBuilder<'_> {
        ExecutorBuilder::new(self, name_format.into())
    }

    /// Builder for a pool meant for delayed and periodic work.
    pub fn scheduled_executor_service(
        &mut self,
        name_format: impl Into<String>,
    ) -> ExecutorBuilder<'_> {
        ExecutorBuilder::new(self, name_format.into()).scheduled()
    }

    /// Aggregate state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Names of every resource, in registration order.
    pub fn managed_names(&self) -> &[String] {
        &self.names
    }

    /// Per-resource state, in registration order.
    pub fn resource_states(&self) -> Vec<(String, LifecycleState)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.state))
            .collect()
    }

    /// Start every resource in registration order.
    ///
    /// If a resource fails, the resources started before it are stopped in
    /// reverse order, later resources are never started, and the registry
    /// ends `FAILED`. Calling `start` on a started registry does nothing.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Start`] with the original failure, or
    /// [`LifecycleError::PreviouslyFailed`].
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::Starting | LifecycleState::Started => return Ok(()),
            LifecycleState::Failed => return Err(LifecycleError::PreviouslyFailed),
            _ => {}
        }
        self.set_state(LifecycleState::Starting);

        for index in 0..self.entries.len() {
            let resource = Arc::clone(&self.entries[index].resource);
            self.transition(index, LifecycleState::Starting);
            if let Err(source) = resource.start().await {
                let name = self.entries[index].name.clone();
                error!(resource = %name, error = %format!("{source:#}"), "failed to start managed resource");
                self.transition(index, LifecycleState::Failed);
                self.roll_back(index).await;
                self.set_state(LifecycleState::Failed);
                return Err(LifecycleError::Start { name, source });
            }
            self.transition(index, LifecycleState::Started);
        }

        self.set_state(LifecycleState::Started);
        Ok(())
    }

    /// Stop every resource that may be holding resources, in reverse
    /// registration order. A failing stop is logged and does not prevent the
    /// remaining stops. Calling `stop` on a registry that never started, or
    /// already stopped, does nothing.
    ///
    /// # Errors
    ///
    /// The first [`LifecycleError::Stop`] encountered.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        if matches!(
            self.state,
            LifecycleState::New | LifecycleState::Stopping | LifecycleState::Stopped
        ) {
            return Ok(());
        }
        self.set_state(LifecycleState::Stopping);

        let mut first_error = None;
        for index in (0..self.entries.len()).rev() {
            if !self.entries[index].state.needs_stop() {
                continue;
            }
            if let Err(err) = self.stop_entry(index).await {
                first_error.get_or_insert(err);
            }
        }

        self.set_state(LifecycleState::Stopped);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop the resources before `failed` that reached `STARTED`.
    async fn roll_back(&mut self, failed: usize) {
        for index in (0..failed).rev() {
            if self.entries[index].state != LifecycleState::Started {
                continue;
            }
            // Already logged by stop_entry; the start failure is what the
            // caller sees.
            let _ = self.stop_entry(index).await;
        }
    }

    async fn stop_entry(&mut self, index: usize) -> Result<(), LifecycleError> {
        let resource = Arc::clone(&self.entries[index].resource);
        self.transition(index, LifecycleState::Stopping);
        let result = resource.stop().await;
        self.transition(index, LifecycleState::Stopped);
        result.map_err(|source| {
            let name = self.entries[index].name.clone();
            warn!(resource = %name, error = %format!("{source:#}"), "failed to stop managed resource");
            LifecycleError::Stop { name, source }
        })
    }

    fn transition(&mut self, index: usize, state: LifecycleState) {
        let entry = &mut self.entries[index];
        entry.state = state;
        debug!(resource = %entry.name, %state, "managed resource transition");
        let event = LifecycleEvent::Resource {
            name: &entry.name,
            state,
        };
        for listener in &self.listeners {
            listener(&event);
        }
    }

    fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
        let event = LifecycleEvent::Registry {
            state,
            managed: &self.names,
        };
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

fn log_summary(event: &LifecycleEvent<'_>) {
    match event {
        LifecycleEvent::Registry {
            state: LifecycleState::Starting,
            managed,
        } => {
            info!(count = managed.len(), managed = ?managed, "starting managed resources");
        }
        LifecycleEvent::Registry { state, .. } => {
            info!(%state, "lifecycle transition");
        }
        LifecycleEvent::Resource { .. } => {}
    }
}
