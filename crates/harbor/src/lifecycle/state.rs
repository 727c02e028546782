use std::fmt;

/// State of a managed resource, or of the registry as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    New,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::New => "NEW",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Started => "STARTED",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Failed => "FAILED",
        }
    }

    /// Whether a resource in this state may hold live resources that
    /// `stop` has to release.
    pub fn needs_stop(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Started | LifecycleState::Failed
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
