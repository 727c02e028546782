use async_trait::async_trait;

/// A resource whose start and stop are driven by the
/// [`LifecycleRegistry`](super::LifecycleRegistry).
///
/// Both operations should be idempotent: the registry only calls `start` on
/// resources that are not running, but `stop` is attempted on anything that
/// might hold resources, including a resource whose `start` failed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Managed: Send + Sync {
    /// Name shown in logs and lifecycle events.
    fn name(&self) -> String;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}
