//! Operator tasks invoked with `POST /tasks/{name}`.

use std::collections::BTreeMap;

use anyhow::Context as _;
use async_trait::async_trait;
use common::ServiceError;
use parking_lot::Mutex;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::LoggingConfig;

/// A named administrative action. Query parameters of the request are
/// passed as `params`; the returned text becomes the response output.
///
/// Returning a [`ServiceError`] picks the response status; any other error
/// is a `500`.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, params: &BTreeMap<String, String>) -> anyhow::Result<String>;
}

/// Handle to the active log filter, produced by telemetry initialisation.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// `log-level`: change log levels at runtime.
///
/// - `level=debug` sets the default level.
/// - `level=trace&target=hyper` sets the level for one target.
/// - `target=hyper` alone removes that target's override.
pub struct LogLevelTask {
    handle: FilterHandle,
    state: Mutex<FilterState>,
}

struct FilterState {
    level: String,
    targets: BTreeMap<String, String>,
}

impl FilterState {
    fn directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(self.targets.iter().map(|(t, l)| format!("{t}={l}")))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl LogLevelTask {
    pub fn new(handle: FilterHandle, logging: &LoggingConfig) -> Self {
        Self {
            handle,
            state: Mutex::new(FilterState {
                level: logging.level.clone(),
                targets: logging.loggers.clone(),
            }),
        }
    }
}

#[async_trait]
impl Task for LogLevelTask {
    fn name(&self) -> &str {
        "log-level"
    }

    async fn execute(&self, params: &BTreeMap<String, String>) -> anyhow::Result<String> {
        let level = params.get("level").map(|l| l.trim().to_ascii_lowercase());
        if let Some(level) = &level {
            level
                .parse::<LevelFilter>()
                .map_err(|_| ServiceError::BadRequest(format!("unknown level {level:?}")))?;
        }

        let directives = {
            let mut state = self.state.lock();
            match (params.get("target"), level) {
                (Some(target), Some(level)) => {
                    state.targets.insert(target.clone(), level);
                }
                (Some(target), None) => {
                    state.targets.remove(target);
                }
                (None, Some(level)) => state.level = level,
                (None, None) => {
                    return Err(ServiceError::BadRequest(
                        "expected a `level` and/or `target` parameter".into(),
                    )
                    .into())
                }
            }
            state.directives()
        };

        let filter = EnvFilter::try_new(&directives)
            .with_context(|| format!("invalid filter {directives:?}"))?;
        self.handle
            .reload(filter)
            .context("log filter is no longer installed")?;
        info!(filter = %directives, "log filter changed");
        Ok(format!("log filter set to {directives}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn task() -> (reload::Layer<EnvFilter, Registry>, LogLevelTask) {
        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        (layer, LogLevelTask::new(handle, &LoggingConfig::default()))
    }

    #[tokio::test]
    async fn sets_default_and_target_levels() {
        let (_layer, task) = task();
        task.execute(&params(&[("level", "DEBUG")])).await.unwrap();
        let output = task
            .execute(&params(&[("level", "trace"), ("target", "hyper")]))
            .await
            .unwrap();
        assert_eq!(output, "log filter set to debug,hyper=trace\n");

        let output = task.execute(&params(&[("target", "hyper")])).await.unwrap();
        assert_eq!(output, "log filter set to debug\n");
    }

    #[tokio::test]
    async fn rejects_unknown_levels_and_empty_requests() {
        let (_layer, task) = task();
        for bad in [params(&[("level", "loud")]), params(&[])] {
            let err = task.execute(&bad).await.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ServiceError>(),
                Some(ServiceError::BadRequest(_))
            ));
        }
    }

    #[tokio::test]
    async fn fails_once_the_subscriber_is_gone() {
        let (layer, task) = task();
        drop(layer);
        let err = task.execute(&params(&[("level", "warn")])).await.unwrap_err();
        assert!(err.to_string().contains("no longer installed"));
    }
}
