//! The admin surface: operator tasks and health checks, served only on the
//! admin listeners.
//!
//! # Routes
//! - `POST /tasks/{name}`: run a registered [`Task`].
//! - `GET /healthcheck`: run every [`HealthCheck`].
//! - `GET /ping`: liveness.

pub mod handlers;
pub mod health;
pub mod task;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::lifecycle::{LifecycleEvent, LifecycleState};
use crate::server::Handler;
pub use health::{DeadlockHealthCheck, HealthCheck, DEADLOCKS};
pub use task::{FilterHandle, LogLevelTask, Task};

const NO_HEALTH_CHECKS_BANNER: &str = "
!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!
!    THIS SERVICE REGISTERS NO HEALTH CHECKS OF ITS OWN. /healthcheck CAN ONLY  !
!    REPORT DEADLOCKED THREADS, SO A BROKEN DEPENDENCY WILL NEVER SHOW UP AS   !
!    UNHEALTHY. REGISTER A CHECK FOR EVERYTHING THIS SERVICE DEPENDS ON.       !
!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!";

/// Registered tasks and health checks.
pub struct AdminEnvironment {
    tasks: BTreeMap<String, Arc<dyn Task>>,
    health_checks: BTreeMap<String, Arc<dyn HealthCheck>>,
}

impl Default for AdminEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdminEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminEnvironment")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("health_checks", &self.health_checks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdminEnvironment {
    /// An environment with the `deadlocks` health check registered.
    pub fn new() -> Self {
        let mut admin = Self {
            tasks: BTreeMap::new(),
            health_checks: BTreeMap::new(),
        };
        admin.register_health_check(DEADLOCKS, Arc::new(DeadlockHealthCheck));
        admin
    }

    /// Register `task` under its own name. A task already registered under
    /// that name is replaced.
    pub fn register_task(&mut self, task: Arc<dyn Task>) {
        let name = task.name().to_owned();
        if self.tasks.insert(name.clone(), task).is_some() {
            warn!(task = %name, "replaced previously registered task");
        }
    }

    /// Register `check` under `name`, replacing any check with that name.
    pub fn register_health_check(&mut self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let name = name.into();
        if self.health_checks.insert(name.clone(), check).is_some() {
            warn!(check = %name, "replaced previously registered health check");
        }
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn health_check_names(&self) -> impl Iterator<Item = &str> {
        self.health_checks.keys().map(String::as_str)
    }

    /// The handler bound to every admin listener.
    pub fn handler(&self) -> Handler {
        Handler::new(
            "admin",
            handlers::router(handlers::AdminState {
                tasks: Arc::new(self.tasks.clone()),
                health_checks: Arc::new(self.health_checks.clone()),
            }),
        )
    }

    /// Lifecycle listener logging the task table and health checks when the
    /// server starts, with a warning when only built-in checks exist.
    pub fn diagnostics(&self) -> impl Fn(&LifecycleEvent<'_>) + Send + Sync + 'static {
        let tasks = task_table(self.task_names());
        let checks: Vec<String> = self.health_check_names().map(str::to_owned).collect();
        move |event| {
            if let LifecycleEvent::Registry {
                state: LifecycleState::Starting,
                ..
            } = event
            {
                info!("tasks = {tasks}");
                info!(health_checks = ?checks, "registered health checks");
                if checks.len() <= 1 {
                    warn!("{NO_HEALTH_CHECKS_BANNER}");
                }
            }
        }
    }
}

fn task_table<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let mut table = String::new();
    for name in names {
        table.push_str("\n\n    POST    /tasks/");
        table.push_str(name);
    }
    if table.is_empty() {
        table.push_str("(none)");
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use common::protocol::{ErrorResponse, HealthResponse, TaskResponse};

    struct Echo;

    #[async_trait]
    impl Task for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            params: &BTreeMap<String, String>,
        ) -> anyhow::Result<String> {
            if params.contains_key("reject") {
                return Err(common::ServiceError::BadRequest("rejected".into()).into());
            }
            match params.get("fail") {
                Some(reason) => anyhow::bail!("asked to fail: {reason}"),
                None => Ok(params
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&")),
            }
        }
    }

    struct Down;

    #[async_trait]
    impl HealthCheck for Down {
        async fn check(&self) -> anyhow::Result<Option<String>> {
            anyhow::bail!("database unreachable")
        }
    }

    fn server(admin: &AdminEnvironment) -> TestServer {
        TestServer::new(admin.handler().router().clone()).unwrap()
    }

    #[tokio::test]
    async fn runs_tasks_with_query_parameters() {
        let mut admin = AdminEnvironment::new();
        admin.register_task(Arc::new(Echo));
        let server = server(&admin);

        let response = server
            .post("/tasks/echo")
            .add_query_param("b", "2")
            .add_query_param("a", "1")
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: TaskResponse = response.json();
        assert_eq!(body.task, "echo");
        assert_eq!(body.output, "a=1&b=2");
    }

    #[tokio::test]
    async fn unknown_task_is_404_bad_input_400_failure_500() {
        let mut admin = AdminEnvironment::new();
        admin.register_task(Arc::new(Echo));
        let server = server(&admin);

        let missing = server.post("/tasks/nope").await;
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(missing.json::<ErrorResponse>().code, "not_found");

        let rejected = server
            .post("/tasks/echo")
            .add_query_param("reject", "1")
            .await;
        assert_eq!(rejected.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(rejected.json::<ErrorResponse>().code, "bad_request");

        let failed = server
            .post("/tasks/echo")
            .add_query_param("fail", "yes")
            .await;
        assert_eq!(failed.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = failed.json();
        assert_eq!(body.code, "task_failed");
        assert!(body.message.contains("asked to fail: yes"));
    }

    #[tokio::test]
    async fn healthcheck_reflects_every_check() {
        let mut admin = AdminEnvironment::new();
        let healthy = server(&admin).get("/healthcheck").await;
        assert_eq!(healthy.status_code(), StatusCode::OK);
        assert!(healthy.json::<HealthResponse>().checks.contains_key(DEADLOCKS));

        admin.register_health_check("database", Arc::new(Down));
        let unhealthy = server(&admin).get("/healthcheck").await;
        assert_eq!(unhealthy.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: HealthResponse = unhealthy.json();
        assert!(!body.checks["database"].healthy);
        assert!(body.checks[DEADLOCKS].healthy);
    }

    #[tokio::test]
    async fn ping_and_fallback() {
        let server = server(&AdminEnvironment::new());
        let ping = server.get("/ping").await;
        assert_eq!(ping.status_code(), StatusCode::OK);
        assert_eq!(ping.text(), "pong\n");
        assert_eq!(server.get("/nowhere").await.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn task_table_lists_every_task() {
        assert_eq!(task_table(std::iter::empty()), "(none)");
        assert_eq!(
            task_table(["echo", "log-level"].into_iter()),
            "\n\n    POST    /tasks/echo\n\n    POST    /tasks/log-level"
        );
    }
}
