//! Maps a webhook request onto an update session.
//!
//! Transport independent: the HTTP layer only turns the returned status and
//! message into a response.

use std::sync::Arc;

use axum::http::StatusCode;
use log::{info, warn};

use crate::orchestrator::Orchestrator;
use crate::progress::ProgressSink;
use crate::registry::RegistryHandle;
use crate::types::SessionOutcome;

pub struct Dispatcher {
    registry: Arc<RegistryHandle>,
    orchestrator: Arc<Orchestrator>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RegistryHandle>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            registry,
            orchestrator,
        }
    }

    pub fn registry(&self) -> &Arc<RegistryHandle> {
        &self.registry
    }

    /// Resolves `name` against the current registry and runs an update.
    pub async fn handle_request(&self, name: &str, progress: ProgressSink) -> (StatusCode, String) {
        let name = name.trim();
        if name.is_empty() {
            return (StatusCode::BAD_REQUEST, "Container name is required".to_string());
        }

        let snapshot = self.registry.snapshot().await;
        let Some(record) = snapshot.lookup(name) else {
            warn!("Webhook for unknown container {}", name);
            return (StatusCode::BAD_REQUEST, "Container not found".to_string());
        };
        let display = record.display_name().to_string();
        info!("Webhook received for {}", display);

        match self
            .orchestrator
            .update(record.container_name(), &record.id, progress)
            .await
        {
            Ok(session) => {
                let elapsed = session.started_at.elapsed().unwrap_or_default();
                let summary = format!(
                    "[{}] Session on {} ended {} after {:.1?}",
                    session.name, session.container_id, session.outcome, elapsed
                );
                if session.outcome.is_failed() {
                    warn!("{}", summary);
                } else {
                    info!("{}", summary);
                }
                Self::respond(&display, &session.outcome)
            }
            Err(_) => {
                warn!("Rejected webhook for {}: update already in progress", display);
                (
                    StatusCode::CONFLICT,
                    format!("Update already in progress for {}", display),
                )
            }
        }
    }

    fn respond(display: &str, outcome: &SessionOutcome) -> (StatusCode, String) {
        match outcome {
            SessionOutcome::Success => (StatusCode::OK, format!("Container {} updated", display)),
            SessionOutcome::Skipped => (
                StatusCode::OK,
                format!("Container {} already up to date", display),
            ),
            SessionOutcome::Failed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to update container {}", display),
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{dispatcher, runtime, DIGEST};
    use super::*;
    use crate::progress::ProgressKind;
    use crate::runtime::fake::Call;

    #[tokio::test]
    async fn empty_name_is_a_bad_request() {
        let runtime = runtime(DIGEST);
        let dispatcher = dispatcher(&runtime).await;

        let (status, _) = dispatcher.handle_request("  ", ProgressSink::detached()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(runtime.count("inspect"), 0);
    }

    #[tokio::test]
    async fn unknown_container_is_not_found() {
        let runtime = runtime(DIGEST);
        let dispatcher = dispatcher(&runtime).await;

        let (status, body) = dispatcher
            .handle_request("ghost", ProgressSink::detached())
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Container not found");
        assert_eq!(runtime.calls(), vec![Call::List]);
    }

    #[tokio::test]
    async fn unchanged_image_answers_ok() {
        let runtime = runtime(DIGEST);
        let dispatcher = dispatcher(&runtime).await;

        let (status, body) = dispatcher
            .handle_request("WEB", ProgressSink::detached())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Container web already up to date");
        assert!(runtime.destructive_calls().is_empty());
    }

    #[tokio::test]
    async fn new_image_answers_ok_and_streams_progress() {
        let runtime = runtime(&format!("sha256:{}", "4".repeat(64)));
        let dispatcher = dispatcher(&runtime).await;
        let (sink, mut rx) = ProgressSink::channel();

        let (status, body) = dispatcher.handle_request("web", sink).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Container web updated");

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&ProgressKind::Start));
        assert_eq!(kinds.last(), Some(&ProgressKind::End));
    }

    #[tokio::test]
    async fn stop_failure_answers_internal_error() {
        let runtime = runtime(&format!("sha256:{}", "4".repeat(64)));
        runtime.fail_on("stop");
        let dispatcher = dispatcher(&runtime).await;

        let (status, body) = dispatcher
            .handle_request("web", ProgressSink::detached())
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Failed to update container web");
        assert_eq!(runtime.count("remove"), 0);
        assert_eq!(runtime.count("create"), 0);
    }

    #[tokio::test]
    async fn concurrent_request_conflicts() {
        let runtime = runtime(&format!("sha256:{}", "4".repeat(64)));
        let gate = runtime.gate_pulls();
        let dispatcher = Arc::new(dispatcher(&runtime).await);

        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .handle_request("web", ProgressSink::detached())
                    .await
            })
        };
        while !dispatcher.orchestrator.leases().is_held("web") {
            tokio::task::yield_now().await;
        }

        let (status, body) = dispatcher
            .handle_request("web", ProgressSink::detached())
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, "Update already in progress for web");

        gate.notify_one();
        let (status, _) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }
}
