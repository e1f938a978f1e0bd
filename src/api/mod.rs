//! HTTP surface: webhooks, container listing and token issuance.

pub mod auth;
pub mod hooks;
pub mod status;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use log::{error, info};
use tokio::signal;

use crate::dispatcher::Dispatcher;
pub use auth::AuthState;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub auth: Arc<AuthState>,
}

/// Builds the router. With `protect_api` the status listing requires a
/// bearer token from `POST /api/auth`.
pub fn router(state: AppState, protect_api: bool) -> Router {
    let mut api = Router::new()
        .route("/api", get(status::list))
        .route("/api/", get(status::list));
    if protect_api {
        api = api.route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));
    }

    Router::new()
        .route("/hooks/{name}", get(hooks::handle))
        .route("/hooks/", get(hooks::handle_unnamed))
        .route("/api/auth", post(auth::login))
        .merge(api)
        .with_state(state)
}

/// Serves `app` on `addr` until Ctrl+C.
pub async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::TokenIssuer;
    use crate::error::ResolutionError;
    use crate::git::CommitResolver;
    use crate::orchestrator::{Orchestrator, UpdateOptions};
    use crate::registry::{RegistryHandle, ServiceRegistry};
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::ContainerSummary;

    struct NoResolver;

    #[async_trait]
    impl CommitResolver for NoResolver {
        async fn resolve_latest_commit(&self, _repo_url: &str) -> Result<String, ResolutionError> {
            Err(ResolutionError::Status(404))
        }
    }

    async fn test_state() -> AppState {
        let runtime = FakeRuntime::new();
        runtime.set_containers(vec![
            ContainerSummary {
                id: "c1".to_string(),
                names: vec!["/web".to_string()],
                labels: HashMap::from([("docker-ci.enable".to_string(), "true".to_string())]),
            },
            ContainerSummary {
                id: "c2".to_string(),
                names: vec!["/db".to_string()],
                labels: HashMap::new(),
            },
        ]);
        let registry = Arc::new(RegistryHandle::new("http://localhost:8080"));
        registry.refresh(&runtime).await.unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(runtime),
            Arc::new(NoResolver),
            UpdateOptions::default(),
        );
        AppState {
            dispatcher: Arc::new(Dispatcher::new(registry, Arc::new(orchestrator))),
            auth: Arc::new(AuthState {
                tokens: TokenIssuer::new("secret", Duration::from_secs(60)),
                password: Some("admin".to_string()),
            }),
        }
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn login(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/auth")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_hook_is_a_bad_request() {
        let app = router(test_state().await, false);

        let resp = app.oneshot(get("/hooks/ghost")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(resp).await, "Container not found");
    }

    #[tokio::test]
    async fn hook_without_name_is_a_bad_request() {
        let app = router(test_state().await, false);

        let resp = app.oneshot(get("/hooks/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_lists_enabled_containers() {
        let app = router(test_state().await, false);

        let resp = app.oneshot(get("/api/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let value: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(value, serde_json::json!([{ "id": "c1", "names": ["/web"] }]));
    }

    #[tokio::test]
    async fn status_includes_labelled_hook_name() {
        let state = test_state().await;
        let registry = ServiceRegistry::from_containers(vec![ContainerSummary {
            id: "c3".to_string(),
            names: vec!["/stack_web_1".to_string()],
            labels: HashMap::from([
                ("docker-ci.enable".to_string(), "true".to_string()),
                ("docker-ci.name".to_string(), "web".to_string()),
            ]),
        }]);
        state.dispatcher.registry().replace(Arc::new(registry)).await;
        let app = router(state, false);

        let resp = app.oneshot(get("/api/")).await.unwrap();
        let value: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{ "id": "c3", "names": ["/stack_web_1"], "hook_name": "web" }])
        );
    }

    #[tokio::test]
    async fn login_issues_a_token_for_the_right_password() {
        let app = router(test_state().await, false);

        let resp = app.oneshot(login(r#"{"password":"admin"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let value: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert!(value["token"].as_str().is_some_and(|t| t.contains('.')));
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let app = router(test_state().await, false);

        let resp = app.oneshot(login(r#"{"password":"nope"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let value: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(value["error"], "Invalid password");
    }

    #[tokio::test]
    async fn login_rejects_malformed_body() {
        let app = router(test_state().await, false);

        let resp = app.oneshot(login("not json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn protected_status_requires_a_valid_token() {
        let state = test_state().await;
        let token = state.auth.tokens.issue();
        let app = router(state, true);

        let resp = app.clone().oneshot(get("/api/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let bogus = Request::builder()
            .uri("/api/")
            .header(header::AUTHORIZATION, "Bearer 1.deadbeef")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(bogus).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let valid = Request::builder()
            .uri("/api/")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(valid).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn hooks_stay_open_when_api_is_protected() {
        let app = router(test_state().await, true);

        let resp = app.oneshot(get("/hooks/ghost")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
