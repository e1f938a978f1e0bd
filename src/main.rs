//! docker-ci agent entry point.

use std::sync::Arc;

use log::{error, info};

mod api;
mod auth;
mod config;
mod credentials;
mod dispatcher;
mod error;
mod events;
mod git;
mod orchestrator;
mod progress;
mod registry;
mod runtime;
mod types;

use api::{AppState, AuthState};
use auth::TokenIssuer;
use config::Config;
use dispatcher::Dispatcher;
use events::EventListener;
use git::GitHttpResolver;
use orchestrator::Orchestrator;
use registry::RegistryHandle;
use runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting docker-ci with config: {:?}", cfg);
    if cfg.password.is_none() {
        info!("No admin password configured, token issuance is disabled");
    }

    // Container runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect()
            .map_err(|e| anyhow::anyhow!("Failed to connect to docker: {}", e))?,
    );
    let version = runtime
        .version()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to reach docker daemon: {}", e))?;
    info!("Connected to docker daemon version {}", version);

    // Registry of enabled containers
    let registry = Arc::new(RegistryHandle::new(cfg.base_url.clone()));
    let count = registry
        .refresh(runtime.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))?;
    info!("Loaded {} enabled container(s)", count);

    // Event listener
    let mut listener = EventListener::new(Arc::clone(&runtime));
    for action in cfg.reload_actions()? {
        let registry = Arc::clone(&registry);
        let runtime = Arc::clone(&runtime);
        listener.subscribe(action, move |_event| {
            let registry = Arc::clone(&registry);
            let runtime = Arc::clone(&runtime);
            async move {
                match registry.refresh(runtime.as_ref()).await {
                    Ok(count) => info!("Reloaded {} enabled container(s)", count),
                    Err(e) => error!("Failed to reload containers, keeping previous set: {}", e),
                }
            }
        });
    }
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!("Container event listener failed: {}", e);
            std::process::exit(1);
        }
    });

    // Update orchestrator and HTTP API
    let resolver = Arc::new(GitHttpResolver::new()?);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&runtime),
        resolver,
        cfg.update_options(),
    ));
    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(registry, orchestrator)),
        auth: Arc::new(AuthState {
            tokens: TokenIssuer::new(&cfg.token_secret, cfg.token_ttl()),
            password: cfg.password.clone(),
        }),
    };
    let app = api::router(state, cfg.protect_api);
    let result = api::serve(cfg.bind_addr()?, app).await;

    // Abort tasks
    listener_handle.abort();

    match &result {
        Ok(()) => info!("Shutdown complete."),
        Err(e) => error!("HTTP server failed: {}", e),
    }
    result
}
