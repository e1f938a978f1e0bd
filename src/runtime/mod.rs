//! Container runtime boundary.
//!
//! Everything the agent asks of the container engine goes through
//! [`ContainerRuntime`], so the update state machine can be driven by the
//! real Docker daemon or by a scripted double in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::Config;
use futures_util::stream::BoxStream;

use crate::credentials::RegistryAuth;
use crate::error::RuntimeError;

pub mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerRuntime;

/// Summary row of a container listing.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Inspected container, with everything needed to recreate it.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    /// Name without its leading `/`.
    pub name: String,
    /// Image reference the container was created from, e.g. `nginx:latest`.
    pub image: String,
    /// Id of the image currently backing the container.
    pub image_id: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    /// Full create configuration, host and network endpoint settings
    /// included.
    pub config: Config<String>,
}

/// Inspected image.
#[derive(Debug, Clone, Default)]
pub struct ImageDetails {
    pub id: String,
    /// Entries of the form `name@sha256:<hex>`.
    pub repo_digests: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Parameters of a build from a remote repository context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Remote context in the runtime's git URL syntax.
    pub remote: String,
    pub dockerfile: String,
    pub tag: String,
    pub labels: HashMap<String, String>,
    /// Registry login used for the base images the build pulls.
    pub auth: RegistryAuth,
}

/// A lifecycle event read from the runtime's event feed.
#[derive(Debug, Clone, Default)]
pub struct RuntimeEvent {
    /// Whether the event is container-scoped.
    pub container_scoped: bool,
    pub action: String,
    pub actor_id: String,
    pub attributes: HashMap<String, String>,
}

/// Operations the update agent needs from a container engine.
///
/// Streaming operations yield human-readable log lines in the order the
/// engine produces them.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Engine version string, used as a connectivity check.
    async fn version(&self) -> Result<String, RuntimeError>;

    /// Lists all containers, stopped ones included.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn inspect_image(&self, id: &str) -> Result<ImageDetails, RuntimeError>;

    fn pull_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> BoxStream<'_, Result<String, RuntimeError>>;

    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<String, RuntimeError>>;

    /// Stops a container, killing it once `grace` has elapsed.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-removes a container, leaving its volumes and links alone.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Creates a container and returns its id.
    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Resolves with the exit status once the container is no longer running.
    async fn wait_not_running(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Force-removes an image by id.
    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError>;

    /// Removes untagged images and returns how many were deleted.
    async fn prune_dangling_images(&self) -> Result<usize, RuntimeError>;

    /// Container-scoped event feed.
    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>>;
}
