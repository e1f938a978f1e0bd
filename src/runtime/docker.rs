use super::{
    BuildRequest, ContainerDetails, ContainerRuntime, ContainerSummary, ImageDetails,
    RuntimeEvent,
};
use crate::credentials::RegistryAuth;
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the local defaults (unix socket, or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn version(&self) -> Result<String, RuntimeError> {
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_default())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let detail = self.docker.inspect_container(id, None).await?;

        let container_config = detail
            .config
            .ok_or_else(|| RuntimeError::NotFound(format!("configuration of container {}", id)))?;
        let image = container_config.image.clone().unwrap_or_default();
        let labels = container_config.labels.clone().unwrap_or_default();

        let container_id = detail.id.unwrap_or_else(|| id.to_string());

        // Recreate with the original create, host and network configuration.
        let mut config: Config<String> = container_config.into();
        config.host_config = detail.host_config;
        if let Some(networks) = detail
            .network_settings
            .and_then(|n| n.networks)
            .filter(|n| !n.is_empty())
        {
            config.networking_config = Some(NetworkingConfig {
                endpoints_config: recreate_endpoints(&container_id, networks),
            });
        }

        Ok(ContainerDetails {
            id: container_id,
            name: detail
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image,
            image_id: detail.image.unwrap_or_default(),
            running: detail.state.and_then(|s| s.running).unwrap_or(false),
            labels,
            config,
        })
    }

    async fn inspect_image(&self, id: &str) -> Result<ImageDetails, RuntimeError> {
        let detail = self.docker.inspect_image(id).await?;
        Ok(ImageDetails {
            id: detail.id.unwrap_or_else(|| id.to_string()),
            repo_digests: detail.repo_digests.unwrap_or_default(),
            labels: detail.config.and_then(|c| c.labels).unwrap_or_default(),
        })
    }

    fn pull_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> BoxStream<'_, Result<String, RuntimeError>> {
        let opts = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(opts), None, auth.docker_credentials())
            .map(|msg| -> Result<String, RuntimeError> {
                let info = msg?;
                let line = match (info.id, info.status) {
                    (Some(id), Some(status)) => format!("{}: {}", id, status),
                    (None, Some(status)) => status,
                    (Some(id), None) => id,
                    (None, None) => String::new(),
                };
                Ok(line)
            })
            .filter(|line| {
                let keep = !matches!(line, Ok(l) if l.is_empty());
                async move { keep }
            })
            .boxed()
    }

    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<String, RuntimeError>> {
        let credentials = request
            .auth
            .server_address()
            .map(str::to_string)
            .zip(request.auth.docker_credentials())
            .map(|(server, creds)| HashMap::from([(server, creds)]));
        let opts = BuildImageOptions {
            dockerfile: request.dockerfile,
            t: request.tag,
            remote: request.remote,
            nocache: true,
            rm: true,
            forcerm: true,
            labels: request.labels,
            ..Default::default()
        };

        self.docker
            .build_image(opts, credentials, None)
            .map(|msg| -> Result<String, RuntimeError> {
                let info = msg?;
                if let Some(error) = info.error {
                    return Err(RuntimeError::Operation(error));
                }
                Ok(info
                    .stream
                    .or(info.status)
                    .unwrap_or_default()
                    .trim_end()
                    .to_string())
            })
            .filter(|line| {
                let keep = !matches!(line, Ok(l) if l.is_empty());
                async move { keep }
            })
            .boxed()
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let opts = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker.stop_container(id, Some(opts)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let opts = RemoveContainerOptions {
            v: false,
            link: false,
            force: true,
        };
        self.docker.remove_container(id, Some(opts)).await?;
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, RuntimeError> {
        let opts = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let created = self.docker.create_container(Some(opts), config).await?;
        for warning in &created.warnings {
            debug!("Create warning for {}: {}", name, warning);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait_not_running(&self, id: &str) -> Result<i64, RuntimeError> {
        let opts = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.docker.wait_container(id, Some(opts)));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Operation(format!(
                "wait stream for {} ended without a status",
                id
            ))),
        }
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        let opts = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        self.docker.remove_image(id, Some(opts), None).await?;
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<usize, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        let pruned = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await?;
        let count = pruned.images_deleted.map(|d| d.len()).unwrap_or(0);
        info!(
            "Pruned {} dangling images, reclaimed {} bytes",
            count,
            pruned.space_reclaimed.unwrap_or(0)
        );
        Ok(count)
    }

    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>> {
        let opts = EventsOptions::<String> {
            filters: [("type", ["container"].as_slice())]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .map(|msg| -> Result<RuntimeEvent, RuntimeError> {
                let event = msg?;
                let (actor_id, attributes) = event
                    .actor
                    .map(|a| (a.id.unwrap_or_default(), a.attributes.unwrap_or_default()))
                    .unwrap_or_default();
                Ok(RuntimeEvent {
                    container_scoped: matches!(event.typ, Some(EventMessageTypeEnum::CONTAINER)),
                    action: event.action.unwrap_or_default(),
                    actor_id,
                    attributes,
                })
            })
            .boxed()
    }
}

/// Endpoint settings to recreate a container with: the user-supplied parts
/// of each network attachment, without what the daemon assigned.
fn recreate_endpoints(
    container_id: &str,
    networks: HashMap<String, EndpointSettings>,
) -> HashMap<String, EndpointSettings> {
    // The daemon aliases every container by its short id on user networks.
    let short_id: String = container_id.chars().take(12).collect();

    networks
        .into_iter()
        .map(|(network, endpoint)| {
            let aliases = endpoint
                .aliases
                .map(|a| a.into_iter().filter(|alias| *alias != short_id).collect::<Vec<_>>())
                .filter(|a| !a.is_empty());
            let settings = EndpointSettings {
                ipam_config: endpoint.ipam_config,
                links: endpoint.links,
                aliases,
                driver_opts: endpoint.driver_opts,
                ..Default::default()
            };
            (network, settings)
        })
        .collect()
}
