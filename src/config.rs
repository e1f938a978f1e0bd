use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::events::ContainerAction;
use crate::orchestrator::UpdateOptions;

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub port: u16,
    pub bind_ip: String,
    /// Public base URL, only used to log webhook addresses.
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub token_secret: String,
    pub token_ttl_secs: u64,
    /// Require a bearer token on the status endpoint.
    pub protect_api: bool,
    pub stop_timeout_secs: u64,
    pub start_wait_secs: u64,
    /// Container actions that trigger a registry reload.
    pub reload_events: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_ip: "0.0.0.0".into(),
            base_url: "http://localhost:8080".into(),
            password: None,
            token_secret: "default_insecure_secret".into(),
            token_ttl_secs: 24 * 60 * 60,
            protect_api: false,
            stop_timeout_secs: 5,
            start_wait_secs: 3,
            reload_events: vec!["create".into(), "destroy".into()],
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("bind_ip", &self.bind_ip)
            .field("base_url", &self.base_url)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token_secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("protect_api", &self.protect_api)
            .field("stop_timeout_secs", &self.stop_timeout_secs)
            .field("start_wait_secs", &self.start_wait_secs)
            .field("reload_events", &self.reload_events)
            .finish()
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("docker-ci.toml"))
                .merge(Json::file("docker-ci.json"))
                .merge(Env::prefixed("DOCKER_CI_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("DOCKER_CI_PASSWORD_FILE") {
            config.password = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }
        if let Ok(secret_file) = std::env::var("DOCKER_CI_TOKEN_SECRET_FILE") {
            config.token_secret = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        config.bind_addr()?;
        config.reload_actions()?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind_ip, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind_ip/port: {}", e))
    }

    pub fn reload_actions(&self) -> anyhow::Result<Vec<ContainerAction>> {
        self.reload_events
            .iter()
            .map(|e| e.parse::<ContainerAction>().map_err(|err| anyhow::anyhow!(err)))
            .collect()
    }

    pub fn update_options(&self) -> UpdateOptions {
        UpdateOptions {
            stop_grace: Duration::from_secs(self.stop_timeout_secs),
            start_wait: Duration::from_secs(self.start_wait_secs),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}
