//! Registry credentials read from container labels.
//!
//! The runtime expects registry auth as a serialized credential triple that
//! it base64-encodes into the `X-Registry-Auth` header; bollard performs that
//! encoding from a [`DockerCredentials`], so resolution stops at building
//! that value.

use std::collections::HashMap;
use std::fmt;

use bollard::auth::DockerCredentials;

use crate::types::labels;

/// Username, password and server address for a private registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub server_address: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Auth handed to the runtime's pull and build calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic(Credentials),
}

impl RegistryAuth {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, RegistryAuth::Anonymous)
    }

    /// Server address the credentials apply to, if any.
    pub fn server_address(&self) -> Option<&str> {
        match self {
            RegistryAuth::Anonymous => None,
            RegistryAuth::Basic(c) => Some(&c.server_address),
        }
    }

    pub fn docker_credentials(&self) -> Option<DockerCredentials> {
        match self {
            RegistryAuth::Anonymous => None,
            RegistryAuth::Basic(c) => Some(DockerCredentials {
                username: Some(c.username.clone()),
                password: Some(c.password.clone()),
                serveraddress: Some(c.server_address.clone()),
                ..Default::default()
            }),
        }
    }
}

/// Reads the auth-server, username and password labels.
///
/// All three must be present and non-empty, otherwise the pull is anonymous.
pub fn resolve_credentials(container_labels: &HashMap<String, String>) -> RegistryAuth {
    let get = |key: &str| {
        container_labels
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    };

    match (
        get(labels::AUTH_SERVER),
        get(labels::USERNAME),
        get(labels::PASSWORD),
    ) {
        (Some(server), Some(username), Some(password)) => RegistryAuth::Basic(Credentials {
            server_address: server.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }),
        _ => RegistryAuth::Anonymous,
    }
}
