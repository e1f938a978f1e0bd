//! Data structures shared by the update agent.
//!
//! Containers opt in through labels, so most of the types here are thin
//! views over a container's label map taken at inspection time.  The
//! label keys themselves live in [`labels`] so every module reads the same
//! metadata contract.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Label keys read from containers and images.
pub mod labels {
    /// `"true"` opts a container in to webhook updates.
    pub const ENABLE: &str = "docker-ci.enable";
    /// Webhook name used instead of the container name.
    pub const NAME: &str = "docker-ci.name";
    /// Remote repository URL; its presence switches a container to build mode.
    pub const REPO: &str = "repo";
    pub const DOCKERFILE: &str = "dockerfile";
    pub const BUILD_CONTEXT: &str = "docker-ci.build-context";
    /// Image label carrying the commit an image was built from.
    pub const REPO_SHA: &str = "docker-ci.repo-sha";
    pub const AUTH_SERVER: &str = "docker-ci.auth-server";
    pub const USERNAME: &str = "docker-ci.username";
    pub const PASSWORD: &str = "docker-ci.password";

    /// Prefix under which the bare keys are also accepted.
    pub const PREFIX: &str = "docker-ci.";

    pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";
    pub const DEFAULT_BUILD_CONTEXT: &str = ".";
}

/// Returns a non-empty label value, trying the bare key first and then the
/// `docker-ci.` prefixed form.
pub fn label<'a>(labels: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    let bare = labels.get(key).map(String::as_str);
    let prefixed = || labels.get(&format!("{}{}", labels::PREFIX, key)).map(String::as_str);
    bare.filter(|v| !v.trim().is_empty())
        .or_else(|| prefixed().filter(|v| !v.trim().is_empty()))
}

/// A runtime container eligible for updates, read at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Names as reported by the runtime, including the leading `/`.
    pub names: Vec<String>,
    /// Set from the `docker-ci.name` label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<String>,
}

impl ContainerRecord {
    /// The webhook name when labelled, else the container name. Used in logs
    /// and URLs.
    pub fn display_name(&self) -> &str {
        self.hook_name
            .as_deref()
            .unwrap_or_else(|| self.container_name())
    }

    /// The first runtime name without its leading separator, or the id.
    ///
    /// Stays the same when the container is replaced.
    pub fn container_name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or(self.id.as_str())
    }
}

/// Where a container's replacement image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Pulled from a registry under the container's configured reference.
    Registry { image: String },
    /// Built by the runtime from a remote repository.
    BuiltFromRepo {
        repo_url: String,
        branch: String,
        dockerfile: String,
        context: String,
        /// Tag applied to the built image.
        image: String,
    },
}

impl ImageSource {
    /// Classifies a container from its labels and configured image reference.
    pub fn classify(container_labels: &HashMap<String, String>, image: &str) -> Self {
        match label(container_labels, labels::REPO) {
            Some(repo) => {
                let (repo_url, branch) = crate::git::split_branch(repo);
                ImageSource::BuiltFromRepo {
                    repo_url: repo_url.to_string(),
                    branch: branch.to_string(),
                    dockerfile: label(container_labels, labels::DOCKERFILE)
                        .unwrap_or(labels::DEFAULT_DOCKERFILE)
                        .to_string(),
                    context: container_labels
                        .get(labels::BUILD_CONTEXT)
                        .filter(|v| !v.trim().is_empty())
                        .cloned()
                        .unwrap_or_else(|| labels::DEFAULT_BUILD_CONTEXT.to_string()),
                    image: image.to_string(),
                }
            }
            None => ImageSource::Registry {
                image: image.to_string(),
            },
        }
    }
}

/// Outcome of the "is there something new" check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    NoChange,
    /// Carries the new digest or commit.
    Changed(String),
}

/// Terminal state of an update session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Skipped,
    Failed(String),
}

impl SessionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionOutcome::Failed(_))
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Success => write!(f, "success"),
            SessionOutcome::Skipped => write!(f, "skipped"),
            SessionOutcome::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}
