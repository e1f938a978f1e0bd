use thiserror::Error;

/// Failure of a single container-runtime call.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    /// Error reported inside a pull/build stream or by a runtime double.
    #[error("{0}")]
    Operation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Failure to resolve the latest commit of a remote repository.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Request to remote repository failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Remote repository answered with status {0}")]
    Status(u16),
    #[error("Branch {branch} not advertised by remote repository")]
    BranchNotFound { branch: String },
    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),
}

/// Step of the replace sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStep {
    Stop,
    Remove,
    Create,
    Start,
}

impl ReplaceStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplaceStep::Stop => "stop",
            ReplaceStep::Remove => "remove",
            ReplaceStep::Create => "create",
            ReplaceStep::Start => "start",
        }
    }
}

/// Fatal errors of an update session.
///
/// Cleanup failures are deliberately absent: they are reported as progress
/// and never change a session's outcome.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Failed to inspect container: {0}")]
    Inspect(#[source] RuntimeError),
    #[error("Failed to resolve latest commit: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("Failed to pull image: {0}")]
    Pull(#[source] RuntimeError),
    #[error("Failed to build image: {0}")]
    Build(#[source] RuntimeError),
    #[error("Failed to {} container: {source}", .step.as_str())]
    Replace {
        step: ReplaceStep,
        #[source]
        source: RuntimeError,
    },
}

impl UpdateError {
    /// Short reason recorded on a failed session.
    pub fn reason(&self) -> &'static str {
        match self {
            UpdateError::Inspect(_) => "inspect",
            UpdateError::Resolution(_) => "resolve",
            UpdateError::Pull(_) => "pull",
            UpdateError::Build(_) => "build",
            UpdateError::Replace { step, .. } => step.as_str(),
        }
    }

    /// Whether the old container may already be stopped or gone with no
    /// replacement running.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            UpdateError::Replace {
                step: ReplaceStep::Remove | ReplaceStep::Create | ReplaceStep::Start,
                ..
            }
        )
    }
}

/// Returned instead of a session when the service already has one in flight.
#[derive(Debug, Error)]
#[error("Update already in progress for {service}")]
pub struct LeaseConflict {
    pub service: String,
}
