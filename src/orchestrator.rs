//! Container update state machine.
//!
//! A session inspects the container, decides whether a newer image exists
//! (by pulled digest or by remote commit), and only then replaces the
//! container: stop, remove, recreate with the original configuration,
//! start, and clean up the superseded image.  Everything before the stop is
//! side-effect free on the running container.
//!
//! At most one session runs per container id; see [`LeaseSet`].

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};

use futures_util::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;

use crate::credentials::resolve_credentials;
use crate::error::{LeaseConflict, ReplaceStep, RuntimeError, UpdateError};
use crate::git::{build_remote, CommitResolver};
use crate::progress::{ProgressKind, ProgressSink};
use crate::runtime::{BuildRequest, ContainerDetails, ContainerRuntime, ImageDetails};
use crate::types::{labels, ImageSource, SessionOutcome, UpdateDecision};

#[allow(clippy::expect_used)]
static DIGEST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(sha256:[A-Fa-f0-9]{64})\b").expect("constant regex pattern is valid")
});

/// First `sha256:<hex>` digest in a line, lowercased.
pub fn find_digest(line: &str) -> Option<String> {
    DIGEST_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Set of services with an update in flight.
///
/// Keys are service names rather than container ids: a replacement gets a
/// new id while the name stays.
#[derive(Debug, Default)]
pub struct LeaseSet {
    held: Mutex<HashSet<String>>,
}

impl LeaseSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims `service`, or returns `None` if it is already claimed.
    /// Matching ignores case and a leading `/`.
    pub fn try_acquire(self: &Arc<Self>, service: &str) -> Option<Lease> {
        let key = lease_key(service);
        let mut held = self.held.lock();
        if !held.insert(key.clone()) {
            return None;
        }
        Some(Lease {
            set: Arc::clone(self),
            key,
        })
    }

    #[cfg(test)]
    pub fn is_held(&self, service: &str) -> bool {
        self.held.lock().contains(&lease_key(service))
    }
}

fn lease_key(service: &str) -> String {
    service.trim().trim_start_matches('/').to_lowercase()
}

/// Exclusive claim on a service, released on drop.
#[derive(Debug)]
pub struct Lease {
    set: Arc<LeaseSet>,
    key: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.set.held.lock().remove(&self.key);
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Time a container gets to stop before it is killed.
    pub stop_grace: Duration,
    /// How long to watch a restarted container for an early exit.
    pub start_wait: Duration,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            start_wait: Duration::from_secs(3),
        }
    }
}

/// A finished update attempt.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    pub container_id: String,
    /// Container name, or the id if inspection failed.
    pub name: String,
    pub started_at: SystemTime,
    pub outcome: SessionOutcome,
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<dyn CommitResolver>,
    leases: Arc<LeaseSet>,
    options: UpdateOptions,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<dyn CommitResolver>,
        options: UpdateOptions,
    ) -> Self {
        Self {
            runtime,
            resolver,
            leases: LeaseSet::new(),
            options,
        }
    }

    #[cfg(test)]
    pub fn leases(&self) -> &Arc<LeaseSet> {
        &self.leases
    }

    /// Runs one update session for the container `container_id` serving
    /// `service`.
    ///
    /// Returns [`LeaseConflict`] immediately if a session for the same
    /// service is already running. Otherwise the session always terminates
    /// in `Success`, `Skipped` or `Failed(reason)`, and `End` is the last
    /// event written to `progress`.
    pub async fn update(
        &self,
        service: &str,
        container_id: &str,
        progress: ProgressSink,
    ) -> Result<UpdateSession, LeaseConflict> {
        let _lease = self
            .leases
            .try_acquire(service)
            .ok_or_else(|| LeaseConflict {
                service: service.to_string(),
            })?;

        let started_at = SystemTime::now();
        let mut run = Run {
            runtime: self.runtime.as_ref(),
            resolver: self.resolver.as_ref(),
            options: &self.options,
            progress,
            name: container_id.to_string(),
        };
        run.say(ProgressKind::Start, "Update requested");

        let result = AssertUnwindSafe(run.execute(container_id))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(UpdateDecision::Changed(revision))) => {
                if !revision.is_empty() {
                    info!("[{}] Now running {}", run.name, revision);
                }
                SessionOutcome::Success
            }
            Ok(Ok(UpdateDecision::NoChange)) => SessionOutcome::Skipped,
            Ok(Err(e)) => {
                if e.is_degraded() {
                    error!(
                        "[{}] {} - container may be left stopped or removed, manual intervention required",
                        run.name, e
                    );
                } else {
                    error!("[{}] {}", run.name, e);
                }
                run.progress.emit(ProgressKind::Error, e.to_string());
                SessionOutcome::Failed(e.reason().to_string())
            }
            Err(_) => {
                error!("[{}] Update aborted by an internal fault", run.name);
                run.progress
                    .emit(ProgressKind::Error, "Update aborted by an internal fault");
                SessionOutcome::Failed("internal".to_string())
            }
        };

        let summary = match &outcome {
            SessionOutcome::Success => "Container updated".to_string(),
            SessionOutcome::Skipped => "Image already up to date, nothing to do".to_string(),
            SessionOutcome::Failed(reason) => format!("Update failed at {}", reason),
        };
        run.say(ProgressKind::End, summary);
        Ok(UpdateSession {
            container_id: container_id.to_string(),
            name: run.name,
            started_at,
            outcome,
        })
    }
}

/// State of a single session while it runs.
struct Run<'a> {
    runtime: &'a dyn ContainerRuntime,
    resolver: &'a dyn CommitResolver,
    options: &'a UpdateOptions,
    progress: ProgressSink,
    name: String,
}

impl Run<'_> {
    fn say(&self, kind: ProgressKind, message: impl Into<String>) {
        let message = message.into();
        info!("[{}] {}", self.name, message);
        self.progress.emit(kind, message);
    }

    /// Streamed runtime output goes to the debug log only.
    fn relay(&self, kind: ProgressKind, line: String) {
        debug!("[{}] {}", self.name, line);
        self.progress.emit(kind, line);
    }

    fn report_cleanup_error(&self, what: &str, e: RuntimeError) {
        let message = format!("Failed to {}: {}", what, e);
        warn!("[{}] {}", self.name, message);
        self.progress.emit(ProgressKind::Error, message);
    }

    async fn execute(&mut self, container_id: &str) -> Result<UpdateDecision, UpdateError> {
        let container = self
            .runtime
            .inspect_container(container_id)
            .await
            .map_err(UpdateError::Inspect)?;
        if !container.name.is_empty() {
            self.name = container.name.clone();
        }
        let image = self
            .runtime
            .inspect_image(&container.image_id)
            .await
            .map_err(UpdateError::Inspect)?;

        let decision = match ImageSource::classify(&container.labels, &container.image) {
            ImageSource::Registry { image: reference } => {
                self.say(ProgressKind::Pull, "Container uses a registry image");
                self.pull(&reference, &container.labels, &image).await?
            }
            source @ ImageSource::BuiltFromRepo { .. } => {
                self.say(ProgressKind::Build, "Container is built from a repository");
                self.build(source, &container.labels, &image).await?
            }
        };

        if decision == UpdateDecision::NoChange {
            return Ok(decision);
        }

        self.replace(&container).await?;
        self.cleanup(&image).await;
        Ok(decision)
    }

    /// Pulls `reference` and compares the first advertised digest with the
    /// digests already known for the running image.
    async fn pull(
        &self,
        reference: &str,
        container_labels: &HashMap<String, String>,
        current: &ImageDetails,
    ) -> Result<UpdateDecision, UpdateError> {
        let auth = resolve_credentials(container_labels);
        match auth.server_address() {
            Some(server) => self.say(
                ProgressKind::Pull,
                format!("Pulling {} with credentials for {}", reference, server),
            ),
            None => self.say(ProgressKind::Pull, format!("Pulling {}", reference)),
        }

        let known: Vec<String> = current
            .repo_digests
            .iter()
            .filter_map(|d| find_digest(d))
            .collect();

        let mut first_digest: Option<String> = None;
        let mut stream = self.runtime.pull_image(reference, &auth);
        while let Some(line) = stream.next().await {
            let line = line.map_err(UpdateError::Pull)?;
            let digest = if first_digest.is_none() {
                find_digest(&line)
            } else {
                None
            };
            self.relay(ProgressKind::PullMessage, line);

            if let Some(digest) = digest {
                self.say(
                    ProgressKind::PullMessage,
                    format!("Pulling image with digest {}", digest),
                );
                if known.contains(&digest) {
                    self.say(ProgressKind::PullEnd, "Pulled digest matches the running image");
                    return Ok(UpdateDecision::NoChange);
                }
                first_digest = Some(digest);
            }
        }

        self.say(ProgressKind::PullEnd, format!("Pulled {}", reference));
        Ok(UpdateDecision::Changed(first_digest.unwrap_or_default()))
    }

    /// Builds the image from its repository when the branch moved past the
    /// commit recorded on the running image.
    async fn build(
        &self,
        source: ImageSource,
        container_labels: &HashMap<String, String>,
        current: &ImageDetails,
    ) -> Result<UpdateDecision, UpdateError> {
        let ImageSource::BuiltFromRepo {
            repo_url,
            branch,
            dockerfile,
            context,
            image,
        } = source
        else {
            return Ok(UpdateDecision::NoChange);
        };

        let commit = self
            .resolver
            .resolve_latest_commit(&format!("{}#{}", repo_url, branch))
            .await?;
        let previous = current.labels.get(labels::REPO_SHA).map(String::as_str);
        if previous == Some(commit.as_str()) {
            self.say(
                ProgressKind::BuildEnd,
                format!("{} is already built from {}", image, commit),
            );
            return Ok(UpdateDecision::NoChange);
        }

        let remote = build_remote(&repo_url, &branch, &context);
        self.say(
            ProgressKind::Build,
            format!(
                "Building {} from {} at {} (previous {})",
                image,
                remote,
                commit,
                previous.unwrap_or("none")
            ),
        );

        let mut build_labels = HashMap::new();
        build_labels.insert(labels::REPO_SHA.to_string(), commit.clone());
        let request = BuildRequest {
            remote,
            dockerfile,
            tag: image.clone(),
            labels: build_labels,
            auth: resolve_credentials(container_labels),
        };

        let mut stream = self.runtime.build_image(request);
        while let Some(line) = stream.next().await {
            let line = line.map_err(UpdateError::Build)?;
            self.relay(ProgressKind::BuildMessage, line);
        }

        self.say(ProgressKind::BuildEnd, format!("Built {}", image));
        Ok(UpdateDecision::Changed(commit))
    }

    async fn replace(&self, container: &ContainerDetails) -> Result<(), UpdateError> {
        let step = |step: ReplaceStep| move |source| UpdateError::Replace { step, source };

        if container.running {
            self.say(ProgressKind::Stop, "Stopping container");
            self.runtime
                .stop_container(&container.id, self.options.stop_grace)
                .await
                .map_err(step(ReplaceStep::Stop))?;
        }

        self.say(ProgressKind::Remove, "Removing container");
        self.runtime
            .remove_container(&container.id)
            .await
            .map_err(step(ReplaceStep::Remove))?;

        self.say(ProgressKind::Recreate, "Recreating container");
        let new_id = self
            .runtime
            .create_container(&container.name, container.config.clone())
            .await
            .map_err(step(ReplaceStep::Create))?;

        self.say(ProgressKind::Restart, "Starting container");
        self.runtime
            .start_container(&new_id)
            .await
            .map_err(step(ReplaceStep::Start))?;

        self.confirm_running(&new_id).await;
        Ok(())
    }

    /// Watches the restarted container for an early exit. Never fails the
    /// session: the replacement is already running.
    async fn confirm_running(&self, container_id: &str) {
        if self.options.start_wait.is_zero() {
            return;
        }
        match tokio::time::timeout(
            self.options.start_wait,
            self.runtime.wait_not_running(container_id),
        )
        .await
        {
            Err(_) => debug!("[{}] Container is running", self.name),
            Ok(Ok(status)) => {
                let message = format!("Container exited right after start with status {}", status);
                warn!("[{}] {}", self.name, message);
                self.progress.emit(ProgressKind::Error, message);
            }
            Ok(Err(e)) => {
                let message = format!("Could not confirm container state: {}", e);
                warn!("[{}] {}", self.name, message);
                self.progress.emit(ProgressKind::Error, message);
            }
        }
    }

    async fn cleanup(&self, former: &ImageDetails) {
        self.say(ProgressKind::RemoveImage, "Removing former image");
        if let Err(e) = self.runtime.remove_image(&former.id).await {
            self.report_cleanup_error("remove former image", e);
        }
        match self.runtime.prune_dangling_images().await {
            Ok(count) => debug!("[{}] Pruned {} untagged images", self.name, count),
            Err(e) => self.report_cleanup_error("remove untagged images", e),
        }
    }
}
