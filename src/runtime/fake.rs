//! Scripted [`ContainerRuntime`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::Config;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{
    BuildRequest, ContainerDetails, ContainerRuntime, ContainerSummary, ImageDetails,
    RuntimeEvent,
};
use crate::credentials::RegistryAuth;
use crate::error::RuntimeError;

/// A runtime call as observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List,
    InspectContainer(String),
    InspectImage(String),
    Pull { image: String, authenticated: bool },
    Build(BuildRequest),
    Stop(String, Duration),
    Remove(String),
    Create(String),
    Start(String),
    Wait(String),
    RemoveImage(String),
    Prune,
}

impl Call {
    /// Operation name as used by [`FakeRuntime::fail_on`].
    pub fn op(&self) -> &'static str {
        match self {
            Call::List => "list",
            Call::InspectContainer(_) => "inspect",
            Call::InspectImage(_) => "inspect_image",
            Call::Pull { .. } => "pull",
            Call::Build(_) => "build",
            Call::Stop(..) => "stop",
            Call::Remove(_) => "remove",
            Call::Create(_) => "create",
            Call::Start(_) => "start",
            Call::Wait(_) => "wait",
            Call::RemoveImage(_) => "remove_image",
            Call::Prune => "prune",
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Call::Stop(..) | Call::Remove(_) | Call::Create(_) | Call::Start(_)
        )
    }
}

#[derive(Default)]
struct State {
    containers: Vec<ContainerSummary>,
    details: HashMap<String, ContainerDetails>,
    images: HashMap<String, ImageDetails>,
    pull_lines: Vec<String>,
    build_lines: Vec<String>,
    events: Vec<Result<RuntimeEvent, String>>,
    failing: HashSet<&'static str>,
    wait_status: Option<i64>,
    calls: Vec<Call>,
    created: u32,
    created_configs: Vec<(String, Config<String>)>,
}

/// In-memory runtime recording every call it receives.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
    pull_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_containers(&self, containers: Vec<ContainerSummary>) {
        self.state.lock().containers = containers;
    }

    pub fn add_container(&self, details: ContainerDetails) {
        self.state.lock().details.insert(details.id.clone(), details);
    }

    pub fn add_image(&self, image: ImageDetails) {
        self.state.lock().images.insert(image.id.clone(), image);
    }

    pub fn set_pull_lines(&self, lines: &[&str]) {
        self.state.lock().pull_lines = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn set_build_lines(&self, lines: &[&str]) {
        self.state.lock().build_lines = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn set_events(&self, events: Vec<Result<RuntimeEvent, String>>) {
        self.state.lock().events = events;
    }

    /// Resolve `wait_not_running` with this exit status instead of never.
    pub fn set_wait_status(&self, status: i64) {
        self.state.lock().wait_status = Some(status);
    }

    /// Makes every call of the named operation fail.
    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    /// Holds pull streams open until the returned notify is signalled.
    pub fn gate_pulls(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.pull_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.op() == op).count()
    }

    /// Name and configuration of every container created, in order.
    pub fn created_configs(&self) -> Vec<(String, Config<String>)> {
        self.state.lock().created_configs.clone()
    }

    pub fn destructive_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_destructive).collect()
    }

    fn record(&self, call: Call) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let op = call.op();
        state.calls.push(call);
        if state.failing.contains(op) {
            return Err(RuntimeError::Operation(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn version(&self) -> Result<String, RuntimeError> {
        Ok("fake".to_string())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record(Call::List)?;
        Ok(self.state.lock().containers.clone())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        self.record(Call::InspectContainer(id.to_string()))?;
        self.state
            .lock()
            .details
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn inspect_image(&self, id: &str) -> Result<ImageDetails, RuntimeError> {
        self.record(Call::InspectImage(id.to_string()))?;
        self.state
            .lock()
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn pull_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> BoxStream<'_, Result<String, RuntimeError>> {
        let call = Call::Pull {
            image: image.to_string(),
            authenticated: !auth.is_anonymous(),
        };
        if let Err(e) = self.record(call) {
            return stream::once(async move { Err(e) }).boxed();
        }
        let lines: Vec<String> = self.state.lock().pull_lines.clone();
        let lines = stream::iter(lines.into_iter().map(Ok));

        match self.pull_gate.lock().clone() {
            Some(gate) => stream::once(async move { gate.notified().await })
                .filter_map(|()| async { None::<Result<String, RuntimeError>> })
                .chain(lines)
                .boxed(),
            None => lines.boxed(),
        }
    }

    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<String, RuntimeError>> {
        if let Err(e) = self.record(Call::Build(request)) {
            return stream::once(async move { Err(e) }).boxed();
        }
        let lines: Vec<Result<String, RuntimeError>> =
            self.state.lock().build_lines.iter().cloned().map(Ok).collect();
        stream::iter(lines).boxed()
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.record(Call::Stop(id.to_string(), grace))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Remove(id.to_string()))
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, RuntimeError> {
        self.record(Call::Create(name.to_string()))?;
        let mut state = self.state.lock();
        state.created_configs.push((name.to_string(), config));
        state.created += 1;
        Ok(format!("new-{}-{}", name, state.created))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Start(id.to_string()))
    }

    async fn wait_not_running(&self, id: &str) -> Result<i64, RuntimeError> {
        self.record(Call::Wait(id.to_string()))?;
        let status = self.state.lock().wait_status;
        match status {
            Some(code) => Ok(code),
            None => std::future::pending().await,
        }
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Call::RemoveImage(id.to_string()))
    }

    async fn prune_dangling_images(&self) -> Result<usize, RuntimeError> {
        self.record(Call::Prune)?;
        Ok(0)
    }

    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>> {
        let events: Vec<Result<RuntimeEvent, RuntimeError>> = self
            .state
            .lock()
            .events
            .drain(..)
            .map(|e| e.map_err(RuntimeError::Operation))
            .collect();
        stream::iter(events).boxed()
    }
}
