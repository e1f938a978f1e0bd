//! Runtime event listener.
//!
//! Reads the runtime's container event feed and hands each event to the
//! handler registered for its action. Handlers run one at a time in feed
//! order; a panicking handler is logged and the loop carries on.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use log::{debug, error, info};

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, RuntimeEvent};

/// Container actions reported by the runtime's event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContainerAction {
    Attach,
    Commit,
    Copy,
    Create,
    Destroy,
    Detach,
    Die,
    ExecCreate,
    ExecDetach,
    ExecDie,
    ExecStart,
    Export,
    HealthStatus,
    Kill,
    Oom,
    Pause,
    Rename,
    Resize,
    Restart,
    Start,
    Stop,
    Top,
    Unpause,
    Update,
}

impl ContainerAction {
    pub const ALL: [ContainerAction; 24] = [
        ContainerAction::Attach,
        ContainerAction::Commit,
        ContainerAction::Copy,
        ContainerAction::Create,
        ContainerAction::Destroy,
        ContainerAction::Detach,
        ContainerAction::Die,
        ContainerAction::ExecCreate,
        ContainerAction::ExecDetach,
        ContainerAction::ExecDie,
        ContainerAction::ExecStart,
        ContainerAction::Export,
        ContainerAction::HealthStatus,
        ContainerAction::Kill,
        ContainerAction::Oom,
        ContainerAction::Pause,
        ContainerAction::Rename,
        ContainerAction::Resize,
        ContainerAction::Restart,
        ContainerAction::Start,
        ContainerAction::Stop,
        ContainerAction::Top,
        ContainerAction::Unpause,
        ContainerAction::Update,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Attach => "attach",
            ContainerAction::Commit => "commit",
            ContainerAction::Copy => "copy",
            ContainerAction::Create => "create",
            ContainerAction::Destroy => "destroy",
            ContainerAction::Detach => "detach",
            ContainerAction::Die => "die",
            ContainerAction::ExecCreate => "exec_create",
            ContainerAction::ExecDetach => "exec_detach",
            ContainerAction::ExecDie => "exec_die",
            ContainerAction::ExecStart => "exec_start",
            ContainerAction::Export => "export",
            ContainerAction::HealthStatus => "health_status",
            ContainerAction::Kill => "kill",
            ContainerAction::Oom => "oom",
            ContainerAction::Pause => "pause",
            ContainerAction::Rename => "rename",
            ContainerAction::Resize => "resize",
            ContainerAction::Restart => "restart",
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Top => "top",
            ContainerAction::Unpause => "unpause",
            ContainerAction::Update => "update",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerAction {
    type Err = String;

    /// Accepts decorated actions such as `exec_start: sh -c date` or
    /// `health_status: healthy`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base = s.split(':').next().unwrap_or("").trim();
        ContainerAction::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == base)
            .ok_or_else(|| format!("unknown container action: {}", s))
    }
}

pub type EventHandler = Arc<dyn Fn(RuntimeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct EventListener {
    runtime: Arc<dyn ContainerRuntime>,
    handlers: HashMap<ContainerAction, EventHandler>,
}

impl EventListener {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `action`, replacing any previous one.
    pub fn subscribe<F, Fut>(&mut self, action: ContainerAction, handler: F)
    where
        F: Fn(RuntimeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event: RuntimeEvent| handler(event).boxed());
        self.handlers.insert(action, handler);
    }

    pub fn actions(&self) -> Vec<ContainerAction> {
        let mut actions: Vec<_> = self.handlers.keys().copied().collect();
        actions.sort();
        actions
    }

    /// Consumes the event feed until it fails or ends.
    ///
    /// The agent cannot work without the feed, so both cases are returned
    /// as errors for the caller to treat as fatal.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        let names: Vec<&str> = self.actions().iter().map(|a| a.as_str()).collect();
        info!("Listening for container events {:?}", names);

        let mut stream = self.runtime.events();
        while let Some(msg) = stream.next().await {
            let event = msg?;
            if !event.container_scoped {
                continue;
            }
            let Ok(action) = event.action.parse::<ContainerAction>() else {
                debug!("Ignoring container event {}", event.action);
                continue;
            };
            if let Some(handler) = self.handlers.get(&action) {
                self.dispatch(action, handler, event).await;
            }
        }

        Err(RuntimeError::Operation("event stream ended".to_string()))
    }

    async fn dispatch(&self, action: ContainerAction, handler: &EventHandler, event: RuntimeEvent) {
        let name = event
            .attributes
            .get("name")
            .cloned()
            .unwrap_or_else(|| event.actor_id.clone());
        debug!("Container event: {} for {}", action, name);

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(fut) => fut,
            Err(_) => {
                error!("Handler for {} panicked on {}", action, name);
                return;
            }
        };
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            error!("Handler for {} panicked on {}", action, name);
        }
    }
}
