//! Progress narration of an update session.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressKind {
    Start,
    Pull,
    PullMessage,
    PullEnd,
    Build,
    BuildMessage,
    BuildEnd,
    Stop,
    Recreate,
    Restart,
    RemoveImage,
    Remove,
    Error,
    End,
}

/// One step emitted during an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "event")]
    pub kind: ProgressKind,
    #[serde(rename = "data")]
    pub payload: String,
}

/// Optional destination for progress events.
///
/// Writing to a detached sink, or to one whose receiver is gone, is a no-op.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// A sink paired with the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, kind: ProgressKind, payload: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent {
                kind,
                payload: payload.into(),
            });
        }
    }
}
