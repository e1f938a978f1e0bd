//! `GET /hooks/{name}`: plain request or websocket progress stream.

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{Sink, SinkExt};
use log::{debug, error};
use serde_json::json;

use super::AppState;
use crate::dispatcher::Dispatcher;
use crate::progress::{ProgressEvent, ProgressSink};

pub async fn handle(
    State(state): State<AppState>,
    Path(name): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    run(state, name, upgrade).await
}

/// `GET /hooks/` with no name.
pub async fn handle_unnamed(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    run(state, String::new(), upgrade).await
}

async fn run(
    state: AppState,
    name: String,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => {
            let dispatcher = Arc::clone(&state.dispatcher);
            ws.on_upgrade(move |socket| stream_update(socket, dispatcher, name))
        }
        Err(_) => state
            .dispatcher
            .handle_request(&name, ProgressSink::detached())
            .await
            .into_response(),
    }
}

/// Forwards progress to the socket, then the final status, then closes.
///
/// The session runs on its own task so a client that goes away mid-update
/// does not abort the replacement halfway.
async fn stream_update<S>(mut socket: S, dispatcher: Arc<Dispatcher>, name: String)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let (sink, mut rx) = ProgressSink::channel();
    let session = {
        let name = name.clone();
        tokio::spawn(async move { dispatcher.handle_request(&name, sink).await })
    };

    while let Some(event) = rx.recv().await {
        let Some(text) = event_frame(&event) else {
            continue;
        };
        if let Err(e) = socket.send(Message::Text(text.into())).await {
            debug!("Progress client for {} disconnected: {}", name, e);
            return;
        }
    }

    let (status, message) = match session.await {
        Ok(result) => result,
        Err(e) => {
            error!("Update task for {} failed: {}", name, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to update container {}", name),
            )
        }
    };
    let _ = socket
        .send(Message::Text(status_frame(status, &message).into()))
        .await;
    let _ = socket.send(Message::Close(None)).await;
}

fn event_frame(event: &ProgressEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to encode progress event: {}", e);
            None
        }
    }
}

fn status_frame(status: StatusCode, message: &str) -> String {
    json!({
        "event": "status",
        "data": { "code": status.as_u16(), "message": message },
    })
    .to_string()
}
