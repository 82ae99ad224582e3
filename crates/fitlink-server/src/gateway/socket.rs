//! WebSocket transport for the gateway.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tracing::{debug, info};

use super::{ClientEvent, Gateway, ServerEvent};
use crate::api::AppState;
use crate::auth::Identity;
use crate::error::{Result, ServerError};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let gateway = state.gateway.clone();
    let auth_timeout = state.config.auth_timeout;
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, params.token, auth_timeout))
}

async fn handle_socket(
    socket: WebSocket,
    gateway: Gateway,
    token: Option<String>,
    auth_timeout: Duration,
) {
    let (mut sink, mut stream) = socket.split();

    let identity = match token {
        Some(token) => gateway.authenticate(&token),
        None => await_authenticate(&mut stream, &gateway, auth_timeout).await,
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            info!(error = %e, "Realtime connection rejected");
            let _ = send_event(&mut sink, &ServerEvent::error(&e)).await;
            let _ = sink.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let (connection_id, mut outbound) = gateway.connect(identity).await;

    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            if send_event(&mut sink, &event).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => gateway.handle(connection_id, event).await,
                    Err(e) => {
                        let err = ServerError::Validation(format!("malformed event: {e}"));
                        gateway.reply_error(connection_id, &err).await;
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %connection_id, error = %e, "Socket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    gateway.disconnect(connection_id).await;
    writer.abort();
}

/// Wait for the first frame, which must be `authenticate`.
async fn await_authenticate(
    stream: &mut SplitStream<WebSocket>,
    gateway: &Gateway,
    auth_timeout: Duration,
) -> Result<Identity> {
    let frame = tokio::time::timeout(auth_timeout, stream.next())
        .await
        .map_err(|_| ServerError::Authentication("timed out waiting for credentials".into()))?;

    match frame {
        Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
            Ok(ClientEvent::Authenticate { token }) => gateway.authenticate(&token),
            _ => Err(ServerError::Authentication(
                "first frame must be authenticate".into(),
            )),
        },
        _ => Err(ServerError::Authentication("connection closed before authentication".into())),
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    event: &ServerEvent,
) -> std::result::Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode event");
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text)).await
}
