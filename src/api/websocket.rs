use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::protocol::ClientMessage;
use crate::relay::{RelayServer, SignalingHandler};

pub async fn handle_signaling_websocket(websocket: WebSocket, server: Arc<RelayServer>) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut handler = SignalingHandler::new(server, tx);
    let connection_id = handler.connection_id();
    tracing::info!(connection_id, "Signaling connection established");

    // Single writer task keeps per-socket send order.
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::debug!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                if message.is_close() {
                    break;
                }
                handle_websocket_message(&mut handler, message).await;
            }
            Err(e) => {
                tracing::warn!(connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    handler.cleanup().await;
    sender_task.abort();
    tracing::info!(connection_id, "Signaling connection closed");
}

async fn handle_websocket_message(handler: &mut SignalingHandler, message: Message) {
    let Ok(text) = message.to_str() else {
        return;
    };

    tracing::trace!(raw_message = %text, "Received signaling frame");

    match ClientMessage::parse(text) {
        Ok(message) => handler.handle_message(message).await,
        Err(e) => {
            // Malformed frames are dropped, the connection stays up.
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse signaling message"
            );
        }
    }
}
