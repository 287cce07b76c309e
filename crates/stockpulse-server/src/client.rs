use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use stockpulse_core::SubscriberId;

use crate::broadcast::Broadcaster;

/// Pump a subscriber's queue onto its WebSocket until either side goes away.
///
/// The writer forwards queued change messages and pings every `heartbeat`.
/// The reader only watches for the close. Whichever finishes first ends the
/// connection, and the subscriber leaves the live set.
pub async fn handle_ws_connection(
    socket: WebSocket,
    subscriber_id: SubscriberId,
    mut rx: mpsc::Receiver<String>,
    broadcaster: Arc<Broadcaster>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = subscriber_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Dropped from the live set, e.g. after a failed send.
                    None => {
                        let _ = ws_tx
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: axum::extract::ws::close_code::AWAY,
                                reason: "unsubscribed".into(),
                            })))
                            .await;
                        break;
                    }
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(subscriber_id = %writer_id, "sent ping");
                }
            }
        }
    });

    let reader_id = subscriber_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Close(_) => break,
                WsMessage::Text(text) => {
                    debug!(subscriber_id = %reader_id, len = text.as_str().len(), "ignoring inbound text");
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    broadcaster.disconnect(&subscriber_id);
    info!(subscriber_id = %subscriber_id, "websocket closed");
}
