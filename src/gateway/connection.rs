//! Per-connection lifecycle
//!
//! One task per socket: a select loop over the inbound WebSocket stream and
//! the connection's outbound queue. Binary frames are discarded (the
//! protocol is text-only), transport hiccups keep the connection open while
//! the socket still reads, and a close tears down the bound session.

use super::{handlers, Gateway};
use crate::protocol;
use crate::state::UiEvent;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

pub(crate) async fn handle_socket<S>(gateway: Arc<Gateway>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::warn!(peer = %peer, error = %err, "WebSocket handshake failed");
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let _ = gateway.state.ui_events.send(UiEvent::ClientConnected);
    tracing::info!(connection_id = %connection_id, peer = %peer, "Client connected");

    let (mut sink, mut inbound) = ws.split();

    loop {
        tokio::select! {
            queued = outbound_rx.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            tracing::warn!(connection_id = %connection_id, error = %err, "Send failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = inbound.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&gateway, connection_id, &outbound_tx, text).await;
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        // Text-only protocol
                        tracing::debug!(connection_id = %connection_id, bytes = payload.len(), "Binary frame discarded");
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = outbound_tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(connection_id = %connection_id, "Client closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        if transport_is_dead(&err) {
                            tracing::warn!(connection_id = %connection_id, error = %err, "Connection lost");
                            break;
                        }
                        // Frame-level noise; the socket still reads
                        tracing::warn!(connection_id = %connection_id, error = %err, "Frame error");
                    }
                    None => break,
                }
            }
        }
    }

    gateway.on_disconnect(connection_id).await;
    tracing::info!(connection_id = %connection_id, "Connection closed");
}

async fn handle_text(
    gateway: &Arc<Gateway>,
    connection_id: Uuid,
    outbound: &super::Outbound,
    text: String,
) {
    // Legacy wake-up frame: surface upward, never answer
    if text == protocol::LEGACY_WAKEUP {
        tracing::debug!(connection_id = %connection_id, "Legacy wake-up frame");
        let _ = gateway.state.ui_events.send(UiEvent::WakeUp);
        return;
    }

    match protocol::decode(&text) {
        Ok(request) => {
            handlers::dispatch(gateway, connection_id, outbound, request).await;
        }
        Err(decode_err) => {
            tracing::debug!(connection_id = %connection_id, reason = %decode_err.reason, "Undecodable frame");
            let request_id = decode_err.request_id.unwrap_or_default();
            let err = crate::error::Error::InvalidRequest(decode_err.reason);
            let frame = protocol::error_frame("unknown", &request_id, &err);
            super::send_frame(outbound, &frame);
        }
    }
}

fn transport_is_dead(err: &tungstenite::Error) -> bool {
    !matches!(
        err,
        tungstenite::Error::Protocol(_) | tungstenite::Error::Utf8
    )
}
