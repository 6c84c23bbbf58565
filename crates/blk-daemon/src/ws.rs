//! WebSocket driver session.
//!
//! One session is one fan-out connection. A writer task owns the socket's
//! sink and forwards both fan-out envelopes and direct replies; the reader
//! loop handles `track`, `untrack` and `location_update`. The connection is
//! removed from the fan-out when either side ends, or when the session
//! future itself is dropped.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use blk_fanout::{ConnectionGuard, Fanout};
use blk_schemas::DriverId;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    api_types::{ClientMessage, ServerReply, SessionQuery},
    state::AppState,
};

const REPLY_BUFFER: usize = 32;

pub(crate) async fn upgrade(
    ws: WebSocketUpgrade,
    State(st): State<Arc<AppState>>,
    Query(q): Query<SessionQuery>,
) -> Response {
    let fanout = st.fanout.clone();
    ws.on_upgrade(move |socket| session(socket, fanout, q.driver_id))
}

async fn session(socket: WebSocket, fanout: Arc<Fanout>, driver_id: DriverId) {
    let mut sub = fanout.connect(driver_id);
    let conn_id = sub.conn_id;
    let registration = ConnectionGuard::new(fanout.clone(), conn_id);
    info!(conn_id = %conn_id, driver_id = %driver_id, "ws session opened");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerReply>(REPLY_BUFFER);

    let mut writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                env = sub.rx.recv() => match env {
                    Some(env) => to_text(&env),
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => to_text(&reply),
                    None => break,
                },
            };
            let Some(text) = text else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut reader = {
        let fanout = fanout.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let reply = handle_client_message(&fanout, conn_id, &text);
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    // Pongs are answered by the protocol layer.
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
                    Err(e) => {
                        debug!(conn_id = %conn_id, error = %e, "ws read failed");
                        break;
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    drop(registration);
    info!(conn_id = %conn_id, driver_id = %driver_id, "ws session closed");
}

fn handle_client_message(fanout: &Fanout, conn_id: blk_fanout::ConnId, text: &str) -> ServerReply {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "unparseable client message");
            return ServerReply::Error {
                error: format!("invalid message: {e}"),
            };
        }
    };

    match msg {
        ClientMessage::Track { block_id } => {
            fanout.track(conn_id, block_id);
            ServerReply::Tracking { block_id }
        }
        ClientMessage::Untrack { block_id } => {
            fanout.untrack(conn_id, block_id);
            ServerReply::Untracked { block_id }
        }
        ClientMessage::LocationUpdate {
            claim_id,
            block_id,
            location,
        } => match fanout.relay_location(conn_id, claim_id, block_id, location) {
            Some(delivered) => ServerReply::LocationRelayed { block_id, delivered },
            None => ServerReply::Error {
                error: "connection is no longer registered".to_string(),
            },
        },
    }
}

fn to_text<T: Serialize>(v: &T) -> Option<String> {
    serde_json::to_string(v).ok()
}
