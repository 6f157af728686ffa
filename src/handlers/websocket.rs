use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::constants::{CLOSE_INTERNAL_ERROR, WS_PATH};
use crate::core::connection::CloseReason;
use crate::core::identity::Identity;
use crate::core::message::Rejection;
use crate::core::supervisor::{ConnectOutcome, LifecycleSupervisor, MessageVerdict};

/// Shared state for the websocket routes
#[derive(Clone)]
pub struct WsContext {
    pub supervisor: LifecycleSupervisor,
    /// Close connections that send nothing (not even a ping) for this long
    pub idle_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    user_id: Option<i64>,
}

/// `GET /ws/{room_id}?user_id=N` upgraded to a websocket
pub fn ws_routes(
    ctx: WsContext,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path(WS_PATH)
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::query::<ConnectParams>())
        .and(warp::addr::remote())
        .and(warp::ws())
        .and(with_context(ctx))
        .map(
            |room_id: String,
             params: ConnectParams,
             remote: Option<SocketAddr>,
             ws: warp::ws::Ws,
             ctx: WsContext| {
                let ip = remote.map(|addr| addr.ip().to_string()).unwrap_or_default();
                debug!("Upgrade request for room {} from {}", room_id, ip);
                ws.on_upgrade(move |socket| {
                    handle_ws_client(socket, ctx, room_id, params.user_id, ip)
                })
            },
        )
}

fn with_context(ctx: WsContext) -> impl Filter<Extract = (WsContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

// Handle a WebSocket connection
pub async fn handle_ws_client(
    ws: WebSocket,
    ctx: WsContext,
    room_id: String,
    user_id: Option<i64>,
    ip_address: String,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Spawn a task to forward messages from our channel to the WebSocket
    let writer = tokio::task::spawn(async move {
        let mut rx = rx;
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_tx.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let identity = match Identity::new(user_id, ip_address) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Refusing connection to room {}: {}", room_id, e);
            let _ = tx.send(Message::close_with(CLOSE_INTERNAL_ERROR, "invalid identity"));
            finish(tx, writer).await;
            return;
        }
    };

    let handle = match ctx.supervisor.on_connect(identity, &room_id).await {
        Ok(ConnectOutcome::Proceed(handle)) => handle,
        Ok(ConnectOutcome::Deny(rejection)) => {
            send_rejection(&tx, &rejection);
            finish(tx, writer).await;
            return;
        }
        Err(e) => {
            error!("Admission failed for room {}: {}", room_id, e);
            let _ = tx.send(Message::close_with(CLOSE_INTERNAL_ERROR, "internal error"));
            finish(tx, writer).await;
            return;
        }
    };

    info!("Client {} joined room {}", handle.id(), room_id);

    let reason = loop {
        let next = match tokio::time::timeout(ctx.idle_timeout, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!("Client {} idle for {:?}, closing", handle.id(), ctx.idle_timeout);
                let _ = tx.send(Message::close());
                break CloseReason::Timeout;
            }
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!("WebSocket error on {}: {}", handle.id(), e);
                break CloseReason::ProtocolError;
            }
            None => break CloseReason::Graceful,
        };

        if msg.is_close() {
            break CloseReason::Graceful;
        }
        if msg.is_ping() || msg.is_pong() {
            ctx.supervisor.heartbeat(&handle);
            continue;
        }

        match ctx.supervisor.on_message(&handle, msg.as_bytes()).await {
            Ok(MessageVerdict::Proceed) => {
                // Room fan-out belongs to the application; echo back to the sender
                if tx.send(msg).is_err() {
                    break CloseReason::ProtocolError;
                }
            }
            Ok(MessageVerdict::Deny(rejection)) => {
                send_rejection(&tx, &rejection);
                break CloseReason::Enforcement(rejection.reason);
            }
            Err(e) => {
                error!("Message check failed on {}: {}", handle.id(), e);
                let _ = tx.send(Message::close_with(CLOSE_INTERNAL_ERROR, "internal error"));
                break CloseReason::ProtocolError;
            }
        }
    };

    let connection_id = handle.id().to_string();
    ctx.supervisor.on_close(handle, reason).await;
    info!("Client {} disconnected ({})", connection_id, reason);

    finish(tx, writer).await;
}

/// Send the JSON rejection body followed by the matching close frame
fn send_rejection(tx: &mpsc::UnboundedSender<Message>, rejection: &Rejection) {
    match rejection.to_json() {
        Ok(body) => {
            let _ = tx.send(Message::text(body));
        }
        Err(e) => error!("Failed to serialize rejection: {}", e),
    }
    let _ = tx.send(Message::close_with(rejection.close_code, rejection.message.clone()));
}

async fn finish(tx: mpsc::UnboundedSender<Message>, writer: tokio::task::JoinHandle<()>) {
    drop(tx);
    if let Err(e) = writer.await {
        error!("WebSocket writer task failed: {}", e);
    }
}
