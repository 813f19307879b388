//! WebSocket server handler using Axum.
//!
//! Connection lifecycle: upgrade, credential handshake (first frame must be
//! `authenticate`), attach to the broadcast hub, then command dispatch until
//! the peer goes away. Disconnection unsubscribes the connection from every
//! joined auction and announces the departures.

use crate::auth::{AuthThrottle, Identity, Verifier};
use crate::client::{spawn_event_pump, ClientSession};
use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use common::model::{RejectReason, Rejection};
use common::money::is_valid_amount;
use engine::{AuctionEvent, AuctionRegistry, BroadcastHub};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub registry: Arc<AuctionRegistry>,
    pub hub: BroadcastHub,
    pub verifier: Verifier,
    pub throttle: AuthThrottle,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","connections":{},"subscriptions":{},"liveLanes":{}}}"#,
        state.hub.connection_count(),
        state.hub.subscription_count(),
        state.registry.lane_count()
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Handle a WebSocket connection end to end.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single outbound channel per connection; one task drains it into the
    // socket so ordering is preserved across direct replies and broadcasts.
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let identity = match authenticate(&state, &mut ws_rx, &msg_tx, addr).await {
        Some(identity) => identity,
        None => {
            counter!("gateway_auth_failures_total").increment(1);
            drop(msg_tx);
            let _ = send_task.await;
            return;
        }
    };

    // Attach to the hub; broadcast frames flow through their own channel and
    // merge into the outbound queue.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<String>();
    let connection_id = state
        .hub
        .attach(identity.user_id, &identity.username, event_tx);
    let pump_task = spawn_event_pump(event_rx, msg_tx.clone());

    let session = ClientSession::new(identity, connection_id, msg_tx.clone());
    let _ = session.send(&ServerMessage::Authenticated {
        user_id: session.identity.user_id,
        username: session.identity.username.clone(),
    });

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.hub.connection_count() as f64);
    info!(
        "user {} connected as {}",
        session.identity.username, connection_id
    );

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => match handle_message(&state, &session, msg).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            warn!("error handling message from {}: {}", connection_id, e);
                            let _ = session.send(&ServerMessage::Error {
                                message: e.to_string(),
                            });
                        }
                    },
                    Some(Err(e)) => {
                        warn!("websocket error for {}: {}", connection_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                // A dead peer fails here and the connection unwinds.
                if msg_tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    if let Some(detached) = state.hub.detach(&connection_id) {
        for auction_id in detached.joined {
            state.hub.publish(
                auction_id,
                AuctionEvent::PeerLeft {
                    auction_id,
                    user_id: detached.user_id,
                    username: detached.username.clone(),
                    seq: 0,
                },
            );
        }
    }
    pump_task.abort();
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.hub.connection_count() as f64);
    info!(
        "user {} disconnected ({})",
        session.identity.username, connection_id
    );
}

/// Consume the credential handshake: the first data frame must be an
/// `authenticate` command carrying a verifiable token.
async fn authenticate(
    state: &Arc<AppState>,
    ws_rx: &mut SplitStream<WebSocket>,
    msg_tx: &mpsc::UnboundedSender<Message>,
    addr: SocketAddr,
) -> Option<Identity> {
    if state.throttle.is_locked(addr.ip()) {
        send_error(msg_tx, "auth_failed: too many failures, try again later");
        return None;
    }

    let token = match timeout(AUTH_TIMEOUT, first_token(ws_rx, msg_tx)).await {
        Ok(Some(token)) => token,
        _ => {
            send_error(msg_tx, "auth_failed: expected authenticate message");
            return None;
        }
    };

    match state.verifier.verify(&token).await {
        Ok(identity) => {
            state.throttle.record_success(addr.ip());
            Some(identity)
        }
        Err(e) => {
            warn!("authentication failed for {}: {}", addr, e);
            state.throttle.record_failure(addr.ip());
            send_error(msg_tx, &format!("auth_failed: {}", e));
            None
        }
    }
}

/// Read frames until the first data frame; answer pings along the way.
async fn first_token(
    ws_rx: &mut SplitStream<WebSocket>,
    msg_tx: &mpsc::UnboundedSender<Message>,
) -> Option<String> {
    while let Some(Ok(msg)) = ws_rx.next().await {
        let parsed = match msg {
            Message::Text(text) => serde_json::from_str::<ClientMessage>(&text).ok(),
            Message::Binary(data) => serde_json::from_slice::<ClientMessage>(&data).ok(),
            Message::Ping(data) => {
                let _ = msg_tx.send(Message::Pong(data));
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(_) => return None,
        };
        return match parsed {
            Some(ClientMessage::Authenticate { token }) => Some(token),
            _ => None,
        };
    }
    None
}

fn send_error(msg_tx: &mpsc::UnboundedSender<Message>, message: &str) {
    if let Ok(json) = serde_json::to_string(&ServerMessage::Error {
        message: message.to_string(),
    }) {
        let _ = msg_tx.send(Message::Text(json.into()));
    }
}

/// Handle a single WebSocket message. Returns `false` when the connection
/// should close.
async fn handle_message(
    state: &Arc<AppState>,
    session: &ClientSession,
    msg: Message,
) -> Result<bool> {
    match msg {
        Message::Text(text) => {
            let cmd: ClientMessage = serde_json::from_str(&text)?;
            handle_command(state, session, cmd).await?;
            Ok(true)
        }
        Message::Binary(data) => {
            let cmd: ClientMessage = serde_json::from_slice(&data)?;
            handle_command(state, session, cmd).await?;
            Ok(true)
        }
        Message::Ping(data) => {
            session.send_frame(Message::Pong(data))?;
            Ok(true)
        }
        Message::Pong(_) => Ok(true),
        Message::Close(_) => Ok(false),
    }
}

/// Dispatch a parsed command. Every command carries the session's verified
/// identity; client-supplied identity fields do not exist in the protocol.
async fn handle_command(
    state: &Arc<AppState>,
    session: &ClientSession,
    cmd: ClientMessage,
) -> Result<()> {
    match cmd {
        ClientMessage::Authenticate { .. } => session.send(&ServerMessage::Error {
            message: "already authenticated".to_string(),
        }),

        ClientMessage::JoinAuction { auction_id } => {
            handle_join(state, session, auction_id).await
        }

        ClientMessage::LeaveAuction { auction_id } => {
            if state.hub.leave(&session.connection_id, auction_id) {
                state.hub.publish(
                    auction_id,
                    AuctionEvent::PeerLeft {
                        auction_id,
                        user_id: session.identity.user_id,
                        username: session.identity.username.clone(),
                        seq: 0,
                    },
                );
            }
            Ok(())
        }

        ClientMessage::PlaceBid { auction_id, amount } => {
            counter!("gateway_bids_received_total").increment(1);
            if !is_valid_amount(amount) {
                return send_bid_rejected(
                    session,
                    auction_id,
                    Rejection::new(RejectReason::InvalidAmount),
                );
            }
            let lane = match state.registry.lane(auction_id).await {
                Ok(lane) => lane,
                Err(rejection) => return send_bid_rejected(session, auction_id, rejection),
            };
            match lane.place_bid(session.identity.user_id, amount).await {
                // Accepted bids surface to everyone (bidder included) as a
                // broadcast `new_bid`; no directed acknowledgement.
                Ok(_) => Ok(()),
                Err(rejection) => send_bid_rejected(session, auction_id, rejection),
            }
        }

        ClientMessage::SetProxy {
            auction_id,
            max_amount,
        } => {
            if !is_valid_amount(max_amount) {
                return send_proxy_rejected(
                    session,
                    auction_id,
                    Rejection::new(RejectReason::InvalidAmount),
                );
            }
            let lane = match state.registry.lane(auction_id).await {
                Ok(lane) => lane,
                Err(rejection) => return send_proxy_rejected(session, auction_id, rejection),
            };
            match lane.set_proxy(session.identity.user_id, max_amount).await {
                Ok(receipt) => session.send(&ServerMessage::ProxySet {
                    auction_id,
                    max_amount: receipt.max_amount,
                }),
                Err(rejection) => send_proxy_rejected(session, auction_id, rejection),
            }
        }

        ClientMessage::CancelProxy { auction_id } => {
            let lane = match state.registry.lane(auction_id).await {
                Ok(lane) => lane,
                Err(rejection) => return send_proxy_rejected(session, auction_id, rejection),
            };
            match lane.cancel_proxy(session.identity.user_id).await {
                Ok(()) => session.send(&ServerMessage::ProxyCancelled { auction_id }),
                Err(rejection) => send_proxy_rejected(session, auction_id, rejection),
            }
        }
    }
}

/// Join: subscribe first, then snapshot, so the client may see a duplicate
/// event at or below `lastSeq` but never a gap.
async fn handle_join(
    state: &Arc<AppState>,
    session: &ClientSession,
    auction_id: i64,
) -> Result<()> {
    if state.hub.join(&session.connection_id, auction_id).is_none() {
        return Err(crate::error::GatewayError::Internal(
            "connection not attached".to_string(),
        ));
    }

    match state.registry.view(auction_id).await {
        Ok(view) => {
            let (state_msg, history_msg) = ServerMessage::snapshot_pair(&view);
            session.send(&state_msg)?;
            session.send(&history_msg)?;
            state.hub.publish(
                auction_id,
                AuctionEvent::PeerJoined {
                    auction_id,
                    user_id: session.identity.user_id,
                    username: session.identity.username.clone(),
                    seq: 0,
                },
            );
            counter!("gateway_joins_total").increment(1);
            Ok(())
        }
        Err(rejection) => {
            state.hub.leave(&session.connection_id, auction_id);
            session.send(&ServerMessage::Error {
                message: rejection.reason.to_string(),
            })
        }
    }
}

fn send_bid_rejected(
    session: &ClientSession,
    auction_id: i64,
    rejection: Rejection,
) -> Result<()> {
    counter!("gateway_bids_rejected_total").increment(1);
    session.send(&ServerMessage::BidRejected {
        auction_id,
        reason: rejection.reason,
        minimum_bid: rejection.minimum,
    })
}

fn send_proxy_rejected(
    session: &ClientSession,
    auction_id: i64,
    rejection: Rejection,
) -> Result<()> {
    session.send(&ServerMessage::ProxyRejected {
        auction_id,
        reason: rejection.reason,
        minimum: rejection.minimum,
    })
}
