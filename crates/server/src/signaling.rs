use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use weir_protocol::{IceServerConfig, RtcEnvelope, WsMessage};

use crate::connection::{
    Connection, ConnectionInfo, Mode, SignalProtocol, infer_mode, parse_medias,
};
use crate::engine::PeerState;
use crate::registry::{SessionRegistry, new_session_id};
use crate::web::AppState;

/// Query parameters shared by the WebSocket and the sync HTTP signaling
/// endpoints. `src` selects a stream to consume, `dst` a stream to
/// publish into.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SessionQuery {
    pub src: Option<String>,
    pub dst: Option<String>,
    pub viewer_id: Option<String>,
    pub paused: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("stream not found")]
    StreamNotFound,
    #[error("invalid offer: {0:#}")]
    OfferInvalid(anyhow::Error),
    #[error("stream rejected connection: {0}")]
    AddConsumerFailed(#[from] crate::streams::StreamError),
    #[error("session id collision")]
    Collision(#[from] crate::registry::SessionIdCollision),
    #[error("engine failure: {0:#}")]
    Engine(anyhow::Error),
}

/// Everything the exchange needs beyond the offer itself.
pub struct ExchangeRequest {
    pub stream_name: String,
    /// `None` lets the exchange classify the role from the offer's media
    /// directions (the sync HTTP path).
    pub mode: Option<Mode>,
    pub viewer_id: String,
    pub start_paused: bool,
    pub client_ip: String,
    pub user_agent: String,
    pub protocol: SignalProtocol,
    pub ice_servers: Option<Vec<IceServerConfig>>,
}

/// The shared offer/answer body behind both signaling channels.
///
/// Resolves the stream, builds the peer and the connection, wires the
/// teardown and candidate callbacks, applies the offer, attaches to the
/// stream, produces the answer and registers the session, in that
/// order, so the session id inside the answer always resolves by the
/// time a client can read it.
pub async fn exchange(
    state: &AppState,
    req: ExchangeRequest,
    sdp: &str,
    candidate_tx: Option<mpsc::UnboundedSender<String>>,
) -> Result<(Arc<Connection>, String), SignalError> {
    let stream = state
        .streams
        .get(&req.stream_name)
        .ok_or(SignalError::StreamNotFound)?;

    let mode = match req.mode {
        Some(mode) => mode,
        None => infer_mode(&parse_medias(sdp).map_err(SignalError::OfferInvalid)?),
    };

    let peer = state
        .engine
        .new_peer(false, req.ice_servers.as_deref())
        .await
        .map_err(SignalError::Engine)?;

    let trickle = req.protocol == SignalProtocol::Ws;
    let conn = Connection::new(
        ConnectionInfo {
            id: state.registry.allocate_id(),
            session_id: new_session_id(),
            viewer_id: req.viewer_id,
            stream_source: req.stream_name.clone(),
            client_ip: req.client_ip,
            user_agent: req.user_agent,
            protocol: req.protocol,
            mode,
            paused: req.start_paused,
        },
        peer,
    );

    // Teardown on the engine's CLOSED report: deregister exactly once and
    // leave the stream. Weak references keep the peer's callback from
    // owning the connection.
    {
        let registry = Arc::clone(&state.registry);
        let stream_weak = Arc::downgrade(&stream);
        let conn_weak = Arc::downgrade(&conn);
        conn.peer().on_connection_state(move |peer_state| {
            if peer_state != PeerState::Closed {
                return;
            }
            let Some(conn) = conn_weak.upgrade() else {
                return;
            };
            if !conn.mark_closed() {
                return;
            }
            registry.unregister(&conn);
            if let Some(stream) = stream_weak.upgrade() {
                match conn.mode() {
                    Mode::PassiveConsumer => stream.remove_consumer(&conn),
                    Mode::PassiveProducer => stream.remove_producer(&conn),
                }
            }
            info!(session_id = %conn.session_id(), "Session closed");
        });
    }

    if let Some(tx) = candidate_tx {
        let engine = Arc::clone(&state.engine);
        conn.peer().on_local_candidate(move |candidate| {
            if engine.filter_candidate(&candidate) {
                let _ = tx.send(candidate);
            } else {
                debug!(candidate, "Local candidate filtered");
            }
        });
    }

    if let Err(e) = conn.set_offer(sdp).await {
        conn.close().await;
        return Err(SignalError::OfferInvalid(e));
    }

    let attached = match conn.mode() {
        Mode::PassiveConsumer => stream.add_consumer(&conn),
        Mode::PassiveProducer => stream.add_producer(&conn),
    };
    if let Err(e) = attached {
        conn.close().await;
        return Err(SignalError::AddConsumerFailed(e));
    }

    let answer = if trickle {
        conn.get_answer().await
    } else {
        conn.get_complete_answer().await
    };
    let answer = match answer {
        Ok(answer) => answer,
        Err(e) => {
            conn.close().await;
            return Err(SignalError::Engine(e));
        }
    };

    if let Err(e) = state.registry.register(Arc::clone(&conn)) {
        conn.close().await;
        return Err(SignalError::Collision(e));
    }

    info!(
        session_id = %conn.session_id(),
        connection_id = conn.id(),
        stream = %conn.stream_source(),
        mode = %conn.mode(),
        protocol = %conn.protocol(),
        user_agent = %conn.user_agent(),
        paused = conn.is_paused(),
        "Session established"
    );

    Ok((conn, answer))
}

/// Handle one signaling WebSocket. The socket carries the offer/answer
/// exchange and trickled candidates; the peer it negotiates outlives the
/// socket, so dropping the socket never tears the session down.
pub async fn handle_ws(
    mut socket: WebSocket,
    query: SessionQuery,
    client_ip: String,
    user_agent: String,
    state: Arc<AppState>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut conn: Option<Arc<Connection>> = None;

    debug!(%client_ip, "Signaling socket connected");

    loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize signaling message: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            result = socket.recv() => {
                let Some(result) = result else { break };
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WsMessage>(&text) {
                        Ok(WsMessage::Webrtc(RtcEnvelope::Offer { sdp, ice_servers })) => {
                            let established = start_exchange(
                                &state, &query, &client_ip, &user_agent,
                                &sdp, ice_servers, true, &out_tx,
                            )
                            .await;
                            if established.is_some() {
                                conn = established;
                            }
                        }
                        Ok(WsMessage::WebrtcOffer(sdp)) => {
                            let established = start_exchange(
                                &state, &query, &client_ip, &user_agent,
                                &sdp, None, false, &out_tx,
                            )
                            .await;
                            if established.is_some() {
                                conn = established;
                            }
                        }
                        Ok(WsMessage::WebrtcCandidate(candidate)) => match &conn {
                            Some(conn) => {
                                if let Err(e) =
                                    conn.peer().add_remote_candidate(&candidate).await
                                {
                                    warn!(
                                        session_id = %conn.session_id(),
                                        "Bad remote candidate: {e:#}"
                                    );
                                }
                            }
                            None => warn!("Candidate before offer, ignoring"),
                        },
                        // The legacy commands deliberately ignore which
                        // transport they arrived on and hit every consumer
                        // in the process.
                        Ok(WsMessage::WebrtcPause) => {
                            let paused = pause_all_consumers(&state.registry);
                            info!(paused, "Global pause command");
                        }
                        Ok(WsMessage::WebrtcResume) => {
                            let resumed = resume_all_consumers(&state.registry);
                            info!(resumed, "Global resume command");
                        }
                        Ok(other) => {
                            debug!(?other, "Ignoring unexpected signaling message");
                        }
                        Err(e) => {
                            warn!("Invalid signaling message: {e}");
                            let _ = out_tx.send(WsMessage::Error(format!("invalid message: {e}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        debug!("Signaling socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    match &conn {
        Some(conn) => debug!(session_id = %conn.session_id(), "Signaling socket closed"),
        None => debug!("Signaling socket closed"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_exchange(
    state: &Arc<AppState>,
    query: &SessionQuery,
    client_ip: &str,
    user_agent: &str,
    sdp: &str,
    ice_servers: Option<Vec<IceServerConfig>>,
    v2: bool,
    out_tx: &mpsc::UnboundedSender<WsMessage>,
) -> Option<Arc<Connection>> {
    let (stream_name, mode) = match (&query.src, &query.dst) {
        (Some(src), _) => (src.clone(), Mode::PassiveConsumer),
        (None, Some(dst)) => (dst.clone(), Mode::PassiveProducer),
        (None, None) => {
            warn!("Signaling request without src or dst");
            let _ = out_tx.send(WsMessage::Error(SignalError::StreamNotFound.to_string()));
            return None;
        }
    };

    let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
    let (latch_tx, latch_rx) = watch::channel(false);
    tokio::spawn(forward_candidates(candidate_rx, latch_rx, out_tx.clone()));

    let req = ExchangeRequest {
        stream_name: stream_name.clone(),
        mode: Some(mode),
        viewer_id: query.viewer_id.clone().unwrap_or_default(),
        start_paused: query.paused.unwrap_or(false),
        client_ip: client_ip.to_string(),
        user_agent: user_agent.to_string(),
        protocol: SignalProtocol::Ws,
        ice_servers,
    };

    match exchange(state, req, sdp, Some(candidate_tx)).await {
        Ok((conn, answer)) => {
            if v2 {
                let _ = out_tx.send(WsMessage::Webrtc(RtcEnvelope::Answer {
                    sdp: answer,
                    session_id: conn.session_id().to_string(),
                }));
            } else {
                let _ = out_tx.send(WsMessage::WebrtcAnswer(answer));
                let _ = out_tx.send(WsMessage::WebrtcSession(conn.session_id().to_string()));
            }
            // Open the latch: pending candidates queue behind the answer.
            let _ = latch_tx.send(true);
            Some(conn)
        }
        Err(e) => {
            match &e {
                SignalError::StreamNotFound => {
                    debug!(stream = %stream_name, "Stream not found")
                }
                SignalError::OfferInvalid(err) => warn!("Rejected offer: {err:#}"),
                SignalError::AddConsumerFailed(err) => {
                    warn!(stream = %stream_name, "Stream rejected connection: {err}")
                }
                SignalError::Collision(_) | SignalError::Engine(_) => {
                    error!(stream = %stream_name, client_ip, "Signaling failed: {e}")
                }
            }
            let _ = out_tx.send(WsMessage::Error(e.to_string()));
            None
        }
    }
}

/// Buffer local candidates until the answer has been queued on the
/// socket, then forward them in arrival order.
async fn forward_candidates(
    mut candidates: mpsc::UnboundedReceiver<String>,
    mut answer_sent: watch::Receiver<bool>,
    out_tx: mpsc::UnboundedSender<WsMessage>,
) {
    if answer_sent.wait_for(|sent| *sent).await.is_err() {
        return;
    }
    while let Some(candidate) = candidates.recv().await {
        if out_tx.send(WsMessage::WebrtcCandidate(candidate)).is_err() {
            break;
        }
    }
}

/// Pause every consumer connection in the process. Producers are never
/// touched by the control plane.
pub fn pause_all_consumers(registry: &SessionRegistry) -> usize {
    let consumers = registry.consumers();
    for conn in &consumers {
        conn.pause();
    }
    consumers.len()
}

/// Resume every consumer connection in the process.
pub fn resume_all_consumers(registry: &SessionRegistry) -> usize {
    let consumers = registry.consumers();
    for conn in &consumers {
        conn.resume();
    }
    consumers.len()
}
