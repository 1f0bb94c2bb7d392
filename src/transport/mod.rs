//! User transport: the browser-facing HTTP/WebSocket surface (§6).
//!
//! Grounded on the teacher's `management.rs` (an `axum::Router` built with a
//! shared `Arc<AppState>`, wrapped in a permissive `CorsLayer` for browser
//! access) generalized from a REST admin surface into a single WebSocket
//! route that drives one `Session` per connection.
//!
//! A connected session is kept in `AppState::sessions`, keyed by codespace
//! name, across WebSocket drops: on disconnect the session enters
//! `ReconnectWait` for a grace window instead of tearing down immediately
//! (§4.6), and a later connection sending `connect_codespace` for the same
//! name reattaches to it rather than dialing SSH again.

pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::ports::PortRegistrySnapshot;
use crate::rpc::HeartbeatCommand;
use crate::session::{Session, SessionHandles, SessionState};
use crate::terminal::{self, InputEvent, OutputEvent};

use schema::{ClientMessage, CodespaceSummary, PortInfo, ServerMessage};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// An established session kept alive across WebSocket reconnects. One
/// instance per connected codespace.
struct LiveSession {
    /// The `Session` whose `establish()` succeeded; owns lifecycle state
    /// publishing and `close()`.
    owner_session: Session,
    handles: SessionHandles,
    heartbeat_tx: mpsc::Sender<HeartbeatCommand>,
    input_tx: mpsc::Sender<InputEvent>,
    output_rx: Mutex<mpsc::Receiver<OutputEvent>>,
    state_rx: tokio::sync::watch::Receiver<SessionState>,
    pipe_task: Mutex<Option<tokio::task::JoinHandle<Result<(), crate::error::BrokerError>>>>,
    /// Set when the transport drops; cleared if a reconnect claims this
    /// session before the grace window elapses.
    reconnect_deadline: Mutex<Option<Instant>>,
}

pub struct AppState {
    pub config: Arc<Config>,
    sessions: Mutex<HashMap<String, Arc<LiveSession>>>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/terminal", get(terminal_ws))
        .with_state(state)
        .layer(cors)
}

async fn terminal_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let first = match ws_rx.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            let _ = send_error(&mut ws_tx, "expected authenticate as first message").await;
            return;
        }
    };

    let token = match serde_json::from_str::<ClientMessage>(&first) {
        Ok(ClientMessage::Authenticate { token }) => token,
        _ => {
            let _ = send_error(&mut ws_tx, "first message must be authenticate").await;
            return;
        }
    };

    let (mut session, state_rx) = Session::new(state.config.clone());
    let success = session.authenticate(token).await.is_ok();
    if send_json(&mut ws_tx, &ServerMessage::Authenticated { success }).await.is_err() {
        return;
    }
    if !success {
        return;
    }

    run_pre_connect(&state, session, state_rx, &mut ws_tx, &mut ws_rx).await;
}

/// Handles everything before a codespace is connected: listing, start/stop,
/// status queries, and the `connect_codespace`/`connect_to_repo_codespace`
/// messages that hand off into `run_streaming`.
async fn run_pre_connect(
    state: &Arc<AppState>,
    session: Session,
    state_rx: tokio::sync::watch::Receiver<SessionState>,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) {
    loop {
        let text = match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("websocket recv error: {}", e);
                return;
            }
        };

        let msg = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed client message: {}", e);
                continue;
            }
        };

        match msg {
            ClientMessage::ListCodespaces => {
                send_codespaces_list(&session, ws_tx).await;
            }
            ClientMessage::StartCodespace { codespace_name } => {
                send_codespace_result(&session.start_codespace(&codespace_name).await, ws_tx).await;
            }
            ClientMessage::StopCodespace { codespace_name } => {
                session.stop_codespace(&codespace_name).await;
                let _ = send_json(
                    ws_tx,
                    &ServerMessage::CodespaceState {
                        codespace_name: Some(codespace_name),
                        state: "ShuttingDown".to_string(),
                        repository_full_name: None,
                        codespace_data: None,
                    },
                )
                .await;
            }
            ClientMessage::QueryCodespaceStatus => {
                let _ = send_error(ws_tx, "no active codespace connection").await;
            }
            ClientMessage::RefreshPorts => {
                let _ = send_json(
                    ws_tx,
                    &ServerMessage::PortUpdate {
                        port_count: 0,
                        ports: vec![],
                        timestamp: chrono::Utc::now().timestamp(),
                    },
                )
                .await;
            }
            ClientMessage::GetPortInfo => {
                let _ = send_json(ws_tx, &ServerMessage::PortInfoResponse { port_info: None }).await;
            }
            ClientMessage::ConnectCodespace { codespace_name, .. } => {
                connect_and_drive(state, session, state_rx, codespace_name, ws_tx, ws_rx).await;
                return;
            }
            ClientMessage::ConnectToRepoCodespace { repo_url } => {
                match session.list_codespaces().await {
                    Ok(list) => match list.into_iter().find(|c| c.repository_full_name.as_deref() == Some(repo_url.as_str())) {
                        Some(codespace) => {
                            connect_and_drive(state, session, state_rx, codespace.name, ws_tx, ws_rx).await;
                            return;
                        }
                        None => {
                            let _ = send_error(ws_tx, &format!("no codespace found for repo {}", repo_url)).await;
                        }
                    },
                    Err(e) => {
                        let _ = send_error(ws_tx, &e.to_string()).await;
                    }
                }
            }
            ClientMessage::DisconnectCodespace
            | ClientMessage::Input { .. }
            | ClientMessage::Resize { .. } => {
                // Nothing connected yet; ignored.
            }
            ClientMessage::Authenticate { .. } => {
                // Already authenticated on this connection.
            }
        }
    }
}

async fn send_codespaces_list(session: &Session, ws_tx: &mut WsSink) {
    match session.list_codespaces().await {
        Ok(list) => {
            let data = list.iter().map(CodespaceSummary::from).collect();
            let _ = send_json(ws_tx, &ServerMessage::CodespacesList { data }).await;
        }
        Err(e) => {
            let _ = send_error(ws_tx, &e.to_string()).await;
        }
    }
}

async fn send_codespace_result(
    result: &Result<crate::provider::Codespace, crate::error::BrokerError>,
    ws_tx: &mut WsSink,
) {
    match result {
        Ok(codespace) => {
            let _ = send_json(
                ws_tx,
                &ServerMessage::CodespaceState {
                    codespace_name: Some(codespace.name.clone()),
                    state: codespace.state.clone(),
                    repository_full_name: codespace.repository_full_name.clone(),
                    codespace_data: Some(CodespaceSummary::from(codespace)),
                },
            )
            .await;
        }
        Err(e) => {
            let _ = send_error(ws_tx, &e.to_string()).await;
        }
    }
}

/// Maps the internal lifecycle phase to the provider-facing `codespace_state`
/// vocabulary (§6), since the two enums describe different things: ours is
/// the session's own progress, the wire one is what the browser renders.
fn codespace_state_label(state: &SessionState) -> &'static str {
    match state {
        SessionState::Idle | SessionState::Authenticated | SessionState::Listing => "Queued",
        SessionState::Acquiring
        | SessionState::RelayConnecting
        | SessionState::Discovering
        | SessionState::Provisioning
        | SessionState::SshDialing => "Starting",
        SessionState::Streaming => "Connected",
        SessionState::ReconnectWait => "Disconnected",
        SessionState::Closing => "ShuttingDown",
        SessionState::Closed => "Shutdown",
        SessionState::Failed(_) => "Failed",
    }
}

/// Reattach to an already-live session for `codespace_name`, if one exists
/// and is still registered (whether actively streamed or in its reconnect
/// grace window).
async fn try_reattach(state: &Arc<AppState>, codespace_name: &str) -> Option<Arc<LiveSession>> {
    let live = state.sessions.lock().await.get(codespace_name).cloned()?;
    *live.reconnect_deadline.lock().await = None;
    let _ = live.heartbeat_tx.send(HeartbeatCommand::MarkReconnected).await;
    live.owner_session.mark_reconnected();
    info!("reattached to live session for {}", codespace_name);
    Some(live)
}

/// Either reattaches to an existing session or runs `Session::establish`
/// while forwarding intermediate `codespace_state` updates to the browser,
/// then drives the connected streaming loop until the connection ends.
async fn connect_and_drive(
    state: &Arc<AppState>,
    session: Session,
    state_rx: tokio::sync::watch::Receiver<SessionState>,
    codespace_name: String,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) {
    if let Some(live) = try_reattach(state, &codespace_name).await {
        run_streaming(state, &session, &codespace_name, live, ws_tx, ws_rx).await;
        return;
    }

    let mut watch_rx = state_rx;
    let established = {
        let establish_fut = session.establish(&codespace_name, state.config.user_public_key_override.clone());
        tokio::pin!(establish_fut);

        loop {
            tokio::select! {
                biased;
                result = &mut establish_fut => break result,
                changed = watch_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let current = watch_rx.borrow().clone();
                    let _ = send_json(
                        ws_tx,
                        &ServerMessage::CodespaceState {
                            codespace_name: Some(codespace_name.clone()),
                            state: codespace_state_label(&current).to_string(),
                            repository_full_name: None,
                            codespace_data: None,
                        },
                    )
                    .await;
                }
            }
        }
    };

    let (handles, heartbeat_tx) = match established {
        Ok(pair) => pair,
        Err(e) => {
            warn!("establish failed for {}: {}", codespace_name, e);
            let _ = send_error(ws_tx, &e.to_string()).await;
            return;
        }
    };

    let keypair = match handles.keys.get(&handles.session_id).await {
        Some(k) => k,
        None => {
            let _ = send_error(ws_tx, "keypair vanished before dial").await;
            return;
        }
    };

    let ssh_session = match terminal::dial(&handles.ssh_addr, &handles.ssh_user, &keypair).await {
        Ok(s) => s,
        Err(e) => {
            let _ = send_error(ws_tx, &e.to_string()).await;
            session.close(&handles, heartbeat_tx).await;
            return;
        }
    };

    let (input_tx, input_rx) = mpsc::channel::<InputEvent>(64);
    let (output_tx, output_rx) = mpsc::channel::<OutputEvent>(64);
    let pipe_task = tokio::spawn(terminal::run(ssh_session, 80, 24, input_rx, output_tx));

    let live = Arc::new(LiveSession {
        owner_session: session,
        handles,
        heartbeat_tx,
        input_tx,
        output_rx: Mutex::new(output_rx),
        state_rx: watch_rx,
        pipe_task: Mutex::new(Some(pipe_task)),
        reconnect_deadline: Mutex::new(None),
    });
    state.sessions.lock().await.insert(codespace_name.clone(), live.clone());

    run_streaming(state, &live.owner_session, &codespace_name, live.clone(), ws_tx, ws_rx).await;
}

/// Drives the connected phase: forwards SSH output and lifecycle state to
/// the browser, and browser input/commands to the session, until the
/// websocket drops or the browser explicitly disconnects.
async fn run_streaming(
    state: &Arc<AppState>,
    session: &Session,
    codespace_name: &str,
    live: Arc<LiveSession>,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) {
    let mut state_rx = live.state_rx.clone();
    let mut output_guard = live.output_rx.lock().await;

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state_rx.borrow().clone();
                let terminal = matches!(current, SessionState::Closed | SessionState::Failed(_));
                let _ = send_json(
                    ws_tx,
                    &ServerMessage::CodespaceState {
                        codespace_name: Some(codespace_name.to_string()),
                        state: codespace_state_label(&current).to_string(),
                        repository_full_name: None,
                        codespace_data: None,
                    },
                )
                .await;
                if terminal {
                    break;
                }
            }
            output = output_guard.recv() => {
                match output {
                    Some(OutputEvent::Data(bytes)) => {
                        let encoded = String::from_utf8_lossy(&bytes).to_string();
                        if send_json(ws_tx, &ServerMessage::Output { data: encoded }).await.is_err() {
                            break;
                        }
                    }
                    Some(OutputEvent::Closed { summary }) => {
                        if let Some(text) = summary {
                            let _ = send_json(ws_tx, &ServerMessage::Output { data: text }).await;
                        }
                        let _ = send_json(ws_tx, &ServerMessage::DisconnectedFromCodespace).await;
                        break;
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Input { data }) => {
                                let _ = live.input_tx.send(InputEvent::Data(data.into_bytes())).await;
                            }
                            Ok(ClientMessage::Resize { cols, rows }) => {
                                // §4.7 boundary: cols/rows must be in [1, 1000].
                                if cols == 0 || rows == 0 || cols > 1000 || rows > 1000 {
                                    continue;
                                }
                                let _ = live.input_tx.send(InputEvent::Resize { cols, rows }).await;
                            }
                            Ok(ClientMessage::DisconnectCodespace) => {
                                drop(output_guard);
                                finalize_close(state, codespace_name, &live).await;
                                let _ = send_json(ws_tx, &ServerMessage::DisconnectedFromCodespace).await;
                                return;
                            }
                            Ok(ClientMessage::RefreshPorts) => {
                                let snapshot = live.handles.registry.snapshot().await;
                                send_port_update(ws_tx, &snapshot).await;
                            }
                            Ok(ClientMessage::GetPortInfo) => {
                                let snapshot = live.handles.registry.snapshot().await;
                                let info = snapshot.ssh.as_ref().map(PortInfo::from);
                                let _ = send_json(ws_tx, &ServerMessage::PortInfoResponse { port_info: info }).await;
                            }
                            Ok(ClientMessage::QueryCodespaceStatus) => {
                                send_codespace_result(&session.get_codespace(codespace_name).await, ws_tx).await;
                            }
                            Ok(_) => {}
                            Err(e) => warn!("malformed client message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("websocket recv error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    drop(output_guard);
    enter_reconnect_wait(state, codespace_name, live).await;
}

async fn send_port_update(ws_tx: &mut WsSink, snapshot: &PortRegistrySnapshot) {
    let ports: Vec<PortInfo> = snapshot
        .rpc
        .iter()
        .chain(snapshot.ssh.iter())
        .chain(snapshot.user.iter())
        .chain(snapshot.management.iter())
        .map(PortInfo::from)
        .collect();
    let _ = send_json(
        ws_tx,
        &ServerMessage::PortUpdate {
            port_count: ports.len(),
            ports,
            timestamp: chrono::Utc::now().timestamp(),
        },
    )
    .await;
}

/// Transport dropped without an explicit disconnect: enter `ReconnectWait`
/// and arm a grace timer. If nothing reattaches before it elapses, finalize
/// the teardown (§4.6 Testable scenario 4).
async fn enter_reconnect_wait(state: &Arc<AppState>, codespace_name: &str, live: Arc<LiveSession>) {
    live.owner_session.mark_transport_dropped();
    let grace = state.config.rpc_session_keepalive;
    let deadline = Instant::now() + grace;
    *live.reconnect_deadline.lock().await = Some(deadline);
    info!(
        "session for {} entered reconnect wait ({}s grace)",
        codespace_name,
        grace.as_secs()
    );

    let state = state.clone();
    let codespace_name = codespace_name.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let still_pending = matches!(*live.reconnect_deadline.lock().await, Some(d) if d == deadline);
        if still_pending {
            finalize_close(&state, &codespace_name, &live).await;
        }
    });
}

/// Removes the session from the registry and tears it all the way down.
/// Safe to call more than once; only the first call does anything.
async fn finalize_close(state: &Arc<AppState>, codespace_name: &str, live: &Arc<LiveSession>) {
    let removed = state.sessions.lock().await.remove(codespace_name).is_some();
    if !removed {
        return;
    }
    if let Some(task) = live.pipe_task.lock().await.take() {
        task.abort();
    }
    live.owner_session.close(&live.handles, live.heartbeat_tx.clone()).await;
    info!("session for {} closed", codespace_name);
}

async fn send_json(ws_tx: &mut WsSink, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_default();
    ws_tx.send(Message::Text(text.into())).await
}

async fn send_error(ws_tx: &mut WsSink, message: &str) -> Result<(), axum::Error> {
    send_json(ws_tx, &ServerMessage::Error { message: message.to_string() }).await
}
