//! The relay client: SSH-over-WebSocket transport to the workspace.
//!
//! Grounded directly on the real Microsoft dev-tunnels Rust SDK
//! (`other_examples/..._host_relay.rs.rs`): the relay is a WebSocket carrying
//! an SSH session. That reference implements the *host* role (the workspace
//! side, which registers `tcpip-forward` requests upstream). This broker
//! plays the *viewing client* role: once connected, it opens `direct-tcpip`
//! channels toward ports the workspace side has already forwarded, and binds
//! each to a local TCP listener — the "forwarding-service listeners" table
//! Port Discovery strategy 3 reads (spec §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use russh::client::{self, Handle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::ports::{RelayPortSource, TunnelPortEntry};

/// Opaque inputs obtained from the workspace provider (§3).
#[derive(Debug, Clone)]
pub struct TunnelProperties {
    pub tunnel_id: String,
    pub cluster_id: String,
    pub connect_token: String,
    pub manage_token: String,
    pub service_uri: String,
    pub domain: String,
}

type ListenerMap = HashMap<u16, u16>;

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The relay's own transport (TLS over the WebSocket) provides the
        // security boundary; the SSH layer underneath is multiplexing only,
        // matching the dev-tunnels reference's "none" kex/cipher convention.
        Ok(true)
    }
}

/// A live connection to the relay. Owned exclusively by the Session State
/// Machine (C6); C3/C4/C5 receive a non-owning `Arc<RelayHandle>` and must
/// not dispose it (spec §5).
pub struct RelayHandle {
    host_id: Uuid,
    session: Arc<Handle<ClientHandler>>,
    listeners_tx: watch::Sender<ListenerMap>,
    listeners_rx: watch::Receiver<ListenerMap>,
    diagnostic_tx: broadcast::Sender<String>,
    tunnel_ports: Vec<TunnelPortEntry>,
    closed: Mutex<bool>,
}

impl RelayHandle {
    /// Connect to the relay named by `properties`, authenticating with its
    /// connect token. `tunnel_ports` comes from the codespace object's
    /// embedded port array (strategy 1 in §4.3).
    pub async fn connect(
        properties: &TunnelProperties,
        tunnel_ports: Vec<TunnelPortEntry>,
    ) -> Result<Self, BrokerError> {
        let mut request = properties
            .service_uri
            .as_str()
            .into_client_request()
            .map_err(|e| BrokerError::Relay(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("tunnel-relay-client"),
        );
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("tunnel {}", properties.connect_token))
                .map_err(|e| BrokerError::Relay(e.to_string()))?,
        );

        let (ws, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BrokerError::Relay(format!("websocket connect failed: {}", e)))?;

        let diagnostic_tx = broadcast::channel(256).0;
        emit(&diagnostic_tx, "connecting to relay websocket");

        let io = bridge_websocket(ws, diagnostic_tx.clone());

        let config = Arc::new(client::Config {
            ..Default::default()
        });
        let session = Arc::new(
            client::connect_stream(config, io, ClientHandler)
                .await
                .map_err(|e| BrokerError::Relay(format!("ssh handshake over relay failed: {}", e)))?,
        );

        emit(&diagnostic_tx, "relay ssh session established");

        let (listeners_tx, listeners_rx) = watch::channel(HashMap::new());

        Ok(Self {
            host_id: Uuid::new_v4(),
            session,
            listeners_tx,
            listeners_rx,
            diagnostic_tx,
            tunnel_ports,
            closed: Mutex::new(false),
        })
    }

    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    /// Subscribe to the relay's free-form diagnostic stream, for the Trace
    /// Tap (§4.4). Detaching is simply dropping the receiver; the sender
    /// outlives any number of taps.
    pub fn diagnostic_stream(&self) -> broadcast::Receiver<String> {
        self.diagnostic_tx.subscribe()
    }

    /// Ensure a local listener is forwarding `remote_port`, creating one on
    /// demand if none exists yet. Returns the local port.
    pub async fn ensure_forwarded(&self, remote_port: u16) -> Result<u16, BrokerError> {
        if let Some(local) = self.listeners_rx.borrow().iter().find_map(|(l, r)| {
            if *r == remote_port {
                Some(*l)
            } else {
                None
            }
        }) {
            return Ok(local);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_port = listener.local_addr()?.port();

        self.listeners_tx.send_modify(|m| {
            m.insert(local_port, remote_port);
        });
        emit(
            &self.diagnostic_tx,
            &format!("Listening on port {} forwarding to host port {}", local_port, remote_port),
        );

        let session = self.session.clone();
        let diagnostic_tx = self.diagnostic_tx.clone();
        let listeners_tx = self.listeners_tx.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("local forwarding listener for {} failed: {}", remote_port, e);
                        break;
                    }
                };
                let session = session.clone();
                let diagnostic_tx = diagnostic_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward_one(session, stream, remote_port).await {
                        warn!("forwarded connection to remote port {} failed: {}", remote_port, e);
                    }
                    emit(
                        &diagnostic_tx,
                        &format!(
                            "Forwarding from 127.0.0.1:{} to host port {}.",
                            local_port, remote_port
                        ),
                    );
                });
            }
            listeners_tx.send_modify(|m| {
                m.remove(&local_port);
            });
        });

        Ok(local_port)
    }

    /// Close the relay: disconnects the SSH session. Idempotent.
    pub async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        let _ = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "session ended", "en")
            .await;
        emit(&self.diagnostic_tx, "relay session disconnected");
    }
}

async fn forward_one(
    session: Arc<Handle<ClientHandler>>,
    mut local: tokio::net::TcpStream,
    remote_port: u16,
) -> Result<(), BrokerError> {
    let channel = session
        .channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0)
        .await?;
    let mut remote = channel.into_stream();
    tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    Ok(())
}

fn emit(tx: &broadcast::Sender<String>, line: &str) {
    debug!("{}", line);
    let _ = tx.send(line.to_string());
}

/// Bridges a WebSocket into a plain byte stream via a `tokio::io::duplex`
/// pipe: one task pumps WebSocket binary frames in both directions, the
/// returned half is handed to `russh::client::connect_stream` as its I/O
/// object. Avoids hand-rolling `AsyncRead`/`AsyncWrite` over message framing.
fn bridge_websocket<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    diagnostic_tx: broadcast::Sender<String>,
) -> impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let (mut ws_sink, mut ws_stream) = ws.split();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                read = remote_rd.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if ws_sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if remote_wr.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let _ = diagnostic_tx.send(format!("relay websocket error: {}", e));
                            break;
                        }
                    }
                }
            }
        }
        info!("relay websocket bridge closed");
    });

    local
}

#[async_trait]
impl RelayPortSource for RelayHandle {
    fn tunnel_object_ports(&self) -> Vec<TunnelPortEntry> {
        self.tunnel_ports.clone()
    }

    fn listeners(&self) -> HashMap<u16, u16> {
        self.listeners_rx.borrow().clone()
    }

    async fn wait_for_forwarded(&self, remote_port: u16, deadline: Duration) -> Option<u16> {
        tokio::time::timeout(deadline, self.ensure_forwarded(remote_port))
            .await
            .ok()
            .and_then(|r| r.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_is_unique_per_instance() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(a, b);
    }
}
