//! Control-Plane RPC Invoker (C5).
//!
//! Dials the workspace's well-known RPC port (classified by the Port
//! Registry as `Category::Rpc`) and issues framed requests: `StartRemoteServer`
//! to provision the SSH daemon the Terminal Pipe will dial, and periodic
//! `NotifyClientActivity` heartbeats to keep the workspace from idling out.
//!
//! The heartbeat actor is a `tokio::select!`-driven periodic loop, the same
//! shape as the teacher's Device Flow polling task
//! (`ssh/verification.rs::spawn_verification_polling`), generalized from a
//! one-shot poll-until-done into the repeating
//! `Idle -> Connecting -> Active <-> Disconnected(deadline) -> Released`
//! state machine in §4.5.

pub mod framing;

use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::error::BrokerError;
use framing::{RpcChannel, RpcEnvelope, RpcHeader};

#[derive(Debug, Clone, serde::Serialize)]
pub struct StartRemoteServerRequest {
    pub user_public_key: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StartRemoteServerResponse {
    pub ssh_port: u16,
    pub host_user: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NotifyClientActivityRequest {
    pub client_id: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NotifyClientActivityResponse {
    pub acknowledged: bool,
}

/// State of the RPC channel as seen by the heartbeat actor, per §4.5.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcState {
    Idle,
    Connecting,
    Active,
    Disconnected { deadline: Instant },
    Released,
}

/// A connected RPC channel plus the authorization metadata every call
/// carries in its header.
pub struct RpcInvoker {
    channel: RpcChannel<TcpStream>,
    authorization: Option<String>,
}

impl RpcInvoker {
    /// Dial the RPC port and wrap it in the framed codec. Per §4.5, this
    /// transport carries no security of its own — the relay provides it.
    pub async fn connect(local_port: u16, authorization: Option<String>) -> Result<Self, BrokerError> {
        let addr = format!("127.0.0.1:{}", local_port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|_| BrokerError::RpcUnreachable)?;
        Ok(Self {
            channel: RpcChannel::new(stream),
            authorization,
        })
    }

    async fn call<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &mut self,
        method: &str,
        body: Req,
        timeout: Duration,
    ) -> Result<Resp, BrokerError> {
        let id = self.channel.next_id();
        let envelope = RpcEnvelope {
            header: RpcHeader {
                request_id: id,
                method: method.to_string(),
                authorization: self.authorization.clone(),
            },
            body,
        };
        self.channel.send(&envelope).await?;

        let response: RpcEnvelope<Resp> = tokio::time::timeout(timeout, self.channel.recv())
            .await
            .map_err(|_| BrokerError::RpcTimeout)??;

        if response.header.request_id != id {
            return Err(BrokerError::RpcRejected(
                "response request_id did not match".to_string(),
            ));
        }
        Ok(response.body)
    }

    /// Provision the workspace's SSH daemon, registering `user_public_key`
    /// as an authorized key.
    pub async fn start_remote_server(
        &mut self,
        user_public_key: &str,
    ) -> Result<StartRemoteServerResponse, BrokerError> {
        self.call(
            "StartRemoteServer",
            StartRemoteServerRequest {
                user_public_key: user_public_key.to_string(),
            },
            Duration::from_secs(10),
        )
        .await
    }

    /// Tell the workspace a client is still attached, deferring any idle
    /// shutdown timer it runs.
    pub async fn notify_client_activity(
        &mut self,
        client_id: &str,
    ) -> Result<NotifyClientActivityResponse, BrokerError> {
        self.call(
            "NotifyClientActivity",
            NotifyClientActivityRequest {
                client_id: client_id.to_string(),
            },
            Duration::from_secs(10),
        )
        .await
    }
}

/// Commands the heartbeat actor accepts from the Session State Machine.
pub enum HeartbeatCommand {
    /// Tear the RPC channel down; the session is closing.
    Release,
    /// The user transport reconnected inside the grace window; clear any
    /// disconnected-since tracking and resume ticking as `Active`.
    MarkReconnected,
}

/// Runs `NotifyClientActivity` every `interval`, tracking the
/// `Idle -> Connecting -> Active <-> Disconnected -> Released` state machine
/// and publishing the current state for the session to observe. On repeated
/// failure past `disconnected_grace`, the actor gives up and leaves `Released`
/// for the caller to interpret as a hard failure.
pub async fn run_heartbeat(
    mut invoker: RpcInvoker,
    client_id: String,
    interval: Duration,
    disconnected_grace: Duration,
    state_tx: watch::Sender<RpcState>,
    mut commands: mpsc::Receiver<HeartbeatCommand>,
) {
    let _ = state_tx.send(RpcState::Connecting);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; consume it

    let _ = state_tx.send(RpcState::Active);
    let mut disconnected_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match invoker.notify_client_activity(&client_id).await {
                    Ok(_) => {
                        disconnected_since = None;
                        let _ = state_tx.send(RpcState::Active);
                    }
                    // Per §4.5/§7, only a lost channel (UNAVAILABLE |
                    // ECONNREFUSED, i.e. the connect/transport failed or the
                    // peer closed on us) starts the disconnected-grace
                    // countdown. A rejected call or a single slow response is
                    // logged and ignored; the next tick tries again.
                    Err(e @ (BrokerError::RpcConnectFailure(_) | BrokerError::RpcClosed)) => {
                        warn!("heartbeat notify_client_activity lost the rpc channel: {}", e);
                        let since = *disconnected_since.get_or_insert_with(Instant::now);
                        let deadline = since + disconnected_grace;
                        let _ = state_tx.send(RpcState::Disconnected { deadline });

                        if Instant::now() >= deadline {
                            info!("heartbeat grace period elapsed; releasing RPC channel");
                            let _ = state_tx.send(RpcState::Released);
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("heartbeat notify_client_activity failed (transient, ignored): {}", e);
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(HeartbeatCommand::Release) | None => {
                        let _ = state_tx.send(RpcState::Released);
                        return;
                    }
                    Some(HeartbeatCommand::MarkReconnected) => {
                        disconnected_since = None;
                        let _ = state_tx.send(RpcState::Active);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_state_transitions_are_distinguishable() {
        assert_ne!(RpcState::Idle, RpcState::Active);
        assert_ne!(RpcState::Active, RpcState::Released);
    }
}
