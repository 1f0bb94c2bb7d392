//! Session State Machine (C6).
//!
//! Owns the relay handle and drives the whole connection lifecycle in §4.6:
//! `Idle -> Authenticated -> Listing -> Acquiring -> RelayConnecting ->
//! Discovering -> Provisioning -> SshDialing -> Streaming`, with
//! `ReconnectWait`/`Closing`/`Closed`/`Failed` as escape states. Grounded on
//! the teacher's `AppState` for shared ownership shape (`Arc` + interior
//! mutability) and on `ssh/verification.rs`'s polling-task pattern for the
//! reconnect actor.

pub mod reconnect;

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::error::BrokerError;
use crate::keys::KeyStore;
use crate::ports::{DiscoveryDeps, PortRegistry, TraceTap};
use crate::provider::{Codespace, ProviderClient};
use crate::relay::{RelayHandle, TunnelProperties};
use crate::rpc::{self, HeartbeatCommand, RpcInvoker, RpcState};

use reconnect::ReconnectPolicy;

/// Coarse lifecycle state, published for the user transport's
/// `codespace_state` field (§6) and for tests.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Authenticated,
    Listing,
    Acquiring,
    RelayConnecting,
    Discovering,
    Provisioning,
    SshDialing,
    Streaming,
    ReconnectWait,
    Closing,
    Closed,
    Failed(String),
}

impl SessionState {
    /// States from which reconnect is meaningful; matches §4.6's retryable
    /// set, mirrored in the transport layer's `codespace_state`.
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

pub struct SessionHandles {
    pub relay: Arc<RelayHandle>,
    pub registry: Arc<PortRegistry>,
    pub trace: Arc<TraceTap>,
    pub keys: Arc<KeyStore>,
    pub session_id: String,
    /// Either a local forwarded mapping (`127.0.0.1:<port>`) or, when no
    /// local mapping was found, the workspace domain dialed directly.
    pub ssh_addr: String,
    pub ssh_user: String,
    pub keypair_fingerprint: String,
}

impl std::fmt::Debug for SessionHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandles")
            .field("session_id", &self.session_id)
            .field("ssh_addr", &self.ssh_addr)
            .field("ssh_user", &self.ssh_user)
            .field("keypair_fingerprint", &self.keypair_fingerprint)
            .finish_non_exhaustive()
    }
}

/// Drives one end-to-end session for a single browser client. Not `Clone`:
/// ownership of the relay handle and RPC heartbeat is exclusive, per §5.
///
/// The provider credential is per-session (§3: `auth_token` lives on the
/// `Session`, not on a shared process-wide client): `provider` starts empty
/// and is only populated once `authenticate` validates a token.
pub struct Session {
    config: Arc<Config>,
    provider: Option<Arc<ProviderClient>>,
    state_tx: watch::Sender<SessionState>,
    reconnect: ReconnectPolicy,
}

impl Session {
    pub fn new(config: Arc<Config>) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        (
            Self {
                config,
                provider: None,
                state_tx,
                reconnect: ReconnectPolicy::default(),
            },
            state_rx,
        )
    }

    fn set_state(&self, state: SessionState) {
        info!("session state -> {:?}", state);
        let _ = self.state_tx.send(state);
    }

    /// `Idle -(authenticate OK)-> Authenticated`. Builds a per-session
    /// provider client from `token` and validates it against the provider's
    /// list-codespaces endpoint; a 401 there surfaces as `BadCredentials`
    /// rather than an unconditional transition.
    pub async fn authenticate(&mut self, token: String) -> Result<Vec<Codespace>, BrokerError> {
        let provider = Arc::new(ProviderClient::new(&self.config, token));
        let codespaces = provider.list_codespaces().await?;
        self.provider = Some(provider);
        self.set_state(SessionState::Authenticated);
        Ok(codespaces)
    }

    fn provider(&self) -> Result<&Arc<ProviderClient>, BrokerError> {
        self.provider.as_ref().ok_or(BrokerError::BadCredentials)
    }

    pub async fn list_codespaces(&self) -> Result<Vec<Codespace>, BrokerError> {
        self.provider()?.list_codespaces().await
    }

    pub async fn get_codespace(&self, name: &str) -> Result<Codespace, BrokerError> {
        self.provider()?.get_codespace(name).await
    }

    pub async fn start_codespace(&self, name: &str) -> Result<Codespace, BrokerError> {
        self.provider()?.start_codespace(name).await
    }

    pub async fn stop_codespace(&self, name: &str) {
        if let Ok(provider) = self.provider() {
            provider.stop_codespace(name).await;
        }
    }

    pub fn mark_transport_dropped(&self) {
        self.set_state(SessionState::ReconnectWait);
    }

    /// The user transport reconnected inside the grace window; resume
    /// without a new SSH dial.
    pub fn mark_reconnected(&self) {
        self.set_state(SessionState::Streaming);
    }

    /// Run the full lifecycle for `codespace_name`, from relay connect
    /// through SSH provisioning. Returns the handles so callers (the user
    /// transport) can wire the Terminal Pipe and registry subscriptions.
    pub async fn establish(
        &self,
        codespace_name: &str,
        user_public_key_override: Option<String>,
    ) -> Result<(SessionHandles, mpsc::Sender<HeartbeatCommand>), BrokerError> {
        let provider = self.provider()?.clone();

        self.set_state(SessionState::Listing);
        self.set_state(SessionState::Acquiring);
        let mut codespace = provider.get_codespace(codespace_name).await?;
        if codespace.state != "Available" && codespace.state != "Running" {
            codespace = provider.start_codespace(codespace_name).await?;
        }
        let tunnel_properties = codespace
            .connection
            .tunnel_properties
            .clone()
            .ok_or_else(|| BrokerError::WorkspaceNotReady(codespace.state.clone()))?;

        self.set_state(SessionState::RelayConnecting);
        let tunnel_ports = codespace.connection.ports.clone();
        let manage_token = tunnel_properties.manage_access_token.clone();
        let properties: TunnelProperties = tunnel_properties.into_tunnel_properties();
        let relay = Arc::new(self.attempt_relay_connect(&properties, tunnel_ports).await?);

        self.set_state(SessionState::Discovering);
        let registry = Arc::new(PortRegistry::new());
        let trace = Arc::new(TraceTap::new(1000));
        trace.clone().attach(relay.diagnostic_stream());

        let deps = DiscoveryDeps {
            relay: relay.as_ref(),
            management: provider.as_ref(),
            manage_token: &manage_token,
            trace: Some(trace.as_ref()),
        };
        let rpc_local_port = crate::ports::find(
            crate::config::RPC_REMOTE_PORT,
            Duration::from_secs(3),
            &deps,
            &registry,
        )
        .await
        .ok_or(BrokerError::RpcUnreachable)?;

        self.set_state(SessionState::Provisioning);
        let keys = Arc::new(KeyStore::new());
        let session_id = uuid::Uuid::new_v4().to_string();
        let keypair = keys
            .generate(&session_id)
            .await
            .map_err(|e| BrokerError::CryptoFailure(e.to_string()))?;
        let user_public_key = user_public_key_override.unwrap_or(keypair.public_text.clone());

        let mut invoker = RpcInvoker::connect(rpc_local_port, Some(format!("Bearer {}", manage_token))).await?;
        let start_response = invoker.start_remote_server(&user_public_key).await?;

        self.set_state(SessionState::SshDialing);
        let ssh_remote_port = start_response.ssh_port;
        let ssh_addr = match crate::ports::find(ssh_remote_port, Duration::from_secs(5), &deps, &registry).await {
            Some(local_port) => format!("127.0.0.1:{}", local_port),
            None => {
                let direct = format!("{}:{}", properties.domain, ssh_remote_port);
                if probe_tcp_addr(&direct).await {
                    warn!(
                        "no local mapping for ssh port {}; dialing workspace directly at {}",
                        ssh_remote_port, direct
                    );
                    direct
                } else {
                    return Err(BrokerError::SshUnreachable(
                        "no local mapping for provisioned ssh port, and direct dial failed".to_string(),
                    ));
                }
            }
        };

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(4);
        let (rpc_state_tx, _rpc_state_rx) = watch::channel(RpcState::Idle);
        tokio::spawn(rpc::run_heartbeat(
            invoker,
            session_id.clone(),
            self.config.rpc_heartbeat_interval,
            self.config.rpc_session_keepalive,
            rpc_state_tx,
            heartbeat_rx,
        ));

        self.set_state(SessionState::Streaming);

        Ok((
            SessionHandles {
                relay,
                registry,
                trace,
                keys,
                session_id,
                ssh_addr,
                ssh_user: start_response.host_user,
                keypair_fingerprint: keypair.fingerprint.clone(),
            },
            heartbeat_tx,
        ))
    }

    /// Attempt to connect to the relay, retrying per `ReconnectPolicy` on
    /// transient failures before giving up.
    async fn attempt_relay_connect(
        &self,
        properties: &TunnelProperties,
        tunnel_ports: Vec<crate::ports::TunnelPortEntry>,
    ) -> Result<RelayHandle, BrokerError> {
        let mut policy = self.reconnect.clone();
        loop {
            match RelayHandle::connect(properties, tunnel_ports.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!("relay connect attempt failed: {}", e);
                    match policy.next_backoff() {
                        Some(delay) => {
                            self.set_state(SessionState::ReconnectWait);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!("relay connect exhausted retries");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    pub async fn close(&self, handles: &SessionHandles, heartbeat: mpsc::Sender<HeartbeatCommand>) {
        self.set_state(SessionState::Closing);
        let _ = heartbeat.send(HeartbeatCommand::Release).await;
        handles.relay.close().await;
        handles.keys.destroy_all().await;
        self.set_state(SessionState::Closed);
    }
}

/// Best-effort fallback dial (§4.6): used only when Port Discovery finds no
/// local mapping for the workspace's SSH port.
async fn probe_tcp_addr(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(3), TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_state_is_retryable() {
        assert!(SessionState::Failed("boom".to_string()).is_retryable_failure());
        assert!(!SessionState::Streaming.is_retryable_failure());
    }

    #[tokio::test]
    async fn establish_without_authenticate_is_bad_credentials() {
        let config = Arc::new(crate::config::Config {
            port: 0,
            rpc_heartbeat_interval: Duration::from_secs(1),
            rpc_session_keepalive: Duration::from_secs(1),
            user_public_key_override: None,
            debug: false,
            provider_base_url: "http://127.0.0.1:1".to_string(),
            provider_user_agent: "test".to_string(),
        });
        let (session, _rx) = Session::new(config);
        let err = session.establish("does-not-matter", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::BadCredentials));
    }
}
