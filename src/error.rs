//! Error kinds for the tunnel session core.
//!
//! One flat enum, matching the teacher's style of a single domain error type
//! rather than a per-module hierarchy. Variants correspond to the Error Kinds
//! table in the specification (§7).

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Provider returned 401.
    #[error("bad credentials")]
    BadCredentials,

    /// Provider timeout or 5xx.
    #[error("workspace provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider returned a 4xx other than 401.
    #[error("provider error ({status}): {body}")]
    ProviderError { status: u16, body: String },

    /// Codespace is in a retryable, not-yet-ready state.
    #[error("workspace not ready: {0}")]
    WorkspaceNotReady(String),

    /// Control-plane RPC port (16634) could not be discovered.
    #[error("rpc port unreachable")]
    RpcUnreachable,

    /// Framed-RPC channel could not be opened.
    #[error("rpc connect failed: {0}")]
    RpcConnectFailure(String),

    /// Provisioning call returned `result=false`.
    #[error("rpc rejected: {0}")]
    RpcRejected(String),

    /// RPC call exceeded its deadline.
    #[error("rpc timeout")]
    RpcTimeout,

    /// The RPC channel has already been released.
    #[error("rpc channel closed")]
    RpcClosed,

    /// No local mapping for the SSH port, and a direct dial also failed.
    #[error("ssh unreachable: {0}")]
    SshUnreachable(String),

    /// The workspace refused the ephemeral key.
    #[error("ssh auth denied")]
    SshAuthDenied,

    /// The user transport closed.
    #[error("transport dropped")]
    TransportDrop,

    /// The platform RNG failed during keypair generation.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// A keypair already exists for this session id (generate called twice
    /// without an intervening destroy).
    #[error("keypair already exists for session")]
    KeypairAlreadyExists,

    /// Generic I/O failure, wrapped rather than discarded.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error from `russh`.
    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Relay transport (WebSocket) error.
    #[error("relay transport error: {0}")]
    Relay(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
