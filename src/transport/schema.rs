//! Wire schema for the browser-facing WebSocket (§6).
//!
//! JSON messages, typed as tagged enums so `serde`'s externally-tagged
//! representation does the dispatch work, matching the teacher's
//! `TunnelResponse`/`ErrorResponse`-style plain `Serialize` structs
//! generalized to the full bidirectional message set the contract defines.
//! Field case follows the wire contract literally: most fields are
//! snake_case, but `port_update`'s `portCount` and `port_info_response`'s
//! `portInfo` are camelCase there and kept that way here.

use serde::{Deserialize, Serialize};

use crate::ports::PortMapping;
use crate::provider::Codespace;

/// Message sent by the browser client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Establish the per-session provider credential. Must be the first
    /// message on every connection.
    Authenticate { token: String },
    /// List workspaces available for selection.
    ListCodespaces,
    /// Select which workspace to connect a terminal to.
    ConnectCodespace {
        codespace_name: String,
        #[serde(default)]
        shell_type: Option<String>,
        #[serde(default)]
        gemini_api_key: Option<String>,
    },
    /// Select a workspace by its backing repository rather than by name.
    ConnectToRepoCodespace { repo_url: String },
    /// Explicit request to tear the current connection down.
    DisconnectCodespace,
    /// Ask the provider to start a (possibly not-yet-connected) workspace.
    StartCodespace { codespace_name: String },
    /// Ask the provider to stop a workspace.
    StopCodespace { codespace_name: String },
    /// Raw keystrokes/paste data for the active terminal.
    Input { data: String },
    /// Browser-side terminal dimensions changed.
    Resize { cols: u32, rows: u32 },
    /// Re-run port discovery and report the current set.
    RefreshPorts,
    /// Report the currently active session's primary port mapping.
    GetPortInfo,
    /// Re-fetch and report the connected codespace's provider-reported state.
    QueryCodespaceStatus,
}

/// A single forwarded port, as reported to the browser.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: String,
    pub category: String,
}

impl From<&PortMapping> for PortInfo {
    fn from(mapping: &PortMapping) -> Self {
        Self {
            local_port: mapping.local_port,
            remote_port: mapping.remote_port,
            protocol: format!("{:?}", mapping.protocol).to_ascii_lowercase(),
            category: format!("{:?}", mapping.category).to_ascii_lowercase(),
        }
    }
}

/// A sanitized projection of `Codespace` safe to hand to the browser: never
/// carries the relay's connect/manage tokens.
#[derive(Debug, Clone, Serialize)]
pub struct CodespaceSummary {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub repository_full_name: Option<String>,
}

impl From<&Codespace> for CodespaceSummary {
    fn from(codespace: &Codespace) -> Self {
        Self {
            name: codespace.name.clone(),
            state: codespace.state.clone(),
            repository_full_name: codespace.repository_full_name.clone(),
        }
    }
}

/// Message sent to the browser client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Result of `authenticate`.
    Authenticated { success: bool },
    /// Result of `list_codespaces`.
    CodespacesList { data: Vec<CodespaceSummary> },
    /// Coarse lifecycle/provider-reported state for the active (or just
    /// requested) codespace.
    CodespaceState {
        codespace_name: Option<String>,
        state: String,
        #[serde(default)]
        repository_full_name: Option<String>,
        #[serde(default)]
        codespace_data: Option<CodespaceSummary>,
    },
    /// Raw bytes produced by the remote shell.
    Output { data: String },
    /// Current forwarded-port set, pushed on change or in reply to
    /// `refresh_ports`.
    PortUpdate {
        #[serde(rename = "portCount")]
        port_count: usize,
        ports: Vec<PortInfo>,
        timestamp: i64,
    },
    /// Reply to `get_port_info`.
    PortInfoResponse {
        #[serde(rename = "portInfo")]
        port_info: Option<PortInfo>,
    },
    /// The active session ended (explicit disconnect, or the browser failed
    /// to reconnect within the grace window).
    DisconnectedFromCodespace,
    /// A recoverable or terminal problem, with a human-readable summary.
    Error { message: String },
}

/// `codespace_state` values the provider can report (§6); the retryable
/// subset is the set the browser should treat as "still settling" rather
/// than a hard failure.
pub const RETRYABLE_STATES: &[&str] = &["Starting", "Provisioning", "Queued", "Awaiting", "Unavailable"];

pub fn is_retryable_state(state: &str) -> bool {
    RETRYABLE_STATES.contains(&state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_tag_roundtrips() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"authenticate","token":"abc"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Authenticate { token } if token == "abc"));
    }

    #[test]
    fn connect_codespace_optional_fields_default() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"connect_codespace","codespace_name":"c1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ConnectCodespace { codespace_name, shell_type, gemini_api_key }
            if codespace_name == "c1" && shell_type.is_none() && gemini_api_key.is_none()));
    }

    #[test]
    fn port_update_field_is_camel_case() {
        let msg = ServerMessage::PortUpdate {
            port_count: 1,
            ports: vec![],
            timestamp: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"portCount\":1"));
    }

    #[test]
    fn retryable_states_are_recognized() {
        assert!(is_retryable_state("Starting"));
        assert!(!is_retryable_state("Connected"));
    }
}
