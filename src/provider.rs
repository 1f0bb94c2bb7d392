//! The workspace provider HTTP client (§6).
//!
//! Replaces the teacher's device-flow client (`device.rs`): same shape
//! (a `reqwest::Client` built with `.no_proxy()`, a config struct sourced
//! from env vars with sane defaults, typed request/response structs), but
//! driving the provider's codespace-lifecycle contract instead of an
//! activation-code exchange.
//!
//! One `ProviderClient` is built per session from the bearer token the
//! browser supplies in `authenticate{token}` (§3: `auth_token` is
//! per-session), rather than a single process-wide credential.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::BrokerError;
use crate::ports::{ManagementPortSource, TunnelPortEntry};
use crate::relay::TunnelProperties;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Deserialize)]
pub struct Codespace {
    pub name: String,
    pub state: String,
    #[serde(default, rename = "repositoryFullName")]
    pub repository_full_name: Option<String>,
    pub connection: ConnectionInfo,
}

/// The codespace object's `connection` sub-object. Per §6 the relay
/// credentials live one level deeper, under `connection.tunnelProperties`;
/// `ports` is the tunnel's own embedded port array (Port Discovery
/// strategy 1), a sibling of `tunnelProperties` rather than nested under it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default, rename = "tunnelProperties")]
    pub tunnel_properties: Option<TunnelPropertiesWire>,
    #[serde(default)]
    pub ports: Vec<TunnelPortEntry>,
}

/// Wire shape of `connection.tunnelProperties`.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelPropertiesWire {
    #[serde(rename = "tunnelId")]
    pub tunnel_id: String,
    #[serde(rename = "clusterId")]
    pub cluster_id: String,
    #[serde(rename = "connectAccessToken")]
    pub connect_access_token: String,
    #[serde(rename = "manageAccessToken")]
    pub manage_access_token: String,
    #[serde(rename = "serviceUri")]
    pub service_uri: String,
    #[serde(default)]
    pub domain: String,
}

impl TunnelPropertiesWire {
    pub fn into_tunnel_properties(self) -> TunnelProperties {
        TunnelProperties {
            tunnel_id: self.tunnel_id,
            cluster_id: self.cluster_id,
            connect_token: self.connect_access_token,
            manage_token: self.manage_access_token,
            service_uri: self.service_uri,
            domain: self.domain,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CodespacesListResponse {
    #[serde(default)]
    codespaces: Vec<Codespace>,
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListPortsResponse {
    #[serde(default)]
    ports: Vec<TunnelPortEntry>,
}

/// Client for the workspace provider's codespace lifecycle API. Holds the
/// bearer credential supplied at session start; never logs it.
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    credential: String,
}

impl ProviderClient {
    pub fn new(config: &Config, credential: String) -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .user_agent(&config.provider_user_agent)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("failed to build provider HTTP client");

        Self {
            http,
            base_url: config.provider_base_url.clone(),
            credential,
        }
    }

    /// Every call authenticates with `Authorization: token <token>`, the
    /// scheme §6 specifies for this API (distinct from the RPC channel's
    /// `Bearer` scheme).
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, BrokerError> {
        let response = builder
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.credential))
            .send()
            .await
            .map_err(|e| BrokerError::ProviderUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BrokerError::BadCredentials);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::ProviderError { status, body });
        }
        Ok(response)
    }

    /// `GET /user/codespaces` → `{codespaces: []}`.
    pub async fn list_codespaces(&self) -> Result<Vec<Codespace>, BrokerError> {
        let url = format!("{}/user/codespaces", self.base_url);
        let response = self.send(self.http.get(&url)).await?;
        let parsed: CodespacesListResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::ProviderError {
                status: 0,
                body: format!("malformed codespace list: {}", e),
            })?;
        Ok(parsed.codespaces)
    }

    /// `GET /user/codespaces/{name}?internal=true&refresh=true` — fetch a
    /// single workspace's current state and, if running, its relay
    /// connection info.
    pub async fn get_codespace(&self, name: &str) -> Result<Codespace, BrokerError> {
        let url = format!(
            "{}/user/codespaces/{}?internal=true&refresh=true",
            self.base_url, name
        );
        let response = self.send(self.http.get(&url)).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::ProviderError {
                status: 0,
                body: format!("malformed codespace: {}", e),
            })
    }

    /// `POST {name}/start` — request the provider bring the workspace up.
    /// Returns the codespace once the provider has accepted the request;
    /// callers poll `get_codespace` until `state` reaches a ready value.
    pub async fn start_codespace(&self, name: &str) -> Result<Codespace, BrokerError> {
        let url = format!("{}/user/codespaces/{}/start", self.base_url, name);
        let response = self
            .send(self.http.post(&url).json(&StartRequest { name }))
            .await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::ProviderError {
                status: 0,
                body: format!("malformed start response: {}", e),
            })
    }

    /// `POST {name}/stop` — best-effort; failures are logged, not propagated,
    /// since this only runs during teardown.
    pub async fn stop_codespace(&self, name: &str) {
        let url = format!("{}/user/codespaces/{}/stop", self.base_url, name);
        if let Err(e) = self.send(self.http.post(&url)).await {
            warn!("stop_codespace({}) failed: {}", name, e);
        }
    }
}

#[async_trait]
impl ManagementPortSource for ProviderClient {
    /// Strategy 2 of Port Discovery (§4.3): the manage-scope list-ports call,
    /// authenticated with the relay's manage token rather than the user's
    /// provider credential.
    async fn list_ports(&self, manage_token: &str) -> Result<Vec<TunnelPortEntry>, BrokerError> {
        let url = format!("{}/manage/ports", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(manage_token)
            .send()
            .await
            .map_err(|e| BrokerError::ProviderUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            debug!("manage/ports returned {}: {}", status, body);
            return Err(BrokerError::ProviderError { status, body });
        }

        let parsed: ListPortsResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::ProviderError {
                status: 0,
                body: format!("malformed ports response: {}", e),
            })?;
        Ok(parsed.ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_properties_wire_maps_into_tunnel_properties() {
        let wire = TunnelPropertiesWire {
            tunnel_id: "t1".into(),
            cluster_id: "c1".into(),
            connect_access_token: "connect".into(),
            manage_access_token: "manage".into(),
            service_uri: "wss://relay.example/t1".into(),
            domain: "example.dev".into(),
        };
        let props = wire.into_tunnel_properties();
        assert_eq!(props.tunnel_id, "t1");
        assert_eq!(props.connect_token, "connect");
    }

    #[test]
    fn connection_info_without_tunnel_properties_defaults_to_none() {
        let info = ConnectionInfo::default();
        assert!(info.tunnel_properties.is_none());
        assert!(info.ports.is_empty());
    }

    #[test]
    fn codespaces_list_response_unwraps_the_codespaces_key() {
        let body = r#"{"codespaces":[{"name":"c1","state":"Available","connection":{}}]}"#;
        let parsed: CodespacesListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.codespaces.len(), 1);
        assert_eq!(parsed.codespaces[0].name, "c1");
    }
}
