//! Wire framing for the control-plane RPC channel (§4.5, glossary "Framed-RPC").
//!
//! Length-delimited binary frames, each carrying a JSON body. Grounded on
//! `tokio-util`'s `LengthDelimitedCodec`, the standard pairing for this
//! pattern in the async-tokio ecosystem the teacher already depends on.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::BrokerError;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcHeader {
    pub request_id: u64,
    pub method: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcEnvelope<T> {
    pub header: RpcHeader,
    pub body: T,
}

/// A length-delimited `Framed` stream carrying JSON-encoded `RpcEnvelope`s.
pub struct RpcChannel<IO> {
    framed: Framed<IO, LengthDelimitedCodec>,
    next_request_id: u64,
}

impl<IO> RpcChannel<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: IO) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(8 * 1024 * 1024)
            .new_codec();
        Self {
            framed: Framed::new(io, codec),
            next_request_id: 1,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    pub async fn send<T: Serialize>(&mut self, envelope: &RpcEnvelope<T>) -> Result<(), BrokerError> {
        use futures::SinkExt;
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| BrokerError::RpcRejected(format!("encode failure: {}", e)))?;
        self.framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| BrokerError::RpcConnectFailure(e.to_string()))
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<RpcEnvelope<T>, BrokerError> {
        use futures::StreamExt;
        let frame = self
            .framed
            .next()
            .await
            .ok_or(BrokerError::RpcClosed)?
            .map_err(|e| BrokerError::RpcConnectFailure(e.to_string()))?;
        serde_json::from_slice(&frame)
            .map_err(|e| BrokerError::RpcRejected(format!("decode failure: {}", e)))
    }
}
