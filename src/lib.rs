//! Tunnel Session Core library.
//!
//! Brokers a browser terminal UI to a remote cloud-hosted workspace: selects
//! a workspace from the provider, dials its relay, discovers forwarded
//! ports, provisions SSH over a framed control-plane RPC, and streams a
//! terminal session with reconnect and keepalive.

pub mod config;
pub mod error;
pub mod keys;
pub mod ports;
pub mod provider;
pub mod relay;
pub mod rpc;
pub mod session;
pub mod terminal;
pub mod transport;

pub use error::{BrokerError, Result};
