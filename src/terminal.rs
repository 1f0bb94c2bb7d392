//! Terminal Pipe (C7).
//!
//! Bridges the browser's user transport to the workspace's SSH daemon: dials
//! the discovered (or, failing that, direct) SSH address with the Ephemeral
//! Key Store's private key, requests a PTY, and shuttles bytes in both
//! directions. On SSH EOF, prints an ANSI-red error summary the way the
//! teacher's `terminal_ui` module styles its own terminal output, using the
//! same `console` crate.

use std::sync::Arc;

use async_trait::async_trait;
use console::style;
use log::{error, info};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::keys::Keypair;

pub(crate) struct TerminalHandler;

#[async_trait]
impl client::Handler for TerminalHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The relay already authenticated the transport; the workspace's
        // host key is not independently pinned here (spec §4.7 open question).
        Ok(true)
    }
}

/// A message flowing from the browser to the SSH session.
pub enum InputEvent {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    Close,
}

/// A message flowing from the SSH session to the browser.
pub enum OutputEvent {
    Data(Vec<u8>),
    Closed { summary: Option<String> },
}

/// Dial the workspace's provisioned SSH daemon and return a live PTY
/// channel session ready to pump bytes. `ssh_addr` is either a local
/// forwarded mapping (`127.0.0.1:<port>`) or, when no local mapping could be
/// discovered, the workspace's domain dialed directly (§4.6's best-effort
/// fallback).
pub async fn dial(
    ssh_addr: &str,
    ssh_user: &str,
    keypair: &Keypair,
) -> Result<Handle<TerminalHandler>, BrokerError> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, ssh_addr, TerminalHandler)
        .await
        .map_err(|e| BrokerError::SshUnreachable(e.to_string()))?;

    let authenticated = session
        .authenticate_publickey(ssh_user, keypair.private.clone())
        .await
        .map_err(BrokerError::Ssh)?;
    if !authenticated {
        return Err(BrokerError::SshAuthDenied);
    }

    Ok(session)
}

/// Run one interactive terminal: opens a PTY-backed session channel and
/// shuttles `InputEvent`s/`OutputEvent`s until the SSH channel closes or
/// `inputs` is dropped. Resize is applied via `window_change`.
pub async fn run(
    session: Handle<TerminalHandler>,
    cols: u32,
    rows: u32,
    mut inputs: mpsc::Receiver<InputEvent>,
    outputs: mpsc::Sender<OutputEvent>,
) -> Result<(), BrokerError> {
    let mut channel = session.channel_open_session().await.map_err(BrokerError::Ssh)?;
    channel
        .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
        .await
        .map_err(BrokerError::Ssh)?;
    channel.request_shell(false).await.map_err(BrokerError::Ssh)?;

    loop {
        tokio::select! {
            input = inputs.recv() => {
                match input {
                    Some(InputEvent::Data(bytes)) => {
                        if channel.data(&bytes[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(InputEvent::Resize { cols, rows }) => {
                        let _ = channel.window_change(cols, rows, 0, 0).await;
                    }
                    Some(InputEvent::Close) | None => {
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if outputs.send(OutputEvent::Data(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if outputs.send(OutputEvent::Data(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        info!("ssh channel closed");
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("ssh shell exited with status {}", exit_status);
                    }
                    _ => {}
                }
            }
        }
    }

    let summary = error_summary();
    let _ = outputs.send(OutputEvent::Closed { summary }).await;
    let _ = session
        .disconnect(Disconnect::ByApplication, "terminal session ended", "en")
        .await;
    Ok(())
}

/// On SSH EOF, the browser side renders whatever text this returns as a
/// styled summary line, matching the teacher's ANSI-red error convention.
fn error_summary() -> Option<String> {
    Some(format!("{}", style("connection to workspace closed").red().bold()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_summary_is_non_empty() {
        assert!(error_summary().unwrap().contains("closed"));
    }
}
