//! Trace Tap (C4).
//!
//! The only place in the system where string parsing of diagnostic text is
//! permitted (§4.4). New relative to the teacher (which never taps a relay's
//! diagnostic stream), but built in its idiom: a `tokio::sync::Mutex`-guarded
//! ring buffer, the same locking discipline `AppState` uses elsewhere, plus
//! `regex` for the five parsing rules.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::Regex;
use tokio::sync::{broadcast, Mutex};

const DEFAULT_CAPACITY: usize = 1000;
const REDACTION_MIN_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceCategory {
    PortForwarding,
    Connection,
    Auth,
    General,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ParsedPortData {
    pub local: Option<u16>,
    pub remote: Option<u16>,
    pub direction: Option<&'static str>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceEvent {
    pub timestamp: SystemTime,
    pub level: String,
    pub category: TraceCategory,
    pub parsed_data: Option<ParsedPortData>,
    pub raw_message: String,
}

fn categorize(line: &str) -> TraceCategory {
    let lower = line.to_ascii_lowercase();
    if lower.contains("forward") || lower.contains("listening on port") {
        TraceCategory::PortForwarding
    } else if lower.contains("auth") || lower.contains("token") || lower.contains("credential") {
        TraceCategory::Auth
    } else if lower.contains("connect") || lower.contains("disconnect") || lower.contains("socket") {
        TraceCategory::Connection
    } else {
        TraceCategory::General
    }
}

struct PortForwardingPatterns {
    forward_v4: Regex,
    forward_v6: Regex,
    established: Regex,
    listening: Regex,
}

fn patterns() -> &'static PortForwardingPatterns {
    static PATTERNS: OnceLock<PortForwardingPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| PortForwardingPatterns {
        forward_v4: Regex::new(r"Forwarding from 127\.0\.0\.1:(\d+) to host port (\d+)\.?")
            .unwrap(),
        forward_v6: Regex::new(r"Forwarding from ::1:(\d+) to host port (\d+)\.?").unwrap(),
        established: Regex::new(r"Port (\d+) forwarding established").unwrap(),
        listening: Regex::new(r"Listening on port (\d+)").unwrap(),
    })
}

/// Parse a `port_forwarding`-category line per the ordered rules in §4.4.
fn parse_port_forwarding(line: &str) -> Option<ParsedPortData> {
    let p = patterns();

    if let Some(c) = p.forward_v4.captures(line) {
        return Some(ParsedPortData {
            local: c.get(1).and_then(|m| m.as_str().parse().ok()),
            remote: c.get(2).and_then(|m| m.as_str().parse().ok()),
            direction: Some("forward"),
            protocol: infer_protocol(line),
        });
    }
    if let Some(c) = p.forward_v6.captures(line) {
        return Some(ParsedPortData {
            local: c.get(1).and_then(|m| m.as_str().parse().ok()),
            remote: c.get(2).and_then(|m| m.as_str().parse().ok()),
            direction: Some("forward"),
            protocol: Some("ipv6".to_string()),
        });
    }
    if let Some(c) = p.established.captures(line) {
        return Some(ParsedPortData {
            remote: c.get(1).and_then(|m| m.as_str().parse().ok()),
            ..Default::default()
        });
    }
    if let Some(c) = p.listening.captures(line) {
        return Some(ParsedPortData {
            local: c.get(1).and_then(|m| m.as_str().parse().ok()),
            direction: Some("reverse"),
            protocol: infer_protocol(line),
            ..Default::default()
        });
    }
    None
}

fn infer_protocol(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("ssh") {
        Some("ssh".to_string())
    } else if lower.contains("http") {
        Some("http".to_string())
    } else if lower.contains("tcp") {
        Some("tcp".to_string())
    } else {
        None
    }
}

fn bearer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").unwrap())
}

fn base64ish_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9+/_\-]{50,}={0,2}").unwrap())
}

/// Redact bearer tokens and long base64-looking runs from auth-category text
/// before it is retained, per §4.4.
fn redact(line: &str) -> String {
    let redacted = bearer_regex().replace_all(line, "[REDACTED]");
    base64ish_regex()
        .replace_all(&redacted, |c: &regex::Captures| {
            if c[0].len() >= REDACTION_MIN_LEN {
                "[REDACTED]".to_string()
            } else {
                c[0].to_string()
            }
        })
        .into_owned()
}

struct RingBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
}

impl RingBuffer {
    fn push(&mut self, event: TraceEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Observes a relay's diagnostic stream and converts lines into `TraceEvent`s.
/// Detaching restores the original sink exactly.
pub struct TraceTap {
    buffer: Mutex<RingBuffer>,
}

impl TraceTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(RingBuffer {
                events: VecDeque::new(),
                capacity: if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
            }),
        }
    }

    /// Attach to a relay's diagnostic broadcast channel, consuming lines
    /// until the channel closes or `detach` fires via the returned guard's
    /// drop. The relay is responsible for restoring its original sink.
    pub fn attach(self: std::sync::Arc<Self>, mut rx: broadcast::Receiver<String>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(line) => self.ingest("info", &line).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn ingest(&self, level: &str, raw_message: &str) {
        let category = categorize(raw_message);
        let (parsed_data, stored_message) = match category {
            TraceCategory::PortForwarding => (parse_port_forwarding(raw_message), raw_message.to_string()),
            TraceCategory::Auth => (None, redact(raw_message)),
            _ => (None, raw_message.to_string()),
        };

        let event = TraceEvent {
            timestamp: SystemTime::now(),
            level: level.to_string(),
            category,
            parsed_data,
            raw_message: stored_message,
        };

        self.buffer.lock().await.push(event);
    }

    pub async fn events(&self) -> Vec<TraceEvent> {
        self.buffer.lock().await.events.iter().cloned().collect()
    }

    /// Last-resort lookup used by Port Discovery strategy 4: search retained
    /// `port_forwarding` events for a `forward` entry matching `remote_port`.
    pub async fn find_local_port_for_remote(&self, remote_port: u16) -> Option<u16> {
        let guard = self.buffer.lock().await;
        guard
            .events
            .iter()
            .rev()
            .find_map(|event| {
                let data = event.parsed_data.as_ref()?;
                if data.remote == Some(remote_port) {
                    data.local
                } else {
                    None
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_ipv4_forward_line() {
        let tap = TraceTap::new(10);
        tap.ingest("info", "Forwarding from 127.0.0.1:51000 to host port 2222.")
            .await;
        let events = tap.events().await;
        let data = events[0].parsed_data.as_ref().unwrap();
        assert_eq!(data.local, Some(51000));
        assert_eq!(data.remote, Some(2222));
        assert_eq!(data.direction, Some("forward"));
    }

    #[tokio::test]
    async fn parses_ipv6_forward_line() {
        let tap = TraceTap::new(10);
        tap.ingest("info", "Forwarding from ::1:51000 to host port 2222.")
            .await;
        let events = tap.events().await;
        let data = events[0].parsed_data.as_ref().unwrap();
        assert_eq!(data.protocol.as_deref(), Some("ipv6"));
    }

    #[tokio::test]
    async fn parses_established_and_listening_lines() {
        let tap = TraceTap::new(10);
        tap.ingest("info", "Port 9000 forwarding established").await;
        tap.ingest("info", "Listening on port 8080").await;
        let events = tap.events().await;
        assert_eq!(events[0].parsed_data.as_ref().unwrap().remote, Some(9000));
        assert_eq!(events[1].parsed_data.as_ref().unwrap().local, Some(8080));
    }

    #[tokio::test]
    async fn redacts_bearer_tokens_in_auth_lines() {
        let tap = TraceTap::new(10);
        tap.ingest("info", "auth: using Bearer abc123.def456-token").await;
        let events = tap.events().await;
        assert!(events[0].raw_message.contains("[REDACTED]"));
        assert!(!events[0].raw_message.contains("abc123"));
    }

    #[tokio::test]
    async fn redacts_long_base64_runs_in_auth_lines() {
        let tap = TraceTap::new(10);
        let long_b64 = "A".repeat(60);
        tap.ingest("info", &format!("auth token blob: {}", long_b64)).await;
        let events = tap.events().await;
        assert!(events[0].raw_message.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let tap = TraceTap::new(3);
        for i in 0..10 {
            tap.ingest("info", &format!("general message {}", i)).await;
        }
        let events = tap.events().await;
        assert_eq!(events.len(), 3);
        assert!(events[0].raw_message.contains("message 7"));
    }

    #[tokio::test]
    async fn find_local_port_for_remote_returns_most_recent() {
        let tap = TraceTap::new(10);
        tap.ingest("info", "Forwarding from 127.0.0.1:51000 to host port 2222.")
            .await;
        tap.ingest("info", "Forwarding from 127.0.0.1:51555 to host port 2222.")
            .await;
        let found = tap.find_local_port_for_remote(2222).await;
        assert_eq!(found, Some(51555));
    }

    #[tokio::test]
    async fn unparseable_port_forwarding_line_yields_no_panic() {
        let tap = TraceTap::new(10);
        tap.ingest("info", "Forwarding something weird happened").await;
        let events = tap.events().await;
        assert!(events[0].parsed_data.is_none());
    }
}
