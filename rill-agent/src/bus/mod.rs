//! Publish/subscribe message bus between pipeline processes.
//!
//! Messages travel over TCP as length-delimited frames. A frame holds one multipart
//! message encoded as a JSON array of strings; the first part doubles as the topic.
//! On connect a subscriber sends one frame with its topic prefixes, and the publisher
//! only queues matching messages for it.
//!
//! Every subscriber gets its own queue on the publisher side. Up to `high_water_mark`
//! messages stay in memory, the overflow goes to a spill file capped at
//! `max_spill_bytes`, and only when both are full does `publish` wait.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::path::PathBuf;
use tokio_util::codec::LengthDelimitedCodec;

pub mod publisher;
pub mod spill;
pub mod subscriber;

pub use publisher::Publisher;
pub use spill::{Push, SpillQueue};
pub use subscriber::Subscriber;

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub high_water_mark: usize,
    pub spill_dir: PathBuf,
    pub max_spill_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    parts: Vec<String>,
}

impl Message {
    pub fn single(payload: impl Into<String>) -> Self {
        Self {
            parts: vec![payload.into()],
        }
    }

    pub fn multipart(parts: Vec<String>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn topic(&self) -> &str {
        self.parts.first().map(String::as_str).unwrap_or_default()
    }

    /// Last part; the whole message for single-part messages.
    pub fn payload(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// An empty filter list subscribes to everything.
    pub fn matches(&self, filters: &[String]) -> bool {
        filters.is_empty() || filters.iter().any(|prefix| self.topic().starts_with(prefix.as_str()))
    }

    pub fn encode(&self) -> Result<Bytes> {
        let raw = serde_json::to_vec(&self.parts).context("failed to encode bus message")?;
        Ok(Bytes::from(raw))
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let parts: Vec<String> =
            serde_json::from_slice(frame).context("bus frame is not a JSON string array")?;
        Ok(Self { parts })
    }
}

/// Accepts `tcp://host:port` as well as bare `host:port`; `*` binds every interface.
pub fn socket_addr(addr: &str) -> Result<String> {
    let trimmed = addr.trim();
    let bare = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
    let (host, port) = bare
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("bus address {addr} has no port"))?;
    port.parse::<u16>()
        .with_context(|| format!("bus address {addr} has an invalid port"))?;
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_accept_tcp_scheme_and_wildcard() {
        assert_eq!(socket_addr("tcp://127.0.0.1:5601").expect("valid"), "127.0.0.1:5601");
        assert_eq!(socket_addr("tcp://*:5601").expect("valid"), "0.0.0.0:5601");
        assert_eq!(socket_addr("localhost:80").expect("valid"), "localhost:80");
        assert!(socket_addr("tcp://localhost").is_err());
        assert!(socket_addr("tcp://localhost:http").is_err());
    }

    #[test]
    fn topic_filters_match_by_prefix() {
        let message = Message::multipart(vec!["jabbah2".to_string(), "responsive".to_string()]);
        assert!(message.matches(&[]));
        assert!(message.matches(&["jabbah".to_string()]));
        assert!(!message.matches(&["magpie".to_string()]));
        assert_eq!(message.payload(), "responsive");
    }

    #[test]
    fn frames_decode_to_the_same_parts() {
        let message = Message::multipart(vec!["host".to_string(), "unresponsive".to_string()]);
        let frame = message.encode().expect("encode");
        assert_eq!(Message::decode(&frame).expect("decode"), message);
        assert!(Message::decode(b"{\"not\":\"parts\"}").is_err());
    }
}
