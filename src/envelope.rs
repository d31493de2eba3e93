//! JSON envelopes on the client wire.
//!
//! Inbound text frames carry exactly one object tagged by `action`;
//! anything that fails to deserialize is dropped by the connection, not
//! answered. Outbound frames carry `{"key", "data"}` with string escaping
//! per RFC 8259 courtesy of `serde_json`.

use serde::{Deserialize, Serialize};

/// The three verbs a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action")]
pub enum ClientCommand {
    /// `{"action":"pub","key":"<channel>","data":"<payload>"}`
    #[serde(rename = "pub")]
    Publish { key: String, data: String },
    /// `{"action":"sub","key":"<channel>"}`
    #[serde(rename = "sub")]
    Subscribe { key: String },
    /// `{"action":"unsub","key":"<channel>"}`
    #[serde(rename = "unsub")]
    Unsubscribe { key: String },
}

impl ClientCommand {
    /// Parse one inbound text message.
    pub fn parse(payload: &[u8]) -> Result<ClientCommand, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Server-to-client message for one fan-out delivery.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub key: &'a str,
    pub data: &'a str,
}

impl Envelope<'_> {
    pub fn to_json(&self) -> Vec<u8> {
        // Infallible for a two-string struct.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
