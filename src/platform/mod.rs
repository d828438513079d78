pub mod telegram;

use serde::{Deserialize, Serialize};

/// Media kinds the forwarder knows how to relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Image,
    Voice,
    Video,
    File,
    Sharing,
}

impl MediaKind {
    /// Stable tag used in logs and synthesized message identities
    pub fn tag(self) -> &'static str {
        match self {
            MediaKind::Text => "text",
            MediaKind::Image => "image",
            MediaKind::Voice => "voice",
            MediaKind::Video => "video",
            MediaKind::File => "file",
            MediaKind::Sharing => "sharing",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Opaque protocol-level payload used for high-fidelity re-sends.
/// Only the transport that produced it knows how to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativePayload(pub serde_json::Value);

/// A group message received from the chat network
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Native message id, if the network provides one
    pub msg_id: Option<String>,
    /// Group (chat) the message was posted in
    pub group_id: String,
    pub sender_id: String,
    /// Display name of the sender
    pub sender_name: String,
    pub kind: MediaKind,
    /// Text, URL/path reference, or a structured payload (JSON/XML)
    pub content: String,
    pub native: Option<NativePayload>,
    pub is_group: bool,
    /// Sent by the account the forwarder runs as
    pub is_self: bool,
}

impl InboundMessage {
    /// Name shown in attribution lines; falls back to the sender id.
    pub fn sender_label(&self) -> &str {
        if self.sender_name.trim().is_empty() {
            &self.sender_id
        } else {
            &self.sender_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_label_falls_back_to_id() {
        let mut msg = InboundMessage {
            msg_id: None,
            group_id: "G1".to_string(),
            sender_id: "U1".to_string(),
            sender_name: "  ".to_string(),
            kind: MediaKind::Text,
            content: "hi".to_string(),
            native: None,
            is_group: true,
            is_self: false,
        };
        assert_eq!(msg.sender_label(), "U1");

        msg.sender_name = "Alice".to_string();
        assert_eq!(msg.sender_label(), "Alice");
    }

    #[test]
    fn test_media_kind_deserializes_lowercase() {
        let kind: MediaKind = serde_json::from_str("\"sharing\"").unwrap();
        assert_eq!(kind, MediaKind::Sharing);
        assert_eq!(MediaKind::Voice.to_string(), "voice");
    }
}
