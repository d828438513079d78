use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::platform::NativePayload;

/// Native re-send entry points a transport may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ResendImage,
    ResendVoice,
    ResendVideo,
    ResendFile,
    ForwardMiniApp,
    ForwardUrl,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::ResendImage => "resend-image",
            Capability::ResendVoice => "resend-voice",
            Capability::ResendVideo => "resend-video",
            Capability::ResendFile => "resend-file",
            Capability::ForwardMiniApp => "forward-mini-app",
            Capability::ForwardUrl => "forward-url",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(HashSet<Capability>);

impl CapabilitySet {
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Structured link/mini-program card
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareCard {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// An outbound message in its degraded (non-native) form
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// Image sent by URL or local path
    Image {
        reference: String,
        caption: Option<String>,
    },
    Share(ShareCard),
}

/// Outbound side of the chat network
#[async_trait]
pub trait Transport: Send + Sync {
    /// Native entry points this transport exposes. Queried once when the
    /// dispatcher is built.
    fn capabilities(&self) -> CapabilitySet;

    async fn send(&self, target: &str, reply: Reply) -> Result<()>;

    /// Re-send the original protocol payload to `target`
    async fn resend_native(
        &self,
        capability: Capability,
        target: &str,
        payload: &NativePayload,
    ) -> Result<()>;
}
