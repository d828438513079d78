use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::platform::InboundMessage;

/// Characters of content that feed a synthesized identity
const CONTENT_PREFIX_CHARS: usize = 64;

/// Identity of an inbound message for deduplication purposes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageIdentity(String);

impl MessageIdentity {
    /// Use the native message id when present, otherwise hash kind, group
    /// and the content prefix.
    ///
    /// The synthesized form cannot tell apart two different messages that
    /// share kind, group and content prefix; within the suppression window
    /// the second one is dropped.
    pub fn of(message: &InboundMessage) -> Self {
        match message.msg_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::synthesize(message),
        }
    }

    fn synthesize(message: &InboundMessage) -> Self {
        let prefix: String = message.content.chars().take(CONTENT_PREFIX_CHARS).collect();
        let mut hasher = Sha256::new();
        hasher.update(message.kind.tag().as_bytes());
        hasher.update([0u8]);
        hasher.update(message.group_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(prefix.as_bytes());
        Self(format!("content:{}", hex::encode(hasher.finalize())))
    }

    #[allow(dead_code)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Time-bounded record of recently forwarded message identities.
///
/// Check-and-record happens under a single lock so two concurrent
/// deliveries of the same message cannot both be treated as new.
pub struct DedupCache {
    seen: Mutex<HashMap<MessageIdentity, Instant>>,
    suppression: Duration,
    retention: Duration,
}

impl DedupCache {
    pub fn new(suppression: Duration, retention: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            suppression,
            retention,
        }
    }

    /// True if `identity` was recorded within the suppression window.
    /// Otherwise records it as seen now and returns false.
    pub fn is_duplicate(&self, identity: &MessageIdentity) -> bool {
        self.check_at(identity, Instant::now())
    }

    pub(crate) fn check_at(&self, identity: &MessageIdentity, now: Instant) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        let before = seen.len();
        seen.retain(|_, last| now.saturating_duration_since(*last) < self.retention);
        if seen.len() < before {
            debug!("Purged {} expired dedup entries", before - seen.len());
        }

        if let Some(last) = seen.get(identity) {
            if now.saturating_duration_since(*last) < self.suppression {
                return true;
            }
        }

        seen.insert(identity.clone(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
