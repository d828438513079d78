//! Per-media-kind forwarding strategies.
//!
//! A strategy names the native capability it needs and builds the degraded
//! reply used when native re-send is unavailable or exhausted. The retry
//! loop itself lives in the dispatcher and is shared by every strategy.

use std::collections::HashMap;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Url;
use serde_json::Value;
use tracing::debug;

use crate::forwarder::dispatch::DispatchPlan;
use crate::forwarder::transport::{Capability, Reply, ShareCard};
use crate::platform::{InboundMessage, MediaKind};

pub trait ForwardStrategy: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Capability required for native re-send of this message, if any
    fn native_capability(&self, message: &InboundMessage) -> Option<Capability>;

    /// Word used in attribution lines ("👆 image from: ...")
    fn label(&self, message: &InboundMessage) -> &'static str;

    fn fallback(&self, message: &InboundMessage, plan: &DispatchPlan) -> Reply;
}

/// All built-in strategies, one per media kind
pub fn builtin_strategies() -> Vec<Box<dyn ForwardStrategy>> {
    vec![
        Box::new(TextStrategy),
        Box::new(ImageStrategy),
        Box::new(MediaStrategy {
            kind: MediaKind::Voice,
            capability: Capability::ResendVoice,
            label: "voice message",
        }),
        Box::new(MediaStrategy {
            kind: MediaKind::Video,
            capability: Capability::ResendVideo,
            label: "video",
        }),
        Box::new(MediaStrategy {
            kind: MediaKind::File,
            capability: Capability::ResendFile,
            label: "file",
        }),
        Box::new(SharingStrategy),
    ]
}

pub fn attribution(label: &str, sender: &str) -> String {
    format!("👆 {} from: {}", label, sender)
}

/// An http(s) URL with a host, parsed the same way the transport will
pub fn web_url(content: &str) -> Option<Url> {
    let content = content.trim();
    if content.is_empty() || content.contains(char::is_whitespace) {
        return None;
    }
    Url::parse(content)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
}

/// URL or absolute path that the receiving side can fetch on its own
pub fn is_reference(content: &str) -> bool {
    let content = content.trim();
    if content.is_empty() || content.contains(char::is_whitespace) {
        return false;
    }
    web_url(content).is_some() || Path::new(content).is_absolute()
}

struct TextStrategy;

impl ForwardStrategy for TextStrategy {
    fn kind(&self) -> MediaKind {
        MediaKind::Text
    }

    fn native_capability(&self, _message: &InboundMessage) -> Option<Capability> {
        None
    }

    fn label(&self, _message: &InboundMessage) -> &'static str {
        "text"
    }

    fn fallback(&self, message: &InboundMessage, plan: &DispatchPlan) -> Reply {
        let body = plan.apply_prefix(&message.content);
        if plan.show_sender {
            Reply::Text(format!("[{}]:\n{}", message.sender_label(), body))
        } else {
            Reply::Text(body)
        }
    }
}

struct ImageStrategy;

impl ForwardStrategy for ImageStrategy {
    fn kind(&self) -> MediaKind {
        MediaKind::Image
    }

    fn native_capability(&self, _message: &InboundMessage) -> Option<Capability> {
        Some(Capability::ResendImage)
    }

    fn label(&self, _message: &InboundMessage) -> &'static str {
        "image"
    }

    fn fallback(&self, message: &InboundMessage, plan: &DispatchPlan) -> Reply {
        let sender = message.sender_label();
        if is_reference(&message.content) {
            let caption = plan
                .show_sender
                .then(|| plan.apply_prefix(&attribution("image", sender)));
            Reply::Image {
                reference: message.content.trim().to_string(),
                caption,
            }
        } else {
            Reply::Text(plan.apply_prefix(&format!(
                "⚠️ Received an image from {} that could not be forwarded.",
                sender
            )))
        }
    }
}

/// Voice, video and file messages share the same degraded form
struct MediaStrategy {
    kind: MediaKind,
    capability: Capability,
    label: &'static str,
}

impl ForwardStrategy for MediaStrategy {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn native_capability(&self, _message: &InboundMessage) -> Option<Capability> {
        Some(self.capability)
    }

    fn label(&self, _message: &InboundMessage) -> &'static str {
        self.label
    }

    fn fallback(&self, message: &InboundMessage, plan: &DispatchPlan) -> Reply {
        let sender = message.sender_label();
        let what = if self.kind == MediaKind::File {
            format!("file \"{}\"", extract_file_name(&message.content))
        } else {
            self.label.to_string()
        };

        let text = if is_reference(&message.content) {
            let reference = message.content.trim();
            if plan.show_sender {
                format!("🔗 {} from {}: {}", what, sender, reference)
            } else {
                format!("🔗 {}: {}", what, reference)
            }
        } else {
            let article = if what.starts_with(['a', 'e', 'i', 'o', 'u']) {
                "an"
            } else {
                "a"
            };
            format!(
                "⚠️ Received {} {} from {} that could not be forwarded.",
                article, what, sender
            )
        };
        Reply::Text(plan.apply_prefix(&text))
    }
}

struct SharingStrategy;

impl ForwardStrategy for SharingStrategy {
    fn kind(&self) -> MediaKind {
        MediaKind::Sharing
    }

    fn native_capability(&self, message: &InboundMessage) -> Option<Capability> {
        if is_mini_program(&message.content) {
            Some(Capability::ForwardMiniApp)
        } else {
            Some(Capability::ForwardUrl)
        }
    }

    fn label(&self, message: &InboundMessage) -> &'static str {
        if is_mini_program(&message.content) {
            "mini program"
        } else {
            "link"
        }
    }

    fn fallback(&self, message: &InboundMessage, plan: &DispatchPlan) -> Reply {
        let sender = message.sender_label();
        match parse_share(&message.content) {
            Some(mut card) => {
                if plan.show_sender {
                    let by = format!("shared by {}", sender);
                    card.description = if card.description.is_empty() {
                        by
                    } else {
                        format!("{}\n{}", card.description, by)
                    };
                }
                card.title = plan.apply_prefix(&card.title);
                Reply::Share(card)
            }
            None => Reply::Text(plan.apply_prefix(&format!(
                "⚠️ {} shared something that could not be shown as a card:\n{}",
                sender, message.content
            ))),
        }
    }
}

/// Heuristic: mini-program shares carry an app id or an official account
/// user name (`gh_...`).
pub fn is_mini_program(content: &str) -> bool {
    let lower = content.to_lowercase();
    if lower.contains("appid") || lower.contains("weappinfo") || lower.contains("miniprogram") {
        return true;
    }
    content
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|token| token.len() > 3 && token.starts_with("gh_"))
}

/// Parse share content as a JSON object, an XML app message, or a bare URL
pub fn parse_share(content: &str) -> Option<ShareCard> {
    let trimmed = content.trim();

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        let field = |keys: &[&str]| -> String {
            keys.iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let card = ShareCard {
            title: field(&["title"]),
            description: field(&["description", "desc", "des"]),
            url: field(&["url", "link"]),
            thumbnail: Some(field(&["thumbnail", "thumb_url", "thumburl"]))
                .filter(|t| !t.is_empty()),
        };
        return complete(card);
    }

    if trimmed.starts_with('<') {
        let mut fields = xml_fields(trimmed)?;
        let card = ShareCard {
            title: fields.remove("title").unwrap_or_default(),
            description: fields.remove("des").unwrap_or_default(),
            url: fields.remove("url").unwrap_or_default(),
            thumbnail: fields.remove("thumburl"),
        };
        return complete(card);
    }

    if web_url(trimmed).is_some() {
        return Some(ShareCard {
            title: trimmed.to_string(),
            url: trimmed.to_string(),
            ..Default::default()
        });
    }

    None
}

fn complete(mut card: ShareCard) -> Option<ShareCard> {
    if card.title.is_empty() && card.url.is_empty() {
        return None;
    }
    if card.title.is_empty() {
        card.title = card.url.clone();
    }
    Some(card)
}

/// Text of each element in an XML document, keyed by local name. The
/// first non-empty occurrence of a name wins. Entities are decoded and
/// CDATA is taken verbatim. Malformed XML yields None.
fn xml_fields(xml: &str) -> Option<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut open: Vec<(String, String)> = Vec::new();
    let mut fields = HashMap::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                open.push((name, String::new()));
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().ok()?;
                if let Some((_, buf)) = open.last_mut() {
                    buf.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some((_, buf)) = open.last_mut() {
                    buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if let Some((name, buf)) = open.pop() {
                    let text = buf.trim();
                    if !text.is_empty() {
                        fields.entry(name).or_insert_with(|| text.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Share content is not well-formed XML: {}", e);
                return None;
            }
        }
    }

    Some(fields)
}

/// Best-effort file name for "could not be forwarded" notices
pub fn extract_file_name(content: &str) -> String {
    let trimmed = content.trim();

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        let name = ["file_name", "filename", "title", "name"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(name) = name {
            return name.to_string();
        }
    }

    if trimmed.starts_with('<') {
        if let Some(title) = xml_fields(trimmed).and_then(|mut f| f.remove("title")) {
            return title;
        }
    }

    if is_reference(trimmed) {
        let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
        if let Some(last) = without_query.rsplit('/').next().filter(|s| !s.is_empty()) {
            return last.to_string();
        }
    }

    "unknown file".to_string()
}
