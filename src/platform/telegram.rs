use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, UserId};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::forwarder::strategies::web_url;
use crate::forwarder::transport::{Capability, CapabilitySet, Reply, Transport};
use crate::forwarder::{Forwarder, HandleOutcome};
use crate::platform::{InboundMessage, MediaKind, NativePayload};

/// Telegram's message length limit, with some headroom
const MAX_TEXT_LEN: usize = 4000;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

fn parse_chat_id(target: &str) -> Result<ChatId> {
    let id = target
        .trim()
        .parse::<i64>()
        .with_context(|| format!("Invalid Telegram chat id: {}", target))?;
    Ok(ChatId(id))
}

/// Origin chat and message id carried in a Telegram native payload
fn payload_ref(payload: &NativePayload) -> Result<(ChatId, MessageId)> {
    let chat_id = payload.0["chat_id"]
        .as_i64()
        .context("Native payload missing 'chat_id'")?;
    let message_id = payload.0["message_id"]
        .as_i64()
        .and_then(|id| i32::try_from(id).ok())
        .context("Native payload missing 'message_id'")?;
    Ok((ChatId(chat_id), MessageId(message_id)))
}

fn share_card_text(card: &crate::forwarder::transport::ShareCard) -> String {
    let mut text = format!("🔗 {}", card.title);
    if !card.description.is_empty() {
        text.push('\n');
        text.push_str(&card.description);
    }
    if !card.url.is_empty() && card.url != card.title {
        text.push('\n');
        text.push_str(&card.url);
    }
    text
}

/// Sends forwarded messages through the Bot API.
///
/// Media is re-sent with `copyMessage`, which keeps the original file
/// without re-uploading it. Games stand in for mini-program shares and go
/// through `forwardMessage`. Plain link shares have no native path.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn capabilities(&self) -> CapabilitySet {
        [
            Capability::ResendImage,
            Capability::ResendVoice,
            Capability::ResendVideo,
            Capability::ResendFile,
            Capability::ForwardMiniApp,
        ]
        .into_iter()
        .collect()
    }

    async fn send(&self, target: &str, reply: Reply) -> Result<()> {
        let chat_id = parse_chat_id(target)?;
        match reply {
            Reply::Text(text) => {
                for chunk in split_message(&text, MAX_TEXT_LEN) {
                    self.bot
                        .send_message(chat_id, chunk)
                        .await
                        .with_context(|| format!("Failed to send text to {}", target))?;
                }
            }
            Reply::Image { reference, caption } => {
                let file = match web_url(&reference) {
                    Some(url) => InputFile::url(url),
                    None => InputFile::file(PathBuf::from(reference.trim())),
                };
                let mut request = self.bot.send_photo(chat_id, file);
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                request
                    .await
                    .with_context(|| format!("Failed to send image to {}", target))?;
            }
            Reply::Share(card) => {
                self.bot
                    .send_message(chat_id, share_card_text(&card))
                    .await
                    .with_context(|| format!("Failed to send share card to {}", target))?;
            }
        }
        Ok(())
    }

    async fn resend_native(
        &self,
        capability: Capability,
        target: &str,
        payload: &NativePayload,
    ) -> Result<()> {
        let chat_id = parse_chat_id(target)?;
        let (from_chat, message_id) = payload_ref(payload)?;
        match capability {
            Capability::ForwardMiniApp => {
                self.bot
                    .forward_message(chat_id, from_chat, message_id)
                    .await
                    .with_context(|| format!("Failed to forward message to {}", target))?;
            }
            Capability::ForwardUrl => {
                anyhow::bail!("Telegram transport does not support {}", capability)
            }
            Capability::ResendImage
            | Capability::ResendVoice
            | Capability::ResendVideo
            | Capability::ResendFile => {
                self.bot
                    .copy_message(chat_id, from_chat, message_id)
                    .await
                    .with_context(|| format!("Failed to copy message to {}", target))?;
            }
        }
        Ok(())
    }
}

/// Forwarder message id for a Telegram message
fn message_key(chat_id: ChatId, message_id: MessageId) -> String {
    format!("{}:{}", chat_id.0, message_id.0)
}

/// Re-send handle for a Telegram message. Text goes through send_message,
/// so only media gets one.
fn native_payload(
    chat_id: ChatId,
    message_id: MessageId,
    kind: MediaKind,
) -> Option<NativePayload> {
    (kind != MediaKind::Text)
        .then(|| NativePayload(json!({ "chat_id": chat_id.0, "message_id": message_id.0 })))
}

/// Convert a Telegram message into the forwarder's model.
/// Returns None for message types the forwarder does not relay.
fn to_inbound(msg: &Message, bot_id: UserId) -> Option<InboundMessage> {
    let user = msg.from.as_ref()?;
    let caption = msg.caption().unwrap_or_default().to_string();

    let (kind, content) = if let Some(text) = msg.text() {
        (MediaKind::Text, text.to_string())
    } else if msg.photo().is_some() {
        (MediaKind::Image, caption)
    } else if msg.voice().is_some() {
        (MediaKind::Voice, caption)
    } else if msg.video().is_some() {
        (MediaKind::Video, caption)
    } else if let Some(doc) = msg.document() {
        let content = json!({
            "file_name": doc.file_name.clone().unwrap_or_default(),
            "caption": caption,
        });
        (MediaKind::File, content.to_string())
    } else if let Some(game) = msg.game() {
        let content = json!({
            "type": "miniprogram",
            "title": game.title,
            "description": game.description,
        });
        (MediaKind::Sharing, content.to_string())
    } else {
        return None;
    };

    Some(InboundMessage {
        msg_id: Some(message_key(msg.chat.id, msg.id)),
        group_id: msg.chat.id.0.to_string(),
        sender_id: user.id.0.to_string(),
        sender_name: user.full_name(),
        kind,
        content,
        native: None,
        is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        is_self: user.id == bot_id,
    })
}

/// Shared state for the Telegram handlers
struct RelayState {
    forwarder: Arc<Forwarder>,
    config_path: PathBuf,
    admin_user_ids: Vec<u64>,
    bot_id: UserId,
}

/// Run the Telegram message source until the dispatcher stops
pub async fn run(
    bot: Bot,
    forwarder: Arc<Forwarder>,
    config_path: PathBuf,
    admin_user_ids: Vec<u64>,
) -> Result<()> {
    let me = bot.get_me().await.context("Failed to fetch bot identity")?;
    info!("Starting Telegram platform as @{}", me.username());

    let state = Arc::new(RelayState {
        forwarder,
        config_path,
        admin_user_ids,
        bot_id: me.id,
    });

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<RelayState>) -> ResponseResult<()> {
    if msg.chat.is_private() {
        return handle_command(bot, msg, state).await;
    }

    let Some(inbound) = to_inbound(&msg, state.bot_id) else {
        return Ok(());
    };

    // The raw handle travels beside the parsed message and is attached by
    // the forwarder under the same id
    if let Some(payload) = native_payload(msg.chat.id, msg.id, inbound.kind) {
        state
            .forwarder
            .record_payload(&message_key(msg.chat.id, msg.id), payload);
    }

    let group = inbound.group_id.clone();
    match state.forwarder.handle(inbound) {
        HandleOutcome::Queued { rule, targets } => {
            debug!("Message from {} queued by '{}' for {} target(s)", group, rule, targets);
        }
        outcome => debug!("Message from {} not forwarded: {:?}", group, outcome),
    }

    Ok(())
}

/// Admin commands in a private chat with the bot
async fn handle_command(bot: Bot, msg: Message, state: Arc<RelayState>) -> ResponseResult<()> {
    let user_id = match msg.from.as_ref() {
        Some(user) => user.id.0,
        None => return Ok(()),
    };
    if !state.admin_user_ids.contains(&user_id) {
        return Ok(());
    }

    let text = match msg.text() {
        Some(t) => t.trim(),
        None => return Ok(()),
    };

    info!("Admin command from {}: {}", user_id, text);

    match text {
        "/start" => {
            bot.send_message(
                msg.chat.id,
                "I forward group messages according to the configured rules.\n\n\
                 Commands:\n\
                 /rules - List forwarding rules\n\
                 /reload - Reload rules from the config file",
            )
            .await?;
        }
        "/rules" => {
            let rules = state.forwarder.rules();
            if rules.is_empty() {
                bot.send_message(msg.chat.id, "No forwarding rules configured.")
                    .await?;
            } else {
                let mut list = String::from("Forwarding rules:\n\n");
                for (i, rule) in rules.rules().iter().enumerate() {
                    let mut sources: Vec<&str> =
                        rule.source_groups.iter().map(String::as_str).collect();
                    sources.sort_unstable();
                    list.push_str(&format!(
                        "{}. {}: {} -> {}",
                        i + 1,
                        rule.name,
                        sources.join(", "),
                        rule.target_groups.join(", ")
                    ));
                    if !rule.keywords.is_empty() {
                        list.push_str(&format!(" (keywords: {})", rule.keywords.join(", ")));
                    }
                    list.push('\n');
                }
                for chunk in split_message(&list, MAX_TEXT_LEN) {
                    bot.send_message(msg.chat.id, chunk).await.ok();
                }
            }
        }
        "/reload" => match Config::load(&state.config_path) {
            Ok(config) => {
                let rules = config.rule_set();
                let count = rules.len();
                state.forwarder.reload_rules(rules);
                bot.send_message(msg.chat.id, format!("Reloaded {} rule(s).", count))
                    .await?;
            }
            Err(e) => {
                error!("Failed to reload config: {:#}", e);
                bot.send_message(msg.chat.id, format!("Reload failed: {:#}", e))
                    .await?;
            }
        },
        _ => {
            warn!("Unknown admin command: {}", text);
        }
    }

    Ok(())
}
