use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::forwarder::rules::ForwardRule;
use crate::forwarder::strategies::{attribution, builtin_strategies, ForwardStrategy};
use crate::forwarder::transport::{Capability, CapabilitySet, Reply, Transport};
use crate::platform::{InboundMessage, MediaKind, NativePayload};

/// Native re-send retry budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Pause between two native attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Per-rule presentation settings for one dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    pub rule: String,
    pub show_sender: bool,
    pub forward_original: bool,
    pub prefix: String,
}

impl DispatchPlan {
    pub fn for_rule(rule: &ForwardRule, default_show_sender: bool) -> Self {
        Self {
            rule: rule.name.clone(),
            show_sender: rule.show_sender.unwrap_or(default_show_sender),
            forward_original: rule.forward_original,
            prefix: rule.add_prefix.clone(),
        }
    }

    /// Prepend the rule prefix unless the rule forwards verbatim
    pub fn apply_prefix(&self, text: &str) -> String {
        if self.forward_original || self.prefix.is_empty() {
            text.to_string()
        } else {
            format!("{}{}", self.prefix, text)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    SentNative,
    SentFallback,
    Failed,
}

/// Routes a message to the strategy for its media kind and runs the
/// native → fallback chain against one target group.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    capabilities: CapabilitySet,
    strategies: HashMap<MediaKind, Box<dyn ForwardStrategy>>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        let capabilities = transport.capabilities();
        debug!("Transport capabilities: {:?}", capabilities);

        let strategies = builtin_strategies()
            .into_iter()
            .map(|strategy| (strategy.kind(), strategy))
            .collect();

        Self {
            transport,
            capabilities,
            strategies,
            retry,
        }
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        self.strategies.contains_key(&kind)
    }

    /// Forward `message` to `target`. Never fails; the outcome is for logging.
    pub async fn dispatch(
        &self,
        message: &InboundMessage,
        target: &str,
        plan: &DispatchPlan,
    ) -> DispatchOutcome {
        let Some(strategy) = self.strategies.get(&message.kind) else {
            warn!("No forwarding strategy for {} messages", message.kind);
            return DispatchOutcome::Failed;
        };

        if let Some(outcome) = self.try_native(strategy.as_ref(), message, target, plan).await {
            return outcome;
        }

        let reply = strategy.fallback(message, plan);
        match self.transport.send(target, reply).await {
            Ok(()) => {
                info!(
                    "Forwarded {} to {} via fallback (rule '{}')",
                    message.kind, target, plan.rule
                );
                DispatchOutcome::SentFallback
            }
            Err(e) => {
                error!(
                    "Failed to forward {} to {} (rule '{}'): {:#}",
                    message.kind, target, plan.rule, e
                );
                DispatchOutcome::Failed
            }
        }
    }

    /// `None` means fall through to the degraded reply.
    async fn try_native(
        &self,
        strategy: &dyn ForwardStrategy,
        message: &InboundMessage,
        target: &str,
        plan: &DispatchPlan,
    ) -> Option<DispatchOutcome> {
        let capability = strategy.native_capability(message)?;
        let payload = message.native.as_ref()?;
        if !self.capabilities.contains(capability) {
            debug!(
                "Transport lacks {}, using fallback for {}",
                capability, message.kind
            );
            return None;
        }

        if !self.resend_with_retry(capability, target, payload).await {
            warn!(
                "Native {} to {} exhausted {} attempt(s), falling back",
                capability, target, self.retry.max_retries
            );
            return None;
        }

        info!(
            "Forwarded {} to {} natively (rule '{}')",
            message.kind, target, plan.rule
        );

        if plan.show_sender {
            let text = attribution(strategy.label(message), message.sender_label());
            if let Err(e) = self.transport.send(target, Reply::Text(text)).await {
                warn!("Failed to send attribution to {}: {:#}", target, e);
            }
        }

        Some(DispatchOutcome::SentNative)
    }

    async fn resend_with_retry(
        &self,
        capability: Capability,
        target: &str,
        payload: &NativePayload,
    ) -> bool {
        for attempt in 1..=self.retry.max_retries {
            match self
                .transport
                .resend_native(capability, target, payload)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "Native {} to {} failed (attempt {}/{}): {:#}",
                        capability, target, attempt, self.retry.max_retries, e
                    );
                    if attempt < self.retry.max_retries {
                        tokio::time::sleep(self.retry.retry_delay).await;
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::transport::mock::{Call, RecordingTransport};
    use serde_json::json;

    fn message(kind: MediaKind, content: &str, native: bool) -> InboundMessage {
        InboundMessage {
            msg_id: Some("m1".to_string()),
            group_id: "G1".to_string(),
            sender_id: "U1".to_string(),
            sender_name: "U1".to_string(),
            kind,
            content: content.to_string(),
            native: native.then(|| NativePayload(json!({ "chat_id": 1, "message_id": 7 }))),
            is_group: true,
            is_self: false,
        }
    }

    fn plan(show_sender: bool) -> DispatchPlan {
        DispatchPlan {
            rule: "r".to_string(),
            show_sender,
            forward_original: true,
            prefix: String::new(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::ZERO,
        }
    }

    fn dispatcher(transport: &Arc<RecordingTransport>) -> Dispatcher {
        Dispatcher::new(transport.clone(), fast_retry())
    }

    #[tokio::test]
    async fn test_native_success_after_transient_failures() {
        let transport = Arc::new(RecordingTransport {
            native_failures: 2,
            ..RecordingTransport::with_capabilities([Capability::ResendImage])
        });
        let d = dispatcher(&transport);

        let outcome = d
            .dispatch(&message(MediaKind::Image, "img", true), "G2", &plan(true))
            .await;

        assert_eq!(outcome, DispatchOutcome::SentNative);
        assert_eq!(transport.native_calls(), 3);
        assert_eq!(
            transport.sends(),
            vec![("G2".to_string(), Reply::Text("👆 image from: U1".into()))]
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_fall_back_once() {
        let transport = Arc::new(RecordingTransport {
            native_failures: usize::MAX,
            ..RecordingTransport::with_capabilities([Capability::ResendVoice])
        });
        let d = dispatcher(&transport);

        let outcome = d
            .dispatch(&message(MediaKind::Voice, "blob", true), "G2", &plan(false))
            .await;

        assert_eq!(outcome, DispatchOutcome::SentFallback);
        assert_eq!(transport.native_calls(), 3);
        assert_eq!(transport.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_capability_skips_native() {
        let transport = Arc::new(RecordingTransport::default());
        let d = dispatcher(&transport);

        let outcome = d
            .dispatch(
                &message(MediaKind::Sharing, "https://example.com", true),
                "G2",
                &plan(false),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::SentFallback);
        assert_eq!(transport.native_calls(), 0);
        assert!(matches!(transport.sends()[0].1, Reply::Share(_)));
    }

    #[tokio::test]
    async fn test_missing_payload_skips_native() {
        let transport = Arc::new(RecordingTransport::with_capabilities([
            Capability::ResendVideo,
        ]));
        let d = dispatcher(&transport);

        d.dispatch(&message(MediaKind::Video, "v", false), "G2", &plan(false))
            .await;

        assert_eq!(transport.native_calls(), 0);
        assert_eq!(transport.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fallback_is_contained() {
        let transport = Arc::new(RecordingTransport {
            fail_sends_to: vec!["G2".to_string()],
            ..Default::default()
        });
        let d = dispatcher(&transport);

        let outcome = d
            .dispatch(&message(MediaKind::Text, "hi", false), "G2", &plan(false))
            .await;

        assert_eq!(outcome, DispatchOutcome::Failed);
    }

    #[tokio::test]
    async fn test_zero_retries_goes_straight_to_fallback() {
        let transport = Arc::new(RecordingTransport::with_capabilities([
            Capability::ResendFile,
        ]));
        let d = Dispatcher::new(
            transport.clone(),
            RetryPolicy {
                max_retries: 0,
                retry_delay: Duration::ZERO,
            },
        );

        let outcome = d
            .dispatch(&message(MediaKind::File, "/f/a.txt", true), "G2", &plan(false))
            .await;

        assert_eq!(outcome, DispatchOutcome::SentFallback);
        assert_eq!(transport.native_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_between_attempts_only() {
        let transport = Arc::new(RecordingTransport {
            native_failures: usize::MAX,
            ..RecordingTransport::with_capabilities([Capability::ResendImage])
        });
        let d = Dispatcher::new(transport.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        d.dispatch(&message(MediaKind::Image, "img", true), "G2", &plan(false))
            .await;

        // 3 attempts, 2 pauses of 1s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
        let calls = transport.calls();
        assert!(matches!(calls.last(), Some(Call::Send { .. })));
    }

    #[test]
    fn test_plan_uses_rule_override() {
        let mut rule = crate::forwarder::rules::rule("r", &["G1"], &["G2"]);
        assert!(DispatchPlan::for_rule(&rule, true).show_sender);
        rule.show_sender = Some(false);
        assert!(!DispatchPlan::for_rule(&rule, true).show_sender);
    }
}
