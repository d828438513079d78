pub mod dedup;
pub mod dispatch;
pub mod payloads;
pub mod rules;
pub mod strategies;
pub mod transport;
pub mod worker;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::forwarder::dedup::{DedupCache, MessageIdentity};
use crate::forwarder::dispatch::{DispatchPlan, Dispatcher, RetryPolicy};
use crate::forwarder::payloads::PayloadIndex;
use crate::forwarder::rules::RuleSet;
use crate::forwarder::transport::Transport;
use crate::forwarder::worker::{DispatchJob, JobQueue, WorkerPool};
use crate::platform::{InboundMessage, NativePayload};

/// Runtime settings for the forwarder, resolved from config
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub show_sender: bool,
    pub retry: RetryPolicy,
    pub dedup_window: Duration,
    pub retention: Duration,
    pub workers: usize,
    pub max_payloads: usize,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            show_sender: true,
            retry: RetryPolicy::default(),
            dedup_window: Duration::from_secs(60),
            retention: Duration::from_secs(600),
            workers: 4,
            max_payloads: 1024,
        }
    }
}

/// What `Forwarder::handle` decided for one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    Unsupported,
    NotGroup,
    SelfMessage,
    NoRule,
    /// No rules at all, or the matched rule has no targets
    MissingConfiguration,
    Duplicate,
    Queued { rule: String, targets: usize },
}

/// Decides whether an inbound message is forwarded and hands the work to
/// the worker pool. `handle` never awaits, so intake is never held up by a
/// slow or retrying send.
pub struct Forwarder {
    rules: RwLock<Arc<RuleSet>>,
    settings: ForwarderSettings,
    dedup: DedupCache,
    payloads: PayloadIndex,
    dispatcher: Arc<Dispatcher>,
    queue: JobQueue,
}

impl Forwarder {
    /// Build the forwarder and spawn its workers on the current runtime.
    pub fn start(
        rules: RuleSet,
        settings: ForwarderSettings,
        transport: Arc<dyn Transport>,
    ) -> (Self, WorkerPool) {
        let dispatcher = Arc::new(Dispatcher::new(transport, settings.retry));
        let (queue, pool) = WorkerPool::spawn(settings.workers, dispatcher.clone());

        info!(
            "Forwarder ready: {} rule(s), dedup window {:?}, retention {:?}",
            rules.len(),
            settings.dedup_window,
            settings.retention
        );

        let forwarder = Self {
            rules: RwLock::new(Arc::new(rules)),
            dedup: DedupCache::new(settings.dedup_window, settings.retention),
            payloads: PayloadIndex::new(settings.retention, settings.max_payloads),
            settings,
            dispatcher,
            queue,
        };
        (forwarder, pool)
    }

    /// Current rule snapshot
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the whole rule set; in-flight jobs keep the rule they matched.
    pub fn reload_rules(&self, rules: RuleSet) {
        info!("Reloading forwarding rules: {} rule(s)", rules.len());
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
    }

    /// Record a native payload that arrived separately from its message
    pub fn record_payload(&self, msg_id: &str, payload: NativePayload) {
        self.payloads.insert(msg_id, payload);
    }

    pub fn handle(&self, mut message: InboundMessage) -> HandleOutcome {
        if !self.dispatcher.supports(message.kind) {
            return HandleOutcome::Unsupported;
        }
        if !message.is_group {
            return HandleOutcome::NotGroup;
        }
        if message.is_self {
            return HandleOutcome::SelfMessage;
        }

        if message.native.is_none() {
            if let Some(id) = message.msg_id.as_deref() {
                message.native = self.payloads.take(id);
            }
        }

        let rules = self.rules();
        if rules.is_empty() {
            warn!("No forwarding rules configured, dropping message");
            return HandleOutcome::MissingConfiguration;
        }

        let Some(rule) = rules.match_rule(&message.group_id, &message.sender_id, &message.content)
        else {
            return HandleOutcome::NoRule;
        };
        if rule.target_groups.is_empty() {
            warn!("Rule '{}' has no target groups, dropping message", rule.name);
            return HandleOutcome::MissingConfiguration;
        }

        // Recorded before any send so a burst of redeliveries is suppressed
        let identity = MessageIdentity::of(&message);
        if self.dedup.is_duplicate(&identity) {
            debug!("Duplicate message {}, skipping", identity);
            return HandleOutcome::Duplicate;
        }

        info!(
            "Rule '{}' matched {} from {} in {}, forwarding to {} group(s)",
            rule.name,
            message.kind,
            message.sender_label(),
            message.group_id,
            rule.target_groups.len()
        );

        let plan = Arc::new(DispatchPlan::for_rule(rule, self.settings.show_sender));
        let message = Arc::new(message);
        for target in &rule.target_groups {
            self.queue.push(DispatchJob {
                id: Uuid::new_v4(),
                message: message.clone(),
                target: target.clone(),
                plan: plan.clone(),
            });
        }

        HandleOutcome::Queued {
            rule: rule.name.clone(),
            targets: rule.target_groups.len(),
        }
    }
}
