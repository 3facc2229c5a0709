//! Forwarding orchestrator. Turns "message M arrived on channel C" into
//! deliveries on every matching rule's targets.
//!
//! Flow per source message:
//! 1. Fetch the message from the transport (fails the request if missing)
//! 2. Match enabled rules for the source channel
//! 3. Per rule, concurrently and independently:
//!    filter → dedup claim → edit → dispatch
//! 4. Aggregate per-rule outcomes
//!
//! Only the fetch, the rule lookup and cancellation can fail a request.
//! Filter rejections, dedup hits and target failures are recorded outcomes.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::error::ForwardError;
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::dedup::{Claim, DedupKey, DedupWindow};
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::editor::edit_message;
use crate::pipeline::filter::evaluate_filter;
use crate::pipeline::types::{
    FilterDecision, ForwardOutcome, MessageTransport, MessageView, OutgoingMessage, RuleOutcome,
    RuleResult, SkipReason,
};
use crate::rules::matcher::RuleMatcher;
use crate::rules::model::ForwardingRule;
use crate::rules::store::RuleStore;

pub struct ForwardingOrchestrator {
    transport: Arc<dyn MessageTransport>,
    matcher: RuleMatcher,
    dispatcher: Dispatcher,
    dedup: DedupWindow,
}

impl ForwardingOrchestrator {
    pub fn new(
        store: Arc<dyn RuleStore>,
        transport: Arc<dyn MessageTransport>,
        dedup: DedupWindow,
        max_parallel_sends: usize,
    ) -> Self {
        Self {
            matcher: RuleMatcher::new(store),
            dispatcher: Dispatcher::new(Arc::clone(&transport), max_parallel_sends),
            transport,
            dedup,
        }
    }

    pub fn dedup_window(&self) -> &DedupWindow {
        &self.dedup
    }

    /// Process one source message through every matching rule.
    pub async fn process(
        &self,
        source_channel_id: i64,
        message_id: i64,
        cancel: &CancelSignal,
    ) -> Result<ForwardOutcome, ForwardError> {
        info!(source_channel_id, message_id, "Processing source message");

        let message = tokio::select! {
            r = self.fetch(source_channel_id, message_id) => r?,
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
        };

        let rules = tokio::select! {
            r = self.matcher.matching_rules(source_channel_id) => r?,
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
        };

        if rules.is_empty() {
            debug!(source_channel_id, message_id, "No enabled rules for source");
        }

        let outcomes = join_all(rules.iter().map(|rule| self.process_rule(rule, &message, cancel))).await;

        if cancel.is_cancelled() {
            warn!(
                source_channel_id,
                message_id,
                "Processing cancelled; copies already sent are kept"
            );
            return Err(ForwardError::Cancelled);
        }

        let outcome = ForwardOutcome {
            source_channel_id,
            message_id,
            rules: outcomes,
            completed_at: Utc::now(),
        };

        info!(
            source_channel_id,
            message_id,
            rules = outcome.rules.len(),
            delivered = outcome.delivered_count(),
            failed = outcome.failed_count(),
            "Source message processed"
        );
        Ok(outcome)
    }

    async fn fetch(&self, channel_id: i64, message_id: i64) -> Result<MessageView, ForwardError> {
        match self.transport.fetch_message(channel_id, message_id).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                warn!(channel_id, message_id, "Source message not found");
                Err(ForwardError::MessageNotFound {
                    channel_id,
                    message_id,
                })
            }
            Err(e) => {
                error!(channel_id, message_id, error = %e, "Failed to fetch source message");
                Err(ForwardError::Fetch(e))
            }
        }
    }

    async fn process_rule(
        &self,
        rule: &ForwardingRule,
        message: &MessageView,
        cancel: &CancelSignal,
    ) -> RuleOutcome {
        let skipped = |reason: SkipReason| RuleOutcome {
            rule_name: rule.name().to_string(),
            result: RuleResult::Skipped { reason },
        };

        if let FilterDecision::Reject(reason) = evaluate_filter(message, rule.filter_options()) {
            debug!(rule = %rule.name(), reason = reason.label(), "Rule skipped by filter");
            return skipped(reason);
        }

        let key = DedupKey::new(message.channel_id, message.message_id, rule.name());
        let claim = match self.dedup.claim(key) {
            Claim::Claimed(claim) => claim,
            Claim::AlreadyDelivered => {
                info!(
                    rule = %rule.name(),
                    message_id = message.message_id,
                    "Already delivered within dedup window"
                );
                return skipped(SkipReason::AlreadyDelivered);
            }
            Claim::InFlight => {
                info!(
                    rule = %rule.name(),
                    message_id = message.message_id,
                    "Another invocation is delivering this message"
                );
                return skipped(SkipReason::InFlight);
            }
        };

        let edited = edit_message(message, rule.edit_options());
        let outgoing = OutgoingMessage::new(message, edited);
        let targets = self
            .dispatcher
            .dispatch(rule.name(), &outgoing, rule.target_channel_ids(), cancel)
            .await;

        if targets.iter().all(|t| t.is_delivered()) {
            claim.complete();
        } else {
            // Dropping the claim lets a redelivery retry this rule.
            drop(claim);
        }

        RuleOutcome {
            rule_name: rule.name().to_string(),
            result: RuleResult::Dispatched { targets },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::ChannelError;
    use crate::pipeline::types::DeliveryStatus;
    use crate::rules::options::{MessageEditOptions, MessageFilterOptions};
    use crate::rules::store::InMemoryRuleStore;

    #[derive(Default)]
    struct FakeTransport {
        messages: HashMap<(i64, i64), MessageView>,
        fetch_error: bool,
        failing: HashSet<i64>,
        hang_sends: bool,
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl MessageTransport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch_message(&self, channel_id: i64, message_id: i64) -> Result<Option<MessageView>, ChannelError> {
            if self.fetch_error {
                return Err(ChannelError::Http("connection reset".into()));
            }
            Ok(self.messages.get(&(channel_id, message_id)).cloned())
        }

        async fn send_message(&self, target: i64, message: &OutgoingMessage) -> Result<(), ChannelError> {
            if self.hang_sends {
                std::future::pending::<()>().await;
            }
            self.sent.lock().unwrap().push((target, message.text.clone()));
            if self.failing.contains(&target) {
                return Err(ChannelError::SendFailed {
                    name: "fake".into(),
                    reason: "forbidden".into(),
                });
            }
            Ok(())
        }
    }

    fn transport_with(text: &str) -> FakeTransport {
        let mut t = FakeTransport::default();
        t.messages.insert((1, 10), MessageView::text(1, 10, text).with_sender(5));
        t
    }

    fn rule(name: &str, targets: Vec<i64>, edit: MessageEditOptions, filter: MessageFilterOptions) -> ForwardingRule {
        ForwardingRule::new(name, true, 1, targets, edit, filter).unwrap()
    }

    fn orchestrator(transport: Arc<FakeTransport>, rules: Vec<ForwardingRule>) -> ForwardingOrchestrator {
        ForwardingOrchestrator::new(
            Arc::new(InMemoryRuleStore::with_rules(rules)),
            transport,
            DedupWindow::new(Duration::from_secs(300)),
            4,
        )
    }

    #[tokio::test]
    async fn missing_message_fails_request() {
        let orch = orchestrator(Arc::new(FakeTransport::default()), vec![]);
        let err = orch.process(1, 10, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, ForwardError::MessageNotFound { channel_id: 1, message_id: 10 }));
    }

    #[tokio::test]
    async fn fetch_error_is_transient() {
        let transport = FakeTransport {
            fetch_error: true,
            ..Default::default()
        };
        let orch = orchestrator(Arc::new(transport), vec![]);
        let err = orch.process(1, 10, &CancelSignal::new()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn no_rules_yields_empty_outcome() {
        let orch = orchestrator(Arc::new(transport_with("hi")), vec![]);
        let outcome = orch.process(1, 10, &CancelSignal::new()).await.unwrap();
        assert!(outcome.rules.is_empty());
    }

    #[tokio::test]
    async fn rules_are_edited_independently() {
        let transport = Arc::new(transport_with("hello"));
        let orch = orchestrator(
            Arc::clone(&transport),
            vec![
                rule("b", vec![3], MessageEditOptions::default().with_append_text("B"), Default::default()),
                rule("a", vec![2], MessageEditOptions::default().with_prepend_text("A"), Default::default()),
            ],
        );
        let outcome = orch.process(1, 10, &CancelSignal::new()).await.unwrap();
        let names: Vec<&str> = outcome.rules.iter().map(|r| r.rule_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let mut sent = transport.sent.lock().unwrap().clone();
        sent.sort();
        assert_eq!(sent, vec![(2, "A hello".to_string()), (3, "hello B".to_string())]);
    }

    #[tokio::test]
    async fn filtered_rule_records_reason_and_sends_nothing() {
        let transport = Arc::new(transport_with("short"));
        let orch = orchestrator(
            Arc::clone(&transport),
            vec![rule("r", vec![2], Default::default(), MessageFilterOptions::default().with_min_length(10))],
        );
        let outcome = orch.process(1, 10, &CancelSignal::new()).await.unwrap();
        assert_eq!(outcome.rules[0].skipped_reason(), Some(SkipReason::LengthOutOfRange));
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(orch.dedup_window().is_empty());
    }

    #[tokio::test]
    async fn redelivery_after_success_is_suppressed() {
        let transport = Arc::new(transport_with("hi"));
        let orch = orchestrator(Arc::clone(&transport), vec![rule("r", vec![2, 3], Default::default(), Default::default())]);

        orch.process(1, 10, &CancelSignal::new()).await.unwrap();
        let second = orch.process(1, 10, &CancelSignal::new()).await.unwrap();

        assert_eq!(second.rules[0].skipped_reason(), Some(SkipReason::AlreadyDelivered));
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_allows_retry() {
        let mut t = transport_with("hi");
        t.failing.insert(3);
        let transport = Arc::new(t);
        let orch = orchestrator(Arc::clone(&transport), vec![rule("r", vec![2, 3], Default::default(), Default::default())]);

        let first = orch.process(1, 10, &CancelSignal::new()).await.unwrap();
        assert_eq!(first.failed_count(), 1);
        let second = orch.process(1, 10, &CancelSignal::new()).await.unwrap();
        assert!(second.rules[0].skipped_reason().is_none());
        assert_eq!(transport.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn cancellation_aborts_hanging_dispatch() {
        let mut t = transport_with("hi");
        t.hang_sends = true;
        let orch = Arc::new(orchestrator(
            Arc::new(t),
            vec![rule("r", vec![2], Default::default(), Default::default())],
        ));
        let cancel = CancelSignal::new();
        let task = {
            let orch = Arc::clone(&orch);
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.process(1, 10, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancel did not abort promptly")
            .unwrap();
        assert!(matches!(result, Err(ForwardError::Cancelled)));
        assert!(orch.dedup_window().is_empty());
    }

    #[tokio::test]
    async fn failed_target_reason_is_reported() {
        let mut t = transport_with("hi");
        t.failing.insert(2);
        let orch = orchestrator(Arc::new(t), vec![rule("r", vec![2], Default::default(), Default::default())]);
        let outcome = orch.process(1, 10, &CancelSignal::new()).await.unwrap();
        assert!(matches!(
            &outcome.rules[0].targets()[0].status,
            DeliveryStatus::Failed { reason } if reason.contains("forbidden")
        ));
    }
}
