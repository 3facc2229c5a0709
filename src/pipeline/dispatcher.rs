//! Dispatcher: fans one edited message out to a rule's targets.
//!
//! Each target is attempted exactly once. A failing target is logged and
//! recorded; it never stops delivery to the others. Up to
//! `max_parallel_sends` sends run at once. Attempts start in target-list
//! order and outcomes are reported in target-list order. Retrying is left
//! to the caller.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::types::{DeliveryStatus, MessageTransport, OutgoingMessage, TargetOutcome};

/// Default number of concurrent sends per rule.
pub const DEFAULT_MAX_PARALLEL_SENDS: usize = 4;

pub struct Dispatcher {
    transport: Arc<dyn MessageTransport>,
    max_parallel_sends: usize,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn MessageTransport>, max_parallel_sends: usize) -> Self {
        Self {
            transport,
            max_parallel_sends: max_parallel_sends.max(1),
        }
    }

    /// Attempt delivery of `message` to every target.
    ///
    /// Targets not yet attempted when `cancel` fires are reported as failed;
    /// copies already sent stay sent.
    pub async fn dispatch(
        &self,
        rule_name: &str,
        message: &OutgoingMessage,
        targets: &[i64],
        cancel: &CancelSignal,
    ) -> Vec<TargetOutcome> {
        stream::iter(targets.iter().copied())
            .map(|target| self.send_one(rule_name, message, target, cancel))
            .buffered(self.max_parallel_sends)
            .collect()
            .await
    }

    async fn send_one(
        &self,
        rule_name: &str,
        message: &OutgoingMessage,
        target: i64,
        cancel: &CancelSignal,
    ) -> TargetOutcome {
        if cancel.is_cancelled() {
            return failed(target, "cancelled before send");
        }

        let result = tokio::select! {
            r = self.transport.send_message(target, message) => r,
            _ = cancel.cancelled() => return failed(target, "cancelled during send"),
        };

        match result {
            Ok(()) => {
                debug!(
                    rule = %rule_name,
                    transport = self.transport.name(),
                    target,
                    "Delivered to target"
                );
                TargetOutcome {
                    channel_id: target,
                    status: DeliveryStatus::Delivered,
                }
            }
            Err(e) => {
                warn!(
                    rule = %rule_name,
                    transport = self.transport.name(),
                    target,
                    error = %e,
                    "Delivery to target failed"
                );
                failed(target, e.to_string())
            }
        }
    }
}

fn failed(channel_id: i64, reason: impl Into<String>) -> TargetOutcome {
    TargetOutcome {
        channel_id,
        status: DeliveryStatus::Failed {
            reason: reason.into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::ChannelError;
    use crate::pipeline::types::{EditedMessage, MessageView, TextFormat};

    /// Records sends, fails for `failing` targets, tracks peak concurrency.
    #[derive(Default)]
    struct StubTransport {
        sent: Mutex<Vec<i64>>,
        failing: HashSet<i64>,
        delay: Option<Duration>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl MessageTransport for StubTransport {
        fn name(&self) -> &str {
            "stub"
        }

        async fn fetch_message(&self, _: i64, _: i64) -> Result<Option<MessageView>, ChannelError> {
            Ok(None)
        }

        async fn send_message(&self, target: i64, _: &OutgoingMessage) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(target);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(&target) {
                return Err(ChannelError::SendFailed {
                    name: "stub".into(),
                    reason: "chat not found".into(),
                });
            }
            Ok(())
        }
    }

    fn outgoing() -> OutgoingMessage {
        let view = MessageView::text(-1, 10, "hi");
        OutgoingMessage::new(
            &view,
            EditedMessage {
                text: "hi".into(),
                format: TextFormat::Plain,
                modified: false,
                flags: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn one_attempt_per_target_in_order() {
        let transport = Arc::new(StubTransport::default());
        let dispatcher = Dispatcher::new(transport.clone(), 1);
        let outcomes = dispatcher
            .dispatch("r", &outgoing(), &[3, 1, 2], &CancelSignal::new())
            .await;
        assert_eq!(*transport.sent.lock().unwrap(), vec![3, 1, 2]);
        let ids: Vec<i64> = outcomes.iter().map(|o| o.channel_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert!(outcomes.iter().all(TargetOutcome::is_delivered));
    }

    #[tokio::test]
    async fn failure_does_not_stop_siblings() {
        let transport = Arc::new(StubTransport {
            failing: HashSet::from([2]),
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(transport.clone(), 4);
        let outcomes = dispatcher
            .dispatch("r", &outgoing(), &[1, 2, 3], &CancelSignal::new())
            .await;
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
        assert!(outcomes[0].is_delivered());
        assert!(matches!(
            &outcomes[1].status,
            DeliveryStatus::Failed { reason } if reason.contains("chat not found")
        ));
        assert!(outcomes[2].is_delivered());
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let transport = Arc::new(StubTransport {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(transport.clone(), 2);
        let targets: Vec<i64> = (1..=6).collect();
        let outcomes = dispatcher
            .dispatch("r", &outgoing(), &targets, &CancelSignal::new())
            .await;
        assert_eq!(outcomes.len(), 6);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_signal_skips_sends() {
        let transport = Arc::new(StubTransport::default());
        let dispatcher = Dispatcher::new(transport.clone(), 2);
        let cancel = CancelSignal::new();
        cancel.cancel();
        let outcomes = dispatcher.dispatch("r", &outgoing(), &[1, 2], &cancel).await;
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(outcomes.iter().all(|o| !o.is_delivered()));
    }

    #[test]
    fn zero_parallelism_is_clamped() {
        let dispatcher = Dispatcher::new(Arc::new(StubTransport::default()), 0);
        assert_eq!(dispatcher.max_parallel_sends, 1);
    }
}
