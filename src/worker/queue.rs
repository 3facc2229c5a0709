//! Forwarding work queue.
//!
//! Producers (the REST `POST /process` handler, the Telegram poller) hand
//! `ForwardJob`s to a bounded channel. A single consumer loop runs each job
//! through the orchestrator on its own task, with at most `concurrency`
//! jobs in flight. Transient failures are re-enqueued after a linear
//! backoff until `max_attempts` is reached. Delivery is at-least-once;
//! the orchestrator's dedup window absorbs repeats.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ForwardError, QueueError};
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::orchestrator::ForwardingOrchestrator;

/// Capacity of the job channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One "process message M from channel C" request.
#[derive(Debug, Clone)]
pub struct ForwardJob {
    pub id: Uuid,
    pub source_channel_id: i64,
    pub message_id: i64,
    /// 1 on first delivery.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ForwardJob {
    pub fn new(source_channel_id: i64, message_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_channel_id,
            message_id,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Producer handle for the job channel.
#[derive(Clone)]
pub struct ForwardQueue {
    tx: mpsc::Sender<ForwardJob>,
}

impl ForwardQueue {
    /// Create a queue and the receiver the worker consumes.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ForwardJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue processing of one source message. Waits for room when full.
    pub async fn enqueue(&self, source_channel_id: i64, message_id: i64) -> Result<Uuid, QueueError> {
        let job = ForwardJob::new(source_channel_id, message_id);
        let id = job.id;
        self.tx.send(job).await.map_err(|_| QueueError::Closed)?;
        debug!(%id, source_channel_id, message_id, "Job enqueued");
        Ok(id)
    }

    /// Enqueue without waiting. Used by the ingest loop, which must not stall.
    pub fn try_enqueue(&self, source_channel_id: i64, message_id: i64) -> Result<Uuid, QueueError> {
        let job = ForwardJob::new(source_channel_id, message_id);
        let id = job.id;
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        Ok(id)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `retry_backoff * n`.
    pub retry_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Spawn the consumer loop. It exits when `cancel` fires or every producer
/// has been dropped.
pub fn spawn_forward_worker(
    orchestrator: Arc<ForwardingOrchestrator>,
    queue: ForwardQueue,
    mut rx: mpsc::Receiver<ForwardJob>,
    settings: WorkerSettings,
    cancel: CancelSignal,
) -> JoinHandle<()> {
    // Only a weak sender is kept for retries so the loop still ends once the
    // last external producer is gone.
    let retry_tx = queue.tx.downgrade();
    drop(queue);
    let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));

    tokio::spawn(async move {
        info!(
            concurrency = settings.concurrency,
            max_attempts = settings.max_attempts,
            "Forward worker started"
        );
        loop {
            let job = tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            let permit = tokio::select! {
                p = Arc::clone(&permits).acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };

            let orchestrator = Arc::clone(&orchestrator);
            let retry_tx = retry_tx.clone();
            let settings = settings.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let retry = run_job(&orchestrator, job, &settings, &cancel).await;
                // Released before a retry waits for queue room.
                drop(permit);
                if let Some((job, delay)) = retry {
                    requeue(job, delay, &cancel, retry_tx).await;
                }
            });
        }
        info!("Forward worker stopped");
    })
}

/// Process one job. Returns the follow-up attempt and its delay when a
/// transient failure should be retried.
async fn run_job(
    orchestrator: &ForwardingOrchestrator,
    job: ForwardJob,
    settings: &WorkerSettings,
    cancel: &CancelSignal,
) -> Option<(ForwardJob, Duration)> {
    let result = orchestrator
        .process(job.source_channel_id, job.message_id, cancel)
        .await;

    match result {
        Ok(outcome) => {
            debug!(
                job_id = %job.id,
                attempt = job.attempt,
                delivered = outcome.delivered_count(),
                failed = outcome.failed_count(),
                "Job finished"
            );
            None
        }
        Err(ForwardError::Cancelled) => {
            debug!(job_id = %job.id, "Job cancelled");
            None
        }
        Err(e) if e.is_transient() && job.attempt < settings.max_attempts => {
            let delay = settings.retry_backoff * job.attempt;
            warn!(
                job_id = %job.id,
                attempt = job.attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "Job failed, retrying"
            );
            Some((job.next_attempt(), delay))
        }
        Err(e) => {
            error!(
                job_id = %job.id,
                attempt = job.attempt,
                source_channel_id = job.source_channel_id,
                message_id = job.message_id,
                error = %e,
                "Job failed"
            );
            None
        }
    }
}

/// Put `job` back on the queue after `delay`.
async fn requeue(
    job: ForwardJob,
    delay: Duration,
    cancel: &CancelSignal,
    retry_tx: mpsc::WeakSender<ForwardJob>,
) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => return,
    }
    let Some(tx) = retry_tx.upgrade() else {
        warn!(job_id = %job.id, "Queue closed, dropping retry");
        return;
    };
    let job_id = job.id;
    tokio::select! {
        sent = tx.send(job) => {
            if sent.is_err() {
                warn!(%job_id, "Queue closed, dropping retry");
            }
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::error::ChannelError;
    use crate::pipeline::dedup::DedupWindow;
    use crate::pipeline::types::{MessageTransport, MessageView, OutgoingMessage};
    use crate::rules::model::ForwardingRule;
    use crate::rules::store::InMemoryRuleStore;

    /// Fails the first `fetch_failures` fetches with a transport error.
    #[derive(Default)]
    struct FlakyTransport {
        messages: HashMap<(i64, i64), MessageView>,
        fetch_failures: u32,
        fetches: AtomicU32,
        sent: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl MessageTransport for FlakyTransport {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch_message(&self, channel_id: i64, message_id: i64) -> Result<Option<MessageView>, ChannelError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if n < self.fetch_failures {
                return Err(ChannelError::Http("timeout".into()));
            }
            Ok(self.messages.get(&(channel_id, message_id)).cloned())
        }

        async fn send_message(&self, target: i64, _: &OutgoingMessage) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(target);
            Ok(())
        }
    }

    fn setup(fetch_failures: u32) -> (Arc<FlakyTransport>, Arc<ForwardingOrchestrator>) {
        let mut transport = FlakyTransport {
            fetch_failures,
            ..Default::default()
        };
        transport.messages.insert((1, 7), MessageView::text(1, 7, "hello"));
        let transport = Arc::new(transport);
        let rule = ForwardingRule::new("r", true, 1, vec![2], Default::default(), Default::default()).unwrap();
        let orchestrator = Arc::new(ForwardingOrchestrator::new(
            Arc::new(InMemoryRuleStore::with_rules([rule])),
            transport.clone(),
            DedupWindow::new(Duration::from_secs(60)),
            2,
        ));
        (transport, orchestrator)
    }

    fn fast_settings(max_attempts: u32) -> WorkerSettings {
        WorkerSettings {
            concurrency: 2,
            max_attempts,
            retry_backoff: Duration::from_millis(5),
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn new_job_starts_at_first_attempt() {
        let job = ForwardJob::new(1, 2);
        assert_eq!(job.attempt, 1);
        let retry = job.next_attempt();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.id, job.id);
    }

    #[tokio::test]
    async fn enqueued_job_is_processed() {
        let (transport, orchestrator) = setup(0);
        let (queue, rx) = ForwardQueue::new(8);
        let cancel = CancelSignal::new();
        let handle = spawn_forward_worker(orchestrator, queue.clone(), rx, fast_settings(3), cancel.clone());

        queue.enqueue(1, 7).await.unwrap();
        wait_for(|| transport.sent.lock().unwrap().len() == 1).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn transient_fetch_failure_is_retried() {
        let (transport, orchestrator) = setup(2);
        let (queue, rx) = ForwardQueue::new(8);
        let cancel = CancelSignal::new();
        let handle = spawn_forward_worker(orchestrator, queue.clone(), rx, fast_settings(3), cancel.clone());

        queue.enqueue(1, 7).await.unwrap();
        wait_for(|| transport.sent.lock().unwrap().len() == 1).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let (transport, orchestrator) = setup(10);
        let (queue, rx) = ForwardQueue::new(8);
        let cancel = CancelSignal::new();
        let handle = spawn_forward_worker(orchestrator, queue.clone(), rx, fast_settings(2), cancel.clone());

        queue.enqueue(1, 7).await.unwrap();
        wait_for(|| transport.fetches.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);
        assert!(transport.sent.lock().unwrap().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retries_keep_flowing_through_a_full_queue() {
        let (transport, orchestrator) = setup(u32::MAX);
        let (queue, rx) = ForwardQueue::new(1);
        let cancel = CancelSignal::new();
        let settings = WorkerSettings {
            concurrency: 1,
            max_attempts: 2,
            retry_backoff: Duration::from_millis(10),
        };
        let handle = spawn_forward_worker(orchestrator, queue.clone(), rx, settings, cancel.clone());

        for message_id in [7, 8, 9] {
            tokio::time::timeout(Duration::from_secs(1), queue.enqueue(1, message_id))
                .await
                .expect("enqueue blocked")
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Two attempts for each of the three jobs.
        wait_for(|| transport.fetches.load(Ordering::SeqCst) == 6).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn missing_message_is_not_retried() {
        let (transport, orchestrator) = setup(0);
        let (queue, rx) = ForwardQueue::new(8);
        let cancel = CancelSignal::new();
        let handle = spawn_forward_worker(orchestrator, queue.clone(), rx, fast_settings(3), cancel.clone());

        queue.enqueue(1, 999).await.unwrap();
        wait_for(|| transport.fetches.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn worker_exits_when_producers_dropped() {
        let (_, orchestrator) = setup(0);
        let (queue, rx) = ForwardQueue::new(8);
        let handle = spawn_forward_worker(orchestrator, queue, rx, fast_settings(3), CancelSignal::new());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn enqueue_after_close_fails() {
        let (queue, rx) = ForwardQueue::new(1);
        drop(rx);
        assert!(queue.is_closed());
        assert!(matches!(queue.enqueue(1, 1).await, Err(QueueError::Closed)));
        assert!(matches!(queue.try_enqueue(1, 1), Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn try_enqueue_reports_full() {
        let (queue, _rx) = ForwardQueue::new(1);
        queue.try_enqueue(1, 1).unwrap();
        assert!(matches!(queue.try_enqueue(1, 2), Err(QueueError::Full)));
    }
}
