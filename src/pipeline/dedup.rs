//! Dedup window. Suppresses repeat deliveries of the same message by the
//! same rule when an upstream scheduler redelivers a job.
//!
//! A rule run first claims its `(source, message, rule)` key. The claim is
//! insert-if-absent: concurrent invocations see `InFlight`, later ones see
//! `AlreadyDelivered` until the entry expires. A claim that is dropped
//! without being completed (partial failure, cancellation) is released so a
//! redelivery can try again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::cancel::CancelSignal;

/// Identity of one rule run for one source message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub source_channel_id: i64,
    pub message_id: i64,
    pub rule_name: String,
}

impl DedupKey {
    pub fn new(source_channel_id: i64, message_id: i64, rule_name: impl Into<String>) -> Self {
        Self {
            source_channel_id,
            message_id,
            rule_name: rule_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EntryState {
    InFlight,
    Completed(Instant),
}

type Entries = Arc<Mutex<HashMap<DedupKey, EntryState>>>;

/// Outcome of [`DedupWindow::claim`].
#[derive(Debug)]
pub enum Claim {
    /// The caller owns the key until the claim is completed or dropped.
    Claimed(DedupClaim),
    AlreadyDelivered,
    InFlight,
}

/// Bounded-retention record of completed rule runs.
#[derive(Clone)]
pub struct DedupWindow {
    entries: Entries,
    retention: Duration,
}

impl DedupWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Insert-if-absent. Expired completions count as absent.
    pub fn claim(&self, key: DedupKey) -> Claim {
        let mut entries = lock(&self.entries);
        match entries.get(&key) {
            Some(EntryState::InFlight) => return Claim::InFlight,
            Some(EntryState::Completed(at)) if at.elapsed() < self.retention => {
                return Claim::AlreadyDelivered;
            }
            _ => {}
        }
        entries.insert(key.clone(), EntryState::InFlight);
        Claim::Claimed(DedupClaim {
            entries: Arc::clone(&self.entries),
            key,
            completed: false,
        })
    }

    /// Drop completions older than the retention period. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        let retention = self.retention;
        entries.retain(|_, state| match state {
            EntryState::InFlight => true,
            EntryState::Completed(at) => at.elapsed() < retention,
        });
        before - entries.len()
    }

    /// Number of tracked keys, in flight or completed.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of a dedup key for the duration of one rule run.
#[derive(Debug)]
pub struct DedupClaim {
    entries: Entries,
    key: DedupKey,
    completed: bool,
}

impl DedupClaim {
    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    /// Record the run as delivered; the key is suppressed for the retention period.
    pub fn complete(mut self) {
        lock(&self.entries).insert(self.key.clone(), EntryState::Completed(Instant::now()));
        self.completed = true;
    }
}

impl Drop for DedupClaim {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut entries = lock(&self.entries);
        if matches!(entries.get(&self.key), Some(EntryState::InFlight)) {
            entries.remove(&self.key);
        }
    }
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<DedupKey, EntryState>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawn a background task that prunes expired entries every `interval`.
pub fn spawn_dedup_sweeper(window: DedupWindow, interval: Duration, cancel: CancelSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = window.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = window.len(), "Pruned dedup window");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(rule: &str) -> DedupKey {
        DedupKey::new(-100, 5, rule)
    }

    #[tokio::test]
    async fn completed_claim_suppresses_repeat() {
        let window = DedupWindow::new(Duration::from_secs(60));
        let Claim::Claimed(claim) = window.claim(key("a")) else {
            panic!("expected claim");
        };
        claim.complete();
        assert!(matches!(window.claim(key("a")), Claim::AlreadyDelivered));
        // Different rule, same message: independent.
        assert!(matches!(window.claim(key("b")), Claim::Claimed(_)));
    }

    #[tokio::test]
    async fn concurrent_claim_sees_in_flight() {
        let window = DedupWindow::new(Duration::from_secs(60));
        let first = window.claim(key("a"));
        assert!(matches!(first, Claim::Claimed(_)));
        assert!(matches!(window.claim(key("a")), Claim::InFlight));
        drop(first);
        assert!(matches!(window.claim(key("a")), Claim::Claimed(_)));
    }

    #[tokio::test]
    async fn dropped_claim_is_released() {
        let window = DedupWindow::new(Duration::from_secs(60));
        {
            let _claim = window.claim(key("a"));
        }
        assert!(window.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_expires_after_retention() {
        let window = DedupWindow::new(Duration::from_secs(10));
        if let Claim::Claimed(c) = window.claim(key("a")) {
            c.complete();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(window.claim(key("a")), Claim::AlreadyDelivered));
        assert_eq!(window.sweep(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(window.sweep(), 1);
        assert!(matches!(window.claim(key("a")), Claim::Claimed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_can_be_reclaimed_without_sweep() {
        let window = DedupWindow::new(Duration::from_secs(1));
        if let Claim::Claimed(c) = window.claim(key("a")) {
            c.complete();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(window.claim(key("a")), Claim::Claimed(_)));
    }

    #[tokio::test]
    async fn claims_from_many_tasks_are_exclusive() {
        let window = DedupWindow::new(Duration::from_secs(60));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let w = window.clone();
            handles.push(tokio::spawn(async move {
                match w.claim(key("a")) {
                    Claim::Claimed(c) => {
                        tokio::task::yield_now().await;
                        c.complete();
                        1
                    }
                    _ => 0,
                }
            }));
        }
        let mut winners = 0;
        for h in handles {
            winners += h.await.unwrap();
        }
        assert_eq!(winners, 1);
    }
}
