//! Bounded hand-off from hash workers to the persistence actor.
//!
//! Every producer phase registers a [`CacheSender`] before it emits and
//! drops it when done. The underlying channel closes once the [`CacheQueue`]
//! and every registered sender are gone, so the actor neither stops early
//! nor waits forever.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::db::CacheRecord;

/// Exponential backoff used while the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Counters shared by the queue and all of its senders
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    active_senders: Arc<AtomicUsize>,
    send_failures: Arc<AtomicU64>,
}

impl QueueMetrics {
    pub fn active_senders(&self) -> usize {
        self.active_senders.load(Ordering::SeqCst)
    }

    /// Number of enqueue attempts that found the queue full
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }
}

pub struct CacheQueue {
    tx: mpsc::Sender<CacheRecord>,
    metrics: QueueMetrics,
    retry: RetryPolicy,
}

impl CacheQueue {
    pub fn new(tx: mpsc::Sender<CacheRecord>, retry: RetryPolicy) -> Self {
        Self {
            tx,
            metrics: QueueMetrics::default(),
            retry,
        }
    }

    /// Register a producer. The queue stays open while the returned sender lives.
    pub fn register(&self) -> CacheSender {
        let active = self.metrics.active_senders.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(active, "cache sender registered");
        CacheSender {
            tx: self.tx.clone(),
            metrics: self.metrics.clone(),
            retry: self.retry,
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics.clone()
    }
}

pub struct CacheSender {
    tx: mpsc::Sender<CacheRecord>,
    metrics: QueueMetrics,
    retry: RetryPolicy,
}

impl CacheSender {
    /// Enqueue `record`, backing off while the queue is full.
    ///
    /// Never drops a record: it either lands in the queue or the actor is
    /// gone, in which case the error is returned.
    pub async fn send(&self, record: CacheRecord) -> Result<()> {
        let mut record = record;
        let mut delay = self.retry.initial_delay;

        loop {
            match self.tx.try_send(record) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => {
                    let failures = self.metrics.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(
                        path = %returned.path.display(),
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "cache queue full, retrying"
                    );
                    record = returned;
                    tokio::time::sleep(delay).await;
                    delay = self.retry.next_delay(delay);
                }
                Err(TrySendError::Closed(returned)) => {
                    bail!(
                        "persistence actor stopped before {} was recorded",
                        returned.path.display()
                    );
                }
            }
        }
    }
}

impl Drop for CacheSender {
    fn drop(&mut self) {
        let remaining = self.metrics.active_senders.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(remaining, "cache sender finished");
    }
}
