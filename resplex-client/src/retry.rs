//! Replay of operations that failed with a connection-level error.
//!
//! One background worker drains the queue in FIFO order whenever it is
//! woken (new entry or reconnect) and on a periodic tick that expires stale
//! entries. Draining stops at the first entry with no available connection.

use crate::config::{RetryConfig, RetryPolicy};
use crate::connection::Connection;
use crate::error::ClientError;
use crate::operation::{Message, Phase};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

/// Shortest interval between expiry sweeps.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Selects the connection a retried message is resent on.
pub(crate) trait RetryTarget: Send + Sync {
    fn select(&self, message: &Message) -> Result<Arc<Connection>, ClientError>;
}

/// Retry queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub queued: u64,
    pub resent: u64,
    pub timed_out: u64,
    pub rejected: u64,
}

/// Bounded FIFO of failed operations awaiting a resend.
pub struct RetryQueue {
    policy: RetryPolicy,
    max_len: usize,
    timeout: Duration,
    queue: Mutex<VecDeque<Message>>,
    wake: Notify,
    target: Weak<dyn RetryTarget>,
    shutdown: AtomicBool,
    queued: AtomicU64,
    resent: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

impl RetryQueue {
    pub(crate) fn new(config: &RetryConfig, target: Weak<dyn RetryTarget>) -> Self {
        Self {
            policy: config.policy,
            max_len: config.max_queue_length,
            timeout: config.timeout(),
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            target,
            shutdown: AtomicBool::new(false),
            queued: AtomicU64::new(0),
            resent: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            queued: self.queued.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Whether `message` may be replayed under the configured policy.
    pub(crate) fn is_eligible(&self, message: &Message) -> bool {
        if self.max_len == 0 || message.flags.is_no_retry() || message.flags.is_admin() {
            return false;
        }
        let phase = message.controller.phase();
        if phase.is_terminal() || phase == Phase::Consumed {
            return false;
        }
        match self.policy {
            RetryPolicy::Always => true,
            RetryPolicy::IfNotSent => !message.controller.was_sent(),
        }
    }

    /// Queues `message`, or hands it back with the rejection reason.
    pub(crate) fn try_enqueue(&self, message: Message) -> Result<(), (Message, ClientError)> {
        let mut queue = self.queue.lock();
        if self.shutdown.load(Ordering::SeqCst) {
            return Err((message, ClientError::Disposed));
        }
        if queue.len() >= self.max_len {
            drop(queue);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Retry queue full ({} entries), rejecting operation",
                self.max_len
            );
            return Err((message, ClientError::RetryQueueFull));
        }
        message.controller.on_queued();
        queue.push_back(message);
        drop(queue);

        self.queued.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();
        Ok(())
    }

    /// Wakes the worker after a connection came back.
    pub fn notify_reconnected(&self) {
        self.wake.notify_one();
    }

    /// Runs the drain worker until [`shutdown`](Self::shutdown).
    pub(crate) async fn run(self: Arc<Self>) {
        let tick = (self.timeout / 4).max(MIN_TICK);
        while !self.shutdown.load(Ordering::SeqCst) {
            let _ = tokio::time::timeout(tick, self.wake.notified()).await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.drain().await;
        }
        tracing::debug!("Retry worker stopped");
    }

    async fn drain(&self) {
        loop {
            let Some(message) = self.queue.lock().pop_front() else {
                return;
            };
            let phase = message.controller.phase();
            if phase.is_terminal() || phase == Phase::Consumed {
                continue;
            }

            let age = message.created_at.elapsed();
            if age >= self.timeout {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Retry entry timed out after {:?}", age);
                message.fail(ClientError::Timeout);
                continue;
            }

            let Some(target) = self.target.upgrade() else {
                message.fail(ClientError::Disposed);
                continue;
            };
            match target.select(&message) {
                Ok(conn) => {
                    self.resent.fetch_add(1, Ordering::Relaxed);
                    conn.write_messages(vec![message]).await;
                }
                Err(_) => {
                    self.queue.lock().push_front(message);
                    return;
                }
            }
        }
    }

    /// Stops the worker and fails every queued entry with
    /// [`ClientError::Disposed`].
    pub fn shutdown(&self) {
        let drained: Vec<Message> = {
            let mut queue = self.queue.lock();
            self.shutdown.store(true, Ordering::SeqCst);
            queue.drain(..).collect()
        };
        if !drained.is_empty() {
            tracing::debug!("Disposing {} queued retries", drained.len());
        }
        for message in drained {
            message.fail(ClientError::Disposed);
        }
        self.wake.notify_one();
    }
}
