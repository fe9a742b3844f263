//! Delivery with delayed retry.
//!
//! Every outbound message goes through [`Courier::deliver`]. A message the
//! sink refuses is queued at the tail of an unbounded FIFO and retried by
//! [`Courier::flush`] (called once per scheduler tick) until it succeeds.
//! Nothing is persisted; the queue is lost on restart.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::sink::NotificationSink;

/// A message waiting for (re)delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Chat id.
    pub target: String,
    /// Message text.
    pub text: String,
    /// What the message is, for logs.
    pub description: String,
}

/// Shared delivery wrapper around a [`NotificationSink`].
///
/// Safe to call from any thread; the sink is never called with the queue
/// locked.
pub struct Courier {
    sink: Arc<dyn NotificationSink>,
    delayed: Mutex<VecDeque<PendingMessage>>,
}

impl Courier {
    /// Create a courier with an empty retry queue.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Courier {
            sink,
            delayed: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to deliver; on failure queue the message for retry.
    ///
    /// Returns whether the sink accepted the message. Never fails.
    pub fn deliver(&self, message: PendingMessage) -> bool {
        match self.sink.send(&message.target, &message.text) {
            Ok(()) => {
                debug!("Courier: delivered {} to {}", message.description, message.target);
                true
            }
            Err(e) => {
                warn!(
                    "Courier: failed to send {} to {}: {} (queued for retry)",
                    message.description, message.target, e
                );
                self.delayed.lock().push_back(message);
                false
            }
        }
    }

    /// Retry every queued message once, in queue order.
    ///
    /// Successful messages leave the queue; failed ones go back to its tail.
    /// Returns the number delivered.
    pub fn flush(&self) -> usize {
        let pending: Vec<PendingMessage> = self.delayed.lock().drain(..).collect();
        if pending.is_empty() {
            return 0;
        }

        let total = pending.len();
        let mut delivered = 0;
        for message in pending {
            if self.deliver(message) {
                delivered += 1;
            }
        }
        info!("Courier: retried {} delayed messages, {} delivered", total, delivered);
        delivered
    }

    /// Number of messages waiting for retry.
    pub fn pending(&self) -> usize {
        self.delayed.lock().len()
    }

    /// Snapshot of the retry queue.
    pub fn pending_messages(&self) -> Vec<PendingMessage> {
        self.delayed.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier").field("pending", &self.pending()).finish()
    }
}
