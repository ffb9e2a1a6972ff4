//! Subscriber bookkeeping.
//!
//! Callbacks registered while the channel is not connected wait in `pending`
//! and move to `attached` when the channel connects. Only attached callbacks
//! receive notifications.

use crate::notification::{Notification, NotificationCallback};

#[derive(Default)]
pub struct CallbackRegistry {
    pending: Vec<NotificationCallback>,
    attached: Vec<NotificationCallback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a callback until the next transition into `Connected`
    pub fn queue(&mut self, callback: NotificationCallback) {
        self.pending.push(callback);
    }

    /// Attach to the live link right away
    pub fn attach(&mut self, callback: NotificationCallback) {
        self.attached.push(callback);
    }

    /// Attach every queued callback in registration order, emptying the queue.
    /// Returns how many were attached.
    pub fn drain_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.attached.append(&mut self.pending);
        count
    }

    /// Attached callbacks, cloned so they can be invoked without holding a lock
    pub fn snapshot(&self) -> Vec<NotificationCallback> {
        self.attached.clone()
    }

    /// Drop everything (channel stopped)
    pub fn clear(&mut self) {
        self.pending.clear();
        self.attached.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn attached_len(&self) -> usize {
        self.attached.len()
    }
}

/// Invoke callbacks in order
pub fn dispatch(callbacks: &[NotificationCallback], notification: &Notification) {
    for callback in callbacks {
        callback(notification);
    }
}
