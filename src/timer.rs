//! Timers
//!
//! State machines own a [`TimerSlots`] and only ever hand out tokens. The
//! socket drivers own a [`TimerQueue`] that turns those tokens back into
//! expiry events. A firing is acted on only if its token is still the one
//! currently armed in the slot, so a timer that races its cancelling event
//! is harmless.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio_util::time::{delay_queue, DelayQueue};

/// Identifies one arming of a timer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Logical timer slots: arm, fire once, cancel
#[derive(Debug)]
pub struct TimerSlots<K> {
    next: u64,
    armed: HashMap<K, TimerToken>,
}

impl<K: Copy + Eq + Hash> TimerSlots<K> {
    pub fn new() -> Self {
        Self {
            next: 0,
            armed: HashMap::new(),
        }
    }

    /// Arm `key`, replacing any earlier arming
    pub fn arm(&mut self, key: K) -> TimerToken {
        self.next += 1;
        let token = TimerToken(self.next);
        self.armed.insert(key, token);
        token
    }

    /// Disarm `key`. Returns whether it was armed.
    pub fn cancel(&mut self, key: K) -> bool {
        self.armed.remove(&key).is_some()
    }

    /// Consume a firing. Returns `true` only for the current arming,
    /// which is then disarmed.
    pub fn fire(&mut self, key: K, token: TimerToken) -> bool {
        if self.armed.get(&key) == Some(&token) {
            self.armed.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.armed.contains_key(&key)
    }
}

impl<K: Copy + Eq + Hash> Default for TimerSlots<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime side of the timers, backed by a tokio delay queue
pub struct TimerQueue<K> {
    queue: DelayQueue<(K, TimerToken)>,
    keys: HashMap<K, delay_queue::Key>,
}

impl<K: Copy + Eq + Hash> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    /// Schedule `key` to expire after `after`, replacing an earlier schedule
    pub fn schedule(&mut self, key: K, token: TimerToken, after: Duration) {
        self.cancel(key);
        let queue_key = self.queue.insert((key, token), after);
        self.keys.insert(key, queue_key);
    }

    pub fn cancel(&mut self, key: K) {
        if let Some(queue_key) = self.keys.remove(&key) {
            self.queue.try_remove(&queue_key);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait for the next expiry. Resolves to `None` immediately when nothing
    /// is scheduled, so callers should use it as a conditional
    /// `tokio::select!` branch.
    pub async fn next_expired(&mut self) -> Option<(K, TimerToken)> {
        let expired = std::future::poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let queue_key = expired.key();
        let (key, token) = expired.into_inner();
        if self.keys.get(&key) == Some(&queue_key) {
            self.keys.remove(&key);
        }
        Some((key, token))
    }
}

impl<K: Copy + Eq + Hash> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
