//! Bounded two-class outbound queue.
//!
//! The queue is the only structure shared between a connection's
//! producers (dispatcher, session) and its outbound loop. Control
//! messages always drain before bulk ones, and each class has its own
//! capacity so a flood of draws can never delay a ping or an ack.
//!
//! Producers either fail fast ([`SendQueue::try_push`]) or wait with a
//! deadline ([`SendQueue::push_timeout`]). Nothing blocks forever.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{QueueError, RdxError};
use crate::message::Message;

/// Which class a message is queued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Acks, pings, capability updates, errors, disconnect.
    Control,
    /// Draw payloads.
    Bulk,
}

#[derive(Debug)]
struct Queued {
    message: Message,
    key: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    control: VecDeque<Queued>,
    bulk: VecDeque<Queued>,
    closed: bool,
}

impl Inner {
    fn class(&mut self, priority: Priority) -> &mut VecDeque<Queued> {
        match priority {
            Priority::Control => &mut self.control,
            Priority::Bulk => &mut self.bulk,
        }
    }

    fn depth(&self) -> usize {
        self.control.len() + self.bulk.len()
    }
}

#[derive(Debug)]
pub struct SendQueue {
    inner: Mutex<Inner>,
    control_capacity: usize,
    bulk_capacity: usize,
    /// Signalled when a message becomes available or the queue closes.
    ready: Notify,
    /// Signalled when a slot frees up or the queue closes.
    space: Notify,
}

impl SendQueue {
    pub fn new(control_capacity: usize, bulk_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            control_capacity: control_capacity.max(1),
            bulk_capacity: bulk_capacity.max(1),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking producer must not wedge the connection.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capacity(&self, priority: Priority) -> usize {
        match priority {
            Priority::Control => self.control_capacity,
            Priority::Bulk => self.bulk_capacity,
        }
    }

    /// Queue a message without waiting.
    ///
    /// With a `coalesce_key`, a still-queued message carrying the same key
    /// is replaced in place and no capacity is consumed.
    pub fn try_push(
        &self,
        message: Message,
        priority: Priority,
        coalesce_key: Option<String>,
    ) -> Result<(), QueueError> {
        let capacity = self.capacity(priority);
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let class = inner.class(priority);

        if let Some(key) = coalesce_key.as_deref() {
            if let Some(slot) = class.iter_mut().find(|q| q.key.as_deref() == Some(key)) {
                slot.message = message;
                return Ok(());
            }
        }
        if class.len() >= capacity {
            return Err(QueueError::Full { depth: class.len() });
        }
        class.push_back(Queued {
            message,
            key: coalesce_key,
        });
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Queue a message, waiting up to `timeout` for space.
    pub async fn push_timeout(
        &self,
        message: Message,
        priority: Priority,
        coalesce_key: Option<String>,
        timeout: Duration,
    ) -> Result<(), RdxError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Fast path: re-check under the lock after registering interest.
            {
                let inner = self.lock();
                if inner.closed {
                    return Err(QueueError::Closed.into());
                }
                let len = match priority {
                    Priority::Control => inner.control.len(),
                    Priority::Bulk => inner.bulk.len(),
                };
                let replaces = coalesce_key.as_deref().is_some_and(|key| {
                    let class = match priority {
                        Priority::Control => &inner.control,
                        Priority::Bulk => &inner.bulk,
                    };
                    class.iter().any(|q| q.key.as_deref() == Some(key))
                });
                if replaces || len < self.capacity(priority) {
                    drop(inner);
                    return self
                        .try_push(message, priority, coalesce_key)
                        .map_err(RdxError::from);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RdxError::Timeout(timeout));
            }
        }
    }

    /// Next message to send, control class first.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                let next = inner.control.pop_front().or_else(|| inner.bulk.pop_front());
                if let Some(q) = next {
                    drop(inner);
                    self.space.notify_waiters();
                    return Some(q.message);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-waiting variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<Message> {
        let mut inner = self.lock();
        let next = inner.control.pop_front().or_else(|| inner.bulk.pop_front());
        drop(inner);
        if next.is_some() {
            self.space.notify_waiters();
        }
        next.map(|q| q.message)
    }

    /// Total queued messages across both classes.
    pub fn depth(&self) -> usize {
        self.lock().depth()
    }

    pub fn depth_of(&self, priority: Priority) -> usize {
        let mut inner = self.lock();
        inner.class(priority).len()
    }

    /// Refuse new messages. Already queued ones can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_waiters();
        self.space.notify_waiters();
    }

    /// Append a final message behind everything already queued, ignoring
    /// capacity, and close the queue.
    pub fn close_with(&self, last: Message) {
        {
            let mut inner = self.lock();
            if !inner.closed {
                inner.bulk.push_back(Queued {
                    message: last,
                    key: None,
                });
                inner.closed = true;
            }
        }
        self.ready.notify_waiters();
        self.ready.notify_one();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Drop everything queued, returning how many messages were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.depth();
        inner.control.clear();
        inner.bulk.clear();
        drop(inner);
        self.space.notify_waiters();
        n
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::message::MessageType;

    fn msg(n: u64) -> Message {
        Message::of(MessageType::Ping).with(n)
    }

    fn draw(n: u64) -> Message {
        Message::of(MessageType::Draw).with(n)
    }

    #[tokio::test]
    async fn control_drains_before_bulk() {
        let q = SendQueue::new(8, 8);
        q.try_push(draw(1), Priority::Bulk, None).unwrap();
        q.try_push(draw(2), Priority::Bulk, None).unwrap();
        q.try_push(msg(3), Priority::Control, None).unwrap();

        assert_eq!(q.pop().await, Some(msg(3)));
        assert_eq!(q.pop().await, Some(draw(1)));
        assert_eq!(q.pop().await, Some(draw(2)));
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn full_bulk_class_pushes_back() {
        let q = SendQueue::new(4, 2);
        q.try_push(draw(1), Priority::Bulk, None).unwrap();
        q.try_push(draw(2), Priority::Bulk, None).unwrap();
        assert_eq!(
            q.try_push(draw(3), Priority::Bulk, None),
            Err(QueueError::Full { depth: 2 })
        );
        // The control class is unaffected.
        q.try_push(msg(1), Priority::Control, None).unwrap();
        assert_eq!(q.depth(), 3);
    }

    #[test]
    fn coalescing_replaces_in_place() {
        let q = SendQueue::new(4, 4);
        q.try_push(msg(1), Priority::Control, Some("meta:1".into())).unwrap();
        q.try_push(msg(2), Priority::Control, None).unwrap();
        q.try_push(msg(3), Priority::Control, Some("meta:1".into())).unwrap();

        assert_eq!(q.depth(), 2);
        assert_eq!(q.try_pop(), Some(msg(3)));
        assert_eq!(q.try_pop(), Some(msg(2)));
    }

    #[tokio::test]
    async fn push_timeout_waits_for_space() {
        let q = Arc::new(SendQueue::new(1, 1));
        q.try_push(draw(1), Priority::Bulk, None).unwrap();

        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                q.pop().await
            })
        };
        q.push_timeout(draw(2), Priority::Bulk, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(consumer.await.unwrap(), Some(draw(1)));
        assert_eq!(q.try_pop(), Some(draw(2)));
    }

    #[tokio::test]
    async fn push_timeout_expires() {
        let q = SendQueue::new(1, 1);
        q.try_push(draw(1), Priority::Bulk, None).unwrap();
        let err = q
            .push_timeout(draw(2), Priority::Bulk, None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RdxError::Timeout(_)));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = SendQueue::new(4, 4);
        q.try_push(msg(1), Priority::Control, None).unwrap();
        q.close();
        assert_eq!(q.try_push(msg(2), Priority::Control, None), Err(QueueError::Closed));
        assert_eq!(q.pop().await, Some(msg(1)));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = Arc::new(SendQueue::new(4, 4));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::task::yield_now().await;
        q.try_push(msg(7), Priority::Control, None).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(msg(7)));
    }

    #[tokio::test]
    async fn final_message_goes_last() {
        let q = SendQueue::new(1, 1);
        q.try_push(draw(1), Priority::Bulk, None).unwrap();
        q.try_push(msg(1), Priority::Control, None).unwrap();
        q.close_with(msg(99));

        assert_eq!(q.pop().await, Some(msg(1)));
        assert_eq!(q.pop().await, Some(draw(1)));
        assert_eq!(q.pop().await, Some(msg(99)));
        assert_eq!(q.pop().await, None);
    }

    #[test]
    fn clear_discards() {
        let q = SendQueue::new(4, 4);
        q.try_push(msg(1), Priority::Control, None).unwrap();
        q.try_push(draw(1), Priority::Bulk, None).unwrap();
        assert_eq!(q.clear(), 2);
        assert_eq!(q.depth(), 0);
    }
}
