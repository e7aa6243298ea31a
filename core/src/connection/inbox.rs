//! Bounded FIFO behind virtual and local connections
//!
//! Push never waits: a full queue is an error the producer must handle.
//! Closing the inbox is the end-of-stream sentinel; queued messages are still
//! drained before `pop` reports the end.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::error::ConnErr;
use crate::message::Message;

struct InboxState {
    queue: VecDeque<Message>,
    closed: bool,
}

pub struct Inbox {
    state: Mutex<InboxState>,
    capacity: usize,
    ready: Notify,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(InboxState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Enqueue without blocking
    pub fn push(&self, msg: Message) -> Result<(), ConnErr> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnErr::Closed);
            }
            if state.queue.len() >= self.capacity {
                return Err(ConnErr::QueueFull);
            }
            state.queue.push_back(msg);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Wait for the next message. `None` once closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.ready.notified();
            {
                let mut state = self.state.lock();
                if let Some(msg) = state.queue.pop_front() {
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-waiting variant of `pop`
    pub fn try_pop(&self) -> Option<Message> {
        self.state.lock().queue.pop_front()
    }

    /// Mark end of stream. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        self.ready.notify_waiters();
        self.ready.notify_one();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Inbox")
            .field("queued", &state.queue.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg(n: u8) -> Message {
        Message::new(MessageType::Use).with_payload(vec![n])
    }

    #[test]
    fn test_push_past_capacity_fails() {
        let inbox = Inbox::new(5);
        for n in 0..5 {
            inbox.push(msg(n)).unwrap();
        }
        assert_eq!(inbox.push(msg(5)), Err(ConnErr::QueueFull));
        assert_eq!(inbox.try_pop().unwrap().payload(), &[0]);
        assert!(inbox.push(msg(5)).is_ok());
        assert_eq!(inbox.len(), 5);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let inbox = Inbox::new(5);
        for n in 0..3 {
            inbox.push(msg(n)).unwrap();
        }
        for n in 0..3 {
            assert_eq!(inbox.pop().await.unwrap().payload(), &[n]);
        }
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let inbox = Inbox::new(5);
        inbox.push(msg(1)).unwrap();
        assert!(inbox.close());
        assert!(!inbox.close());
        assert_eq!(inbox.push(msg(2)), Err(ConnErr::Closed));
        assert!(inbox.pop().await.is_some());
        assert!(inbox.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_and_close() {
        let inbox = Arc::new(Inbox::new(5));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { (inbox.pop().await, inbox.pop().await) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        inbox.push(msg(9)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        inbox.close();
        let (first, second) = waiter.await.unwrap();
        assert_eq!(first.unwrap().payload(), &[9]);
        assert!(second.is_none());
    }
}
