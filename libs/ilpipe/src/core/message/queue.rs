// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-component message queue.
//!
//! Any thread may post; only the owning worker thread dequeues. Posting never
//! blocks. Waiting does not consume: a message that ends a wait stays queued
//! and is returned by the next [`MessageQueue::get`].

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{Command, Message};

pub struct MessageQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    // Messages pulled off the channel by `wait` but not yet handed out.
    pending: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn put(&self, message: Message) {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.tx.send(message);
    }

    pub fn post(&self, command: Command) {
        self.put(Message::new(command));
    }

    /// Post a [`Command::Nop`] to wake a waiting worker.
    pub fn wake(&self) {
        self.post(Command::Nop);
    }

    /// Dequeue the next message without blocking.
    pub fn get(&self) -> Option<Message> {
        if let Some(message) = self.pending.lock().pop_front() {
            return Some(message);
        }
        self.rx.try_recv().ok()
    }

    /// Block until a message is available or `timeout` elapses.
    ///
    /// `None` waits indefinitely. Returns `true` when a message is available.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        if !self.pending.lock().is_empty() || !self.rx.is_empty() {
            return true;
        }

        let received = match timeout {
            None => self.rx.recv().ok(),
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        match received {
            Some(message) => {
                self.pending.lock().push_back(message);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len() + self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ComponentState;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new();
        queue.post(Command::StateSet(ComponentState::Idle));
        queue.post(Command::StateSet(ComponentState::Executing));
        queue.wake();

        assert_eq!(
            queue.get().map(|m| m.command),
            Some(Command::StateSet(ComponentState::Idle))
        );
        assert_eq!(
            queue.get().map(|m| m.command),
            Some(Command::StateSet(ComponentState::Executing))
        );
        assert_eq!(queue.get().map(|m| m.command), Some(Command::Nop));
        assert!(queue.get().is_none());
    }

    #[test]
    fn test_wait_does_not_consume() {
        let queue = Arc::new(MessageQueue::new());
        let poster = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            poster.post(Command::Flush(1));
        });

        assert!(queue.wait(None));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().map(|m| m.command), Some(Command::Flush(1)));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let queue = MessageQueue::new();
        let start = Instant::now();
        assert!(!queue.wait(Some(Duration::from_millis(5))));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_wait_returns_immediately_when_pending() {
        let queue = MessageQueue::new();
        queue.wake();
        assert!(queue.wait(Some(Duration::from_secs(5))));
        assert!(queue.wait(None));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_payload_is_preserved() {
        let queue = MessageQueue::new();
        queue.put(Message::with_payload(
            Command::MarkBuffer(0),
            bytes::Bytes::from_static(b"mark"),
        ));
        let message = queue.get().unwrap();
        assert_eq!(message.payload.as_deref(), Some(&b"mark"[..]));
    }
}
