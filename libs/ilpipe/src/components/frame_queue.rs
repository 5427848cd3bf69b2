// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Input side shared by the renderers.
//!
//! A frame arrives through `empty_this_buffer` into `ready`, stays at the
//! head of `ready` while it is being rendered, then moves to `processing`
//! until upstream has taken it back. Only [`FrameQueue::return_rendered`]
//! gives frames back, and it is serialised, so no frame is returned twice.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::{
    BufferCounts, BufferHeader, ComponentBase, ListKind, NodeId, NodeLists, PipelineError, Result,
};

#[derive(Default)]
pub(crate) struct FrameNode {
    pub header: Option<BufferHeader>,
}

pub(crate) struct FrameQueue {
    port: u32,
    lists: NodeLists<FrameNode>,
    step: usize,
    return_lock: Mutex<()>,
    waiting_for_frame: AtomicBool,
    pub received: AtomicU64,
    pub returned: AtomicU64,
}

impl FrameQueue {
    pub fn new(port: u32, initial: usize, step: usize, max: usize) -> Self {
        Self {
            port,
            lists: NodeLists::new(initial, max, FrameNode::default),
            step: step.max(1),
            return_lock: Mutex::new(()),
            waiting_for_frame: AtomicBool::new(false),
            received: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        }
    }

    pub fn counts(&self) -> BufferCounts {
        self.lists.counts()
    }

    /// Fill path: park `buffer` in `ready`, growing the pool if needed.
    pub fn accept(&self, base: &ComponentBase, buffer: &BufferHeader) -> Result<()> {
        {
            let mut lists = self.lists.lock();
            if lists.is_empty(ListKind::Empty) && lists.grow(self.step, FrameNode::default) == 0 {
                return Err(PipelineError::InsufficientResources(format!(
                    "all {} frame nodes on port {} in use",
                    lists.total(),
                    self.port
                )));
            }
            if let Some(id) = lists.move_front(ListKind::Empty, ListKind::Ready) {
                lists.node_mut(id).header = Some(buffer.clone());
            }
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        if self.waiting_for_frame.swap(false, Ordering::AcqRel) {
            base.queue().wake();
        }
        Ok(())
    }

    /// Head of `ready`, left in place.
    pub fn head(&self) -> Option<(NodeId, BufferHeader)> {
        let lists = self.lists.lock();
        let id = lists.front(ListKind::Ready)?;
        lists.node(id).header.clone().map(|header| (id, header))
    }

    /// Announce that the worker is about to wait for a frame. Returns `true`
    /// if one arrived in the meantime and the worker should not wait.
    pub fn prepare_wait(&self) -> bool {
        self.waiting_for_frame.store(true, Ordering::Release);
        if self.lists.is_empty(ListKind::Ready) {
            return false;
        }
        self.waiting_for_frame.store(false, Ordering::Release);
        true
    }

    /// The frame at `id` has been rendered (or dropped). `false` when a flush
    /// already took it.
    pub fn mark_rendered(&self, id: NodeId) -> bool {
        self.lists
            .lock()
            .move_node(id, ListKind::Ready, ListKind::Processing)
    }

    /// Give back rendered frames, except `keep`. With `until_accepted` every
    /// refusal is retried; otherwise the pass stops at the first one.
    pub fn return_rendered(
        &self,
        base: &ComponentBase,
        keep: Option<NodeId>,
        until_accepted: bool,
    ) {
        let _serial = self.return_lock.lock();
        loop {
            let next = {
                let lists = self.lists.lock();
                lists
                    .iter(ListKind::Processing)
                    .find(|(id, _)| Some(*id) != keep)
                    .and_then(|(id, node)| node.header.clone().map(|h| (id, h)))
            };
            let Some((id, header)) = next else {
                return;
            };

            if until_accepted {
                base.give_back_until_accepted(self.port, header);
            } else if let Err(e) = base.give_back(self.port, header) {
                tracing::debug!("[{}] Frame give-back refused: {}", base.name(), e);
                return;
            }

            let mut lists = self.lists.lock();
            lists.node_mut(id).header = None;
            lists.move_node(id, ListKind::Processing, ListKind::Empty);
            self.returned.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Hand every frame still held back upstream, blocking until each one is
    /// accepted.
    pub fn flush(&self, base: &ComponentBase) {
        self.lists
            .lock()
            .move_all(ListKind::Ready, ListKind::Processing);
        self.return_rendered(base, None, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BufferId, BufferPayload};

    #[test]
    fn test_head_stays_until_rendered() {
        let queue = FrameQueue::new(0, 1, 1, 2);
        {
            let mut lists = queue.lists.lock();
            let id = lists.move_front(ListKind::Empty, ListKind::Ready).unwrap();
            lists.node_mut(id).header =
                Some(BufferHeader::new(BufferId::next(), BufferPayload::Empty));
        }
        let (id, _) = queue.head().unwrap();
        assert_eq!(queue.head().map(|(again, _)| again), Some(id));
        assert!(queue.mark_rendered(id));
        assert!(!queue.mark_rendered(id));
        assert!(queue.head().is_none());
        assert_eq!(queue.counts().processing, 1);
    }

    #[test]
    fn test_prepare_wait_sees_pending_frame() {
        let queue = FrameQueue::new(0, 1, 1, 1);
        assert!(!queue.prepare_wait());
        queue
            .lists
            .lock()
            .move_front(ListKind::Empty, ListKind::Ready);
        assert!(queue.prepare_wait());
    }
}
