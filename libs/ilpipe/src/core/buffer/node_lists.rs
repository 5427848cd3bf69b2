// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Three-list buffer ownership: `empty` -> `ready` -> `processing` -> `empty`.
//!
//! Nodes live in an arena owned by [`Lists`]; the three lists hold indices
//! into it. The only way to change membership is to *move* an index from one
//! list to another in a single call, so every node is a member of exactly one
//! list at all times. One mutex ([`NodeLists`]) guards all three lists of a
//! port and nothing else.

use std::collections::VecDeque;

use parking_lot::{Mutex, MutexGuard};

/// Index of a node in its port's arena. Only handed out by [`Lists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Owned by the holding component, content undefined
    Empty,
    /// Filled, waiting for a consumer
    Ready,
    /// Lent to a consumer, waiting to come back
    Processing,
}

/// Snapshot of a port's list sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCounts {
    pub empty: usize,
    pub ready: usize,
    pub processing: usize,
    pub total: usize,
}

impl BufferCounts {
    /// Every node is back in `empty`.
    pub fn is_settled(&self) -> bool {
        self.ready == 0 && self.processing == 0 && self.empty == self.total
    }
}

pub struct Lists<T> {
    slots: Vec<T>,
    empty: VecDeque<NodeId>,
    ready: VecDeque<NodeId>,
    processing: VecDeque<NodeId>,
    max_nodes: usize,
}

impl<T> Lists<T> {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            slots: Vec::new(),
            empty: VecDeque::new(),
            ready: VecDeque::new(),
            processing: VecDeque::new(),
            max_nodes,
        }
    }

    /// Add up to `count` new nodes to `empty`, never exceeding the cap.
    /// Returns how many were added.
    pub fn grow(&mut self, count: usize, mut make: impl FnMut() -> T) -> usize {
        let room = self.max_nodes.saturating_sub(self.slots.len());
        let added = count.min(room);
        for _ in 0..added {
            let id = NodeId(self.slots.len());
            self.slots.push(make());
            self.empty.push_back(id);
        }
        added
    }

    fn list(&self, kind: ListKind) -> &VecDeque<NodeId> {
        match kind {
            ListKind::Empty => &self.empty,
            ListKind::Ready => &self.ready,
            ListKind::Processing => &self.processing,
        }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut VecDeque<NodeId> {
        match kind {
            ListKind::Empty => &mut self.empty,
            ListKind::Ready => &mut self.ready,
            ListKind::Processing => &mut self.processing,
        }
    }

    pub fn len(&self, kind: ListKind) -> usize {
        self.list(kind).len()
    }

    pub fn is_empty(&self, kind: ListKind) -> bool {
        self.list(kind).is_empty()
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn counts(&self) -> BufferCounts {
        BufferCounts {
            empty: self.empty.len(),
            ready: self.ready.len(),
            processing: self.processing.len(),
            total: self.slots.len(),
        }
    }

    pub fn front(&self, kind: ListKind) -> Option<NodeId> {
        self.list(kind).front().copied()
    }

    pub fn node(&self, id: NodeId) -> &T {
        &self.slots[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.slots[id.0]
    }

    /// First node in `kind` (in list order) matching `pred`.
    pub fn find(&self, kind: ListKind, pred: impl Fn(&T) -> bool) -> Option<NodeId> {
        self.list(kind)
            .iter()
            .copied()
            .find(|id| pred(&self.slots[id.0]))
    }

    pub fn iter(&self, kind: ListKind) -> impl Iterator<Item = (NodeId, &T)> + '_ {
        self.list(kind).iter().map(|id| (*id, &self.slots[id.0]))
    }

    /// Move the head of `from` to the tail of `to`.
    pub fn move_front(&mut self, from: ListKind, to: ListKind) -> Option<NodeId> {
        let id = self.list_mut(from).pop_front()?;
        self.list_mut(to).push_back(id);
        Some(id)
    }

    /// Move `id` from `from` to the tail of `to`. Returns `false` (and moves
    /// nothing) when `id` is not currently in `from`.
    pub fn move_node(&mut self, id: NodeId, from: ListKind, to: ListKind) -> bool {
        let source = self.list_mut(from);
        let Some(pos) = source.iter().position(|candidate| *candidate == id) else {
            return false;
        };
        source.remove(pos);
        self.list_mut(to).push_back(id);
        true
    }

    /// Move `id` from `from` back to the head of `to`, e.g. after a refused
    /// hand-off so the node keeps its place in line.
    pub fn requeue_front(&mut self, id: NodeId, from: ListKind, to: ListKind) -> bool {
        let source = self.list_mut(from);
        let Some(pos) = source.iter().position(|candidate| *candidate == id) else {
            return false;
        };
        source.remove(pos);
        self.list_mut(to).push_front(id);
        true
    }

    /// Move every node of `from` to `to`, preserving order.
    pub fn move_all(&mut self, from: ListKind, to: ListKind) -> usize {
        let drained: Vec<NodeId> = self.list_mut(from).drain(..).collect();
        let moved = drained.len();
        self.list_mut(to).extend(drained);
        moved
    }
}

/// A port's three lists behind their single mutex.
pub struct NodeLists<T> {
    inner: Mutex<Lists<T>>,
}

impl<T> NodeLists<T> {
    /// Pre-allocate `initial` nodes (capped at `max_nodes`).
    pub fn new(initial: usize, max_nodes: usize, make: impl FnMut() -> T) -> Self {
        let mut lists = Lists::new(max_nodes);
        lists.grow(initial, make);
        Self {
            inner: Mutex::new(lists),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Lists<T>> {
        self.inner.lock()
    }

    pub fn counts(&self) -> BufferCounts {
        self.inner.lock().counts()
    }

    pub fn is_empty(&self, kind: ListKind) -> bool {
        self.inner.lock().is_empty(kind)
    }

    pub fn len(&self, kind: ListKind) -> usize {
        self.inner.lock().len(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_conserved<T>(lists: &Lists<T>) {
        let mut seen = HashSet::new();
        for kind in [ListKind::Empty, ListKind::Ready, ListKind::Processing] {
            for (id, _) in lists.iter(kind) {
                assert!(seen.insert(id), "node {:?} appears twice", id);
            }
        }
        assert_eq!(seen.len(), lists.total(), "a node is in no list");
    }

    #[test]
    fn test_preallocation_respects_cap() {
        let lists = NodeLists::new(10, 4, || 0u32);
        let counts = lists.counts();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.empty, 4);
        assert!(counts.is_settled());
    }

    #[test]
    fn test_grow_stops_at_cap() {
        let mut lists = Lists::new(5);
        assert_eq!(lists.grow(3, || ()), 3);
        assert_eq!(lists.grow(3, || ()), 2);
        assert_eq!(lists.grow(3, || ()), 0);
        assert_eq!(lists.total(), 5);
        assert_conserved(&lists);
    }

    #[test]
    fn test_fill_drain_give_back_cycle() {
        let lists = NodeLists::new(3, 3, || 0i64);
        let mut guard = lists.lock();

        // fill
        let id = guard.move_front(ListKind::Empty, ListKind::Ready).unwrap();
        *guard.node_mut(id) = 42;
        assert_conserved(&guard);

        // drain
        let drained = guard.move_front(ListKind::Ready, ListKind::Processing).unwrap();
        assert_eq!(drained, id);
        assert_conserved(&guard);

        // give back, located by content
        let found = guard.find(ListKind::Processing, |v| *v == 42).unwrap();
        assert!(guard.move_node(found, ListKind::Processing, ListKind::Empty));
        assert_conserved(&guard);
        assert!(guard.counts().is_settled());
    }

    #[test]
    fn test_move_node_rejects_wrong_list() {
        let mut lists = Lists::new(2);
        lists.grow(2, || ());
        let id = lists.front(ListKind::Empty).unwrap();
        assert!(!lists.move_node(id, ListKind::Processing, ListKind::Empty));
        assert_eq!(lists.len(ListKind::Empty), 2);
        assert_conserved(&lists);
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut lists = Lists::new(3);
        let mut next = 0;
        lists.grow(3, || {
            next += 1;
            next
        });
        lists.move_all(ListKind::Empty, ListKind::Ready);
        let head = lists.move_front(ListKind::Ready, ListKind::Processing).unwrap();
        assert!(lists.requeue_front(head, ListKind::Processing, ListKind::Ready));
        let order: Vec<i32> = lists.iter(ListKind::Ready).map(|(_, v)| *v).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(!lists.requeue_front(head, ListKind::Processing, ListKind::Ready));
        assert_conserved(&lists);
    }

    #[test]
    fn test_move_all_preserves_order() {
        let mut lists = Lists::new(4);
        let mut next = 0;
        lists.grow(4, || {
            next += 1;
            next
        });
        for _ in 0..3 {
            lists.move_front(ListKind::Empty, ListKind::Ready);
        }
        assert_eq!(lists.move_all(ListKind::Ready, ListKind::Processing), 3);
        let order: Vec<i32> = lists
            .iter(ListKind::Processing)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_conserved(&lists);
    }

    #[test]
    fn test_conservation_over_mixed_sequence() {
        let mut lists = Lists::new(8);
        lists.grow(5, || 0u8);
        let kinds = [ListKind::Empty, ListKind::Ready, ListKind::Processing];
        for step in 0..200usize {
            let from = kinds[step % 3];
            let to = kinds[(step / 3 + 1) % 3];
            if step % 7 == 0 {
                lists.move_all(from, to);
            } else {
                lists.move_front(from, to);
            }
            if step % 50 == 0 {
                lists.grow(1, || 0u8);
            }
            assert_conserved(&lists);
        }
        assert!(lists.total() <= 8);
    }
}
