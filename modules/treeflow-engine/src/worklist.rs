//! FIFO buffer of pending node evaluations for one cycle.
//!
//! Entries are never shifted out; a cursor walks the buffer and removed
//! nodes are neutralized in place. The allocation survives across cycles.

use std::collections::HashSet;

use crate::types::{NodeIndex, Reason};

#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub(crate) node: NodeIndex,
    /// `None` only for initialization seeds.
    pub(crate) reason: Option<Reason>,
}

#[derive(Debug)]
pub(crate) struct Worklist {
    items: Vec<Option<WorkItem>>,
    cursor: usize,
    high_water: usize,
}

impl Worklist {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            cursor: 0,
            high_water: 0,
        }
    }

    /// Empty the buffer, keeping its allocation.
    pub(crate) fn reset(&mut self) {
        self.items.clear();
        self.cursor = 0;
    }

    pub(crate) fn push(&mut self, node: NodeIndex, reason: Option<Reason>) {
        self.items.push(Some(WorkItem { node, reason }));
        self.high_water = self.high_water.max(self.items.len());
    }

    /// Next entry that was not neutralized. Counts skipped entries.
    pub(crate) fn next_live(&mut self, skipped: &mut usize) -> Option<WorkItem> {
        while self.cursor < self.items.len() {
            let item = self.items[self.cursor].take();
            self.cursor += 1;
            match item {
                Some(item) => return Some(item),
                None => *skipped += 1,
            }
        }
        None
    }

    /// Drop pending entries for removed nodes, from the cursor onward.
    pub(crate) fn neutralize(&mut self, removed: &HashSet<NodeIndex>) -> usize {
        let mut neutralized = 0;
        for slot in &mut self.items[self.cursor..] {
            if slot.as_ref().is_some_and(|item| removed.contains(&item.node)) {
                *slot = None;
                neutralized += 1;
            }
        }
        neutralized
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Largest number of entries any cycle has queued.
    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_with_neutralized_entries_skipped() {
        let mut worklist = Worklist::with_capacity(4);
        for i in 0..4 {
            worklist.push(NodeIndex(i), None);
        }

        let mut skipped = 0;
        assert_eq!(worklist.next_live(&mut skipped).unwrap().node, NodeIndex(0));

        let removed: HashSet<NodeIndex> = [NodeIndex(0), NodeIndex(2)].into_iter().collect();
        assert_eq!(worklist.neutralize(&removed), 1);

        let order: Vec<usize> = std::iter::from_fn(|| worklist.next_live(&mut skipped))
            .map(|item| item.node.index())
            .collect();
        assert_eq!(order, vec![1, 3]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn reset_keeps_high_water_mark() {
        let mut worklist = Worklist::with_capacity(1);
        for i in 0..5 {
            worklist.push(NodeIndex(i), None);
        }
        worklist.reset();
        worklist.push(NodeIndex(9), None);

        assert_eq!(worklist.len(), 1);
        assert_eq!(worklist.high_water(), 5);
    }
}
