use std::collections::{HashMap, VecDeque};

use crate::api::MaxQueueLengthExceeded;

/// Path from the root to a queue node, root excluded. The broker uses
/// single-segment paths (`[tenant_id]`); deeper paths are supported so finer
/// queue granularity can be added without changing the broker contract.
pub(crate) type QueuePath<'a> = &'a [&'a str];

/// A tree of FIFOs. Only leaves carry payloads in practice; the root is a
/// fixed container for tenant leaves. A leaf emptied by a dequeue is removed
/// from its parent.
pub(crate) struct TreeQueue<T> {
    max_queue_len: usize,
    local: VecDeque<T>,
    children: HashMap<String, TreeQueue<T>>,
}

impl<T> TreeQueue<T> {
    pub(crate) fn new(max_queue_len: usize) -> Self {
        Self {
            max_queue_len,
            local: VecDeque::new(),
            children: HashMap::new(),
        }
    }

    /// True iff no node in the tree holds any payload.
    pub(crate) fn is_empty(&self) -> bool {
        self.local.is_empty() && self.children.values().all(|child| child.is_empty())
    }

    pub(crate) fn get_node(&self, path: QueuePath) -> Option<&TreeQueue<T>> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self.children.get(*head)?.get_node(rest),
        }
    }

    fn get_or_add_node(&mut self, path: QueuePath) -> &mut TreeQueue<T> {
        match path.split_first() {
            None => self,
            Some((head, rest)) => {
                let max_queue_len = self.max_queue_len;
                self.children
                    .entry((*head).to_string())
                    .or_insert_with(|| TreeQueue::new(max_queue_len))
                    .get_or_add_node(rest)
            }
        }
    }

    /// Appends to the queue at `path`, creating missing nodes along the way.
    pub(crate) fn enqueue_back_by_path(
        &mut self,
        path: QueuePath,
        item: T,
    ) -> Result<(), MaxQueueLengthExceeded> {
        let node = self.get_or_add_node(path);
        if node.local.len() >= node.max_queue_len {
            return Err(MaxQueueLengthExceeded);
        }
        node.local.push_back(item);
        Ok(())
    }

    /// Inserts at the head of the queue at `path`. The length cap is not
    /// enforced: this path re-enqueues an item that was already dequeued once,
    /// so it cannot grow the queue beyond what was admitted.
    pub(crate) fn enqueue_front_by_path(&mut self, path: QueuePath, item: T) {
        self.get_or_add_node(path).local.push_front(item);
    }

    /// Pops the head of the queue at `path`, or `None` if the node does not
    /// exist or is empty. A child left with no payloads anywhere beneath it is
    /// removed; callers can observe the removal through [`get_node`].
    ///
    /// [`get_node`]: TreeQueue::get_node
    pub(crate) fn dequeue_by_path(&mut self, path: QueuePath) -> Option<T> {
        match path.split_first() {
            None => self.local.pop_front(),
            Some((head, rest)) => {
                let child = self.children.get_mut(*head)?;
                let item = child.dequeue_by_path(rest);
                if child.is_empty() {
                    self.children.remove(*head);
                }
                item
            }
        }
    }
}
