//! The dispatch queue: an ordered backlog of not-yet-assigned tasks.

use std::collections::{BTreeMap, VecDeque};

use croft_types::{BatchId, Task};

/// A queued task plus the number of crash-retries already spent on it. The
/// wrapper keeps [`Task`] itself immutable while letting the retry count
/// travel with the payload through requeues.
#[derive(Debug, Clone)]
pub(crate) struct Attempted<P> {
    pub task: Task<P>,
    pub retries_used: usize,
}

impl<P> Attempted<P> {
    pub fn fresh(task: Task<P>) -> Self {
        Self {
            task,
            retries_used: 0,
        }
    }
}

/// FIFO backlog keyed by batch id. Because batch ids are monotonic, iterating
/// the map front-to-back yields oldest-batch-first dispatch, which bounds the
/// tail latency of an earlier batch when pipelining is enabled.
#[derive(Debug)]
pub(crate) struct DispatchQueue<P> {
    per_batch: BTreeMap<BatchId, VecDeque<Attempted<P>>>,
    len: usize,
}

impl<P> DispatchQueue<P> {
    pub fn new() -> Self {
        Self {
            per_batch: BTreeMap::new(),
            len: 0,
        }
    }

    /// Atomic bulk insert: the whole batch becomes visible at once. Callers
    /// hold the queue lock for the duration, so no dequeue can observe a
    /// partially inserted batch.
    pub fn enqueue_batch(&mut self, tasks: Vec<Task<P>>) {
        if tasks.is_empty() {
            return;
        }
        let batch_id = tasks[0].batch_id;
        let line = self.per_batch.entry(batch_id).or_default();
        self.len += tasks.len();
        line.extend(tasks.into_iter().map(Attempted::fresh));
    }

    /// Pop the next task: FIFO within a batch, oldest batch first.
    pub fn dequeue(&mut self) -> Option<Attempted<P>> {
        let (&batch_id, line) = self.per_batch.iter_mut().next()?;
        let entry = line.pop_front();
        if line.is_empty() {
            self.per_batch.remove(&batch_id);
        }
        if entry.is_some() {
            self.len -= 1;
        }
        entry
    }

    /// Put a task back at the head of its batch's line so a crash-retried
    /// task is re-dispatched before anything else from that batch.
    pub fn requeue_front(&mut self, entry: Attempted<P>) {
        let line = self.per_batch.entry(entry.task.batch_id).or_default();
        line.push_front(entry);
        self.len += 1;
    }

    /// Drop all queued tasks of a batch. Returns how many were dropped.
    pub fn remove_batch(&mut self, batch_id: BatchId) -> usize {
        match self.per_batch.remove(&batch_id) {
            Some(line) => {
                self.len -= line.len();
                line.len()
            }
            None => 0,
        }
    }

    /// Drop everything (shutdown, pool exhaustion).
    pub fn remove_all(&mut self) {
        self.per_batch.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(batch_id: BatchId, count: u32) -> Vec<Task<u32>> {
        (0..count)
            .map(|i| Task::new(batch_id, i, batch_id as u32 * 100 + i))
            .collect()
    }

    #[test]
    fn fifo_within_a_batch() {
        let mut queue = DispatchQueue::new();
        queue.enqueue_batch(batch(0, 3));
        let order: Vec<u32> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.task.index)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn oldest_batch_dispatched_first() {
        let mut queue = DispatchQueue::new();
        queue.enqueue_batch(batch(5, 2));
        queue.enqueue_batch(batch(3, 2));
        queue.enqueue_batch(batch(9, 1));

        let order: Vec<BatchId> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.task.batch_id)
            .collect();
        assert_eq!(order, vec![3, 3, 5, 5, 9]);
    }

    #[test]
    fn requeue_front_takes_priority() {
        let mut queue = DispatchQueue::new();
        queue.enqueue_batch(batch(1, 3));
        let first = queue.dequeue().unwrap();
        assert_eq!(first.task.index, 0);

        let mut retried = first;
        retried.retries_used += 1;
        queue.requeue_front(retried);

        let next = queue.dequeue().unwrap();
        assert_eq!(next.task.index, 0);
        assert_eq!(next.retries_used, 1);
    }

    #[test]
    fn remove_batch_drops_only_that_batch() {
        let mut queue = DispatchQueue::new();
        queue.enqueue_batch(batch(1, 4));
        queue.enqueue_batch(batch(2, 2));

        assert_eq!(queue.remove_batch(1), 4);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap().task.batch_id, 2);
        assert_eq!(queue.remove_batch(1), 0);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut queue: DispatchQueue<u32> = DispatchQueue::new();
        queue.enqueue_batch(Vec::new());
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }
}
