use shoal_db::{DRAIN_ORDER, OperationKind};
use std::collections::VecDeque;

/// Opens the first time every worker index has been up at least once.
#[derive(Debug)]
pub struct StartupBarrier {
    seen: Vec<bool>,
    open: bool,
}

impl StartupBarrier {
    pub fn new(workers: usize) -> Self {
        Self {
            seen: vec![false; workers],
            open: workers == 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Returns `true` only for the call that opens the barrier.
    pub fn mark_ready(&mut self, index: usize) -> bool {
        if let Some(seen) = self.seen.get_mut(index) {
            *seen = true;
        }
        if self.open || !self.seen.iter().all(|seen| *seen) {
            return false;
        }
        self.open = true;
        true
    }

    pub fn ready_count(&self) -> usize {
        self.seen.iter().filter(|seen| **seen).count()
    }
}

/// Operations held back while no worker can take them, one FIFO per kind.
#[derive(Debug)]
pub struct PendingOps<T> {
    executes: VecDeque<T>,
    batches: VecDeque<T>,
    pages: VecDeque<T>,
}

impl<T> Default for PendingOps<T> {
    fn default() -> Self {
        Self {
            executes: VecDeque::new(),
            batches: VecDeque::new(),
            pages: VecDeque::new(),
        }
    }
}

impl<T> PendingOps<T> {
    pub fn push(&mut self, kind: OperationKind, op: T) {
        self.queue_mut(kind).push_back(op);
    }

    pub fn len(&self) -> usize {
        self.executes.len() + self.batches.len() + self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties every queue: executes, then batches, then pages.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        for kind in DRAIN_ORDER {
            drained.extend(self.queue_mut(kind).drain(..));
        }
        drained
    }

    fn queue_mut(&mut self, kind: OperationKind) -> &mut VecDeque<T> {
        match kind {
            OperationKind::Execute => &mut self.executes,
            OperationKind::Batch => &mut self.batches,
            OperationKind::GetPage => &mut self.pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_opens_once_every_index_was_seen() {
        let mut barrier = StartupBarrier::new(3);
        assert!(!barrier.mark_ready(0));
        assert!(!barrier.mark_ready(0));
        assert!(!barrier.mark_ready(2));
        assert_eq!(barrier.ready_count(), 2);
        assert!(barrier.mark_ready(1));
        assert!(barrier.is_open());
        assert!(!barrier.mark_ready(1));
    }

    #[test]
    fn drain_replays_executes_then_batches_then_pages() {
        let mut pending = PendingOps::default();
        pending.push(OperationKind::GetPage, "p1");
        pending.push(OperationKind::Batch, "b1");
        pending.push(OperationKind::Execute, "e1");
        pending.push(OperationKind::Batch, "b2");
        pending.push(OperationKind::Execute, "e2");
        assert_eq!(pending.len(), 5);
        assert_eq!(pending.drain(), vec!["e1", "e2", "b1", "b2", "p1"]);
        assert!(pending.is_empty());
    }
}
