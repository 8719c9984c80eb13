use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Execute,
    Batch,
    GetPage,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Execute => "execute",
            OperationKind::Batch => "batch",
            OperationKind::GetPage => "getPage",
        }
    }
}

/// Order in which queued kinds are admitted when a slot frees up.
pub const DRAIN_ORDER: [OperationKind; 3] =
    [OperationKind::Execute, OperationKind::Batch, OperationKind::GetPage];

/// Three FIFOs sharing one in-flight cap.
#[derive(Debug)]
pub struct AdmissionQueue<T> {
    max_in_flight: usize,
    in_flight: usize,
    executes: VecDeque<T>,
    batches: VecDeque<T>,
    pages: VecDeque<T>,
}

impl<T> AdmissionQueue<T> {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            in_flight: 0,
            executes: VecDeque::new(),
            batches: VecDeque::new(),
            pages: VecDeque::new(),
        }
    }

    /// Queues `item` behind its kind and admits the head of that queue if a
    /// slot is free. Admitted items count as in flight until [`complete`].
    ///
    /// [`complete`]: AdmissionQueue::complete
    pub fn submit(&mut self, kind: OperationKind, item: T) -> Option<T> {
        self.queue_mut(kind).push_back(item);
        self.admit_from(kind)
    }

    /// Frees one slot, then admits queued work in [`DRAIN_ORDER`].
    pub fn complete(&mut self) -> Vec<T> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let mut admitted = Vec::new();
        for kind in DRAIN_ORDER {
            while let Some(item) = self.admit_from(kind) {
                admitted.push(item);
            }
        }
        admitted
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn queued(&self) -> usize {
        self.executes.len() + self.batches.len() + self.pages.len()
    }

    pub fn queued_of(&self, kind: OperationKind) -> usize {
        match kind {
            OperationKind::Execute => self.executes.len(),
            OperationKind::Batch => self.batches.len(),
            OperationKind::GetPage => self.pages.len(),
        }
    }

    fn admit_from(&mut self, kind: OperationKind) -> Option<T> {
        if self.in_flight >= self.max_in_flight {
            return None;
        }
        let item = self.queue_mut(kind).pop_front()?;
        self.in_flight += 1;
        Some(item)
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
    fn cap_queues_every_kind() {
        let mut queue = AdmissionQueue::new(2);
        assert_eq!(queue.submit(OperationKind::Execute, "e1"), Some("e1"));
        assert_eq!(queue.submit(OperationKind::GetPage, "p1"), Some("p1"));
        assert_eq!(queue.submit(OperationKind::Execute, "e2"), None);
        assert_eq!(queue.submit(OperationKind::Batch, "b1"), None);
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.queued(), 2);
    }

    #[test]
    fn completion_drains_execute_then_batch_then_page() {
        let mut queue = AdmissionQueue::new(1);
        assert_eq!(queue.submit(OperationKind::GetPage, "p0"), Some("p0"));
        queue.submit(OperationKind::GetPage, "p1");
        queue.submit(OperationKind::Batch, "b1");
        queue.submit(OperationKind::Execute, "e1");

        assert_eq!(queue.complete(), vec!["e1"]);
        assert_eq!(queue.complete(), vec!["b1"]);
        assert_eq!(queue.complete(), vec!["p1"]);
        assert_eq!(queue.complete(), Vec::<&str>::new());
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn completion_fills_every_free_slot() {
        let mut queue = AdmissionQueue::new(3);
        for item in ["a", "b", "c"] {
            queue.submit(OperationKind::Execute, item);
        }
        queue.submit(OperationKind::Batch, "d");
        queue.submit(OperationKind::GetPage, "e");
        assert_eq!(queue.queued_of(OperationKind::Batch), 1);
        assert_eq!(queue.complete(), vec!["d"]);
        assert_eq!(queue.complete(), vec!["e"]);
        assert_eq!(queue.in_flight(), 3);
    }

    #[test]
    fn zero_cap_is_clamped() {
        let mut queue = AdmissionQueue::new(0);
        assert_eq!(queue.max_in_flight(), 1);
        assert_eq!(queue.submit(OperationKind::Batch, 1), Some(1));
    }
}
