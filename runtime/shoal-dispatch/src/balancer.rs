/// Per-worker load estimate: the last polled concurrency plus one for every
/// operation routed since.
#[derive(Clone, Debug, Default)]
pub struct LoadTable {
    counts: Vec<usize>,
    connected: Vec<bool>,
}

impl LoadTable {
    pub fn new(workers: usize) -> Self {
        Self {
            counts: vec![0; workers],
            connected: vec![false; workers],
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, index: usize) -> usize {
        self.counts.get(index).copied().unwrap_or(0)
    }

    pub fn set_count(&mut self, index: usize, count: usize) {
        if let Some(slot) = self.counts.get_mut(index) {
            *slot = count;
        }
    }

    pub fn is_connected(&self, index: usize) -> bool {
        self.connected.get(index).copied().unwrap_or(false)
    }

    pub fn set_connected(&mut self, index: usize, connected: bool) {
        if let Some(slot) = self.connected.get_mut(index) {
            *slot = connected;
        }
    }

    pub fn any_connected(&self) -> bool {
        self.connected.iter().any(|connected| *connected)
    }

    /// Picks the connected worker with the lowest estimate, lowest index on
    /// ties, and charges it one operation.
    pub fn select(&mut self) -> Option<usize> {
        let (index, _) = self
            .counts
            .iter()
            .enumerate()
            .filter(|(index, _)| self.connected[*index])
            .min_by_key(|(_, count)| **count)?;
        self.counts[index] += 1;
        Some(index)
    }

    /// Takes back a charge from [`select`](Self::select) for an operation
    /// that never reached the worker.
    pub fn release(&mut self, index: usize) {
        if let Some(count) = self.counts.get_mut(index) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(counts: &[usize], connected: &[usize]) -> LoadTable {
        let mut table = LoadTable::new(counts.len());
        for (index, count) in counts.iter().enumerate() {
            table.set_count(index, *count);
        }
        for index in connected {
            table.set_connected(*index, true);
        }
        table
    }

    #[test]
    fn least_loaded_worker_wins_and_is_charged() {
        let mut table = table(&[3, 1, 2], &[0, 1, 2]);
        assert_eq!(table.select(), Some(1));
        assert_eq!(table.count(1), 2);
        // 1 and 2 now tie at 2; the lower index goes first.
        assert_eq!(table.select(), Some(1));
        assert_eq!(table.select(), Some(2));
    }

    #[test]
    fn disconnected_workers_are_never_picked() {
        let mut table = table(&[5, 0, 5], &[0, 2]);
        for _ in 0..20 {
            assert_ne!(table.select(), Some(1));
        }
        assert_eq!(table.count(1), 0);
        assert_eq!(table.count(0) + table.count(2), 30);
    }

    #[test]
    fn nothing_connected_selects_nothing() {
        let mut table = table(&[0, 0], &[]);
        assert!(!table.any_connected());
        assert_eq!(table.select(), None);
        table.set_connected(1, true);
        assert_eq!(table.select(), Some(1));
    }

    #[test]
    fn released_charge_restores_the_estimate() {
        let mut table = table(&[0, 4], &[0, 1]);
        assert_eq!(table.select(), Some(0));
        table.release(0);
        assert_eq!(table.count(0), 0);
        table.release(0);
        assert_eq!(table.count(0), 0);
        table.release(7);
    }
}
