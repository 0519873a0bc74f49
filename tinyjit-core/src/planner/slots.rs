/// Tracks slot usage statistics for one planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotMetrics {
    /// Number of times a freed slot was handed out again.
    pub reuses: usize,
    /// Number of times the table grew by a fresh slot.
    pub grows: usize,
    /// Number of times a slot was released.
    pub frees: usize,
    /// Highest number of slots occupied at the same time.
    pub peak_occupied: usize,
}

#[derive(Debug, Default)]
/// Occupancy of fixed-width arena slots, handed out lowest index first.
pub(crate) struct SlotTable {
    occupied: Vec<bool>,
    live: usize,
    metrics: SlotMetrics,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest-indexed free slot, growing the table when every slot is busy.
    pub fn acquire(&mut self) -> usize {
        let slot = match self.occupied.iter().position(|busy| !busy) {
            Some(slot) => {
                self.metrics.reuses += 1;
                self.occupied[slot] = true;
                slot
            }
            None => {
                self.metrics.grows += 1;
                self.occupied.push(true);
                self.occupied.len() - 1
            }
        };
        self.live += 1;
        self.metrics.peak_occupied = self.metrics.peak_occupied.max(self.live);
        slot
    }

    /// Mark `slot` free. Returns `false` if it was already free.
    pub fn release(&mut self, slot: usize) -> bool {
        match self.occupied.get_mut(slot) {
            Some(busy) if *busy => {
                *busy = false;
                self.live -= 1;
                self.metrics.frees += 1;
                true
            }
            _ => false,
        }
    }

    /// Total number of slots ever created.
    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    /// Slots currently occupied.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Returns a snapshot of current table metrics.
    pub fn metrics(&self) -> SlotMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::SlotTable;

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut table = SlotTable::new();
        assert_eq!(table.acquire(), 0);
        assert_eq!(table.acquire(), 1);
        assert_eq!(table.acquire(), 2);
        assert!(table.release(1));
        assert!(table.release(0));
        assert_eq!(table.acquire(), 0);
        assert_eq!(table.acquire(), 1);
        assert_eq!(table.acquire(), 3);
        assert_eq!(table.len(), 4);
        let metrics = table.metrics();
        assert_eq!(metrics.grows, 4);
        assert_eq!(metrics.reuses, 2);
        assert_eq!(metrics.peak_occupied, 4);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut table = SlotTable::new();
        let slot = table.acquire();
        assert!(table.release(slot));
        assert!(!table.release(slot));
        assert!(!table.release(17));
        assert_eq!(table.live(), 0);
        assert_eq!(table.metrics().frees, 1);
    }
}
