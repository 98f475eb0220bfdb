use std::collections::VecDeque;

/// Sequence-numbered reorder buffer.
///
/// Every admitted item gets the next sequence number and an empty slot. Slots are
/// filled as work completes, in any order, and only the longest contiguous filled
/// prefix can be drained. This keeps emission in arrival order while the work behind
/// each slot races.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    slots: VecDeque<Option<T>>,
    /// Sequence number of the slot at the front
    head: u64,
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer sized for `capacity` outstanding slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            head: 0,
        }
    }

    /// Reserve a slot for a newly accepted item and return its sequence number
    pub fn admit(&mut self) -> u64 {
        let seq = self.head + self.slots.len() as u64;
        self.slots.push_back(None);
        seq
    }

    /// Fill the slot for `seq`
    pub fn complete(&mut self, seq: u64, value: T) {
        debug_assert!(seq >= self.head, "slot {seq} was already drained");
        let idx = (seq - self.head) as usize;
        let slot = &mut self.slots[idx];
        debug_assert!(slot.is_none(), "slot {seq} completed twice");
        *slot = Some(value);
    }

    /// Pop the front slot if it has completed
    pub fn pop_ready(&mut self) -> Option<T> {
        match self.slots.front() {
            Some(Some(_)) => {
                self.head += 1;
                self.slots.pop_front().flatten()
            }
            _ => None,
        }
    }

    /// Number of admitted slots not yet drained
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of completed slots waiting behind an unfinished one
    pub fn parked(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
