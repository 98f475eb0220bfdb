use crate::metrics::StageMetrics;

/// Admission control for a single stage.
///
/// Counts items accepted but not yet emitted. Once the count reaches the high-water
/// mark the stage stops pulling from upstream; each emission frees one slot. The gate
/// is owned by the stage task and never shared; the metrics handle only mirrors it.
#[derive(Debug)]
pub struct CapacityGate {
    high_water_mark: usize,
    occupied: usize,
    /// Whether the current full stretch was already recorded as a block
    engaged: bool,
    metrics: StageMetrics,
}

impl CapacityGate {
    pub fn new(high_water_mark: usize, metrics: StageMetrics) -> Self {
        Self {
            high_water_mark,
            occupied: 0,
            engaged: false,
            metrics,
        }
    }

    /// Whether another item may be accepted.
    /// Records one block event each time the gate fills up.
    pub fn has_room(&mut self) -> bool {
        let room = self.occupied < self.high_water_mark;
        if !room && !self.engaged {
            self.engaged = true;
            self.metrics.record_block();
            tracing::trace!(
                occupied = self.occupied,
                high_water_mark = self.high_water_mark,
                "backpressure engaged"
            );
        }
        room
    }

    /// Account for an accepted item
    pub fn acquire(&mut self) {
        debug_assert!(self.occupied < self.high_water_mark);
        self.occupied += 1;
        self.metrics.set_in_flight(self.occupied);
    }

    /// Account for an emitted (or dropped) item
    pub fn release(&mut self) {
        debug_assert!(self.occupied > 0);
        self.occupied = self.occupied.saturating_sub(1);
        self.engaged = false;
        self.metrics.set_in_flight(self.occupied);
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
