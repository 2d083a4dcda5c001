//! Sequential destination-well allocation.
//!
//! Work orders may leave destination wells as `ANY`, deferring the choice to
//! run time. The allocator hands out wells across an ordered list of
//! destination plates in column-major order (the row varies fastest), moving
//! to the next plate when one fills up.
//!
//! The allocator holds mutable cursor state and performs no internal
//! locking: it must be driven from one logical thread at a time, or
//! externally synchronized.

use crate::error::{AppResult, PlateFlowError};
use crate::labware::{column_major_well_name, rows_for_well_count};
use crate::worklist::{Barcoded, TransferOverview};

#[derive(Clone, Debug)]
struct AllocatorPlate {
    barcode: String,
    well_count: usize,
}

/// Stateful cursor assigning the next free well across destination plates.
#[derive(Clone, Debug, Default)]
pub struct DestinationAllocator {
    plates: Vec<AllocatorPlate>,
    plate_cursor: usize,
    well_cursor: usize,
}

impl DestinationAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the allocator from a work order's destination catalog, in
    /// insertion order.
    pub fn from_overview(overview: &TransferOverview) -> Self {
        let mut allocator = Self::new();
        for plate in overview.destination_plates.iter() {
            allocator.add_plate(plate.barcode(), plate.format().well_count());
        }
        allocator
    }

    /// Register another destination plate at the end of the allocation
    /// order.
    pub fn add_plate(&mut self, barcode: impl Into<String>, well_count: usize) {
        self.plates.push(AllocatorPlate { barcode: barcode.into(), well_count });
    }

    pub fn has_plate(&self, barcode: &str) -> bool {
        self.plates.iter().any(|p| p.barcode == barcode)
    }

    /// Barcode and well name for the next transfer, advancing the cursor.
    ///
    /// When every registered plate is exhausted this fails with
    /// `CapacityExceeded` and resets both cursors to the start, so the
    /// caller can add more destination plates and retry the whole
    /// allocation sequence from the beginning. Allocations handed out
    /// before the failure are not remembered on retry; whether that is
    /// intended or an oversight is an open product question, and the
    /// behavior is preserved as-is.
    pub fn next_transfer_location(&mut self) -> AppResult<(String, String)> {
        while self.plate_cursor < self.plates.len() {
            let plate = &self.plates[self.plate_cursor];
            if self.well_cursor < plate.well_count {
                let rows = rows_for_well_count(plate.well_count);
                let well_name = column_major_well_name(self.well_cursor, rows);
                let barcode = plate.barcode.clone();
                self.well_cursor += 1;
                return Ok((barcode, well_name));
            }
            self.plate_cursor += 1;
            self.well_cursor = 0;
        }
        self.plate_cursor = 0;
        self.well_cursor = 0;
        Err(PlateFlowError::CapacityExceeded)
    }

    /// Wells not yet handed out in the current pass.
    pub fn remaining(&self) -> usize {
        let mut remaining = 0;
        for (index, plate) in self.plates.iter().enumerate().skip(self.plate_cursor) {
            remaining += if index == self.plate_cursor {
                plate.well_count.saturating_sub(self.well_cursor)
            } else {
                plate.well_count
            };
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_major_ordering_96() {
        let mut allocator = DestinationAllocator::new();
        allocator.add_plate("D1", 96);
        let expected = ["A1", "B1", "C1", "D1", "E1", "F1", "G1", "H1", "A2"];
        for name in expected {
            let (barcode, well) = allocator.next_transfer_location().unwrap();
            assert_eq!(barcode, "D1");
            assert_eq!(well, name);
        }
    }

    #[test]
    fn test_exhaustion_after_96_wells() {
        let mut allocator = DestinationAllocator::new();
        allocator.add_plate("D1", 96);
        for _ in 0..96 {
            allocator.next_transfer_location().unwrap();
        }
        assert!(matches!(
            allocator.next_transfer_location(),
            Err(PlateFlowError::CapacityExceeded)
        ));
    }

    #[test]
    fn test_cursor_resets_on_exhaustion() {
        let mut allocator = DestinationAllocator::new();
        allocator.add_plate("D1", 48);
        for _ in 0..48 {
            allocator.next_transfer_location().unwrap();
        }
        assert!(allocator.next_transfer_location().is_err());
        // Retry replays the sequence from the first plate.
        let (barcode, well) = allocator.next_transfer_location().unwrap();
        assert_eq!((barcode.as_str(), well.as_str()), ("D1", "A1"));
    }

    #[test]
    fn test_rolls_over_to_next_plate() {
        let mut allocator = DestinationAllocator::new();
        allocator.add_plate("D1", 48);
        allocator.add_plate("D2", 96);
        for _ in 0..48 {
            allocator.next_transfer_location().unwrap();
        }
        let (barcode, well) = allocator.next_transfer_location().unwrap();
        assert_eq!((barcode.as_str(), well.as_str()), ("D2", "A1"));
    }

    #[test]
    fn test_48_well_uses_six_rows() {
        let mut allocator = DestinationAllocator::new();
        allocator.add_plate("D1", 48);
        let mut names = Vec::new();
        for _ in 0..7 {
            names.push(allocator.next_transfer_location().unwrap().1);
        }
        assert_eq!(names, ["A1", "B1", "C1", "D1", "E1", "F1", "A2"]);
    }

    #[test]
    fn test_add_plate_after_exhaustion() {
        let mut allocator = DestinationAllocator::new();
        allocator.add_plate("D1", 48);
        for _ in 0..48 {
            allocator.next_transfer_location().unwrap();
        }
        assert!(allocator.next_transfer_location().is_err());
        allocator.add_plate("D2", 48);
        assert_eq!(allocator.remaining(), 96);
        // The whole sequence restarts from D1 before reaching D2.
        let (barcode, _) = allocator.next_transfer_location().unwrap();
        assert_eq!(barcode, "D1");
    }

    #[test]
    fn test_remaining_counts_current_pass() {
        let mut allocator = DestinationAllocator::new();
        allocator.add_plate("D1", 96);
        assert_eq!(allocator.remaining(), 96);
        allocator.next_transfer_location().unwrap();
        assert_eq!(allocator.remaining(), 95);
    }
}
