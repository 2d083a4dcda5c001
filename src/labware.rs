//! Labware geometry and well-name math.
//!
//! A labware format describes the row/column grid of a physical plate.
//! Well names follow the microplate convention: a row letter followed by a
//! 1-based column number ("A5", "O12"). Plates with more than 26 rows use
//! doubled letters for the overflow rows ("AA", "BB", ... on 1536-well
//! labware), so "BB46" resolves to row 27, column 45.
//!
//! The distinguished name `ANY` stands for "any well" in work orders whose
//! destination wells are assigned at run time by the allocator.

use crate::error::{AppResult, PlateFlowError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Well name accepted anywhere a concrete well is.
pub const ANY_WELL_NAME: &str = "ANY";

// =============================================================================
// Labware format
// =============================================================================

/// Row/column grid of a plate format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabwareFormat {
    pub rows: usize,
    pub cols: usize,
}

impl LabwareFormat {
    pub const STANDARD_48: LabwareFormat = LabwareFormat { rows: 6, cols: 8 };
    pub const STANDARD_96: LabwareFormat = LabwareFormat { rows: 8, cols: 12 };
    pub const STANDARD_384: LabwareFormat = LabwareFormat { rows: 16, cols: 24 };
    pub const STANDARD_1536: LabwareFormat = LabwareFormat { rows: 32, cols: 48 };

    /// Resolve a standard format from a total well count.
    pub fn for_well_count(well_count: usize) -> AppResult<Self> {
        match well_count {
            48 => Ok(Self::STANDARD_48),
            96 => Ok(Self::STANDARD_96),
            384 => Ok(Self::STANDARD_384),
            1536 => Ok(Self::STANDARD_1536),
            other => Err(PlateFlowError::InvalidWellCount(other)),
        }
    }

    pub fn well_count(&self) -> usize {
        self.rows * self.cols
    }
}

impl fmt::Display for LabwareFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

// =============================================================================
// Wells
// =============================================================================

/// A well position on a plate, or the `ANY` placeholder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Well {
    /// Matches every well; used by work orders that defer destination
    /// assignment to the allocator.
    Any,
    At { row: usize, col: usize },
}

impl Well {
    pub fn at(row: usize, col: usize) -> Self {
        Well::At { row, col }
    }

    /// Parse a well name ("A5", "o12", "BB46", "any"). Case-insensitive,
    /// surrounding whitespace tolerated.
    pub fn parse(name: &str) -> AppResult<Self> {
        let trimmed = name.trim().to_ascii_uppercase();
        if trimmed == ANY_WELL_NAME {
            return Ok(Well::Any);
        }

        let letter_count = trimmed.chars().take_while(|c| c.is_ascii_uppercase()).count();
        let (letters, digits) = trimmed.split_at(letter_count);
        if letters.is_empty()
            || digits.is_empty()
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return Err(PlateFlowError::InvalidWell(name.trim().to_string()));
        }

        // Overflow rows are doubled letters: "AA" is row 26, "BB" row 27.
        let mut chars = letters.chars();
        let first = chars.next().ok_or_else(|| PlateFlowError::InvalidWell(name.to_string()))?;
        if chars.clone().any(|c| c != first) {
            return Err(PlateFlowError::InvalidWell(name.trim().to_string()));
        }
        let row = 26 * (letters.len() - 1) + (first as usize - 'A' as usize);

        let col: usize = digits
            .parse()
            .map_err(|_| PlateFlowError::InvalidWell(name.trim().to_string()))?;
        if col == 0 {
            return Err(PlateFlowError::InvalidWell(name.trim().to_string()));
        }

        Ok(Well::At { row, col: col - 1 })
    }

    /// Parse a well name and check it against a labware format.
    pub fn parse_in(name: &str, format: LabwareFormat) -> AppResult<Self> {
        let well = Self::parse(name)?;
        if !well.fits(format) {
            return Err(PlateFlowError::InvalidWell(name.trim().to_string()));
        }
        Ok(well)
    }

    /// Canonical well name ("A5"); `ANY` for the placeholder.
    pub fn name(&self) -> String {
        match *self {
            Well::Any => ANY_WELL_NAME.to_string(),
            Well::At { row, col } => format!("{}{}", row_letters(row), col + 1),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Well::Any)
    }

    /// Whether the well lies within a labware format. `ANY` fits everything.
    pub fn fits(&self, format: LabwareFormat) -> bool {
        match *self {
            Well::Any => true,
            Well::At { row, col } => row < format.rows && col < format.cols,
        }
    }

    /// Row-major index within a format; `None` for `ANY`.
    pub fn index_in(&self, format: LabwareFormat) -> Option<usize> {
        match *self {
            Well::Any => None,
            Well::At { row, col } => Some(row * format.cols + col),
        }
    }
}

impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn row_letters(row: usize) -> String {
    let letter = (b'A' + (row % 26) as u8) as char;
    let repeats = row / 26 + 1;
    std::iter::repeat(letter).take(repeats).collect()
}

// =============================================================================
// Well sets (usable-wells specifications)
// =============================================================================

/// Expand a usable-wells specification into its member wells.
///
/// Accepts a single name ("A1"), a comma-separated list ("A1, b2, C3"), an
/// inclusive rectangular range ("C5:H9"), or a mix of list entries and
/// ranges. Empty list segments are skipped, so "A1:C5," and ",A1,B2" parse.
pub fn parse_well_set(spec: &str) -> AppResult<Vec<Well>> {
    let mut wells = Vec::new();
    if spec.contains(',') {
        for segment in spec.split(',') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            if segment.contains(':') {
                expand_range(&mut wells, segment)?;
            } else {
                wells.push(Well::parse(segment)?);
            }
        }
    } else if spec.contains(':') {
        expand_range(&mut wells, spec)?;
    } else {
        wells.push(Well::parse(spec)?);
    }
    Ok(wells)
}

fn expand_range(wells: &mut Vec<Well>, range: &str) -> AppResult<()> {
    if range.chars().filter(|c| *c == ':').count() != 1 {
        return Err(PlateFlowError::InvalidWell(range.trim().to_string()));
    }
    let (start_name, end_name) = range
        .split_once(':')
        .ok_or_else(|| PlateFlowError::InvalidWell(range.to_string()))?;
    let (start, end) = (Well::parse(start_name)?, Well::parse(end_name)?);
    let (Well::At { row: r0, col: c0 }, Well::At { row: r1, col: c1 }) = (start, end) else {
        return Err(PlateFlowError::InvalidWell(range.trim().to_string()));
    };
    for row in r0..=r1 {
        for col in c0..=c1 {
            wells.push(Well::At { row, col });
        }
    }
    Ok(())
}

// =============================================================================
// Column-major allocation order
// =============================================================================

/// Row count used for sequential allocation, keyed by total well count.
/// Unknown counts fall back to the 96-well default of 8 rows.
pub fn rows_for_well_count(well_count: usize) -> usize {
    match well_count {
        48 => 6,
        384 => 16,
        _ => 8,
    }
}

/// Map a running well index to a name in column-major order: the row varies
/// fastest, so index 0 is A1, index 1 is B1, and index `rows` is A2.
pub fn column_major_well_name(index: usize, rows: usize) -> String {
    Well::At { row: index % rows, col: index / rows }.name()
}

// =============================================================================
// Labware database
// =============================================================================

/// A named plate format as referenced by work-order `labware_id` elements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Labware {
    pub name: String,
    pub format: LabwareFormat,
}

impl Labware {
    pub fn new(name: impl Into<String>, well_count: usize) -> AppResult<Self> {
        Ok(Self {
            name: name.into(),
            format: LabwareFormat::for_well_count(well_count)?,
        })
    }

    pub fn well_count(&self) -> usize {
        self.format.well_count()
    }
}

/// Resolves labware identifiers to plate formats when reading work orders.
pub trait LabwareDatabase: Send + Sync {
    fn labware(&self, name: &str) -> AppResult<Labware>;
}

/// In-memory labware database, preloaded with the standard formats under
/// their well-count names ("48", "96", "384", "1536").
#[derive(Clone, Debug)]
pub struct StandardLabwareDatabase {
    entries: HashMap<String, usize>,
}

impl StandardLabwareDatabase {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        for count in [48usize, 96, 384, 1536] {
            entries.insert(count.to_string(), count);
        }
        Self { entries }
    }

    /// Register a labware name, e.g. from configuration.
    pub fn register(&mut self, name: impl Into<String>, well_count: usize) -> AppResult<()> {
        LabwareFormat::for_well_count(well_count)?;
        self.entries.insert(name.into(), well_count);
        Ok(())
    }
}

impl Default for StandardLabwareDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl LabwareDatabase for StandardLabwareDatabase {
    fn labware(&self, name: &str) -> AppResult<Labware> {
        let well_count = self
            .entries
            .get(name)
            .ok_or_else(|| PlateFlowError::LabwareUnknown(name.to_string()))?;
        Labware::new(name, *well_count)
    }
}
