//! Work-order model: plates, catalogs, transfers, and the transfer overview.
//!
//! A work order (historically a "hitpick file") describes liquid transfers
//! from source plates to destination plates. The aggregate root is
//! [`TransferOverview`]: a catalog of source plates, a catalog of destination
//! plates, the ordered transfer sequence, and default values inherited by
//! transfers that omit them.
//!
//! None of these types are internally synchronized. A caller sharing an
//! overview across threads (importer and scheduler, say) must apply external
//! locking.

use crate::error::{AppResult, PlateFlowError};
use crate::labware::{parse_well_set, Labware, LabwareFormat, Well};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Volumes
// =============================================================================

/// Volume units carried by transfers and dispense records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeUnits {
    Ul,
    Ml,
}

impl fmt::Display for VolumeUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeUnits::Ul => f.write_str("ul"),
            VolumeUnits::Ml => f.write_str("ml"),
        }
    }
}

impl FromStr for VolumeUnits {
    type Err = PlateFlowError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ul" => Ok(VolumeUnits::Ul),
            "ml" => Ok(VolumeUnits::Ml),
            other => Err(PlateFlowError::Parse(format!("unknown volume units '{other}'"))),
        }
    }
}

/// A single dispensed-volume record in a well.
#[derive(Clone, Debug, PartialEq)]
pub struct WellContent {
    pub volume: f64,
    pub units: VolumeUnits,
    pub dispensed_at: DateTime<Utc>,
}

impl WellContent {
    pub fn new(volume: f64, units: VolumeUnits) -> Self {
        Self { volume, units, dispensed_at: Utc::now() }
    }
}

// =============================================================================
// Plates
// =============================================================================

/// Keyed access for plate catalogs.
pub trait Barcoded {
    fn barcode(&self) -> &str;
}

/// A physical plate: labware, barcode, and per-well contents.
///
/// Wells are created lazily on first access through [`Plate::well_mut`], so
/// a freshly parsed work order carries no well state until dispenses are
/// recorded against it.
#[derive(Clone, Debug)]
pub struct Plate {
    labware: Labware,
    barcode: String,
    wells: HashMap<Well, Vec<WellContent>>,
}

const NO_CONTENTS: &[WellContent] = &[];

impl Plate {
    pub fn new(labware: Labware, barcode: impl Into<String>) -> Self {
        Self { labware, barcode: barcode.into(), wells: HashMap::new() }
    }

    pub fn labware_name(&self) -> &str {
        &self.labware.name
    }

    pub fn format(&self) -> LabwareFormat {
        self.labware.format
    }

    pub fn well_count(&self) -> usize {
        self.labware.well_count()
    }

    /// Contents of a well, creating the entry on first access. Fails with
    /// `InvalidWell` for names outside the labware geometry and for `ANY`.
    pub fn well_mut(&mut self, well_name: &str) -> AppResult<&mut Vec<WellContent>> {
        let well = Well::parse_in(well_name, self.labware.format)?;
        if well.is_any() {
            return Err(PlateFlowError::InvalidWell(well_name.trim().to_string()));
        }
        Ok(self.wells.entry(well).or_default())
    }

    /// Contents of a well without creating it; empty for untouched wells.
    pub fn well_contents(&self, well_name: &str) -> AppResult<&[WellContent]> {
        let well = Well::parse_in(well_name, self.labware.format)?;
        Ok(self.wells.get(&well).map_or(NO_CONTENTS, Vec::as_slice))
    }

    /// Append a dispense record to a well.
    pub fn record_dispense(&mut self, well_name: &str, content: WellContent) -> AppResult<()> {
        self.well_mut(well_name)?.push(content);
        Ok(())
    }
}

impl Barcoded for Plate {
    fn barcode(&self) -> &str {
        &self.barcode
    }
}

/// A destination plate carries a usable-wells specification on top of the
/// plate itself: a single well name, a comma-separated list, an inclusive
/// rectangular range ("C5:H9"), or `ANY`.
#[derive(Clone, Debug)]
pub struct DestinationPlate {
    plate: Plate,
    usable_spec: String,
    usable: Vec<Well>,
}

impl DestinationPlate {
    /// Parses and validates the usable-wells specification once; every well
    /// named by it must fit the plate's labware format.
    pub fn new(
        labware: Labware,
        barcode: impl Into<String>,
        usable_spec: impl Into<String>,
    ) -> AppResult<Self> {
        let usable_spec = usable_spec.into();
        let usable = parse_well_set(&usable_spec)?;
        for well in &usable {
            if !well.fits(labware.format) {
                return Err(PlateFlowError::InvalidWell(well.name()));
            }
        }
        Ok(Self { plate: Plate::new(labware, barcode), usable_spec, usable })
    }

    pub fn plate(&self) -> &Plate {
        &self.plate
    }

    pub fn plate_mut(&mut self) -> &mut Plate {
        &mut self.plate
    }

    pub fn labware_name(&self) -> &str {
        self.plate.labware_name()
    }

    pub fn format(&self) -> LabwareFormat {
        self.plate.format()
    }

    pub fn usable_wells_spec(&self) -> &str {
        &self.usable_spec
    }

    /// Whether one well is eligible to receive liquid. Case-insensitive;
    /// `ANY` (as query or as specification) always passes.
    pub fn is_well_usable(&self, well_name: &str) -> AppResult<bool> {
        let well = Well::parse(well_name)?;
        Ok(self.well_usable(well))
    }

    /// Batch form of [`Self::is_well_usable`]: true iff every named well is
    /// usable.
    pub fn are_wells_usable<'a, I>(&self, well_names: I) -> AppResult<bool>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in well_names {
            if !self.is_well_usable(name)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn well_usable(&self, well: Well) -> bool {
        if well.is_any() || self.usable.contains(&Well::Any) {
            return true;
        }
        self.usable.contains(&well)
    }
}

impl Barcoded for DestinationPlate {
    fn barcode(&self) -> &str {
        self.plate.barcode()
    }
}

// =============================================================================
// Plate catalogs
// =============================================================================

/// Barcode-keyed plate collection, insertion-ordered for serialization.
///
/// `add` is idempotent: inserting a barcode that is already present is a
/// silent no-op and the first-inserted plate is retained.
#[derive(Clone, Debug)]
pub struct PlateCatalog<P> {
    plates: Vec<P>,
}

impl<P> Default for PlateCatalog<P> {
    fn default() -> Self {
        Self { plates: Vec::new() }
    }
}

impl<P: Barcoded> PlateCatalog<P> {
    pub fn new() -> Self {
        Self { plates: Vec::new() }
    }

    pub fn add(&mut self, plate: P) {
        if !self.contains(plate.barcode()) {
            self.plates.push(plate);
        }
    }

    pub fn contains(&self, barcode: &str) -> bool {
        self.plates.iter().any(|p| p.barcode() == barcode)
    }

    pub fn get(&self, barcode: &str) -> AppResult<&P> {
        self.plates
            .iter()
            .find(|p| p.barcode() == barcode)
            .ok_or_else(|| PlateFlowError::PlateNotFound(barcode.to_string()))
    }

    pub fn get_mut(&mut self, barcode: &str) -> AppResult<&mut P> {
        self.plates
            .iter_mut()
            .find(|p| p.barcode() == barcode)
            .ok_or_else(|| PlateFlowError::PlateNotFound(barcode.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.plates.iter()
    }

    pub fn len(&self) -> usize {
        self.plates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }
}

// =============================================================================
// Transfers
// =============================================================================

/// One pipetting operation from a source well to a destination well.
///
/// Transfers reference plates by barcode; the owning [`TransferOverview`]
/// catalogs hold the plates themselves.
#[derive(Clone, Debug)]
pub struct Transfer {
    pub source_barcode: String,
    pub source_well: Well,
    pub dest_barcode: String,
    pub dest_well: Well,
    pub volume: f64,
    pub units: VolumeUnits,
    pub current_volume: f64,
    pub current_units: VolumeUnits,
    pub liquid_class: Option<String>,
    pub aspirate_script: String,
    pub dispense_script: String,
    pub aspirate_distance_mm: Option<f64>,
    pub dispense_distance_mm: Option<f64>,
}

impl Transfer {
    /// Structural equality as used by the round-trip law. Per-transfer
    /// height offsets are excluded: the canonical document carries heights
    /// only as document-level defaults.
    pub fn are_equal(lhs: &Transfer, rhs: &Transfer) -> bool {
        lhs.source_barcode == rhs.source_barcode
            && lhs.source_well == rhs.source_well
            && lhs.dest_barcode == rhs.dest_barcode
            && lhs.dest_well == rhs.dest_well
            && lhs.volume == rhs.volume
            && lhs.units == rhs.units
            && lhs.current_volume == rhs.current_volume
            && lhs.current_units == rhs.current_units
            && lhs.liquid_class == rhs.liquid_class
            && lhs.aspirate_script == rhs.aspirate_script
            && lhs.dispense_script == rhs.dispense_script
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.[{}]=>{}.[{}]",
            self.source_barcode,
            self.source_well.name(),
            self.dest_barcode,
            self.dest_well.name()
        )
    }
}

/// Arguments to [`TransferOverview::add_transfer`]. Fields left at their
/// defaults inherit the overview's [`TransferDefaults`].
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub source_barcode: String,
    pub source_well: Well,
    pub dest_barcode: String,
    pub dest_well: Well,
    pub volume: f64,
    pub units: VolumeUnits,
    /// Liquid volume assumed present in the source well; work orders that do
    /// not carry one get the nominal 10 ul.
    pub current_volume: f64,
    pub current_units: VolumeUnits,
    pub liquid_class: Option<String>,
    pub aspirate_script: Option<String>,
    pub dispense_script: Option<String>,
    pub aspirate_distance_mm: Option<f64>,
    pub dispense_distance_mm: Option<f64>,
}

impl TransferRequest {
    pub fn new(
        source_barcode: impl Into<String>,
        source_well: Well,
        dest_barcode: impl Into<String>,
        dest_well: Well,
        volume: f64,
        units: VolumeUnits,
    ) -> Self {
        Self {
            source_barcode: source_barcode.into(),
            source_well,
            dest_barcode: dest_barcode.into(),
            dest_well,
            volume,
            units,
            current_volume: 10.0,
            current_units: VolumeUnits::Ul,
            liquid_class: None,
            aspirate_script: None,
            dispense_script: None,
            aspirate_distance_mm: None,
            dispense_distance_mm: None,
        }
    }
}

/// Default values inherited by transfers that omit them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransferDefaults {
    pub liquid_class: Option<String>,
    pub aspirate_script: String,
    pub dispense_script: String,
    pub aspirate_distance_mm: Option<f64>,
    pub dispense_distance_mm: Option<f64>,
}

// =============================================================================
// Transfer overview
// =============================================================================

/// Aggregate root of a work order: plate catalogs, the ordered transfer
/// sequence, and transfer defaults.
#[derive(Clone, Debug, Default)]
pub struct TransferOverview {
    pub source_plates: PlateCatalog<Plate>,
    pub destination_plates: PlateCatalog<DestinationPlate>,
    pub defaults: TransferDefaults,
    transfers: Vec<Transfer>,
}

impl TransferOverview {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers in execution order.
    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    /// Append a transfer, substituting the overview defaults for omitted
    /// liquid class, scripts and height offsets.
    ///
    /// No volume or plate-existence validation is performed here: callers
    /// are responsible for creating the referenced plates first. Importers
    /// that want destination-well validation should consult
    /// [`DestinationPlate::are_wells_usable`] before appending.
    pub fn add_transfer(&mut self, request: TransferRequest) {
        let defaults = &self.defaults;
        let aspirate_script = match request.aspirate_script {
            Some(script) if !script.is_empty() => script,
            _ => defaults.aspirate_script.clone(),
        };
        let dispense_script = match request.dispense_script {
            Some(script) if !script.is_empty() => script,
            _ => defaults.dispense_script.clone(),
        };
        self.transfers.push(Transfer {
            source_barcode: request.source_barcode,
            source_well: request.source_well,
            dest_barcode: request.dest_barcode,
            dest_well: request.dest_well,
            volume: request.volume,
            units: request.units,
            current_volume: request.current_volume,
            current_units: request.current_units,
            liquid_class: request.liquid_class.or_else(|| defaults.liquid_class.clone()),
            aspirate_script,
            dispense_script,
            aspirate_distance_mm: request.aspirate_distance_mm.or(defaults.aspirate_distance_mm),
            dispense_distance_mm: request.dispense_distance_mm.or(defaults.dispense_distance_mm),
        });
    }

    /// Distinct liquid classes referenced by the transfers, in first-use
    /// order.
    pub fn liquid_classes_used(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for transfer in &self.transfers {
            if let Some(class) = &transfer.liquid_class {
                if !seen.contains(class) {
                    seen.push(class.clone());
                }
            }
        }
        seen
    }

    /// Transfers targeting one destination plate, in execution order.
    pub fn transfers_for_destination(&self, barcode: &str) -> Vec<&Transfer> {
        self.transfers.iter().filter(|t| t.dest_barcode == barcode).collect()
    }

    /// Structural equality: both catalogs (destinations including their
    /// usable-well specs) and the full ordered transfer list, value by
    /// value. Used for round-trip verification.
    pub fn are_equal(lhs: &TransferOverview, rhs: &TransferOverview) -> bool {
        if lhs.source_plates.len() != rhs.source_plates.len()
            || lhs.destination_plates.len() != rhs.destination_plates.len()
            || lhs.transfers.len() != rhs.transfers.len()
        {
            return false;
        }
        for plate in lhs.source_plates.iter() {
            let Ok(other) = rhs.source_plates.get(plate.barcode()) else {
                return false;
            };
            if other.labware_name() != plate.labware_name() {
                return false;
            }
        }
        for plate in lhs.destination_plates.iter() {
            let Ok(other) = rhs.destination_plates.get(plate.barcode()) else {
                return false;
            };
            if other.labware_name() != plate.labware_name()
                || other.usable_wells_spec() != plate.usable_wells_spec()
            {
                return false;
            }
        }
        lhs.transfers
            .iter()
            .zip(rhs.transfers.iter())
            .all(|(lt, rt)| Transfer::are_equal(lt, rt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labware_96() -> Labware {
        Labware::new("96", 96).unwrap()
    }

    #[test]
    fn test_duplicate_plate_entries() {
        let mut catalog = PlateCatalog::new();
        catalog.add(Plate::new(labware_96(), "S00001"));
        // Second add with the same barcode must be a silent no-op.
        let mut duplicate = Plate::new(labware_96(), "S00001");
        duplicate.record_dispense("A1", WellContent::new(5.0, VolumeUnits::Ul)).unwrap();
        catalog.add(duplicate);
        assert_eq!(catalog.len(), 1);
        let kept = catalog.get("S00001").unwrap();
        assert!(kept.well_contents("A1").unwrap().is_empty());
    }

    #[test]
    fn test_catalog_missing_barcode() {
        let catalog: PlateCatalog<Plate> = PlateCatalog::new();
        assert!(matches!(
            catalog.get("S99999"),
            Err(PlateFlowError::PlateNotFound(_))
        ));
    }

    #[test]
    fn test_well_indexer_lazy_create() {
        let mut plate = Plate::new(labware_96(), "S1234");
        assert!(plate.well_contents("G6").unwrap().is_empty());
        plate.well_mut("G6").unwrap().push(WellContent::new(20.0, VolumeUnits::Ul));
        assert_eq!(plate.well_contents("G6").unwrap().len(), 1);
        assert_eq!(plate.well_contents("g6").unwrap().len(), 1);
    }

    #[test]
    fn test_well_indexer_out_of_range() {
        let mut plate = Plate::new(labware_96(), "S1234");
        assert!(plate.well_mut("I1").is_err());
        assert!(plate.well_mut("A13").is_err());
        assert!(plate.well_mut("ANY").is_err());
    }

    #[test]
    fn test_destination_plate_one_usable() {
        let plate = DestinationPlate::new(labware_96(), "D00001", "A1").unwrap();
        assert!(plate.is_well_usable("a1").unwrap());
        assert!(!plate.is_well_usable("B2").unwrap());
    }

    #[test]
    fn test_destination_plate_multiple_usable() {
        let plate = DestinationPlate::new(labware_96(), "D00001", "A1, b2, C3, d4").unwrap();
        for name in ["a1", "B2", "c3", "D4"] {
            assert!(plate.is_well_usable(name).unwrap());
        }
        assert!(plate.are_wells_usable(["a1", "B2", "c3"]).unwrap());
        assert!(!plate.are_wells_usable(["A1", "f6"]).unwrap());
    }

    #[test]
    fn test_destination_plate_range_usable() {
        let plate = DestinationPlate::new(labware_96(), "D00001", "C5:h9").unwrap();
        assert!(plate.is_well_usable("c5").unwrap());
        assert!(plate.is_well_usable("H9").unwrap());
        assert!(plate.is_well_usable("f7").unwrap());
        assert!(plate.are_wells_usable(["C5", "h9"]).unwrap());
        assert!(!plate.is_well_usable("c4").unwrap());
        assert!(!plate.is_well_usable("h10").unwrap());
        assert!(!plate.is_well_usable("b7").unwrap());
        assert!(!plate.is_well_usable("i8").unwrap());
    }

    #[test]
    fn test_destination_plate_any_usable() {
        let plate = DestinationPlate::new(labware_96(), "D00001", "ANY").unwrap();
        assert!(plate.is_well_usable("H12").unwrap());
        assert!(plate.is_well_usable("any").unwrap());
    }

    #[test]
    fn test_destination_plate_rejects_out_of_format_spec() {
        assert!(DestinationPlate::new(labware_96(), "D00001", "I1").is_err());
        assert!(DestinationPlate::new(labware_96(), "D00001", "A1:I3").is_err());
    }

    #[test]
    fn test_add_transfer_substitutes_defaults() {
        let mut overview = TransferOverview::new();
        overview.defaults = TransferDefaults {
            liquid_class: Some("water".to_string()),
            aspirate_script: "asp_default".to_string(),
            dispense_script: "disp_default".to_string(),
            aspirate_distance_mm: Some(1.5),
            dispense_distance_mm: Some(2.0),
        };
        overview.add_transfer(TransferRequest::new(
            "S00001",
            Well::parse("C5").unwrap(),
            "D00001",
            Well::parse("C2").unwrap(),
            1.0,
            VolumeUnits::Ul,
        ));
        let transfer = &overview.transfers()[0];
        assert_eq!(transfer.liquid_class.as_deref(), Some("water"));
        assert_eq!(transfer.aspirate_script, "asp_default");
        assert_eq!(transfer.dispense_script, "disp_default");
        assert_eq!(transfer.aspirate_distance_mm, Some(1.5));
        assert_eq!(transfer.dispense_distance_mm, Some(2.0));
    }

    #[test]
    fn test_add_transfer_keeps_explicit_values() {
        let mut overview = TransferOverview::new();
        overview.defaults.liquid_class = Some("water".to_string());
        let mut request = TransferRequest::new(
            "S00001",
            Well::parse("A1").unwrap(),
            "D00001",
            Well::parse("B2").unwrap(),
            2.5,
            VolumeUnits::Ul,
        );
        request.liquid_class = Some("dmso".to_string());
        request.aspirate_script = Some("custom_asp".to_string());
        overview.add_transfer(request);
        let transfer = &overview.transfers()[0];
        assert_eq!(transfer.liquid_class.as_deref(), Some("dmso"));
        assert_eq!(transfer.aspirate_script, "custom_asp");
    }

    #[test]
    fn test_liquid_classes_used_distinct() {
        let mut overview = TransferOverview::new();
        for class in ["water", "dmso", "water"] {
            let mut request = TransferRequest::new(
                "S00001",
                Well::parse("A1").unwrap(),
                "D00001",
                Well::parse("B2").unwrap(),
                1.0,
                VolumeUnits::Ul,
            );
            request.liquid_class = Some(class.to_string());
            overview.add_transfer(request);
        }
        assert_eq!(overview.liquid_classes_used(), vec!["water", "dmso"]);
    }

    #[test]
    fn test_transfers_for_destination() {
        let mut overview = TransferOverview::new();
        for (dest, well) in [("D00001", "A1"), ("D00002", "B1"), ("D00001", "C1")] {
            overview.add_transfer(TransferRequest::new(
                "S00001",
                Well::parse("A1").unwrap(),
                dest,
                Well::parse(well).unwrap(),
                1.0,
                VolumeUnits::Ul,
            ));
        }
        let transfers = overview.transfers_for_destination("D00001");
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[1].dest_well.name(), "C1");
    }

    #[test]
    fn test_overview_equality() {
        let build = || {
            let mut overview = TransferOverview::new();
            overview.source_plates.add(Plate::new(labware_96(), "S00001"));
            overview
                .destination_plates
                .add(DestinationPlate::new(labware_96(), "D00001", "A1:D5").unwrap());
            overview.add_transfer(TransferRequest::new(
                "S00001",
                Well::parse("C5").unwrap(),
                "D00001",
                Well::parse("C2").unwrap(),
                1.0,
                VolumeUnits::Ul,
            ));
            overview
        };
        let a = build();
        let b = build();
        assert!(TransferOverview::are_equal(&a, &b));

        let mut c = build();
        c.add_transfer(TransferRequest::new(
            "S00001",
            Well::parse("A1").unwrap(),
            "D00001",
            Well::parse("A2").unwrap(),
            1.0,
            VolumeUnits::Ul,
        ));
        assert!(!TransferOverview::are_equal(&a, &c));
    }

    #[test]
    fn test_volume_units_round_trip() {
        assert_eq!(VolumeUnits::Ul.to_string(), "ul");
        assert_eq!("ml".parse::<VolumeUnits>().unwrap(), VolumeUnits::Ml);
        assert!("liters".parse::<VolumeUnits>().is_err());
    }
}
