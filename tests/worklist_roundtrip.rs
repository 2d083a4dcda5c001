//! Round-trip law for the canonical work-order document: a document read
//! back from a just-written document is structurally equal to the original.

use plateflow::document::{WorklistReader, WorklistWriter};
use plateflow::labware::{Labware, StandardLabwareDatabase, Well};
use plateflow::worklist::{
    DestinationPlate, Plate, TransferDefaults, TransferOverview, TransferRequest, VolumeUnits,
};
use std::sync::Arc;

fn reader() -> WorklistReader {
    WorklistReader::new(Arc::new(StandardLabwareDatabase::new()))
}

/// Build an overview with `sources` source plates, `destinations`
/// destination plates, and `transfers` transfers spread across them.
fn build_overview(sources: usize, destinations: usize, transfers: usize) -> TransferOverview {
    let mut overview = TransferOverview::new();
    overview.defaults = TransferDefaults {
        liquid_class: Some("water".to_string()),
        aspirate_script: "aspirate.gem".to_string(),
        dispense_script: "dispense.gem".to_string(),
        aspirate_distance_mm: Some(1.0),
        dispense_distance_mm: Some(0.5),
    };

    for i in 0..sources {
        let labware = Labware::new("96", 96).unwrap();
        overview
            .source_plates
            .add(Plate::new(labware, format!("S{:05}", i + 1)));
    }
    for i in 0..destinations {
        let labware = Labware::new("384", 384).unwrap();
        overview.destination_plates.add(
            DestinationPlate::new(labware, format!("D{:05}", i + 1), "A1:P24").unwrap(),
        );
    }

    for i in 0..transfers {
        let source = format!("S{:05}", i % sources + 1);
        let dest = format!("D{:05}", i % destinations + 1);
        let mut request = TransferRequest::new(
            source,
            Well::at(i % 8, i % 12),
            dest,
            Well::at(i % 16, i % 24),
            0.5 + i as f64,
            VolumeUnits::Ul,
        );
        request.current_volume = 25.0;
        if i % 3 == 0 {
            request.liquid_class = Some("dmso".to_string());
        }
        overview.add_transfer(request);
    }
    overview
}

#[test]
fn round_trip_small_overview() {
    let overview = build_overview(1, 1, 1);
    let xml = WorklistWriter::write_str(&overview).unwrap();
    let read_back = reader().read_str(&xml).unwrap();
    assert!(TransferOverview::are_equal(&overview, &read_back));
}

#[test]
fn round_trip_many_plates_and_transfers() {
    let overview = build_overview(4, 3, 24);
    let xml = WorklistWriter::write_str(&overview).unwrap();
    let read_back = reader().read_str(&xml).unwrap();
    assert!(TransferOverview::are_equal(&overview, &read_back));
}

#[test]
fn round_trip_preserves_transfer_order() {
    let overview = build_overview(2, 2, 10);
    let xml = WorklistWriter::write_str(&overview).unwrap();
    let read_back = reader().read_str(&xml).unwrap();
    let original: Vec<String> = overview.transfers().iter().map(ToString::to_string).collect();
    let round_tripped: Vec<String> =
        read_back.transfers().iter().map(ToString::to_string).collect();
    assert_eq!(original, round_tripped);
}

#[test]
fn round_trip_through_file() {
    let overview = build_overview(2, 1, 6);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worklist.xml");
    WorklistWriter::write_file(&overview, &path).unwrap();
    let read_back = reader().read_file(&path).unwrap();
    assert!(TransferOverview::are_equal(&overview, &read_back));
}

#[test]
fn round_trip_detects_mutation() {
    let overview = build_overview(1, 1, 3);
    let xml = WorklistWriter::write_str(&overview).unwrap();
    let mut read_back = reader().read_str(&xml).unwrap();
    read_back.add_transfer(TransferRequest::new(
        "S00001",
        Well::at(0, 0),
        "D00001",
        Well::at(0, 1),
        9.0,
        VolumeUnits::Ul,
    ));
    assert!(!TransferOverview::are_equal(&overview, &read_back));
}

#[test]
fn usable_wells_survive_round_trip() {
    let mut overview = TransferOverview::new();
    let labware = Labware::new("96", 96).unwrap();
    overview
        .destination_plates
        .add(DestinationPlate::new(labware, "D00001", "C5:H9").unwrap());
    let xml = WorklistWriter::write_str(&overview).unwrap();
    let read_back = reader().read_str(&xml).unwrap();
    let plate = read_back.destination_plates.get("D00001").unwrap();
    assert!(plate.is_well_usable("C5").unwrap());
    assert!(plate.is_well_usable("f7").unwrap());
    assert!(!plate.is_well_usable("I8").unwrap());
}
