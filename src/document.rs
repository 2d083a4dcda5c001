//! Canonical XML read/write for work orders.
//!
//! A [`crate::worklist::TransferOverview`] persists as a `transfer_overview`
//! document with a fixed element order:
//!
//! ```text
//! transfer_overview
//!   default_liquid_class_id
//!   aspirate_script
//!   dispense_script
//!   aspirate_distance_from_well_bottom_mm
//!   dispense_distance_from_well_bottom_mm
//!   sources/source*{labware_id, barcode}
//!   destinations/destination*{labware_id, barcode, usable_wells}
//!   transfers/transfer*{liquid_class_id?, source{barcode, well},
//!                       destination{barcode, well},
//!                       transfer_volume@units, current_volume@units}
//! ```
//!
//! The writer emits elements in this order, collections in insertion order.
//! The reader validates element names against the same schema and
//! reconstructs an equivalent overview; malformed documents fail with
//! `Parse` and no partial overview is returned. A document read back from a
//! just-written document is structurally equal to the original.

use crate::error::{AppResult, PlateFlowError};
use crate::labware::{LabwareDatabase, Well};
use crate::worklist::{
    Barcoded, DestinationPlate, Plate, TransferOverview, TransferRequest, VolumeUnits,
};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

const ROOT_ELEMENT: &str = "transfer_overview";

fn xml_err<E: Display>(err: E) -> PlateFlowError {
    PlateFlowError::Parse(err.to_string())
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Serializes transfer overviews to the canonical document.
pub struct WorklistWriter;

impl WorklistWriter {
    pub fn write_str(overview: &TransferOverview) -> AppResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(xml_err)?;

        start(&mut writer, ROOT_ELEMENT)?;
        let defaults = &overview.defaults;
        text_element(
            &mut writer,
            "default_liquid_class_id",
            defaults.liquid_class.as_deref().unwrap_or(""),
        )?;
        text_element(&mut writer, "aspirate_script", &defaults.aspirate_script)?;
        text_element(&mut writer, "dispense_script", &defaults.dispense_script)?;
        text_element(
            &mut writer,
            "aspirate_distance_from_well_bottom_mm",
            &defaults.aspirate_distance_mm.unwrap_or(0.0).to_string(),
        )?;
        text_element(
            &mut writer,
            "dispense_distance_from_well_bottom_mm",
            &defaults.dispense_distance_mm.unwrap_or(0.0).to_string(),
        )?;

        start(&mut writer, "sources")?;
        for plate in overview.source_plates.iter() {
            start(&mut writer, "source")?;
            text_element(&mut writer, "labware_id", plate.labware_name())?;
            text_element(&mut writer, "barcode", plate.barcode())?;
            end(&mut writer, "source")?;
        }
        end(&mut writer, "sources")?;

        start(&mut writer, "destinations")?;
        for plate in overview.destination_plates.iter() {
            start(&mut writer, "destination")?;
            text_element(&mut writer, "labware_id", plate.labware_name())?;
            text_element(&mut writer, "barcode", plate.barcode())?;
            text_element(&mut writer, "usable_wells", plate.usable_wells_spec())?;
            end(&mut writer, "destination")?;
        }
        end(&mut writer, "destinations")?;

        start(&mut writer, "transfers")?;
        for transfer in overview.transfers() {
            start(&mut writer, "transfer")?;
            if let Some(liquid_class) = &transfer.liquid_class {
                text_element(&mut writer, "liquid_class_id", liquid_class)?;
            }
            start(&mut writer, "source")?;
            text_element(&mut writer, "barcode", &transfer.source_barcode)?;
            text_element(&mut writer, "well", &transfer.source_well.name())?;
            end(&mut writer, "source")?;
            start(&mut writer, "destination")?;
            text_element(&mut writer, "barcode", &transfer.dest_barcode)?;
            text_element(&mut writer, "well", &transfer.dest_well.name())?;
            end(&mut writer, "destination")?;
            volume_element(
                &mut writer,
                "transfer_volume",
                transfer.volume,
                transfer.units,
            )?;
            volume_element(
                &mut writer,
                "current_volume",
                transfer.current_volume,
                transfer.current_units,
            )?;
            end(&mut writer, "transfer")?;
        }
        end(&mut writer, "transfers")?;
        end(&mut writer, ROOT_ELEMENT)?;

        String::from_utf8(writer.into_inner()).map_err(xml_err)
    }

    pub fn write_file(overview: &TransferOverview, path: &Path) -> AppResult<()> {
        std::fs::write(path, Self::write_str(overview)?)?;
        Ok(())
    }
}

fn start(writer: &mut Writer<Vec<u8>>, name: &str) -> AppResult<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)
}

fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> AppResult<()> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> AppResult<()> {
    start(writer, name)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    end(writer, name)
}

fn volume_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    volume: f64,
    units: VolumeUnits,
) -> AppResult<()> {
    let units_text = units.to_string();
    let mut element = BytesStart::new(name);
    element.push_attribute(("units", units_text.as_str()));
    writer.write_event(Event::Start(element)).map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(&volume.to_string())))
        .map_err(xml_err)?;
    end(writer, name)
}

// =============================================================================
// Reader
// =============================================================================

/// Parses canonical work-order documents, resolving labware identifiers
/// through the configured database.
pub struct WorklistReader {
    database: Arc<dyn LabwareDatabase>,
}

impl WorklistReader {
    pub fn new(database: Arc<dyn LabwareDatabase>) -> Self {
        Self { database }
    }

    pub fn read_file(&self, path: &Path) -> AppResult<TransferOverview> {
        let xml = std::fs::read_to_string(path)?;
        self.read_str(&xml)
    }

    pub fn read_str(&self, xml: &str) -> AppResult<TransferOverview> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        // Locate the root element, skipping prolog noise.
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => {
                    if e.name().as_ref() != ROOT_ELEMENT.as_bytes() {
                        return Err(PlateFlowError::Parse(format!(
                            "expected root element '{ROOT_ELEMENT}', found '{}'",
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                    break;
                }
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => {
                    return Err(PlateFlowError::Parse("empty document".to_string()))
                }
                _ => {
                    return Err(PlateFlowError::Parse(
                        "unexpected content before root element".to_string(),
                    ))
                }
            }
        }

        let mut overview = TransferOverview::new();
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => {
                    let name = e.name().as_ref().to_vec();
                    match name.as_slice() {
                        b"default_liquid_class_id" => {
                            let text = read_text(&mut reader, &e)?;
                            overview.defaults.liquid_class = non_empty(text);
                        }
                        b"aspirate_script" => {
                            overview.defaults.aspirate_script = read_text(&mut reader, &e)?;
                        }
                        b"dispense_script" => {
                            overview.defaults.dispense_script = read_text(&mut reader, &e)?;
                        }
                        b"aspirate_distance_from_well_bottom_mm" => {
                            overview.defaults.aspirate_distance_mm =
                                Some(read_f64(&mut reader, &e)?);
                        }
                        b"dispense_distance_from_well_bottom_mm" => {
                            overview.defaults.dispense_distance_mm =
                                Some(read_f64(&mut reader, &e)?);
                        }
                        b"sources" => self.parse_sources(&mut reader, &mut overview)?,
                        b"destinations" => self.parse_destinations(&mut reader, &mut overview)?,
                        b"transfers" => self.parse_transfers(&mut reader, &mut overview)?,
                        other => {
                            return Err(unexpected_element(other, ROOT_ELEMENT));
                        }
                    }
                }
                Event::Empty(_) => {}
                Event::End(e) if e.name().as_ref() == ROOT_ELEMENT.as_bytes() => break,
                Event::Eof => {
                    return Err(PlateFlowError::Parse(
                        "unexpected end of document".to_string(),
                    ))
                }
                _ => {}
            }
        }
        Ok(overview)
    }

    fn parse_sources(
        &self,
        reader: &mut Reader<&[u8]>,
        overview: &mut TransferOverview,
    ) -> AppResult<()> {
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) if e.name().as_ref() == b"source" => {
                    let fields = parse_plate_fields(reader, b"source")?;
                    let labware_id = fields
                        .labware_id
                        .ok_or_else(|| missing_field("source", "labware_id"))?;
                    let barcode = fields
                        .barcode
                        .ok_or_else(|| missing_field("source", "barcode"))?;
                    let labware = self.database.labware(&labware_id)?;
                    overview.source_plates.add(Plate::new(labware, barcode));
                }
                Event::Start(e) => return Err(unexpected_element(e.name().as_ref(), "sources")),
                Event::End(e) if e.name().as_ref() == b"sources" => return Ok(()),
                Event::Eof => {
                    return Err(PlateFlowError::Parse(
                        "unexpected end of document in sources".to_string(),
                    ))
                }
                _ => {}
            }
        }
    }

    fn parse_destinations(
        &self,
        reader: &mut Reader<&[u8]>,
        overview: &mut TransferOverview,
    ) -> AppResult<()> {
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) if e.name().as_ref() == b"destination" => {
                    let fields = parse_plate_fields(reader, b"destination")?;
                    let labware_id = fields
                        .labware_id
                        .ok_or_else(|| missing_field("destination", "labware_id"))?;
                    let barcode = fields
                        .barcode
                        .ok_or_else(|| missing_field("destination", "barcode"))?;
                    let usable_wells = fields
                        .usable_wells
                        .ok_or_else(|| missing_field("destination", "usable_wells"))?;
                    let labware = self.database.labware(&labware_id)?;
                    overview
                        .destination_plates
                        .add(DestinationPlate::new(labware, barcode, usable_wells)?);
                }
                Event::Start(e) => {
                    return Err(unexpected_element(e.name().as_ref(), "destinations"))
                }
                Event::End(e) if e.name().as_ref() == b"destinations" => return Ok(()),
                Event::Eof => {
                    return Err(PlateFlowError::Parse(
                        "unexpected end of document in destinations".to_string(),
                    ))
                }
                _ => {}
            }
        }
    }

    fn parse_transfers(
        &self,
        reader: &mut Reader<&[u8]>,
        overview: &mut TransferOverview,
    ) -> AppResult<()> {
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) if e.name().as_ref() == b"transfer" => {
                    self.parse_transfer(reader, overview)?;
                }
                Event::Start(e) => return Err(unexpected_element(e.name().as_ref(), "transfers")),
                Event::End(e) if e.name().as_ref() == b"transfers" => return Ok(()),
                Event::Eof => {
                    return Err(PlateFlowError::Parse(
                        "unexpected end of document in transfers".to_string(),
                    ))
                }
                _ => {}
            }
        }
    }

    fn parse_transfer(
        &self,
        reader: &mut Reader<&[u8]>,
        overview: &mut TransferOverview,
    ) -> AppResult<()> {
        let mut liquid_class: Option<String> = None;
        let mut source: Option<EndpointFields> = None;
        let mut destination: Option<EndpointFields> = None;
        let mut volume: Option<(f64, VolumeUnits)> = None;
        let mut current_volume: Option<(f64, VolumeUnits)> = None;
        let mut aspirate_script: Option<String> = None;
        let mut dispense_script: Option<String> = None;

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => match e.name().as_ref() {
                    b"liquid_class_id" => liquid_class = non_empty(read_text(reader, &e)?),
                    b"source" => source = Some(parse_endpoint(reader, b"source")?),
                    b"destination" => destination = Some(parse_endpoint(reader, b"destination")?),
                    b"transfer_volume" => volume = Some(parse_volume(reader, &e)?),
                    b"current_volume" => current_volume = Some(parse_volume(reader, &e)?),
                    b"aspirate_script" => aspirate_script = Some(read_text(reader, &e)?),
                    b"dispense_script" => dispense_script = Some(read_text(reader, &e)?),
                    other => return Err(unexpected_element(other, "transfer")),
                },
                Event::End(e) if e.name().as_ref() == b"transfer" => break,
                Event::Eof => {
                    return Err(PlateFlowError::Parse(
                        "unexpected end of document in transfer".to_string(),
                    ))
                }
                _ => {}
            }
        }

        let source = source.ok_or_else(|| missing_field("transfer", "source"))?;
        let destination = destination.ok_or_else(|| missing_field("transfer", "destination"))?;
        let source_barcode = source
            .barcode
            .ok_or_else(|| missing_field("transfer source", "barcode"))?;
        let source_well_name = source
            .well
            .ok_or_else(|| missing_field("transfer source", "well"))?;
        let dest_barcode = destination
            .barcode
            .ok_or_else(|| missing_field("transfer destination", "barcode"))?;
        let dest_well_name = destination
            .well
            .ok_or_else(|| missing_field("transfer destination", "well"))?;
        let (volume, units) =
            volume.ok_or_else(|| missing_field("transfer", "transfer_volume"))?;

        // Well names validate against the referenced plates' geometry, so
        // the plates must already have been declared.
        let source_plate = overview.source_plates.get(&source_barcode).map_err(|_| {
            PlateFlowError::Parse(format!(
                "transfer references unknown source barcode {source_barcode}"
            ))
        })?;
        let source_well = Well::parse_in(&source_well_name, source_plate.format())?;
        let dest_plate = overview.destination_plates.get(&dest_barcode).map_err(|_| {
            PlateFlowError::Parse(format!(
                "transfer references unknown destination barcode {dest_barcode}"
            ))
        })?;
        let dest_well = Well::parse_in(&dest_well_name, dest_plate.format())?;

        let mut request = TransferRequest::new(
            source_barcode,
            source_well,
            dest_barcode,
            dest_well,
            volume,
            units,
        );
        if let Some((current, current_units)) = current_volume {
            request.current_volume = current;
            request.current_units = current_units;
        }
        request.liquid_class = liquid_class;
        request.aspirate_script = aspirate_script;
        request.dispense_script = dispense_script;
        request.aspirate_distance_mm = source.distance_mm;
        request.dispense_distance_mm = destination.distance_mm;
        overview.add_transfer(request);
        Ok(())
    }
}

#[derive(Default)]
struct PlateFields {
    labware_id: Option<String>,
    barcode: Option<String>,
    usable_wells: Option<String>,
}

fn parse_plate_fields(reader: &mut Reader<&[u8]>, parent: &[u8]) -> AppResult<PlateFields> {
    let mut fields = PlateFields::default();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"labware_id" => fields.labware_id = Some(read_text(reader, &e)?),
                b"barcode" => fields.barcode = Some(read_text(reader, &e)?),
                b"usable_wells" if parent == b"destination" => {
                    fields.usable_wells = Some(read_text(reader, &e)?);
                }
                other => {
                    return Err(unexpected_element(
                        other,
                        &String::from_utf8_lossy(parent),
                    ))
                }
            },
            Event::End(e) if e.name().as_ref() == parent => return Ok(fields),
            Event::Eof => {
                return Err(PlateFlowError::Parse(
                    "unexpected end of document in plate".to_string(),
                ))
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct EndpointFields {
    barcode: Option<String>,
    well: Option<String>,
    distance_mm: Option<f64>,
}

fn parse_endpoint(reader: &mut Reader<&[u8]>, parent: &[u8]) -> AppResult<EndpointFields> {
    let mut fields = EndpointFields::default();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"barcode" => fields.barcode = Some(read_text(reader, &e)?),
                b"well" => fields.well = Some(read_text(reader, &e)?),
                b"aspirate_distance_from_well_bottom_mm" if parent == b"source" => {
                    fields.distance_mm = Some(read_f64(reader, &e)?);
                }
                b"dispense_distance_from_well_bottom_mm" if parent == b"destination" => {
                    fields.distance_mm = Some(read_f64(reader, &e)?);
                }
                other => {
                    return Err(unexpected_element(
                        other,
                        &String::from_utf8_lossy(parent),
                    ))
                }
            },
            Event::End(e) if e.name().as_ref() == parent => return Ok(fields),
            Event::Eof => {
                return Err(PlateFlowError::Parse(
                    "unexpected end of document in transfer endpoint".to_string(),
                ))
            }
            _ => {}
        }
    }
}

fn read_text(reader: &mut Reader<&[u8]>, element: &BytesStart<'_>) -> AppResult<String> {
    reader
        .read_text(element.name())
        .map(|text| text.trim().to_string())
        .map_err(xml_err)
}

fn read_f64(reader: &mut Reader<&[u8]>, element: &BytesStart<'_>) -> AppResult<f64> {
    let text = read_text(reader, element)?;
    text.parse()
        .map_err(|_| PlateFlowError::Parse(format!("invalid number '{text}'")))
}

fn parse_volume(
    reader: &mut Reader<&[u8]>,
    element: &BytesStart<'_>,
) -> AppResult<(f64, VolumeUnits)> {
    let mut units: Option<VolumeUnits> = None;
    for attribute in element.attributes() {
        let attribute = attribute.map_err(xml_err)?;
        if attribute.key.as_ref() == b"units" {
            units = Some(attribute.unescape_value().map_err(xml_err)?.parse()?);
        }
    }
    let units = units.ok_or_else(|| {
        missing_field(&String::from_utf8_lossy(element.name().as_ref()), "units")
    })?;
    Ok((read_f64(reader, element)?, units))
}

fn unexpected_element(name: &[u8], parent: &str) -> PlateFlowError {
    PlateFlowError::Parse(format!(
        "unexpected element '{}' in {parent}",
        String::from_utf8_lossy(name)
    ))
}

fn missing_field(parent: &str, field: &str) -> PlateFlowError {
    PlateFlowError::Parse(format!("{parent} is missing {field}"))
}
