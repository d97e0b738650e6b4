use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::errors::AppResult;
use crate::geocode::Coordinate;
use crate::ingestion::{ContactRow, REQUIRED_COLUMNS};

pub const COL_POSTAL_COORDINATES: &str = "Postal_co-ordinates";
pub const COL_RESIDENTIAL_COORDINATES: &str = "Residential_co-ordinates";

/// A contact row that survived geocoding, with both coordinate pairs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRow {
    pub contact: ContactRow,
    pub residential: Coordinate,
    pub postal: Coordinate,
}

/// `(lat, lng)`, always with a decimal point: `151` is written as `151.0`.
pub fn format_coordinate(coordinate: &Coordinate) -> String {
    format!("({:?}, {:?})", coordinate.lat, coordinate.lng)
}

/// Writes the cleaned table, creating parent directories as needed.
///
/// The header is always written, so an empty run still yields a valid file.
pub fn write_enriched(path: &Path, rows: &[EnrichedRow]) -> AppResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_enriched_to(File::create(path)?, rows)
}

pub fn write_enriched_to<W: Write>(writer: W, rows: &[EnrichedRow]) -> AppResult<usize> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(
        REQUIRED_COLUMNS
            .iter()
            .copied()
            .chain([COL_POSTAL_COORDINATES, COL_RESIDENTIAL_COORDINATES]),
    )?;

    for row in rows {
        let contact = &row.contact;
        writer.write_record([
            contact.email.as_str(),
            contact.first_name.as_str(),
            contact.last_name.as_str(),
            contact.residential.street.as_str(),
            contact.residential.locality.as_str(),
            contact.residential.state.as_str(),
            contact.residential.postcode.as_str(),
            contact.postal.street.as_str(),
            contact.postal.locality.as_str(),
            contact.postal.state.as_str(),
            contact.postal.postcode.as_str(),
            format_coordinate(&row.postal).as_str(),
            format_coordinate(&row.residential).as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::Address;

    fn enriched() -> EnrichedRow {
        EnrichedRow {
            contact: ContactRow {
                email: "colton_tromp@gmail.com".into(),
                first_name: "Darcy".into(),
                last_name: "Waters".into(),
                residential: Address {
                    street: "1 George St".into(),
                    locality: "Sydney".into(),
                    state: "NSW".into(),
                    postcode: "2000".into(),
                },
                postal: Address {
                    street: "PO Box 7, Level 2".into(),
                    locality: "Ambleside".into(),
                    state: "TAS".into(),
                    postcode: "7310".into(),
                },
            },
            residential: Coordinate::new(-33.8688, 151.2093),
            postal: Coordinate::new(-37.9398, 146.4046),
        }
    }

    #[test]
    fn writes_header_and_coordinate_columns() {
        let mut buffer = Vec::new();
        assert_eq!(write_enriched_to(&mut buffer, &[enriched()]).unwrap(), 1);
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();

        let header = lines.next().unwrap();
        assert!(header.starts_with("Email,First Name,Last Name"));
        assert!(header.ends_with("Postal_co-ordinates,Residential_co-ordinates"));

        let row = lines.next().unwrap();
        assert!(row.contains("\"PO Box 7, Level 2\""));
        assert!(row.ends_with("\"(-37.9398, 146.4046)\",\"(-33.8688, 151.2093)\""));
    }

    #[test]
    fn whole_degrees_keep_their_decimal_point() {
        assert_eq!(format_coordinate(&Coordinate::new(-33.0, 151.0)), "(-33.0, 151.0)");
        assert_eq!(
            format_coordinate(&Coordinate::new(-33.8688, 151.2093)),
            "(-33.8688, 151.2093)"
        );
    }

    #[test]
    fn empty_run_still_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        assert_eq!(write_enriched(&path, &[]).unwrap(), 0);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
