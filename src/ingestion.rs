use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const COL_EMAIL: &str = "Email";
pub const COL_FIRST_NAME: &str = "First Name";
pub const COL_LAST_NAME: &str = "Last Name";
pub const COL_RES_STREET: &str = "Residential Address Street";
pub const COL_RES_LOCALITY: &str = "Residential Address Locality";
pub const COL_RES_STATE: &str = "Residential Address State";
pub const COL_RES_POSTCODE: &str = "Residential Address Postcode";
pub const COL_POS_STREET: &str = "Postal Address Street";
pub const COL_POS_LOCALITY: &str = "Postal Address Locality";
pub const COL_POS_STATE: &str = "Postal Address State";
pub const COL_POS_POSTCODE: &str = "Postal Address Postcode";

pub const REQUIRED_COLUMNS: [&str; 11] = [
    COL_EMAIL,
    COL_FIRST_NAME,
    COL_LAST_NAME,
    COL_RES_STREET,
    COL_RES_LOCALITY,
    COL_RES_STATE,
    COL_RES_POSTCODE,
    COL_POS_STREET,
    COL_POS_LOCALITY,
    COL_POS_STATE,
    COL_POS_POSTCODE,
];

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@]+@[^@]+\.[^@]+").expect("email pattern compiles")
});

/// Which of a contact's two addresses a lookup belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Residential,
    Postal,
}

impl AddressKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            AddressKind::Residential => "residential",
            AddressKind::Postal => "postal",
        }
    }
}

/// A row as read from the input file, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawContact {
    fields: HashMap<String, String>,
}

impl RawContact {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Trimmed value of a column; empty cells count as missing.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub locality: String,
    pub state: String,
    pub postcode: String,
}

impl Address {
    /// Geocoder query in `locality, state, postcode` form.
    pub fn query(&self) -> String {
        format!("{}, {}, {}", self.locality, self.state, self.postcode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRow {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub residential: Address,
    pub postal: Address,
}

impl ContactRow {
    pub fn address(&self, kind: AddressKind) -> &Address {
        match kind {
            AddressKind::Residential => &self.residential,
            AddressKind::Postal => &self.postal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleaningReport {
    pub read: usize,
    pub dropped_missing: usize,
    pub dropped_invalid: usize,
    pub dropped_duplicate: usize,
    pub kept: usize,
}

/// Reads a contact file, rejecting it outright when it cannot be processed.
pub fn read_contacts(path: &Path) -> AppResult<Vec<RawContact>> {
    if !path.exists() {
        return Err(AppError::Input(format!("{} does not exist", path.display())));
    }

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let rows = match extension.as_str() {
        "csv" => parse_contacts(BufReader::new(File::open(path)?))?,
        "xlsx" => parse_workbook(path)?,
        _ => {
            return Err(AppError::Input(
                "file type not supported, expected .csv or .xlsx".into(),
            ))
        }
    };
    debug!(path = %path.display(), rows = rows.len(), "read contact file");
    Ok(rows)
}

pub fn parse_contacts<R: Read>(reader: R) -> AppResult<Vec<RawContact>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers = csv_reader
        .headers()?
        .iter()
        .map(|header| header.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        rows.push(RawContact::from_pairs(
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string)),
        ));
    }
    check_table(&headers, rows)
}

/// Reads the first sheet of a workbook; its first row holds the headers.
pub fn parse_workbook(path: &Path) -> AppResult<Vec<RawContact>> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AppError::Input("workbook has no sheets".into()))??;

    let mut cells = sheet.rows();
    let headers = cells
        .next()
        .map(|header| {
            header
                .iter()
                .map(|cell| cell_text(cell).trim().to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let rows = cells
        .filter(|row| row.iter().any(|cell| !matches!(cell, Data::Empty)))
        .map(|row| RawContact::from_pairs(headers.iter().cloned().zip(row.iter().map(cell_text))))
        .collect::<Vec<_>>();
    check_table(&headers, rows)
}

// Whole-number floats print without a fraction, so postcode 2000.0 reads as "2000".
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(value) => value.clone(),
        Data::Float(value) => value.to_string(),
        Data::Int(value) => value.to_string(),
        other => other.to_string(),
    }
}

fn check_table(headers: &[String], rows: Vec<RawContact>) -> AppResult<Vec<RawContact>> {
    if rows.is_empty() {
        return Err(AppError::Input("data is empty".into()));
    }

    let missing = REQUIRED_COLUMNS
        .iter()
        .filter(|column| !headers.iter().any(|header| header == *column))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(AppError::Input(format!(
            "data columns are not correct, missing: {}",
            missing.join(", ")
        )));
    }

    Ok(rows)
}

/// Drops incomplete, invalid and duplicate rows, normalizing the survivors.
///
/// Row order is preserved; duplicates by email keep their first valid occurrence.
pub fn clean_contacts(raw: &[RawContact]) -> (Vec<ContactRow>, CleaningReport) {
    let mut report = CleaningReport {
        read: raw.len(),
        ..CleaningReport::default()
    };
    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(raw.len());

    for entry in raw {
        if REQUIRED_COLUMNS.iter().any(|column| entry.get(column).is_none()) {
            report.dropped_missing += 1;
            continue;
        }
        let Some(row) = normalize_row(entry) else {
            report.dropped_invalid += 1;
            continue;
        };
        if !is_valid_row(&row) {
            report.dropped_invalid += 1;
            continue;
        }
        if !seen.insert(row.email.clone()) {
            report.dropped_duplicate += 1;
            continue;
        }
        rows.push(row);
    }

    report.kept = rows.len();
    info!(
        read = report.read,
        kept = report.kept,
        dropped_missing = report.dropped_missing,
        dropped_invalid = report.dropped_invalid,
        dropped_duplicate = report.dropped_duplicate,
        "cleaned contact rows"
    );
    (rows, report)
}

pub fn is_valid_row(row: &ContactRow) -> bool {
    EMAIL_PATTERN.is_match(&row.email)
        && !is_numeric(&row.first_name)
        && !is_numeric(&row.last_name)
        && is_numeric(&row.residential.postcode)
        && is_numeric(&row.postal.postcode)
}

/// Removes a float-style trailing zero (`"2000.0"`) without touching leading zeros.
pub fn normalize_postcode(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.split_once('.') {
        Some((whole, fraction)) if !whole.is_empty() && fraction.chars().all(|c| c == '0') => {
            whole.to_string()
        }
        _ => trimmed.to_string(),
    }
}

pub fn strip_non_ascii(value: &str) -> String {
    value.chars().filter(char::is_ascii).collect::<String>().trim().to_string()
}

fn normalize_row(entry: &RawContact) -> Option<ContactRow> {
    let field = |column: &str| entry.get(column).unwrap_or_default().to_string();
    let address = |street: &str, locality: &str, state: &str, postcode: &str| {
        let address = Address {
            street: strip_non_ascii(&field(street)),
            locality: strip_non_ascii(&field(locality)),
            state: strip_non_ascii(&field(state)),
            postcode: normalize_postcode(&field(postcode)),
        };
        (!address.locality.is_empty() && !address.state.is_empty()).then_some(address)
    };

    Some(ContactRow {
        email: field(COL_EMAIL),
        first_name: field(COL_FIRST_NAME),
        last_name: field(COL_LAST_NAME),
        residential: address(
            COL_RES_STREET,
            COL_RES_LOCALITY,
            COL_RES_STATE,
            COL_RES_POSTCODE,
        )?,
        postal: address(
            COL_POS_STREET,
            COL_POS_LOCALITY,
            COL_POS_STATE,
            COL_POS_POSTCODE,
        )?,
    })
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}
