use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::ingestion::RawRecord;

pub const AFFIRMATIVE_MARKER: &str = "Y";
pub const OTHER_CATEGORY: &str = "Other";

/// Species flag columns; the first match is the primary category.
pub const CATEGORY_COLUMNS: &[&str] = &[
    "Cattle",
    "Sheep",
    "Goats",
    "Pigs",
    "Solipeds",
    "Poultry",
    "Farmed_Game",
    "Wild_Game",
    "Ratites",
    "Lagomorphs",
];

pub const FACILITY_COLUMNS: &[&str] = &[
    "Slaughterhouse",
    "Cutting_Plant",
    "Game_Handling_Establishment",
    "Cold_Store",
    "Minced_Meat",
    "Meat_Preparations",
    "Mechanically_Separated_Meat",
    "Meat_Products",
    "Re_Wrapping_and_Re_Packing",
    "Wholesale_Market",
    "Fishery_Products_and_Aquaculture",
];

const ID_COLUMNS: &[&str] = &["AppNo", "ApprovalNumber", "ApplicationNumber"];
const NAME_COLUMNS: &[&str] = &["TradingName", "Name"];
const ADDRESS_COLUMNS: &[&[&str]] = &[
    &["Address1", "AddressLine1"],
    &["Address2", "AddressLine2"],
    &["Address3", "AddressLine3"],
    &["Town"],
];
const POSTCODE_COLUMNS: &[&str] = &["Postcode", "PostCode"];
const COUNTRY_COLUMNS: &[&str] = &["Country"];
const AUTHORITY_COLUMNS: &[&str] = &["LocalAuthority", "Authority"];
const X_COLUMNS: &[&str] = &["X"];
const Y_COLUMNS: &[&str] = &["Y"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLocation {
    pub id: String,
    pub name: String,
    pub address: String,
    pub primary_category: String,
    pub categories: Vec<String>,
    pub facility_types: Vec<String>,
    pub authority: Option<String>,
    pub country: Option<String>,
    pub postcode: Option<String>,
    /// Source X/Y pair, stored in column order.
    pub raw_coordinates: Option<(f64, f64)>,
}

impl NormalizedLocation {
    pub fn is_locatable(&self) -> bool {
        self.postcode.is_some() || self.raw_coordinates.is_some()
    }

    /// Categories as a filter value-set: every matching flag, or just "Other".
    pub fn category_values(&self) -> Vec<&str> {
        if self.categories.is_empty() {
            vec![self.primary_category.as_str()]
        } else {
            self.categories.iter().map(String::as_str).collect()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizationReport {
    pub total: usize,
    pub retained: usize,
    pub dropped_unlocatable: usize,
    pub dropped_duplicate: usize,
}

pub fn normalize(raw_records: &[RawRecord]) -> (Vec<NormalizedLocation>, NormalizationReport) {
    let mut report = NormalizationReport {
        total: raw_records.len(),
        ..NormalizationReport::default()
    };
    let source_ids: HashSet<&str> = raw_records.iter().filter_map(source_id).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut locations = Vec::with_capacity(raw_records.len());

    for raw in raw_records {
        let mut location = normalize_record(raw);
        if !location.is_locatable() {
            trace!(position = raw.position, "dropping row without postcode or coordinates");
            report.dropped_unlocatable += 1;
            continue;
        }
        if source_id(raw).is_none() {
            let id = unique_synthesized_id(raw.position, &source_ids, &seen);
            if location.name == location.id {
                location.name = id.clone();
            }
            location.id = id;
        } else if seen.contains(&location.id) {
            debug!(id = %location.id, position = raw.position, "dropping duplicate identifier");
            report.dropped_duplicate += 1;
            continue;
        }
        seen.insert(location.id.clone());
        locations.push(location);
    }

    report.retained = locations.len();
    (locations, report)
}

pub fn normalize_record(raw: &RawRecord) -> NormalizedLocation {
    let id = source_id(raw)
        .map(str::to_string)
        .unwrap_or_else(|| synthesized_id(raw.position));
    let name = raw
        .first_of(NAME_COLUMNS)
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());
    let postcode = raw.first_of(POSTCODE_COLUMNS).map(str::to_string);

    let mut address_parts: Vec<&str> = ADDRESS_COLUMNS
        .iter()
        .filter_map(|aliases| raw.first_of(aliases))
        .collect();
    if let Some(code) = postcode.as_deref() {
        address_parts.push(code);
    }

    let categories = flagged(raw, CATEGORY_COLUMNS);
    let primary_category = categories
        .first()
        .cloned()
        .unwrap_or_else(|| OTHER_CATEGORY.to_string());

    NormalizedLocation {
        id,
        name,
        address: address_parts.join(", "),
        primary_category,
        categories,
        facility_types: flagged(raw, FACILITY_COLUMNS)
            .iter()
            .map(|column| humanize_flag(column))
            .collect(),
        authority: raw.first_of(AUTHORITY_COLUMNS).map(str::to_string),
        country: raw.first_of(COUNTRY_COLUMNS).map(str::to_string),
        postcode,
        raw_coordinates: raw_pair(raw),
    }
}

pub fn synthesized_id(position: usize) -> String {
    format!("row-{position}")
}

fn source_id(raw: &RawRecord) -> Option<&str> {
    raw.first_of(ID_COLUMNS)
}

/// `row-<position>`, suffixed until it clashes with no source identifier and
/// no identifier already issued in this run.
fn unique_synthesized_id(
    position: usize,
    source_ids: &HashSet<&str>,
    issued: &HashSet<String>,
) -> String {
    let base = synthesized_id(position);
    let mut candidate = base.clone();
    let mut suffix = 1;
    while source_ids.contains(candidate.as_str()) || issued.contains(&candidate) {
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
    candidate
}

/// `Cutting_Plant` -> `Cutting Plant`, `Re_Wrapping_and_Re_Packing` -> `Re Wrapping & Re Packing`.
pub fn humanize_flag(column: &str) -> String {
    column
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| if part.eq_ignore_ascii_case("and") { "&" } else { part })
        .collect::<Vec<_>>()
        .join(" ")
}

fn flagged(raw: &RawRecord, columns: &[&str]) -> Vec<String> {
    columns
        .iter()
        .filter(|column| raw.get(column) == Some(AFFIRMATIVE_MARKER))
        .map(|column| column.to_string())
        .collect()
}

fn raw_pair(raw: &RawRecord) -> Option<(f64, f64)> {
    let x = parse_coordinate(raw.first_of(X_COLUMNS)?)?;
    let y = parse_coordinate(raw.first_of(Y_COLUMNS)?)?;
    Some((x, y))
}

fn parse_coordinate(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}
