//! Flattening raw outage descriptions into canonical event rows.

use crate::errors::HarvestError;
use crate::geometry::GeoPoint;
use crate::settings::Site;
use crate::traversal::{customer_count, RawEvent, Snapshot};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

/// Stored `etr` for an explicitly expired estimate.
pub const ETR_EXPIRED: i64 = -1;

/// Description values meaning "no value".
pub const NA_LIKE_VALUES: &[&str] = &["Not Supplied"];

/// Keys every outage description carries, sorted.
pub const DESCRIPTION_KEYS: [&str; 7] = [
    "cause",
    "cluster",
    "crew_status",
    "cust_a",
    "etr",
    "outages",
    "reported_problem",
];

static TRAILING_OFFSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([+-]\d\d)(\d\d)$").expect("offset pattern compiles"));

/// Categorical description fields stored as enumeration codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Cause,
    CrewStatus,
    ReportedProblem,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Cause,
        Category::CrewStatus,
        Category::ReportedProblem,
    ];

    /// Key in the outage description, and column in the events table.
    pub fn column(self) -> &'static str {
        match self {
            Category::Cause => "cause",
            Category::CrewStatus => "crew_status",
            Category::ReportedProblem => "reported_problem",
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Category::Cause => "enumeration_cause",
            Category::CrewStatus => "enumeration_crew_status",
            Category::ReportedProblem => "enumeration_reported_problem",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// In-memory mirror of one enumeration table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    codes: HashMap<String, i32>,
    next_code: i32,
}

impl Enumeration {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (i32, String)>) -> Self {
        let mut enumeration = Self::default();
        for (code, meaning) in pairs {
            enumeration.next_code = enumeration.next_code.max(code + 1);
            enumeration.codes.insert(meaning, code);
        }
        enumeration
    }

    pub fn code(&self, meaning: &str) -> Option<i32> {
        self.codes.get(meaning).copied()
    }

    /// Code for `meaning`, allocating the next unused one on first sight.
    pub fn code_or_allocate(&mut self, meaning: &str) -> i32 {
        if let Some(code) = self.code(meaning) {
            return code;
        }
        let code = self.next_code;
        self.codes.insert(meaning.to_string(), code);
        self.next_code += 1;
        code
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// `(code, meaning)` pairs in code order.
    pub fn pairs(&self) -> Vec<(i32, &str)> {
        let mut pairs: Vec<_> = self
            .codes
            .iter()
            .map(|(meaning, code)| (*code, meaning.as_str()))
            .collect();
        pairs.sort_unstable();
        pairs
    }
}

/// Mirrors for every enumerated category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumerations {
    tables: BTreeMap<Category, Enumeration>,
}

impl Enumerations {
    pub fn new(categories: &[Category]) -> Self {
        Self {
            tables: categories
                .iter()
                .map(|c| (*c, Enumeration::default()))
                .collect(),
        }
    }

    pub fn insert(&mut self, category: Category, enumeration: Enumeration) {
        self.tables.insert(category, enumeration);
    }

    pub fn get(&self, category: Category) -> Option<&Enumeration> {
        self.tables.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &Enumeration)> {
        self.tables.iter().map(|(c, e)| (*c, e))
    }

    fn code_for(&mut self, category: Category, meaning: Option<&str>) -> Option<i32> {
        let meaning = meaning?;
        self.tables
            .get_mut(&category)
            .map(|table| table.code_or_allocate(meaning))
    }
}

/// One canonical row of the events table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventRow {
    pub site: i32,
    pub ilon: i64,
    pub ilat: i64,
    pub time: i64,
    pub outage_ix: i32,
    pub etr: Option<i64>,
    pub cust_a: i64,
    pub cause: Option<i32>,
    pub crew_status: Option<i32>,
    pub reported_problem: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub rows: Vec<EventRow>,
    /// Working copy of the mirrors, including codes allocated for `rows`.
    pub enums: Enumerations,
}

/// Scale a coordinate to the stored fixed-point integer.
pub fn fixed_point(coord: f64, precision: u32) -> i64 {
    (coord * 10f64.powi(precision as i32)).round() as i64
}

/// Encode an estimated restoration time.
///
/// Offsets written without a colon (`-0500`) are accepted. A timestamp with no
/// offset is read in `tz`.
pub fn parse_etr<Z: TimeZone>(raw: &str, tz: &Z) -> Result<Option<i64>, HarvestError> {
    match raw {
        "ETR-NULL" => return Ok(None),
        "ETR-EXP" => return Ok(Some(ETR_EXPIRED)),
        _ => {}
    }

    let normalized = TRAILING_OFFSET.replace(raw, "$1:$2");
    if let Ok(t) = DateTime::parse_from_rfc3339(&normalized) {
        return Ok(Some(t.timestamp()));
    }
    for format in ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"] {
        if let Ok(t) = DateTime::<FixedOffset>::parse_from_str(&normalized, format) {
            return Ok(Some(t.timestamp()));
        }
    }
    for format in ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            if let Some(t) = tz.from_local_datetime(&naive).earliest() {
                return Ok(Some(t.timestamp()));
            }
        }
    }
    Err(HarvestError::SchemaMismatch(format!(
        "unrecognized etr value `{raw}`"
    )))
}

fn check_description_keys(desc: &Map<String, Value>) -> Result<(), HarvestError> {
    let mut keys: Vec<&str> = desc.keys().map(String::as_str).collect();
    keys.sort_unstable();
    if keys != DESCRIPTION_KEYS {
        return Err(HarvestError::SchemaMismatch(format!(
            "description keys {keys:?}, expected {DESCRIPTION_KEYS:?}"
        )));
    }
    Ok(())
}

fn categorical<'a>(
    desc: &'a Map<String, Value>,
    category: Category,
) -> Result<Option<&'a str>, HarvestError> {
    match &desc[category.column()] {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() || NA_LIKE_VALUES.contains(&s.as_str()) => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(HarvestError::SchemaMismatch(format!(
            "{category} is {other}, expected a string"
        ))),
    }
}

fn canonical_row(
    site: &Site,
    event: &RawEvent,
    time: i64,
    precision: u32,
    enums: &mut Enumerations,
) -> Result<EventRow, HarvestError> {
    let desc = &event.desc;
    check_description_keys(desc)?;

    let etr = match &desc["etr"] {
        Value::String(raw) => parse_etr(raw, &site.timezone)?,
        Value::Null => None,
        other => {
            return Err(HarvestError::SchemaMismatch(format!(
                "etr is {other}, expected a string"
            )))
        }
    };
    let GeoPoint { lon, lat } = event.point;
    let outage_ix = i32::try_from(event.outage_ix)
        .map_err(|_| HarvestError::SchemaMismatch(format!("outage index {}", event.outage_ix)))?;

    Ok(EventRow {
        site: site.code,
        ilon: fixed_point(lon, precision),
        ilat: fixed_point(lat, precision),
        time,
        outage_ix,
        etr,
        cust_a: customer_count(desc)?,
        cause: enums.code_for(Category::Cause, categorical(desc, Category::Cause)?),
        crew_status: enums.code_for(Category::CrewStatus, categorical(desc, Category::CrewStatus)?),
        reported_problem: enums.code_for(
            Category::ReportedProblem,
            categorical(desc, Category::ReportedProblem)?,
        ),
    })
}

/// Turn a snapshot's raw events into deduplicated rows.
///
/// `enums` is left untouched; codes allocated along the way are returned in
/// [`Normalized::enums`] so they can be adopted once the rows are committed.
pub fn normalize(
    site: &Site,
    snapshot: &Snapshot,
    precision: u32,
    enums: &Enumerations,
) -> Result<Normalized, HarvestError> {
    let mut working = enums.clone();
    let time = snapshot.time.timestamp();
    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(snapshot.events.len());

    for event in &snapshot.events {
        let row = canonical_row(site, event, time, precision, &mut working)?;
        if seen.insert(row.clone()) {
            rows.push(row);
        }
    }

    Ok(Normalized {
        rows,
        enums: working,
    })
}
