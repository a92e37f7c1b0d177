//! Breadth-first walk of a site's tile quadtree for one snapshot.

use crate::errors::HarvestError;
use crate::fetch::{FetchOutcome, Fetcher, OutageFeed, SnapshotClock};
use crate::geometry::{decode_point, point_in_tile, GeoPoint, QuadKey};
use crate::settings::Site;
use chrono::DateTime;
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

const SINGLE_TITLE: &str = "Outage Information";
const CLUSTER_TITLE: &str = "Area Outage";
const SINGLE_RECORD_KEYS: [&str; 4] = ["desc", "geom", "id", "title"];

/// An outage description located at a decoded point.
///
/// `outage_ix` is 1 for single events and the 1-based position within an
/// itemized cluster otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub point: GeoPoint,
    pub outage_ix: u32,
    pub desc: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub events: Vec<RawEvent>,
    /// Time the snapshot was actually read at, after any realignment.
    pub time: DateTime<Tz>,
}

#[derive(Debug, Deserialize)]
struct TileBody {
    file_data: Vec<Map<String, Value>>,
}

fn schema(message: impl Into<String>) -> HarvestError {
    HarvestError::SchemaMismatch(message.into())
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, HarvestError> {
    value
        .as_object()
        .ok_or_else(|| schema(format!("{what} is {value}, expected an object")))
}

/// The value of an object that must hold exactly the one key `key`.
fn sole_value<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value, HarvestError> {
    match obj.get(key) {
        Some(value) if obj.len() == 1 => Ok(value),
        _ => Err(schema(format!(
            "expected only `{key}`, found keys {:?}",
            obj.keys().collect::<Vec<_>>()
        ))),
    }
}

/// `cust_a.val` of a description.
pub fn customer_count(desc: &Map<String, Value>) -> Result<i64, HarvestError> {
    let cust_a = desc
        .get("cust_a")
        .ok_or_else(|| schema("description has no cust_a"))?;
    let val = sole_value(as_object(cust_a, "cust_a")?, "val")?;
    val.as_i64()
        .ok_or_else(|| schema(format!("cust_a.val is {val}, expected an integer")))
}

/// The single marker point of a record. Any extra `a` element is discarded.
fn record_point(record: &Map<String, Value>, precision: u32) -> Result<GeoPoint, HarvestError> {
    let geom = record
        .get("geom")
        .ok_or_else(|| schema("record has no geom"))?;
    let mut geom = as_object(geom, "geom")?.clone();
    geom.remove("a");
    let encoded = match sole_value(&geom, "p")? {
        Value::Array(items) => match items.as_slice() {
            [Value::String(s)] => s,
            _ => return Err(schema(format!("geom.p holds {} items", items.len()))),
        },
        other => return Err(schema(format!("geom.p is {other}, expected a list"))),
    };
    decode_point(encoded, precision)
}

fn title(record: &Map<String, Value>) -> Option<&str> {
    record.get("title").and_then(Value::as_str)
}

struct Traversal<'a> {
    tile: &'a QuadKey,
    precision: u32,
    queue: &'a mut VecDeque<QuadKey>,
    seen: &'a mut HashSet<QuadKey>,
    events: &'a mut Vec<RawEvent>,
}

impl Traversal<'_> {
    fn visit_record(&mut self, record: &Map<String, Value>) -> Result<(), HarvestError> {
        let point = record_point(record, self.precision)?;
        let desc = as_object(
            record
                .get("desc")
                .ok_or_else(|| schema("record has no desc"))?,
            "desc",
        )?;
        let is_cluster = desc
            .get("cluster")
            .and_then(Value::as_bool)
            .ok_or_else(|| schema("desc.cluster is not a boolean"))?;

        if !is_cluster {
            let mut keys: Vec<&str> = record.keys().map(String::as_str).collect();
            keys.sort_unstable();
            if keys != SINGLE_RECORD_KEYS {
                return Err(schema(format!("single outage record has keys {keys:?}")));
            }
            if title(record) != Some(SINGLE_TITLE) {
                return Err(schema(format!("single outage titled {:?}", title(record))));
            }
            if !desc.get("outages").is_some_and(Value::is_null) {
                return Err(schema("single outage lists sub-outages"));
            }
            self.events.push(RawEvent {
                point,
                outage_ix: 1,
                desc: desc.clone(),
            });
            return Ok(());
        }

        if title(record) != Some(CLUSTER_TITLE) {
            return Err(schema(format!("cluster titled {:?}", title(record))));
        }
        let itemized: &[Value] = match desc.get("outages") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Null) | None => &[],
            Some(other) => return Err(schema(format!("desc.outages is {other}"))),
        };

        if itemized.is_empty() {
            self.zoom_in(point);
            return Ok(());
        }

        let subs = itemized
            .iter()
            .map(|s| as_object(s, "sub-outage"))
            .collect::<Result<Vec<_>, _>>()?;
        let reported = customer_count(desc)?;
        let itemized_total = subs
            .iter()
            .map(|s| customer_count(s))
            .sum::<Result<i64, _>>()?;
        if reported != itemized_total {
            return Err(HarvestError::ClusterCountMismatch {
                tile: self.tile.to_string(),
                reported,
                itemized: itemized_total,
            });
        }
        for (ix, sub) in subs.into_iter().enumerate() {
            self.events.push(RawEvent {
                point,
                outage_ix: ix as u32 + 1,
                desc: sub.clone(),
            });
        }
        Ok(())
    }

    /// Queue the children of the current tile that contain `point`.
    fn zoom_in(&mut self, point: GeoPoint) {
        for child in self.tile.children() {
            if point_in_tile(point, &child) && self.seen.insert(child.clone()) {
                debug!(tile = %child, "Queueing child tile");
                self.queue.push_back(child);
            }
        }
    }
}

/// Collect every outage of `site` at `requested`.
///
/// Tiles are visited first-in first-out, starting from the site's top tiles.
/// A cluster without itemized outages sends the walk one level deeper. The
/// returned snapshot time is where the anchor tile's realignment left it.
pub async fn scrape<F: OutageFeed>(
    fetcher: &mut Fetcher<F>,
    site: &Site,
    precision: u32,
    requested: DateTime<Tz>,
) -> Result<Snapshot, HarvestError> {
    let mut clock = SnapshotClock::new(requested);
    let mut queue: VecDeque<QuadKey> = site.top_tiles.iter().cloned().collect();
    let mut seen: HashSet<QuadKey> = queue.iter().cloned().collect();
    let mut events = Vec::new();
    let anchor = site.anchor_tile();

    while let Some(tile) = queue.pop_front() {
        let is_anchor = anchor == Some(&tile);
        let body = match fetcher
            .fetch(&site.url_root, &tile, &mut clock, is_anchor)
            .await?
        {
            FetchOutcome::Data(body) => body,
            FetchOutcome::NoData => continue,
        };
        let body: TileBody = serde_json::from_str(&body)?;

        let mut traversal = Traversal {
            tile: &tile,
            precision,
            queue: &mut queue,
            seen: &mut seen,
            events: &mut events,
        };
        for record in &body.file_data {
            traversal.visit_record(record)?;
        }
    }

    Ok(Snapshot {
        events,
        time: clock.current,
    })
}
