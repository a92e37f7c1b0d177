use chrono::{DateTime, NaiveDate, TimeZone};
use chrono_tz::Tz;
use outage_harvest::geometry::{Anchor, QuadKey};
use outage_harvest::settings::{Database, Scrape, Settings, SleepRange, Site};
use serde_json::{json, Value};

pub const ROOT: &str = "https://feed.test/data";
pub const ANCHOR: &str = "03201011";
/// Second top tile, west of the anchor.
pub const NEIGHBOR: &str = "03201010";

/// Local midnight of the test site's first day.
pub fn t0() -> DateTime<Tz> {
    chrono_tz::America::New_York
        .with_ymd_and_hms(2021, 7, 4, 0, 0, 0)
        .unwrap()
}

pub fn site() -> Site {
    Site {
        code: 0,
        name: "testville".to_string(),
        url_root: ROOT.to_string(),
        timezone: chrono_tz::America::New_York,
        top_tiles: vec![ANCHOR.parse().unwrap(), NEIGHBOR.parse().unwrap()],
        date_min: NaiveDate::from_ymd_opt(2021, 7, 4).unwrap(),
    }
}

/// Default scraping policy without any sleeping.
pub fn settings() -> Settings {
    Settings {
        database: Database::default(),
        scrape: Scrape {
            between_requests_secs: SleepRange::none(),
            retry_secs: SleepRange::none(),
            ..Scrape::default()
        },
        sites: vec![site()],
    }
}

pub fn tile_url(tile: &str, time: DateTime<Tz>) -> String {
    outage_harvest::fetch::tile_url(ROOT, &time, &tile.parse().unwrap())
}

fn encode_value(value: f64, out: &mut String) {
    let scaled = (value * 1e5).round() as i64;
    let mut v = if scaled < 0 { !(scaled << 1) } else { scaled << 1 };
    while v >= 0x20 {
        out.push(char::from((0x20 | (v & 0x1f)) as u8 + 63));
        v >>= 5;
    }
    out.push(char::from(v as u8 + 63));
}

/// Google polyline of a single point at five digits.
pub fn encode_point(lat: f64, lon: f64) -> String {
    let mut out = String::new();
    encode_value(lat, &mut out);
    encode_value(lon, &mut out);
    out
}

/// `(lat, lon)` of the middle of a tile.
pub fn tile_center(tile: &str) -> (f64, f64) {
    let key: QuadKey = tile.parse().unwrap();
    let sw = key.corner(Anchor::SouthWest);
    let ne = key.corner(Anchor::NorthEast);
    ((sw.lat + ne.lat) / 2.0, (sw.lon + ne.lon) / 2.0)
}

/// A single outage description.
pub fn desc(cust: i64, cause: &str) -> Value {
    json!({
        "cause": cause,
        "cluster": false,
        "crew_status": "Crew Dispatched",
        "cust_a": {"val": cust},
        "etr": "2021-07-04T10:00-0500",
        "outages": null,
        "reported_problem": "Not Supplied",
    })
}

pub fn single_record(lat: f64, lon: f64, desc: Value) -> Value {
    json!({
        "id": format!("{lat:.5},{lon:.5}"),
        "title": "Outage Information",
        "geom": {"p": [encode_point(lat, lon)]},
        "desc": desc,
    })
}

/// A cluster; an empty `outages` leaves it unresolved.
pub fn cluster_record(lat: f64, lon: f64, cust: i64, outages: Vec<Value>) -> Value {
    let outages = if outages.is_empty() {
        Value::Null
    } else {
        Value::Array(outages)
    };
    json!({
        "id": format!("{lat:.5},{lon:.5}"),
        "title": "Area Outage",
        "geom": {"p": [encode_point(lat, lon)], "a": ["area"]},
        "desc": {
            "cause": null,
            "cluster": true,
            "crew_status": null,
            "cust_a": {"val": cust},
            "etr": "ETR-NULL",
            "outages": outages,
            "reported_problem": null,
        },
    })
}

pub fn tile_body(records: Vec<Value>) -> String {
    json!({ "file_data": records }).to_string()
}
