use crate::errors::HarvestError;
use crate::geometry::QuadKey;
use crate::normalize::Category;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use miette::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub database: Database,
    #[serde(default)]
    pub scrape: Scrape,
    #[serde(default = "default_sites")]
    pub sites: Vec<Site>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// SeaORM/SQLx connection string, e.g. sqlite://outages.db?mode=rwc
    pub url: String,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://outages.db?mode=rwc".to_string(),
        }
    }
}

/// Uniformly random sleep bounds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct SleepRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl SleepRange {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub const fn none() -> Self {
        Self::new(0.0, 0.0)
    }

    fn is_valid(&self) -> bool {
        self.min_secs >= 0.0 && self.min_secs <= self.max_secs
    }
}

impl From<(f64, f64)> for SleepRange {
    fn from((min_secs, max_secs): (f64, f64)) -> Self {
        Self { min_secs, max_secs }
    }
}

impl From<SleepRange> for (f64, f64) {
    fn from(value: SleepRange) -> Self {
        (value.min_secs, value.max_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scrape {
    /// Decimal digits of the encoded polylines; also the fixed-point scale of
    /// stored coordinates.
    pub polyline_precision: u32,
    /// Categorical description fields stored as enumeration codes. Fields
    /// left out are stored as NULL.
    pub enum_columns: Vec<Category>,
    /// Throttle after every this many requests.
    pub request_sleep_interval: u64,
    pub between_requests_secs: SleepRange,
    pub retry_secs: SleepRange,
    pub max_tries: u32,
    pub query_increment_secs: i64,
    pub subquery_increment_secs: i64,
    pub subquery_max_drift_secs: i64,
    pub request_timeout_secs: u64,
}

impl Default for Scrape {
    fn default() -> Self {
        Self {
            polyline_precision: 5,
            enum_columns: Category::ALL.to_vec(),
            request_sleep_interval: 30,
            between_requests_secs: SleepRange::new(0.5, 2.0),
            retry_secs: SleepRange::new(15.0 * 60.0, 16.0 * 60.0),
            max_tries: 3,
            query_increment_secs: 15 * 60,
            subquery_increment_secs: 30,
            subquery_max_drift_secs: 90,
            request_timeout_secs: 60,
        }
    }
}

impl Scrape {
    pub fn query_increment(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.query_increment_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// A utility outage map. A site's code is its position in [`Settings::sites`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    #[serde(skip)]
    pub code: i32,
    pub name: String,
    pub url_root: String,
    pub timezone: Tz,
    /// The first entry is the anchor tile, the only one eligible for time
    /// realignment.
    pub top_tiles: Vec<QuadKey>,
    /// Earliest date with published data
    pub date_min: NaiveDate,
}

impl Site {
    pub fn anchor_tile(&self) -> Option<&QuadKey> {
        self.top_tiles.first()
    }

    /// Local midnight of `date_min`, where a fresh job begins.
    pub fn start_time(&self) -> Result<DateTime<Tz>, HarvestError> {
        self.timezone
            .from_local_datetime(&self.date_min.and_time(NaiveTime::MIN))
            .earliest()
            .ok_or_else(|| {
                HarvestError::InvalidSettings(format!(
                    "site {} has no local midnight on {}",
                    self.name, self.date_min
                ))
            })
    }

    pub fn local_time(&self, epoch_secs: i64) -> Result<DateTime<Tz>, HarvestError> {
        self.timezone
            .timestamp_opt(epoch_secs, 0)
            .single()
            .ok_or_else(|| HarvestError::Other(format!("timestamp {epoch_secs} out of range")))
    }
}

fn default_sites() -> Vec<Site> {
    vec![Site {
        code: 0,
        name: "nyc".to_string(),
        url_root: "https://outagemap.coned.com/resources/data/external/interval_generation_data"
            .to_string(),
        timezone: chrono_tz::America::New_York,
        top_tiles: vec!["03201011".parse().expect("literal quadkey is valid")],
        date_min: NaiveDate::from_ymd_opt(2020, 2, 19).expect("literal date is valid"),
    }]
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("database.url", Database::default().url)
            .map_err(HarvestError::from)?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: OUTAGE_HARVEST__SCRAPE__MAX_TRIES=5, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("OUTAGE_HARVEST").separator("__"));

        let cfg = builder.build().map_err(HarvestError::from)?;
        let mut s: Settings = cfg.try_deserialize().map_err(HarvestError::from)?;

        for (code, site) in s.sites.iter_mut().enumerate() {
            site.code = code as i32;
        }
        s.validate()?;

        Ok(s)
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let scrape = &self.scrape;
        if scrape.max_tries == 0 {
            return Err(HarvestError::InvalidSettings(
                "scrape.max_tries must be at least 1".to_string(),
            ));
        }
        if scrape.request_sleep_interval == 0 {
            return Err(HarvestError::InvalidSettings(
                "scrape.request_sleep_interval must be at least 1".to_string(),
            ));
        }
        if !scrape.between_requests_secs.is_valid() || !scrape.retry_secs.is_valid() {
            return Err(HarvestError::InvalidSettings(
                "sleep ranges must be [min, max] with 0 <= min <= max".to_string(),
            ));
        }
        if scrape.subquery_increment_secs <= 0 || scrape.subquery_max_drift_secs < 0 {
            return Err(HarvestError::InvalidSettings(
                "subquery increment must be positive and the drift bound non-negative"
                    .to_string(),
            ));
        }
        if scrape.query_increment_secs <= 0 {
            return Err(HarvestError::InvalidSettings(
                "scrape.query_increment_secs must be positive".to_string(),
            ));
        }
        if self.sites.is_empty() {
            return Err(HarvestError::InvalidSettings(
                "at least one site must be configured".to_string(),
            ));
        }
        if let Some(site) = self.sites.iter().find(|s| s.top_tiles.is_empty()) {
            return Err(HarvestError::InvalidSettings(format!(
                "site {} has no top_tiles",
                site.name
            )));
        }
        Ok(())
    }

    pub fn site(&self, code: i32) -> Result<&Site, HarvestError> {
        usize::try_from(code)
            .ok()
            .and_then(|ix| self.sites.get(ix))
            .ok_or_else(|| HarvestError::UnknownSite(code.to_string()))
    }

    pub fn site_by_name(&self, name: &str) -> Result<&Site, HarvestError> {
        self.sites
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| HarvestError::UnknownSite(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_settings_load_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nonexistent.toml");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.database.url, "sqlite://outages.db?mode=rwc");
        assert_eq!(settings.scrape.polyline_precision, 5);
        assert_eq!(settings.scrape.max_tries, 3);
        assert_eq!(settings.scrape.request_sleep_interval, 30);
        assert_eq!(settings.scrape.subquery_max_drift_secs, 90);
        assert_eq!(settings.scrape.enum_columns, Category::ALL.to_vec());
        assert_eq!(settings.sites.len(), 1);
        assert_eq!(settings.sites[0].name, "nyc");
        assert_eq!(settings.sites[0].anchor_tile().unwrap().as_str(), "03201011");
    }

    #[test]
    fn test_settings_load_from_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[database]
url = "sqlite://test.db?mode=rwc"

[scrape]
polyline_precision = 6
enum_columns = ["cause", "crew_status"]
retry_secs = [1, 2]
between_requests_secs = [0.0, 0.25]

[[sites]]
name = "alpha"
url_root = "https://alpha.example.com/data"
timezone = "America/Chicago"
top_tiles = ["0231", "0232"]
date_min = "2021-06-01"

[[sites]]
name = "beta"
url_root = "https://beta.example.com/data"
timezone = "UTC"
top_tiles = ["1"]
date_min = "2022-01-01"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.database.url, "sqlite://test.db?mode=rwc");
        assert_eq!(settings.scrape.polyline_precision, 6);
        assert_eq!(
            settings.scrape.enum_columns,
            vec![Category::Cause, Category::CrewStatus]
        );
        assert_eq!(settings.scrape.retry_secs, SleepRange::new(1.0, 2.0));
        // Unset keys keep their defaults
        assert_eq!(settings.scrape.max_tries, 3);

        let beta = settings.site_by_name("beta").expect("beta configured");
        assert_eq!(beta.code, 1);
        assert_eq!(beta.timezone, chrono_tz::UTC);
        assert_eq!(settings.site(0).unwrap().top_tiles.len(), 2);
        assert!(settings.site(2).is_err());
    }

    #[test]
    fn test_settings_env_override() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[scrape]
request_timeout_secs = 4
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        // Read by no other test
        env::set_var("OUTAGE_HARVEST__SCRAPE__REQUEST_TIMEOUT_SECS", "7");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.scrape.request_timeout_secs, 7);
        assert_eq!(settings.scrape.request_timeout(), Duration::from_secs(7));

        env::remove_var("OUTAGE_HARVEST__SCRAPE__REQUEST_TIMEOUT_SECS");
    }

    #[test]
    fn test_settings_reject_bad_quadkey() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[[sites]]
name = "broken"
url_root = "https://example.com"
timezone = "UTC"
top_tiles = ["0394"]
date_min = "2021-01-01"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let err = Settings::load(config_path.to_str().unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarvestError>(),
            Some(HarvestError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_sleep_range() {
        let mut settings = Settings {
            sites: default_sites(),
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());

        settings.scrape.retry_secs = SleepRange::new(10.0, 5.0);
        assert!(matches!(
            settings.validate(),
            Err(HarvestError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_site_start_time_is_local_midnight() {
        let site = &default_sites()[0];
        let start = site.start_time().expect("valid start");
        assert_eq!(start.timestamp(), 1_582_088_400);
    }
}
