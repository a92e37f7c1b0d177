use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("Config error: {0}")]
    #[diagnostic(code(outage_harvest::config))]
    Config(#[from] config::ConfigError),

    #[error("Invalid settings: {0}")]
    #[diagnostic(
        code(outage_harvest::settings),
        help("Check the [scrape] and [[sites]] sections of the configuration file")
    )]
    InvalidSettings(String),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(outage_harvest::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(outage_harvest::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("HTTP client error: {0}")]
    #[diagnostic(code(outage_harvest::http))]
    Http(#[from] reqwest::Error),

    #[error("Retries exceeded for {url} (last status: {status})")]
    #[diagnostic(
        code(outage_harvest::retries_exceeded),
        help("The outage feed kept failing; rerun once it recovers. Progress resumes from the last committed snapshot")
    )]
    RetriesExceeded { url: String, status: String },

    #[error("Malformed geometry: {0}")]
    #[diagnostic(code(outage_harvest::malformed_geometry))]
    MalformedGeometry(String),

    #[error("Unexpected outage record shape: {0}")]
    #[diagnostic(
        code(outage_harvest::schema_mismatch),
        help("The upstream JSON schema appears to have changed")
    )]
    SchemaMismatch(String),

    #[error("Cluster in tile {tile} reports {reported} customers but its outages sum to {itemized}")]
    #[diagnostic(
        code(outage_harvest::cluster_count_mismatch),
        help("The upstream JSON schema appears to have changed")
    )]
    ClusterCountMismatch {
        tile: String,
        reported: i64,
        itemized: i64,
    },

    #[error("Unknown site `{0}`")]
    #[diagnostic(code(outage_harvest::unknown_site))]
    UnknownSite(String),

    #[error("Invalid quadkey `{0}`")]
    #[diagnostic(
        code(outage_harvest::invalid_quadkey),
        help("A quadkey is a non-empty string of the digits 0-3, at most 31 long")
    )]
    InvalidQuadKey(String),

    #[error("{0}")]
    #[diagnostic(code(outage_harvest::other))]
    Other(String),
}

impl From<sea_orm::sea_query::error::Error> for HarvestError {
    fn from(value: sea_orm::sea_query::error::Error) -> Self {
        HarvestError::Other(format!("Query builder error: {value}"))
    }
}
