//! The job loop: pick a job, scrape one snapshot, commit it, repeat.

use crate::errors::HarvestError;
use crate::fetch::{FetchPolicy, Fetcher, OutageFeed};
use crate::normalize::{normalize, Enumerations};
use crate::settings::Settings;
use crate::storage;
use crate::traversal;
use chrono::DateTime;
use chrono_tz::Tz;
use sea_orm::DatabaseConnection;
use tracing::info;

/// What one committed snapshot did.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub job_id: i64,
    pub site: String,
    pub requested: DateTime<Tz>,
    /// Snapshot time after realignment; the stored event time.
    pub actual: DateTime<Tz>,
    pub rows: usize,
    /// The job's cursor after the commit.
    pub time_next: i64,
}

/// Harvesting context: database handle, fetcher and enumeration mirrors.
///
/// The mirrors only ever hold codes that are already committed.
pub struct Session<F> {
    db: DatabaseConnection,
    settings: Settings,
    fetcher: Fetcher<F>,
    enums: Enumerations,
}

impl<F: OutageFeed> Session<F> {
    pub async fn open(
        db: DatabaseConnection,
        settings: Settings,
        feed: F,
    ) -> Result<Self, HarvestError> {
        let enums = storage::load_enumerations(&db, &settings.scrape.enum_columns).await?;
        let fetcher = Fetcher::new(feed, FetchPolicy::from(&settings.scrape));
        Ok(Self {
            db,
            settings,
            fetcher,
            enums,
        })
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn fetcher(&self) -> &Fetcher<F> {
        &self.fetcher
    }

    pub fn enumerations(&self) -> &Enumerations {
        &self.enums
    }

    /// Scrape and commit the next snapshot of the first pending job.
    ///
    /// Returns `None` once no job is pending.
    pub async fn step(&mut self) -> Result<Option<StepReport>, HarvestError> {
        let Some(job) = storage::pending_job(&self.db).await? else {
            return Ok(None);
        };
        let site = self.settings.site(job.site)?;
        let requested = match job.time_next {
            Some(t) => site.local_time(t)?,
            None => site.start_time()?,
        };
        info!(job_id = job.job_id, site = %site.name, time = %requested, "Processing job");

        let scrape = &self.settings.scrape;
        let snapshot =
            traversal::scrape(&mut self.fetcher, site, scrape.polyline_precision, requested)
                .await?;
        let normalized = normalize(site, &snapshot, scrape.polyline_precision, &self.enums)?;

        let time_next = storage::commit_snapshot(
            &self.db,
            &job,
            &normalized.rows,
            &normalized.enums,
            snapshot.time,
            scrape.query_increment(),
        )
        .await?;
        info!(
            job_id = job.job_id,
            time = %snapshot.time,
            rows = normalized.rows.len(),
            "Wrote snapshot"
        );
        // Committed, so the allocated codes are now safe to reuse
        self.enums = normalized.enums;

        Ok(Some(StepReport {
            job_id: job.job_id,
            site: site.name.clone(),
            requested,
            actual: snapshot.time,
            rows: normalized.rows.len(),
            time_next,
        }))
    }

    /// Process snapshots until no job is pending. Returns the number committed.
    pub async fn run(&mut self) -> Result<usize, HarvestError> {
        let mut snapshots = 0;
        while self.step().await?.is_some() {
            snapshots += 1;
        }
        info!(snapshots, "All jobs done");
        Ok(snapshots)
    }
}
