//! HTTP access to the outage feed with its two retry policies.
//!
//! A `403 Forbidden` from the feed is not an error: it means the tile has no
//! data, or, for the anchor tile, that the snapshot was published a little
//! late. Other failures are retried after a long randomized backoff and
//! eventually abort the run.

use crate::errors::HarvestError;
use crate::geometry::QuadKey;
use crate::settings::{Scrape, SleepRange};
use async_trait::async_trait;
use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, warn};

/// Outcome of a single HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(String),
    /// `403 Forbidden`
    NoData,
    /// Any other failure, with the status (or transport error) for reporting.
    TransientFailure(String),
}

#[async_trait]
pub trait OutageFeed: Send + Sync {
    async fn get(&self, url: &str) -> Reply;
}

/// [`OutageFeed`] backed by `reqwest`.
pub struct HttpFeed {
    client: reqwest::Client,
}

impl HttpFeed {
    pub fn new(settings: &Scrape) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(concat!("outage-harvest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OutageFeed for HttpFeed {
    async fn get(&self, url: &str) -> Reply {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return Reply::TransientFailure(format!("request failed: {e}")),
        };
        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Reply::NoData;
        }
        if !status.is_success() {
            return Reply::TransientFailure(status.to_string());
        }
        match response.text().await {
            Ok(body) => Reply::Success(body),
            Err(e) => Reply::TransientFailure(format!("{status}, body unreadable: {e}")),
        }
    }
}

/// The time a snapshot is being queried at.
///
/// `current` starts at `requested` and only moves forward when the anchor tile
/// is realigned; every later request of the snapshot uses the moved time, and
/// so does the stored event time and the job cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotClock {
    pub requested: DateTime<Tz>,
    pub current: DateTime<Tz>,
}

impl SnapshotClock {
    pub fn new(requested: DateTime<Tz>) -> Self {
        Self {
            requested,
            current: requested,
        }
    }

    pub fn drift(&self) -> Duration {
        self.current - self.requested
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Data(String),
    NoData,
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub request_sleep_interval: u64,
    pub between_requests: SleepRange,
    pub retry: SleepRange,
    pub max_tries: u32,
    pub subquery_increment: Duration,
    pub subquery_max_drift: Duration,
}

impl From<&Scrape> for FetchPolicy {
    fn from(s: &Scrape) -> Self {
        Self {
            request_sleep_interval: s.request_sleep_interval,
            between_requests: s.between_requests_secs,
            retry: s.retry_secs,
            max_tries: s.max_tries,
            subquery_increment: Duration::seconds(s.subquery_increment_secs),
            subquery_max_drift: Duration::seconds(s.subquery_max_drift_secs),
        }
    }
}

/// `{url_root}/{%Y_%m_%d_%H_%M_%S}/outages/{quadkey}.json`, in site-local time.
pub fn tile_url(url_root: &str, time: &DateTime<Tz>, tile: &QuadKey) -> String {
    format!(
        "{}/{}/outages/{}.json",
        url_root,
        time.format("%Y_%m_%d_%H_%M_%S"),
        tile
    )
}

async fn sleep_within(range: SleepRange, reason: &str) {
    let secs = if range.max_secs > range.min_secs {
        rand::thread_rng().gen_range(range.min_secs..=range.max_secs)
    } else {
        range.min_secs
    };
    debug!(secs, reason, "Sleeping");
    tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
}

pub struct Fetcher<F> {
    feed: F,
    policy: FetchPolicy,
    requests: u64,
}

impl<F: OutageFeed> Fetcher<F> {
    pub fn new(feed: F, policy: FetchPolicy) -> Self {
        Self {
            feed,
            policy,
            requests: 0,
        }
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    /// Requests issued by this fetcher so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    async fn request(&mut self, url: &str) -> Reply {
        debug!(url, "Requesting tile");
        let reply = self.feed.get(url).await;
        self.requests += 1;
        if self.requests % self.policy.request_sleep_interval == 0 {
            sleep_within(self.policy.between_requests, "throttle").await;
        }
        reply
    }

    /// Fetch one tile at `clock.current`.
    ///
    /// For the anchor tile a "no data" reply moves `clock.current` forward in
    /// fixed steps until the feed answers or the drift bound would be passed.
    /// On giving up the clock keeps the last time tried.
    pub async fn fetch(
        &mut self,
        url_root: &str,
        tile: &QuadKey,
        clock: &mut SnapshotClock,
        is_anchor: bool,
    ) -> Result<FetchOutcome, HarvestError> {
        let mut tries = 0;
        loop {
            let url = tile_url(url_root, &clock.current, tile);
            let reply = self.request(&url).await;
            tries += 1;
            match reply {
                Reply::Success(body) => return Ok(FetchOutcome::Data(body)),
                Reply::NoData if is_anchor => {
                    let next = clock.current + self.policy.subquery_increment;
                    if next - clock.requested > self.policy.subquery_max_drift {
                        warn!(
                            %tile,
                            requested = %clock.requested,
                            last_tried = %clock.current,
                            "No data for anchor tile within the drift bound"
                        );
                        return Ok(FetchOutcome::NoData);
                    }
                    debug!(%tile, time = %next, "Realigning snapshot time");
                    clock.current = next;
                    tries = 0;
                }
                Reply::NoData => {
                    debug!(%tile, "Tile has no data");
                    return Ok(FetchOutcome::NoData);
                }
                Reply::TransientFailure(status) => {
                    if tries >= self.policy.max_tries {
                        return Err(HarvestError::RetriesExceeded { url, status });
                    }
                    warn!(url = %url, status = %status, tries, "Request failed, retrying");
                    sleep_within(self.policy.retry, "retry").await;
                }
            }
        }
    }
}
