use chrono::{DateTime, Duration, NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use outage_harvest::errors::HarvestError;
use outage_harvest::fetch::HttpFeed;
use outage_harvest::harvest::Session;
use outage_harvest::settings::{Settings, Site};
use outage_harvest::storage;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "outage-harvest",
    version,
    about = "Historical archive builder for utility outage maps"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every pending job until none remain (default)
    Run,
    /// Queue a job that harvests a site up to a given time
    AddJob {
        /// Site name from the configuration
        #[arg(long)]
        site: String,
        /// Last snapshot time, RFC 3339 or YYYY-MM-DD (end of that day, site time)
        #[arg(long)]
        until: String,
    },
    /// List jobs and their cursors
    Jobs,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    tracing::info!("Database schema is up to date");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let feed = HttpFeed::new(&settings.scrape)?;
            let mut session = Session::open(db, settings, feed).await?;
            session.run().await?;
        }
        Command::AddJob { site, until } => {
            let site = settings.site_by_name(&site)?;
            let time_max = parse_until(site, &until)?;
            let job = storage::add_job(&db, site.code, time_max).await?;
            tracing::info!(
                job_id = job.job_id,
                site = %site.name,
                until = %site.local_time(time_max)?,
                "Added job"
            );
        }
        Command::Jobs => {
            for job in storage::list_jobs(&db).await? {
                let site = settings.site(job.site)?;
                let cursor = match job.time_next {
                    Some(t) if t > job.time_max => "done".to_string(),
                    Some(t) => site.local_time(t)?.to_rfc3339(),
                    None => "not started".to_string(),
                };
                println!(
                    "{}\t{}\tuntil {}\tnext {}",
                    job.job_id,
                    site.name,
                    site.local_time(job.time_max)?.to_rfc3339(),
                    cursor
                );
            }
        }
    }
    Ok(())
}

/// Epoch seconds for `--until`. A bare date means the last second of that day.
fn parse_until(site: &Site, raw: &str) -> Result<i64> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.timestamp());
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").into_diagnostic()?;
    let local = date
        .and_time(NaiveTime::MIN)
        .checked_add_signed(Duration::days(1) - Duration::seconds(1))
        .ok_or_else(|| HarvestError::Other(format!("{raw} is out of range")))?
        .and_local_timezone(site.timezone)
        .latest()
        .ok_or_else(|| HarvestError::Other(format!("{raw} does not exist in {}", site.timezone)))?;
    Ok(local.timestamp())
}
