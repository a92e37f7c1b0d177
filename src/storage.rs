use crate::entities;
use crate::errors::HarvestError;
use crate::normalize::{Category, Enumeration, Enumerations, EventRow};
use crate::settings::Database as DbCfg;
use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use sea_orm::sea_query::{Alias, Condition, Expr, OnConflict, Order, Query};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, ConnectionTrait, Database,
    DatabaseConnection, DbBackend, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use serde::{Deserialize, Serialize};

/// Rows per multi-row INSERT, well under SQLite's bound-parameter limit.
const EVENT_INSERT_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: i64,
    pub site: i32,
    pub time_max: i64,
    pub time_next: Option<i64>,
}

impl From<entities::job::Model> for Job {
    fn from(m: entities::job::Model) -> Self {
        Self {
            job_id: m.job_id,
            site: m.site,
            time_max: m.time_max,
            time_next: m.time_next,
        }
    }
}

impl From<entities::event::Model> for EventRow {
    fn from(m: entities::event::Model) -> Self {
        Self {
            site: m.site,
            ilon: m.ilon,
            ilat: m.ilat,
            time: m.time,
            outage_ix: m.outage_ix,
            etr: m.etr,
            cust_a: m.cust_a,
            cause: m.cause,
            crew_status: m.crew_status,
            reported_problem: m.reported_problem,
        }
    }
}

fn event_model(row: &EventRow) -> entities::event::ActiveModel {
    entities::event::ActiveModel {
        site: Set(row.site),
        ilon: Set(row.ilon),
        ilat: Set(row.ilat),
        time: Set(row.time),
        outage_ix: Set(row.outage_ix),
        etr: Set(row.etr),
        cust_a: Set(row.cust_a),
        cause: Set(row.cause),
        crew_status: Set(row.crew_status),
        reported_problem: Set(row.reported_problem),
    }
}

/// Connect and bring the schema up to date.
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, HarvestError> {
    let db = Database::connect(&cfg.url).await?;
    if db.get_database_backend() == DbBackend::Sqlite {
        db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
    }
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn add_job(
    db: &DatabaseConnection,
    site: i32,
    time_max: i64,
) -> Result<Job, HarvestError> {
    let job = entities::job::ActiveModel {
        job_id: NotSet,
        site: Set(site),
        time_max: Set(time_max),
        time_next: Set(None),
    };

    let model = job.insert(db).await?;
    Ok(model.into())
}

pub async fn list_jobs(db: &DatabaseConnection) -> Result<Vec<Job>, HarvestError> {
    use entities::job::{Column, Entity};

    let jobs = Entity::find().order_by_asc(Column::JobId).all(db).await?;
    Ok(jobs.into_iter().map(Job::from).collect())
}

/// The lowest-numbered job whose cursor has not passed its end time.
pub async fn pending_job(db: &DatabaseConnection) -> Result<Option<Job>, HarvestError> {
    use entities::job::{Column, Entity};

    let job = Entity::find()
        .filter(
            Condition::any()
                .add(Column::TimeNext.is_null())
                .add(Expr::col(Column::TimeNext).lte(Expr::col(Column::TimeMax))),
        )
        .order_by_asc(Column::JobId)
        .one(db)
        .await?;
    Ok(job.map(Job::from))
}

/// Load the enumeration mirrors for `categories`.
pub async fn load_enumerations(
    db: &DatabaseConnection,
    categories: &[Category],
) -> Result<Enumerations, HarvestError> {
    let backend = db.get_database_backend();
    let mut enums = Enumerations::new(categories);

    for category in categories {
        let stmt = Query::select()
            .columns([Alias::new("code"), Alias::new("meaning")])
            .from(Alias::new(category.table_name()))
            .order_by(Alias::new("code"), Order::Asc)
            .to_owned();
        let mut pairs = Vec::new();
        for row in db.query_all(backend.build(&stmt)).await? {
            let code: i32 = row.try_get("", "code")?;
            let meaning: String = row.try_get("", "meaning")?;
            pairs.push((code, meaning));
        }
        enums.insert(*category, Enumeration::from_pairs(pairs));
    }

    Ok(enums)
}

async fn insert_enumerations<C: ConnectionTrait>(
    conn: &C,
    enums: &Enumerations,
) -> Result<(), HarvestError> {
    let backend = conn.get_database_backend();

    for (category, enumeration) in enums.iter() {
        if enumeration.is_empty() {
            continue;
        }
        let mut stmt = Query::insert();
        stmt.into_table(Alias::new(category.table_name()))
            .columns([Alias::new("code"), Alias::new("meaning")]);
        for (code, meaning) in enumeration.pairs() {
            stmt.values([code.into(), meaning.into()])?;
        }
        // Existing codes are never overwritten
        stmt.on_conflict(OnConflict::column(Alias::new("code")).do_nothing().to_owned());
        conn.execute(backend.build(&stmt)).await?;
    }

    Ok(())
}

/// Persist one snapshot and advance the job's cursor, atomically.
///
/// The cursor moves to `actual + increment`, where `actual` is the time the
/// snapshot was really read at (after any realignment), so drift carries over
/// to the job's following snapshots. Returns the new cursor.
pub async fn commit_snapshot(
    db: &DatabaseConnection,
    job: &Job,
    rows: &[EventRow],
    enums: &Enumerations,
    actual: DateTime<Tz>,
    increment: Duration,
) -> Result<i64, HarvestError> {
    use entities::job::{Column, Entity};

    let next = (actual + increment).timestamp();
    let txn = db.begin().await?;

    if !rows.is_empty() {
        insert_enumerations(&txn, enums).await?;
        for chunk in rows.chunks(EVENT_INSERT_CHUNK) {
            entities::event::Entity::insert_many(chunk.iter().map(event_model))
                .exec_without_returning(&txn)
                .await?;
        }
    }

    let updated = Entity::update_many()
        .col_expr(Column::TimeNext, Expr::value(next))
        .filter(Column::JobId.eq(job.job_id))
        .exec(&txn)
        .await?;
    if updated.rows_affected != 1 {
        return Err(HarvestError::Other(format!(
            "job {} disappeared while being processed",
            job.job_id
        )));
    }

    txn.commit().await?;
    Ok(next)
}

pub async fn list_events(
    db: &DatabaseConnection,
    site: i32,
) -> Result<Vec<EventRow>, HarvestError> {
    use entities::event::{Column, Entity};

    let events = Entity::find()
        .filter(Column::Site.eq(site))
        .order_by_asc(Column::Time)
        .order_by_asc(Column::Ilon)
        .order_by_asc(Column::Ilat)
        .order_by_asc(Column::OutageIx)
        .all(db)
        .await?;
    Ok(events.into_iter().map(EventRow::from).collect())
}
