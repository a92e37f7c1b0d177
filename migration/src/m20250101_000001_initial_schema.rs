use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create jobs table. A NULL time_next means the job starts at the
        // site's earliest available date.
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(pk_auto(Jobs::JobId))
                    .col(integer(Jobs::Site))
                    .col(big_integer(Jobs::TimeMax))
                    .col(big_integer_null(Jobs::TimeNext))
                    .to_owned(),
            )
            .await?;

        // One code table per categorical event field
        for table in ENUMERATION_TABLES {
            manager
                .create_table(
                    Table::create()
                        .table(Alias::new(table))
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Enumeration::Code)
                                .integer()
                                .not_null()
                                .primary_key(),
                        )
                        .col(string_uniq(Enumeration::Meaning))
                        .to_owned(),
                )
                .await?;
        }

        // Create events table (append-only)
        manager
            .create_table(
                Table::create()
                    .table(Events::Table)
                    .if_not_exists()
                    .col(integer(Events::Site))
                    .col(big_integer(Events::Ilon))
                    .col(big_integer(Events::Ilat))
                    .col(big_integer(Events::Time))
                    .col(integer(Events::OutageIx))
                    .col(big_integer_null(Events::Etr))
                    .col(big_integer(Events::CustA))
                    .col(integer_null(Events::Cause))
                    .col(integer_null(Events::CrewStatus))
                    .col(integer_null(Events::ReportedProblem))
                    .primary_key(
                        Index::create()
                            .col(Events::Site)
                            .col(Events::Ilon)
                            .col(Events::Ilat)
                            .col(Events::Time)
                            .col(Events::OutageIx),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_events_cause")
                            .from(Events::Table, Events::Cause)
                            .to(Alias::new("enumeration_cause"), Enumeration::Code),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_events_crew_status")
                            .from(Events::Table, Events::CrewStatus)
                            .to(Alias::new("enumeration_crew_status"), Enumeration::Code),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_events_reported_problem")
                            .from(Events::Table, Events::ReportedProblem)
                            .to(Alias::new("enumeration_reported_problem"), Enumeration::Code),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_events_time")
                    .table(Events::Table)
                    .col(Events::Time)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Events::Table).to_owned())
            .await?;
        for table in ENUMERATION_TABLES {
            manager
                .drop_table(Table::drop().table(Alias::new(table)).to_owned())
                .await?;
        }
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await?;
        Ok(())
    }
}

const ENUMERATION_TABLES: [&str; 3] = [
    "enumeration_cause",
    "enumeration_crew_status",
    "enumeration_reported_problem",
];

#[derive(DeriveIden)]
enum Jobs {
    Table,
    JobId,
    Site,
    TimeMax,
    TimeNext,
}

#[derive(DeriveIden)]
enum Enumeration {
    Code,
    Meaning,
}

#[derive(DeriveIden)]
enum Events {
    Table,
    Site,
    Ilon,
    Ilat,
    Time,
    OutageIx,
    Etr,
    CustA,
    Cause,
    CrewStatus,
    ReportedProblem,
}
