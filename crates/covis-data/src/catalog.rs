//! `PostgreSQL` run catalog.
//!
//! # Design
//! - Runs and their replica locations live in two tables; locations keep their
//!   recorded order through a serial `position` column.
//! - The relocation cursor pages through the catalog by basename so callers can
//!   stream arbitrarily large result sets without holding a connection.
//! - Appending a location is `ON CONFLICT DO NOTHING`, which keeps relocation
//!   idempotent under redelivery.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covis_core::{ArchiveFormat, Catalog, CoreError, CoreResult, RawLocation, Run, RunStream};
use futures_util::stream;
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::error::{DataError, Result};

const PAGE_SIZE: i64 = 500;

const SELECT_NEEDING_RELOCATION_PAGE: &str = r"
    SELECT r.basename, r.datetime, covis_run_locations(r.basename) AS raw
    FROM covis_runs r
    WHERE NOT EXISTS (
        SELECT 1 FROM covis_raw_locations x
        WHERE x.basename = r.basename AND x.host = $1
    )
      AND ($2::text IS NULL OR r.basename > $2)
    ORDER BY r.basename
    LIMIT $3
";

const SAMPLE_NEEDING_RELOCATION: &str = r"
    SELECT r.basename, r.datetime, covis_run_locations(r.basename) AS raw
    FROM covis_runs r
    WHERE NOT EXISTS (
        SELECT 1 FROM covis_raw_locations x
        WHERE x.basename = r.basename AND x.host = $1
    )
    ORDER BY random()
    LIMIT $2
";

const SELECT_RUN: &str = r"
    SELECT r.basename, r.datetime, covis_run_locations(r.basename) AS raw
    FROM covis_runs r
    WHERE r.basename = $1
";

const SELECT_ALL_RUNS: &str = r"
    SELECT r.basename, r.datetime, covis_run_locations(r.basename) AS raw
    FROM covis_runs r
    ORDER BY r.datetime, r.basename
";

const INSERT_RUN: &str = r"
    INSERT INTO covis_runs (basename, datetime) VALUES ($1, $2)
    ON CONFLICT (basename) DO UPDATE SET datetime = EXCLUDED.datetime
";

const INSERT_LOCATION: &str = r"
    INSERT INTO covis_raw_locations (basename, host, path, format)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (basename, host, path) DO NOTHING
";

const RUN_EXISTS: &str = r"SELECT EXISTS (SELECT 1 FROM covis_runs WHERE basename = $1)";

#[derive(Debug, Deserialize)]
struct LocationRow {
    host: String,
    path: String,
    format: String,
}

/// Run catalog backed by `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Catalog over an already migrated pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update `run` and append its locations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn upsert_run(&self, run: &Run) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| DataError::query("catalog.upsert_run.begin", source))?;
        sqlx::query(INSERT_RUN)
            .bind(&run.basename)
            .bind(run.datetime)
            .execute(&mut *tx)
            .await
            .map_err(|source| DataError::query("catalog.upsert_run", source))?;
        for location in &run.raw {
            sqlx::query(INSERT_LOCATION)
                .bind(&run.basename)
                .bind(&location.host)
                .bind(&location.path)
                .bind(location.format.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|source| DataError::query("catalog.upsert_run.location", source))?;
        }
        tx.commit()
            .await
            .map_err(|source| DataError::query("catalog.upsert_run.commit", source))
    }

    async fn page_needing_relocation(
        &self,
        exclude_host: &str,
        after: Option<&str>,
    ) -> Result<Vec<Run>> {
        let rows = sqlx::query(SELECT_NEEDING_RELOCATION_PAGE)
            .bind(exclude_host)
            .bind(after)
            .bind(PAGE_SIZE)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::query("catalog.runs_needing_relocation", source))?;
        rows.iter().map(decode_run).collect()
    }

    async fn run_exists(&self, basename: &str) -> Result<bool> {
        sqlx::query_scalar(RUN_EXISTS)
            .bind(basename)
            .fetch_one(&self.pool)
            .await
            .map_err(|source| DataError::query("catalog.run_exists", source))
    }
}

struct Cursor {
    catalog: PgCatalog,
    exclude_host: String,
    after: Option<String>,
    buffer: VecDeque<Run>,
    exhausted: bool,
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn runs_needing_relocation(&self, exclude_host: &str) -> CoreResult<RunStream> {
        let cursor = Cursor {
            catalog: self.clone(),
            exclude_host: exclude_host.to_string(),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        let runs = stream::try_unfold(cursor, |mut cursor| async move {
            if cursor.buffer.is_empty() && !cursor.exhausted {
                let page = cursor
                    .catalog
                    .page_needing_relocation(&cursor.exclude_host, cursor.after.as_deref())
                    .await
                    .map_err(CoreError::from)?;
                debug!(rows = page.len(), "fetched catalog page");
                cursor.exhausted = page.len() < usize::try_from(PAGE_SIZE).unwrap_or(usize::MAX);
                cursor.after = page.last().map(|run| run.basename.clone());
                cursor.buffer.extend(page);
            }
            Ok::<_, CoreError>(cursor.buffer.pop_front().map(|run| (run, cursor)))
        });
        Ok(Box::pin(runs))
    }

    async fn sample_runs_needing_relocation(
        &self,
        exclude_host: &str,
        count: usize,
    ) -> CoreResult<Vec<Run>> {
        let rows = sqlx::query(SAMPLE_NEEDING_RELOCATION)
            .bind(exclude_host)
            .bind(i64::try_from(count).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::query("catalog.sample_runs", source))?;
        Ok(rows.iter().map(decode_run).collect::<Result<Vec<_>>>()?)
    }

    async fn find_run_by_basename(&self, basename: &str) -> CoreResult<Option<Run>> {
        let row = sqlx::query(SELECT_RUN)
            .bind(basename)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| DataError::query("catalog.find_run", source))?;
        Ok(row.as_ref().map(decode_run).transpose()?)
    }

    async fn add_location(&self, basename: &str, location: RawLocation) -> CoreResult<bool> {
        if !self.run_exists(basename).await? {
            return Err(DataError::UnknownRun {
                basename: basename.to_string(),
            }
            .into());
        }
        let inserted = sqlx::query(INSERT_LOCATION)
            .bind(basename)
            .bind(&location.host)
            .bind(&location.path)
            .bind(location.format.as_str())
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("catalog.add_location", source))?
            .rows_affected()
            == 1;
        info!(
            basename,
            host = %location.host,
            path = %location.path,
            inserted,
            "recorded run location"
        );
        Ok(inserted)
    }

    async fn list_runs(&self) -> CoreResult<Vec<Run>> {
        let rows = sqlx::query(SELECT_ALL_RUNS)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::query("catalog.list_runs", source))?;
        Ok(rows.iter().map(decode_run).collect::<Result<Vec<_>>>()?)
    }
}

fn decode_run(row: &PgRow) -> Result<Run> {
    let basename: String = row
        .try_get("basename")
        .map_err(|source| DataError::query("catalog.decode.basename", source))?;
    let datetime: DateTime<Utc> = row
        .try_get("datetime")
        .map_err(|source| DataError::query("catalog.decode.datetime", source))?;
    let Json(locations): Json<Vec<LocationRow>> = row
        .try_get("raw")
        .map_err(|source| DataError::query("catalog.decode.raw", source))?;

    let mut run = Run::new(basename, datetime);
    for location in locations {
        let format = location.format.parse().unwrap_or_else(|_| {
            debug!(format = %location.format, "unrecognised archive format tag");
            ArchiveFormat::Unknown
        });
        run.push_location(RawLocation::new(location.host, location.path, format));
    }
    Ok(run)
}
