#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! `PostgreSQL` persistence for COVIS: the run catalog, the task broker, and
//! the task result backend.

pub mod catalog;
pub mod error;
pub mod queue;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub use catalog::PgCatalog;
pub use error::{DataError, Result as DataResult};
pub use queue::{PgBroker, PgResultBackend};

/// Connected and migrated database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to `url`, giving up after `timeout`, and apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or migrations fail.
    pub async fn connect(url: &str, timeout: Duration) -> DataResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(timeout)
            .connect(url)
            .await
            .map_err(|source| DataError::ConnectFailed { source })?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn from_pool(pool: PgPool) -> DataResult<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| DataError::MigrationFailed { source })?;
        info!("catalog schema is up to date");
        Ok(Self { pool })
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run catalog over this database.
    #[must_use]
    pub fn catalog(&self) -> PgCatalog {
        PgCatalog::new(self.pool.clone())
    }

    /// Task broker over this database.
    #[must_use]
    pub fn broker(&self) -> PgBroker {
        PgBroker::new(self.pool.clone())
    }

    /// Result backend over this database keeping results for `retention`.
    #[must_use]
    pub fn results(&self, retention: Duration) -> PgResultBackend {
        PgResultBackend::new(self.pool.clone(), retention)
    }
}
