// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistent storage.
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use eventpipe_core::SourceId;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{migrate, query, query_as};
use thiserror::Error;
use tracing::debug;

use crate::items::ItemStoreError;

/// Default time a connection waits for a lock held by another process before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Get migrations from folder without running them.
pub fn migrations() -> Migrator {
    migrate!()
}

/// Run any pending database migrations from inside the application.
///
/// Migrations are strictly additive, running them against a database created by an older version
/// keeps all existing sources and items.
pub async fn run_pending_migrations(pool: &sqlx::SqlitePool) -> Result<(), SqliteError> {
    migrations().run(pool).await?;
    Ok(())
}

/// Version of the latest migration applied to the database, `None` for an empty database.
pub async fn schema_version(pool: &sqlx::SqlitePool) -> Result<Option<i64>, SqliteError> {
    let has_table = query(
        "
        SELECT
            1
        FROM
            sqlite_master
        WHERE
            type = 'table'
            AND name = '_sqlx_migrations'
        ",
    )
    .fetch_optional(pool)
    .await?
    .is_some();

    if !has_table {
        return Ok(None);
    }

    let row: (Option<i64>,) = query_as(
        "
        SELECT
            MAX(version)
        FROM
            _sqlx_migrations
        WHERE
            success = 1
        ",
    )
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

#[derive(Clone, Debug)]
enum Location {
    Url(String),
    Path(PathBuf),
}

pub struct SqliteStoreBuilder {
    location: Location,
    busy_timeout: Duration,
    run_migrations: bool,
    create_database: bool,
}

impl Default for SqliteStoreBuilder {
    fn default() -> Self {
        Self {
            location: Location::Url("sqlite::memory:".into()),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            create_database: true,
            run_migrations: true,
        }
    }
}

impl SqliteStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn random_memory_url(mut self) -> Self {
        // Combining Rust tests with in-memory databases can lead to unsound behaviour, this
        // "workaround" assigns every temporary database a different, random name and keeps them
        // isolated from other tests.
        //
        // See related issue: https://github.com/launchbadge/sqlx/issues/2510
        self.location = Location::Url(format!(
            "sqlite://dbmem{}?mode=memory&cache=private",
            rand::random::<u32>()
        ));
        self
    }

    /// Connect to the database with a SQLite connection URL.
    pub fn database_url(mut self, url: &str) -> Self {
        self.location = Location::Url(url.to_string());
        self
    }

    /// Use the database file at the given path.
    ///
    /// Parent directories are created when building the store.
    pub fn database_path(mut self, path: impl AsRef<Path>) -> Self {
        self.location = Location::Path(path.as_ref().to_path_buf());
        self
    }

    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn create_database(mut self, create_database: bool) -> Self {
        self.create_database = create_database;
        self
    }

    pub fn run_default_migrations(mut self, run_migrations: bool) -> Self {
        self.run_migrations = run_migrations;
        self
    }

    pub async fn build(self) -> Result<SqliteStore, SqliteError> {
        let (options, path) = match self.location {
            Location::Url(url) => (SqliteConnectOptions::from_str(&url)?, None),
            Location::Path(path) => {
                match path.parent() {
                    Some(parent) if self.create_database && !parent.as_os_str().is_empty() => {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|err| SqliteError::Io(parent.to_path_buf(), err))?;
                    }
                    _ => (),
                }
                (SqliteConnectOptions::new().filename(&path), Some(path))
            }
        };

        let options = options
            .create_if_missing(self.create_database)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout);

        // All writes go through one single connection, SQLite serializes writers anyhow and this
        // way we never run into "database is locked" errors between our own connections. The
        // connection is kept open for the lifetime of the pool, in-memory databases would be
        // lost otherwise.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        if self.run_migrations {
            run_pending_migrations(&pool).await?;
        }

        debug!(path = ?path, "opened sqlite store");

        Ok(SqliteStore::new(pool, path))
    }
}

/// SQLite database backed by a write-ahead log.
///
/// This struct can be cloned and used in multiple places in the application. Every cloned instance
/// re-uses the same connection pool, which holds exactly one connection: concurrent callers are
/// queued until the connection is free again, which serializes all writes.
///
/// Operations consisting of multiple statements (for example pushing an item, which also assigns
/// the next order index and lazily creates the source row) run inside a transaction and are
/// either applied fully or not at all.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pub(crate) pool: sqlx::SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub(crate) fn new(pool: sqlx::SqlitePool, path: Option<PathBuf>) -> Self {
        Self { pool, path }
    }

    /// Shortcut building an in-memory SQLite database with a randomised name for testing purposes.
    #[cfg(any(test, feature = "test_utils"))]
    pub async fn temporary() -> Self {
        SqliteStoreBuilder::new()
            .random_memory_url()
            .build()
            .await
            .expect("migrations succeeded")
    }

    /// Path of the database file, `None` when the store was opened with a connection URL.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) async fn close_pool(&self) {
        self.pool.close().await;
    }

    /// Remove the database file together with its write-ahead log and shared-memory files.
    pub(crate) async fn remove_files(&self) -> Result<(), SqliteError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            let file = PathBuf::from(file);

            match tokio::fs::remove_file(&file).await {
                Ok(()) => debug!(path = %file.display(), "removed database file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => return Err(SqliteError::Io(file, err)),
            }
        }

        Ok(())
    }
}

/// Returns `true` if the error was caused by a violated unique constraint.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|err| err.is_unique_violation())
        .unwrap_or(false)
}

#[derive(Debug, Error)]
pub enum SqliteError {
    /// SQLite database and connection error.
    #[error(transparent)]
    Sqlite(#[from] sqlx::Error),

    /// SQL table schema migration error.
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Creating or removing database files failed.
    #[error("i/o error on '{path}': {1}", path = .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("item '{1}' of source '{0}' already exists")]
    ItemExists(SourceId, String),

    #[error("item '{1}' of source '{0}' not found")]
    ItemNotFound(SourceId, String),
}

impl ItemStoreError for SqliteError {
    fn is_item_exists(&self) -> bool {
        matches!(self, Self::ItemExists(..))
    }
}
