//! Schema update database
//!
//! Applies and reverts schema updates against a SQLite database and records
//! which updates are applied in the `schema_updates` table. Each apply or
//! revert runs its script and its bookkeeping in one transaction.

use std::path::Path;
use std::time::Instant;

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::updates::{SchemaDir, SchemaError, SchemaResult, FILE_APPLY, FILE_REVERT};
use crate::logger::{ChildFactory, Logger};

/// Default database file, relative to the working directory
pub const DEFAULT_DATABASE: &str = "nosh.db";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_updates (
    name       TEXT PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)"#;

const SELECT_APPLIED_AT: &str = "SELECT applied_at FROM schema_updates WHERE name = ?1";
const INSERT_UPDATE: &str = "INSERT INTO schema_updates (name) VALUES (?1)";
const DELETE_UPDATE: &str = "DELETE FROM schema_updates WHERE name = ?1";

/// A database tracking applied schema updates
pub struct SchemaDatabase {
    conn: Connection,
    logger: Logger,
    queries: ChildFactory,
}

impl SchemaDatabase {
    /// Open the database file at `path`, creating it if needed
    pub async fn open(path: impl AsRef<Path>) -> SchemaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path)
            .await
            .map_err(|e| SchemaError::Database(e.to_string()))?;
        Self::init(conn).await
    }

    /// Open a private in-memory database
    pub async fn open_in_memory() -> SchemaResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| SchemaError::Database(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> SchemaResult<Self> {
        let logger = Logger::root().child("schema");
        let database = Self {
            conn,
            queries: ChildFactory::new("query", &logger),
            logger,
        };

        database.logger.debug("Creating schema_updates table");
        database
            .run(CREATE_TABLE, |conn| {
                conn.execute_batch(CREATE_TABLE)?;
                Ok(())
            })
            .await?;
        Ok(database)
    }

    async fn run<F, R>(&self, description: &str, query: F) -> SchemaResult<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, tokio_rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let logger = self.queries.create();
        logger.debug(format!("Running query: {}", description.trim()));

        let started = Instant::now();
        let result = self.conn.call(query).await;
        let elapsed = started.elapsed().as_millis();
        match result {
            Ok(value) => {
                logger.debug(format!("Finished in {}ms", elapsed));
                Ok(value)
            }
            Err(e) => {
                logger.debug(format!("Failed after {}ms: {}", elapsed, e));
                Err(SchemaError::Database(e.to_string()))
            }
        }
    }

    /// When `update` was applied, if it is applied
    pub async fn applied_at(&self, update: &str) -> SchemaResult<Option<String>> {
        let update = update.to_string();
        self.run(SELECT_APPLIED_AT, move |conn| {
            let applied_at = conn
                .query_row(SELECT_APPLIED_AT, [&update], |row| row.get::<_, String>(0))
                .optional()?;
            Ok(applied_at)
        })
        .await
    }

    /// Apply `update`; returns false if it was already applied
    pub async fn apply(&self, dir: &SchemaDir, update: &str) -> SchemaResult<bool> {
        self.logger.info(format!("Applying schema update: {}", update));
        if let Some(applied_at) = self.applied_at(update).await? {
            self.logger.info(format!("Already applied on {}", applied_at));
            return Ok(false);
        }

        let path = dir.apply_script(update);
        self.logger.info(format!("Applying: {}", path.display()));
        let script = tokio::fs::read_to_string(&path).await?;

        let name = update.to_string();
        let description = format!("{} of {}", FILE_APPLY, update);
        let applied = self
            .run(&description, move |conn| {
                let tx = conn.transaction()?;
                if tx
                    .query_row(SELECT_APPLIED_AT, [&name], |_| Ok(()))
                    .optional()?
                    .is_some()
                {
                    return Ok(false);
                }
                tx.execute_batch(&script)?;
                tx.execute(INSERT_UPDATE, [&name])?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if applied {
            self.logger.info("Successful");
        }
        Ok(applied)
    }

    /// Revert `update`; returns false if it was not applied
    pub async fn revert(&self, dir: &SchemaDir, update: &str) -> SchemaResult<bool> {
        self.logger.info(format!("Reverting schema update: {}", update));
        if self.applied_at(update).await?.is_none() {
            self.logger.info("Not applied");
            return Ok(false);
        }

        let path = dir.revert_script(update);
        self.logger.info(format!("Reverting: {}", path.display()));
        let script = tokio::fs::read_to_string(&path).await?;

        let name = update.to_string();
        let description = format!("{} of {}", FILE_REVERT, update);
        let reverted = self
            .run(&description, move |conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(&script)?;
                let removed = tx.execute(DELETE_UPDATE, [&name])?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await?;

        if reverted {
            self.logger.info("Successful");
        }
        Ok(reverted)
    }

    /// Apply every update in `dir` that is not applied yet, oldest first
    ///
    /// Returns the number of updates applied by this call.
    pub async fn update(&self, dir: &SchemaDir) -> SchemaResult<usize> {
        let started = Instant::now();

        let updates = dir.updates().await?;
        self.logger.info(format!("{} schema updates found", updates.len()));

        let mut applied = 0;
        for update in &updates {
            if self.apply(dir, update).await? {
                applied += 1;
            }
        }

        self.logger
            .info(format!("Finished in {}ms", started.elapsed().as_millis()));
        Ok(applied)
    }
}
