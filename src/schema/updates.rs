//! Schema update directory
//!
//! Every schema update lives in its own directory below the schema root,
//! named `<timestamp>-<name>`, where the timestamp is the 17-digit UTC
//! creation time (`YYYYMMDDHHMMSSmmm`). Each directory holds an `apply.sql`
//! and a `revert.sql` script. Sorting directory names therefore yields the
//! order the updates were created in.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;

/// Script run to apply an update
pub const FILE_APPLY: &str = "apply.sql";

/// Script run to revert an update
pub const FILE_REVERT: &str = "revert.sql";

/// Default schema root, relative to the working directory
pub const DEFAULT_SCHEMA_DIR: &str = "schema";

/// Number of digits in an update's timestamp prefix
pub const TIMESTAMP_LENGTH: usize = 17;

const MIN_NAME_LENGTH: usize = 3;

/// Schema tooling errors
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Invalid schema update name \"{0}\" - must be at least 3 lowercase letters or dashes")]
    NameInvalid(String),

    #[error("Schema update \"{name}\" already exists as \"{existing}\"")]
    NameConflict { name: String, existing: String },

    #[error("Unknown schema update \"{0}\"")]
    UnknownUpdate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Whether `name` may be used for a new update
pub fn is_valid_name(name: &str) -> bool {
    name.len() >= MIN_NAME_LENGTH && name.bytes().all(|b| b.is_ascii_lowercase() || b == b'-')
}

/// Whether `dir` is a well-formed update directory name
pub fn is_update_dir(dir: &str) -> bool {
    match dir.split_once('-') {
        Some((stamp, name)) => {
            stamp.len() == TIMESTAMP_LENGTH
                && stamp.bytes().all(|b| b.is_ascii_digit())
                && is_valid_name(name)
        }
        None => false,
    }
}

/// The name part of an update directory, without its timestamp
pub fn update_name(update: &str) -> &str {
    update.split_once('-').map_or(update, |(_, name)| name)
}

/// Timestamp prefix for an update created at `at`
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S%3f").to_string()
}

/// A directory of schema updates
#[derive(Debug, Clone)]
pub struct SchemaDir {
    root: PathBuf,
}

impl SchemaDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of `update`
    pub fn path(&self, update: &str) -> PathBuf {
        self.root.join(update)
    }

    pub fn apply_script(&self, update: &str) -> PathBuf {
        self.path(update).join(FILE_APPLY)
    }

    pub fn revert_script(&self, update: &str) -> PathBuf {
        self.path(update).join(FILE_REVERT)
    }

    /// All updates, oldest first
    ///
    /// Entries that are not directories or are not named like an update are
    /// skipped. A missing root holds no updates.
    pub async fn updates(&self) -> SchemaResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut updates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_update_dir(name) {
                    updates.push(name.to_string());
                }
            }
        }
        updates.sort();
        Ok(updates)
    }

    /// Check that `update` names an existing update directory
    pub async fn ensure_exists(&self, update: &str) -> SchemaResult<()> {
        if !is_update_dir(update) || !is_dir(&self.path(update)).await {
            return Err(SchemaError::UnknownUpdate(update.to_string()));
        }
        Ok(())
    }

    /// Create empty scripts for a new update called `name`
    ///
    /// Returns the new update's directory name.
    pub async fn create(&self, name: &str) -> SchemaResult<String> {
        self.create_at(name, Utc::now()).await
    }

    pub async fn create_at(&self, name: &str, at: DateTime<Utc>) -> SchemaResult<String> {
        if !is_valid_name(name) {
            return Err(SchemaError::NameInvalid(name.to_string()));
        }

        let existing = self
            .updates()
            .await?
            .into_iter()
            .find(|update| update_name(update) == name);
        if let Some(existing) = existing {
            return Err(SchemaError::NameConflict {
                name: name.to_string(),
                existing,
            });
        }

        let update = format!("{}-{}", timestamp(at), name);
        fs::create_dir_all(self.path(&update)).await?;
        tokio::try_join!(
            fs::write(self.apply_script(&update), ""),
            fs::write(self.revert_script(&update), ""),
        )?;
        Ok(update)
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}
