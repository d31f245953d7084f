//! SQLite persistence for CertKeeper
//!
//! Storage owns every persisted entity. Orders are the unit of atomicity:
//! each state transition is one transactional update, and a terminal order
//! (`valid` / `invalid`) is never modified again except for the
//! `known_revoked` flag.

pub mod entities;
pub mod migrator;

mod accounts;
mod certificates;
mod keys;
mod orders;

pub use accounts::NewAccount;
pub use certificates::{CertificateUpdate, NewCertificate};
pub use keys::NewKey;
pub use orders::NewOrder;

use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The `NoRecord` sentinel: callers map this to their NotFound
    #[error("no record found")]
    NotFound,

    /// Referential or uniqueness conflict (delete of an in-use key,
    /// duplicate name, ...)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Attempted state transition on a terminal order
    #[error("order is in a terminal state")]
    TerminalOrder,

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

/// Handle to the relational store; cheap to clone
#[derive(Clone)]
pub struct Storage {
    db: DatabaseConnection,
}

impl Storage {
    /// Connect and run pending migrations. `url` is a sqlx sqlite URL, e.g.
    /// `sqlite://data/certkeeper.db?mode=rwc` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let db = Database::connect(url).await?;
        migrator::Migrator::up(&db, None).await?;

        info!("storage connected and migrated");
        Ok(Self { db })
    }

    pub(crate) fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Current unix time in seconds, the storage timestamp format
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
