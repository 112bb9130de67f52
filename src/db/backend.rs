//! Storage abstraction consumed by the family engine.
//!
//! A backend hands out transactions. Every read made through a [`FamilyTx`]
//! happens under the backend's write lock (an immediate transaction on SQLite,
//! `SELECT ... FOR UPDATE` on PostgreSQL), so a resolver that reads, decides and
//! then mutates never acts on a stale view. Dropping a transaction without
//! calling [`FamilyTx::commit`] rolls it back.

use thiserror::Error;

use super::models::{ContentHash, FamilyId, FamilyRecord, FileRecord};
use super::similarity::{PerceptualHash, SimilarityCandidate};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("File not found: {0}")]
    FileNotFound(ContentHash),

    #[error("Family not found: {0}")]
    FamilyNotFound(FamilyId),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::LockConflict(err.to_string())
            }
            Some(ErrorCode::ConstraintViolation) => StoreError::Constraint(err.to_string()),
            _ => StoreError::Sqlite(err),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<postgres::Error> for StoreError {
    fn from(err: postgres::Error) -> Self {
        use postgres::error::SqlState;

        match err.code() {
            Some(code)
                if *code == SqlState::LOCK_NOT_AVAILABLE
                    || *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED =>
            {
                StoreError::LockConflict(err.to_string())
            }
            Some(code)
                if *code == SqlState::UNIQUE_VIOLATION
                    || *code == SqlState::FOREIGN_KEY_VIOLATION
                    || *code == SqlState::NOT_NULL_VIOLATION =>
            {
                StoreError::Constraint(err.to_string())
            }
            _ => StoreError::Postgres(err),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A backend able to open family transactions.
pub trait FamilyStore {
    type Tx<'a>: FamilyTx
    where
        Self: 'a;

    /// Start a transaction holding the write lock for its whole lifetime.
    fn begin(&mut self) -> StoreResult<Self::Tx<'_>>;
}

/// Operations available inside one family transaction.
pub trait FamilyTx {
    /// Files with a perceptual hash within `threshold` bits of `hash`, closest
    /// first, ties ordered by identity. `exclude` is never returned.
    fn find_similar(
        &mut self,
        hash: PerceptualHash,
        exclude: &ContentHash,
        threshold: u32,
    ) -> StoreResult<Vec<SimilarityCandidate>>;

    /// Lock and return the given files, ordered by identity.
    /// Fails with [`StoreError::FileNotFound`] if any of them does not exist.
    fn lock_files(&mut self, ids: &[ContentHash]) -> StoreResult<Vec<FileRecord>>;

    /// Lock and return the given families, ordered by id.
    /// Fails with [`StoreError::FamilyNotFound`] if any of them does not exist.
    fn lock_families(&mut self, ids: &[FamilyId]) -> StoreResult<Vec<FamilyRecord>>;

    /// Identities of the children of a family, ordered by identity.
    fn family_children(&mut self, family: FamilyId) -> StoreResult<Vec<ContentHash>>;

    fn create_family(&mut self, parent: &ContentHash) -> StoreResult<FamilyRecord>;

    /// Point a file's child reference at `family`, or clear it with `None`.
    fn set_child(&mut self, file: &ContentHash, family: Option<FamilyId>) -> StoreResult<()>;

    fn set_parent(&mut self, family: FamilyId, file: &ContentHash) -> StoreResult<()>;

    /// Remove a family row. Files are never deleted.
    fn delete_family(&mut self, family: FamilyId) -> StoreResult<()>;

    fn commit(self) -> StoreResult<()>
    where
        Self: Sized;

    fn rollback(self) -> StoreResult<()>
    where
        Self: Sized;
}
