mod backend;
mod models;
mod schema;
pub mod similarity;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod postgres_schema;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use backend::{FamilyStore, FamilyTx, StoreError, StoreResult};
pub use models::{ContentHash, FamilyId, FamilyRecord, FamilyView, FileRecord, NewFile};
pub use schema::SCHEMA;
pub use similarity::{
    hamming_distance, sort_candidates, PerceptualHash, SimilarityCandidate, SIMILARITY_THRESHOLD,
};

use crate::config::DatabaseConfig;
#[cfg(feature = "postgres")]
use crate::config::DatabaseType;

/// Macro to dispatch a method call to the active backend variant.
macro_rules! dispatch {
    // No arguments beyond self
    ($self:expr, $method:ident()) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method(),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method(),
        }
    };
    // With arguments
    ($self:expr, $method:ident($($arg:expr),+ $(,)?)) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method($($arg),+),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method($($arg),+),
        }
    };
}

/// Same as `dispatch!`, for the transaction enum.
macro_rules! dispatch_tx {
    ($self:expr, $method:ident($($arg:expr),* $(,)?)) => {
        match $self {
            DatabaseTx::Sqlite(tx) => tx.$method($($arg),*),
            #[cfg(feature = "postgres")]
            DatabaseTx::Postgres(tx) => tx.$method($($arg),*),
        }
    };
}

enum DatabaseInner {
    Sqlite(sqlite::SqliteDb),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgDb),
}

pub struct Database {
    inner: DatabaseInner,
}

impl Database {
    /// Open a database connection based on the provided configuration.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        #[cfg(feature = "postgres")]
        {
            if config.backend == DatabaseType::Postgresql {
                let url = config
                    .postgresql_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("PostgreSQL URL not configured"))?;
                let pg = postgres::PgDb::open(url, config.pool_size)?;
                return Ok(Self {
                    inner: DatabaseInner::Postgres(pg),
                });
            }
        }

        Self::open_sqlite(&config.sqlite_path, config.busy_timeout())
    }

    pub fn open_sqlite(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let db = sqlite::SqliteDb::open(path, busy_timeout)?;
        Ok(Self {
            inner: DatabaseInner::Sqlite(db),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = sqlite::SqliteDb::open_in_memory()?;
        Ok(Self {
            inner: DatabaseInner::Sqlite(db),
        })
    }

    /// A handle able to open further connections to the same database,
    /// one per concurrent ingestion task.
    pub fn connector(&self) -> Result<Connector> {
        match &self.inner {
            DatabaseInner::Sqlite(db) => {
                let (path, busy_timeout) = db.connection_params()?;
                Ok(Connector::Sqlite { path, busy_timeout })
            }
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => Ok(Connector::Postgres(db.clone())),
        }
    }

    pub fn initialize(&self) -> Result<()> {
        dispatch!(self, initialize())
    }

    // ========================================================================
    // File operations
    // ========================================================================

    /// Store a file and its tags atomically. Returns false when a file with
    /// the same content hash is already stored.
    pub fn insert_file(&self, file: &NewFile) -> Result<bool> {
        dispatch!(self, insert_file(file))
    }

    pub fn get_file(&self, id: &ContentHash) -> Result<Option<FileRecord>> {
        dispatch!(self, get_file(id))
    }

    // ========================================================================
    // Family read paths
    // ========================================================================

    pub fn list_families(&self) -> Result<Vec<FamilyView>> {
        dispatch!(self, list_families())
    }

    pub fn count_families(&self) -> Result<i64> {
        dispatch!(self, count_families())
    }
}

// ============================================================================
// Family transactions
// ============================================================================

pub enum DatabaseTx<'a> {
    Sqlite(sqlite::SqliteTx<'a>),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgTx),
}

impl FamilyStore for Database {
    type Tx<'a>
        = DatabaseTx<'a>
    where
        Self: 'a;

    fn begin(&mut self) -> StoreResult<DatabaseTx<'_>> {
        match &mut self.inner {
            DatabaseInner::Sqlite(db) => Ok(DatabaseTx::Sqlite(db.begin()?)),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => Ok(DatabaseTx::Postgres(db.begin()?)),
        }
    }
}

impl FamilyTx for DatabaseTx<'_> {
    fn find_similar(
        &mut self,
        hash: PerceptualHash,
        exclude: &ContentHash,
        threshold: u32,
    ) -> StoreResult<Vec<SimilarityCandidate>> {
        dispatch_tx!(self, find_similar(hash, exclude, threshold))
    }

    fn lock_files(&mut self, ids: &[ContentHash]) -> StoreResult<Vec<FileRecord>> {
        dispatch_tx!(self, lock_files(ids))
    }

    fn lock_families(&mut self, ids: &[FamilyId]) -> StoreResult<Vec<FamilyRecord>> {
        dispatch_tx!(self, lock_families(ids))
    }

    fn family_children(&mut self, family: FamilyId) -> StoreResult<Vec<ContentHash>> {
        dispatch_tx!(self, family_children(family))
    }

    fn create_family(&mut self, parent: &ContentHash) -> StoreResult<FamilyRecord> {
        dispatch_tx!(self, create_family(parent))
    }

    fn set_child(&mut self, file: &ContentHash, family: Option<FamilyId>) -> StoreResult<()> {
        dispatch_tx!(self, set_child(file, family))
    }

    fn set_parent(&mut self, family: FamilyId, file: &ContentHash) -> StoreResult<()> {
        dispatch_tx!(self, set_parent(family, file))
    }

    fn delete_family(&mut self, family: FamilyId) -> StoreResult<()> {
        dispatch_tx!(self, delete_family(family))
    }

    fn commit(self) -> StoreResult<()> {
        dispatch_tx!(self, commit())
    }

    fn rollback(self) -> StoreResult<()> {
        dispatch_tx!(self, rollback())
    }
}

// ============================================================================
// Per-task connections
// ============================================================================

/// Opens independent connections to an already-opened database.
#[derive(Clone)]
pub enum Connector {
    Sqlite {
        path: PathBuf,
        busy_timeout: Duration,
    },
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgDb),
}

impl Connector {
    pub fn connect(&self) -> Result<Database> {
        match self {
            Connector::Sqlite { path, busy_timeout } => Database::open_sqlite(path, *busy_timeout),
            #[cfg(feature = "postgres")]
            Connector::Postgres(db) => Ok(Database {
                inner: DatabaseInner::Postgres(db.clone()),
            }),
        }
    }
}
