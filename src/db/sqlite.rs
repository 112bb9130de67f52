//! SQLite backend implementation.
//!
//! Family transactions are opened with `BEGIN IMMEDIATE`, which takes the
//! database write lock up front. Concurrent resolvers therefore run one after
//! the other, and each one reads the state its predecessor committed. Other
//! writers wait up to the configured busy timeout before failing with
//! [`StoreError::LockConflict`].

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::backend::{FamilyStore, FamilyTx, StoreError, StoreResult};
use super::models::{ContentHash, FamilyId, FamilyRecord, FamilyView, FileRecord, NewFile};
use super::schema::SCHEMA;
use super::similarity::{hamming_distance, PerceptualHash, SimilarityCandidate};

const FILE_COLUMNS: &str = r#"
    f.sha256_hash, f.width, f.height, f.file_size, f.file_ext, f.date_added,
    f.phash, f.parent_family_id, fam.id
"#;

const FILE_FROM: &str = r#"
    FROM files f
    LEFT JOIN file_families fam ON fam.parent_sha256_hash = f.sha256_hash
"#;

pub struct SqliteDb {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
    busy_timeout: Duration,
}

impl SqliteDb {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        configure(&conn, busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            busy_timeout,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let busy_timeout = Duration::from_millis(0);
        configure(&conn, busy_timeout)?;
        Ok(Self {
            conn,
            path: None,
            busy_timeout,
        })
    }

    /// Path and busy timeout needed to open another connection to the same file.
    pub fn connection_params(&self) -> Result<(PathBuf, Duration)> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| anyhow!("An in-memory database cannot be shared between connections"))?;
        Ok((path, self.busy_timeout))
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ========================================================================
    // File operations
    // ========================================================================

    /// Insert a new file together with its tags. Returns false, and writes
    /// nothing, if a file with the same content hash exists.
    pub fn insert_file(&self, file: &NewFile) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO files (
                sha256_hash, md5_hash, file_size, original_filename, file_ext,
                width, height, phash, date_added
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                file.id.as_str(),
                file.md5,
                file.file_size as i64,
                file.original_filename,
                file.extension,
                file.width,
                file.height,
                file.perceptual_hash.map(PerceptualHash::to_db),
                file.date_added,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        for name in &file.tags {
            tx.execute("INSERT OR IGNORE INTO tags (name) VALUES (?)", [name])?;
            tx.execute(
                r#"
                INSERT OR IGNORE INTO file_tags (file_sha256_hash, tag_id)
                SELECT ?, id FROM tags WHERE name = ?
                "#,
                params![file.id.as_str(), name],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get_file(&self, id: &ContentHash) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} {FILE_FROM} WHERE f.sha256_hash = ?");
        let record = self
            .conn
            .query_row(&sql, [id.as_str()], row_to_file)
            .optional()?;
        match record {
            Some(record) => {
                let mut files = vec![record];
                attach_tags(&self.conn, &mut files)?;
                Ok(files.pop())
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Family read paths
    // ========================================================================

    pub fn list_families(&self) -> Result<Vec<FamilyView>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, parent_sha256_hash, created_at, updated_at FROM file_families ORDER BY id",
        )?;
        let families = stmt
            .query_map([], row_to_family)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut children: HashMap<i64, Vec<ContentHash>> = HashMap::new();
        let mut stmt = self.conn.prepare(
            r#"
            SELECT parent_family_id, sha256_hash
            FROM files
            WHERE parent_family_id IS NOT NULL
            ORDER BY sha256_hash
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, ContentHash::new(row.get::<_, String>(1)?)))
        })?;
        for row in rows {
            let (family_id, child) = row?;
            children.entry(family_id).or_default().push(child);
        }

        Ok(families
            .into_iter()
            .map(|family| FamilyView {
                children: children.remove(&family.id.0).unwrap_or_default(),
                id: family.id,
                parent: family.parent,
                created_at: family.created_at,
                updated_at: family.updated_at,
            })
            .collect())
    }

    pub fn count_families(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM file_families", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.create_scalar_function(
        "hamming_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: Option<i64> = ctx.get(0)?;
            let b: Option<i64> = ctx.get(1)?;
            Ok(a.zip(b).map(|(a, b)| {
                i64::from(hamming_distance(
                    PerceptualHash::from_db(a),
                    PerceptualHash::from_db(b),
                ))
            }))
        },
    )
}

fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: ContentHash::new(row.get::<_, String>(0)?),
        width: row.get::<_, Option<u32>>(1)?,
        height: row.get::<_, Option<u32>>(2)?,
        file_size: row.get::<_, i64>(3)? as u64,
        extension: row.get(4)?,
        created_at: row.get(5)?,
        tags: BTreeSet::new(),
        perceptual_hash: row.get::<_, Option<i64>>(6)?.map(PerceptualHash::from_db),
        family_as_child: row.get::<_, Option<i64>>(7)?.map(FamilyId),
        family_as_parent: row.get::<_, Option<i64>>(8)?.map(FamilyId),
    })
}

fn row_to_family(row: &rusqlite::Row) -> rusqlite::Result<FamilyRecord> {
    Ok(FamilyRecord {
        id: FamilyId(row.get(0)?),
        parent: ContentHash::new(row.get::<_, String>(1)?),
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

/// Load the tag names of every file in one query.
fn attach_tags(conn: &Connection, files: &mut [FileRecord]) -> rusqlite::Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; files.len()].join(", ");
    let sql = format!(
        r#"
        SELECT ft.file_sha256_hash, t.name
        FROM file_tags ft
        JOIN tags t ON t.id = ft.tag_id
        WHERE ft.file_sha256_hash IN ({placeholders})
        "#
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(files.iter().map(|f| f.id.as_str())), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut tags: HashMap<String, BTreeSet<String>> = HashMap::new();
    for row in rows {
        let (file, name) = row?;
        tags.entry(file).or_default().insert(name);
    }
    for file in files.iter_mut() {
        if let Some(names) = tags.remove(file.id.as_str()) {
            file.tags = names;
        }
    }
    Ok(())
}

// ============================================================================
// Family transactions
// ============================================================================

pub struct SqliteTx<'a> {
    tx: Transaction<'a>,
}

impl FamilyStore for SqliteDb {
    type Tx<'a>
        = SqliteTx<'a>
    where
        Self: 'a;

    fn begin(&mut self) -> StoreResult<SqliteTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(SqliteTx { tx })
    }
}

impl SqliteTx<'_> {
    fn touch_family(&self, family: FamilyId) -> StoreResult<()> {
        self.tx.execute(
            "UPDATE file_families SET updated_at = ? WHERE id = ?",
            params![Utc::now(), family.0],
        )?;
        Ok(())
    }
}

impl FamilyTx for SqliteTx<'_> {
    fn find_similar(
        &mut self,
        hash: PerceptualHash,
        exclude: &ContentHash,
        threshold: u32,
    ) -> StoreResult<Vec<SimilarityCandidate>> {
        let sql = format!(
            r#"
            SELECT {FILE_COLUMNS}, hamming_distance(f.phash, ?1) AS distance
            {FILE_FROM}
            WHERE f.phash IS NOT NULL
              AND f.sha256_hash != ?2
              AND hamming_distance(f.phash, ?1) <= ?3
            ORDER BY distance ASC, f.sha256_hash ASC
            "#
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![hash.to_db(), exclude.as_str(), threshold], |row| {
                Ok((row_to_file(row)?, row.get::<_, u32>(9)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let (mut files, distances): (Vec<FileRecord>, Vec<u32>) = rows.into_iter().unzip();
        attach_tags(&self.tx, &mut files)?;
        Ok(files
            .into_iter()
            .zip(distances)
            .map(|(file, distance)| SimilarityCandidate { file, distance })
            .collect())
    }

    fn lock_files(&mut self, ids: &[ContentHash]) -> StoreResult<Vec<FileRecord>> {
        let wanted: BTreeSet<&ContentHash> = ids.iter().collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; wanted.len()].join(", ");
        let sql = format!(
            "SELECT {FILE_COLUMNS} {FILE_FROM} WHERE f.sha256_hash IN ({placeholders}) ORDER BY f.sha256_hash"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let mut files = stmt
            .query_map(params_from_iter(wanted.iter().map(|id| id.as_str())), row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        if files.len() != wanted.len() {
            let missing = wanted
                .into_iter()
                .find(|id| !files.iter().any(|f| &f.id == *id))
                .cloned();
            if let Some(missing) = missing {
                return Err(StoreError::FileNotFound(missing));
            }
        }
        attach_tags(&self.tx, &mut files)?;
        Ok(files)
    }

    fn lock_families(&mut self, ids: &[FamilyId]) -> StoreResult<Vec<FamilyRecord>> {
        let wanted: BTreeSet<FamilyId> = ids.iter().copied().collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; wanted.len()].join(", ");
        let sql = format!(
            r#"
            SELECT id, parent_sha256_hash, created_at, updated_at
            FROM file_families
            WHERE id IN ({placeholders})
            ORDER BY id
            "#
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let families = stmt
            .query_map(params_from_iter(wanted.iter().map(|id| id.0)), row_to_family)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if let Some(missing) = wanted
            .into_iter()
            .find(|id| !families.iter().any(|f| f.id == *id))
        {
            return Err(StoreError::FamilyNotFound(missing));
        }
        Ok(families)
    }

    fn family_children(&mut self, family: FamilyId) -> StoreResult<Vec<ContentHash>> {
        let mut stmt = self.tx.prepare(
            "SELECT sha256_hash FROM files WHERE parent_family_id = ? ORDER BY sha256_hash",
        )?;
        let children = stmt
            .query_map([family.0], |row| Ok(ContentHash::new(row.get::<_, String>(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(children)
    }

    fn create_family(&mut self, parent: &ContentHash) -> StoreResult<FamilyRecord> {
        let now = Utc::now();
        self.tx.execute(
            r#"
            INSERT INTO file_families (parent_sha256_hash, created_at, updated_at)
            VALUES (?, ?, ?)
            "#,
            params![parent.as_str(), now, now],
        )?;
        Ok(FamilyRecord {
            id: FamilyId(self.tx.last_insert_rowid()),
            parent: parent.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    fn set_child(&mut self, file: &ContentHash, family: Option<FamilyId>) -> StoreResult<()> {
        let previous: Option<i64> = self
            .tx
            .query_row(
                "SELECT parent_family_id FROM files WHERE sha256_hash = ?",
                [file.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::FileNotFound(file.clone()))?;

        self.tx.execute(
            "UPDATE files SET parent_family_id = ? WHERE sha256_hash = ?",
            params![family.map(|f| f.0), file.as_str()],
        )?;

        if let Some(previous) = previous {
            self.touch_family(FamilyId(previous))?;
        }
        if let Some(family) = family {
            self.touch_family(family)?;
        }
        Ok(())
    }

    fn set_parent(&mut self, family: FamilyId, file: &ContentHash) -> StoreResult<()> {
        let updated = self.tx.execute(
            "UPDATE file_families SET parent_sha256_hash = ?, updated_at = ? WHERE id = ?",
            params![file.as_str(), Utc::now(), family.0],
        )?;
        if updated == 0 {
            return Err(StoreError::FamilyNotFound(family));
        }
        Ok(())
    }

    fn delete_family(&mut self, family: FamilyId) -> StoreResult<()> {
        let deleted = self
            .tx
            .execute("DELETE FROM file_families WHERE id = ?", [family.0])?;
        if deleted == 0 {
            return Err(StoreError::FamilyNotFound(family));
        }
        Ok(())
    }

    fn commit(self) -> StoreResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    fn rollback(self) -> StoreResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}
