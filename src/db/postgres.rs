//! PostgreSQL backend implementation.
//!
//! Family transactions run at READ COMMITTED and take explicit row locks with
//! `SELECT ... FOR UPDATE`, always in identity order. Locked rows are re-read
//! with a fresh statement after the locks are granted, so a resolver that had
//! to wait sees what the previous lock holder committed.

use anyhow::Result;
use chrono::Utc;
use postgres::NoTls;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::collections::{BTreeSet, HashMap};

use super::backend::{FamilyStore, FamilyTx, StoreError, StoreResult};
use super::models::{ContentHash, FamilyId, FamilyRecord, FamilyView, FileRecord, NewFile};
use super::postgres_schema::POSTGRES_SCHEMA;
use super::similarity::{PerceptualHash, SimilarityCandidate};

type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

const FILE_SELECT: &str = r#"
    SELECT f.sha256_hash, f.width, f.height, f.file_size, f.file_ext, f.date_added,
           f.phash, f.parent_family_id, fam.id
    FROM files f
    LEFT JOIN file_families fam ON fam.parent_sha256_hash = f.sha256_hash
"#;

#[derive(Clone)]
pub struct PgDb {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

fn row_to_file(row: &postgres::Row) -> FileRecord {
    let width: Option<i32> = row.get(1);
    let height: Option<i32> = row.get(2);
    let file_size: i64 = row.get(3);
    let phash: Option<i64> = row.get(6);
    let parent_family_id: Option<i64> = row.get(7);
    let family_as_parent: Option<i64> = row.get(8);
    FileRecord {
        id: ContentHash::new(row.get::<_, String>(0)),
        width: width.map(|v| v as u32),
        height: height.map(|v| v as u32),
        file_size: file_size as u64,
        extension: row.get(4),
        created_at: row.get(5),
        tags: BTreeSet::new(),
        perceptual_hash: phash.map(PerceptualHash::from_db),
        family_as_child: parent_family_id.map(FamilyId),
        family_as_parent: family_as_parent.map(FamilyId),
    }
}

fn row_to_family(row: &postgres::Row) -> FamilyRecord {
    FamilyRecord {
        id: FamilyId(row.get(0)),
        parent: ContentHash::new(row.get::<_, String>(1)),
        created_at: row.get(2),
        updated_at: row.get(3),
    }
}

fn attach_tags(client: &mut postgres::Client, files: &mut [FileRecord]) -> Result<(), postgres::Error> {
    if files.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = files.iter().map(|f| f.id.as_str().to_string()).collect();
    let rows = client.query(
        r#"
        SELECT ft.file_sha256_hash, t.name
        FROM file_tags ft
        JOIN tags t ON t.id = ft.tag_id
        WHERE ft.file_sha256_hash = ANY($1)
        "#,
        &[&ids],
    )?;
    let mut tags: HashMap<String, BTreeSet<String>> = HashMap::new();
    for row in rows {
        tags.entry(row.get(0)).or_default().insert(row.get(1));
    }
    for file in files.iter_mut() {
        if let Some(names) = tags.remove(file.id.as_str()) {
            file.tags = names;
        }
    }
    Ok(())
}

impl PgDb {
    pub fn open(url: &str, pool_size: u32) -> Result<Self> {
        let manager = PostgresConnectionManager::new(url.parse()?, NoTls);
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self { pool })
    }

    pub fn initialize(&self) -> Result<()> {
        let mut client = self.pool.get()?;
        client.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    pub fn insert_file(&self, file: &NewFile) -> Result<bool> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT INTO files (
                sha256_hash, md5_hash, file_size, original_filename, file_ext,
                width, height, phash, date_added
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (sha256_hash) DO NOTHING
            "#,
            &[
                &file.id.as_str(),
                &file.md5,
                &(file.file_size as i64),
                &file.original_filename,
                &file.extension,
                &file.width.map(|v| v as i32),
                &file.height.map(|v| v as i32),
                &file.perceptual_hash.map(PerceptualHash::to_db),
                &file.date_added,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        for name in &file.tags {
            tx.execute(
                "INSERT INTO tags (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
                &[name],
            )?;
            tx.execute(
                r#"
                INSERT INTO file_tags (file_sha256_hash, tag_id)
                SELECT $1, id FROM tags WHERE name = $2
                ON CONFLICT DO NOTHING
                "#,
                &[&file.id.as_str(), name],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get_file(&self, id: &ContentHash) -> Result<Option<FileRecord>> {
        let mut client = self.pool.get()?;
        let sql = format!("{FILE_SELECT} WHERE f.sha256_hash = $1");
        let row = client.query_opt(&sql, &[&id.as_str()])?;
        match row {
            Some(row) => {
                let mut files = vec![row_to_file(&row)];
                attach_tags(&mut client, &mut files)?;
                Ok(files.pop())
            }
            None => Ok(None),
        }
    }

    pub fn list_families(&self) -> Result<Vec<FamilyView>> {
        let mut client = self.pool.get()?;
        let families: Vec<FamilyRecord> = client
            .query(
                "SELECT id, parent_sha256_hash, created_at, updated_at FROM file_families ORDER BY id",
                &[],
            )?
            .iter()
            .map(row_to_family)
            .collect();

        let mut children: HashMap<i64, Vec<ContentHash>> = HashMap::new();
        for row in client.query(
            r#"
            SELECT parent_family_id, sha256_hash
            FROM files
            WHERE parent_family_id IS NOT NULL
            ORDER BY sha256_hash
            "#,
            &[],
        )? {
            let family_id: i64 = row.get(0);
            children
                .entry(family_id)
                .or_default()
                .push(ContentHash::new(row.get::<_, String>(1)));
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
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM file_families", &[])?;
        Ok(row.get(0))
    }
}

// ============================================================================
// Family transactions
// ============================================================================

/// A transaction pinned to one pooled connection. Dropping it unfinished rolls back.
pub struct PgTx {
    conn: PgConnection,
    finished: bool,
}

impl FamilyStore for PgDb {
    type Tx<'a>
        = PgTx
    where
        Self: 'a;

    fn begin(&mut self) -> StoreResult<PgTx> {
        let mut conn = self.pool.get()?;
        conn.batch_execute("BEGIN ISOLATION LEVEL READ COMMITTED")?;
        Ok(PgTx {
            conn,
            finished: false,
        })
    }
}

impl PgTx {
    fn touch_family(&mut self, family: FamilyId) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE file_families SET updated_at = $1 WHERE id = $2",
            &[&Utc::now(), &family.0],
        )?;
        Ok(())
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.batch_execute("ROLLBACK");
        }
    }
}

impl FamilyTx for PgTx {
    fn find_similar(
        &mut self,
        hash: PerceptualHash,
        exclude: &ContentHash,
        threshold: u32,
    ) -> StoreResult<Vec<SimilarityCandidate>> {
        let sql = format!(
            r#"
            SELECT * FROM (
                SELECT q.*, bit_count((q.phash # $1)::bit(64))::integer AS distance
                FROM ({FILE_SELECT} WHERE f.phash IS NOT NULL AND f.sha256_hash <> $2) q
            ) scored
            WHERE scored.distance <= $3
            ORDER BY scored.distance ASC, scored.sha256_hash ASC
            "#
        );
        let rows = self.conn.query(
            &sql,
            &[&hash.to_db(), &exclude.as_str(), &(threshold as i32)],
        )?;
        let distances: Vec<u32> = rows
            .iter()
            .map(|row| row.get::<_, i32>("distance") as u32)
            .collect();
        let mut files: Vec<FileRecord> = rows.iter().map(row_to_file).collect();
        attach_tags(&mut self.conn, &mut files)?;
        Ok(files
            .into_iter()
            .zip(distances)
            .map(|(file, distance)| SimilarityCandidate { file, distance })
            .collect())
    }

    fn lock_files(&mut self, ids: &[ContentHash]) -> StoreResult<Vec<FileRecord>> {
        let wanted: BTreeSet<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: Vec<String> = wanted.into_iter().collect();

        let locked = self.conn.query(
            "SELECT sha256_hash FROM files WHERE sha256_hash = ANY($1) ORDER BY sha256_hash FOR UPDATE",
            &[&wanted],
        )?;
        if locked.len() != wanted.len() {
            let found: BTreeSet<String> = locked.iter().map(|row| row.get(0)).collect();
            if let Some(missing) = wanted.iter().find(|id| !found.contains(*id)) {
                return Err(StoreError::FileNotFound(ContentHash::new(missing.clone())));
            }
        }

        let sql = format!("{FILE_SELECT} WHERE f.sha256_hash = ANY($1) ORDER BY f.sha256_hash");
        let mut files: Vec<FileRecord> = self
            .conn
            .query(&sql, &[&wanted])?
            .iter()
            .map(row_to_file)
            .collect();
        attach_tags(&mut self.conn, &mut files)?;
        Ok(files)
    }

    fn lock_families(&mut self, ids: &[FamilyId]) -> StoreResult<Vec<FamilyRecord>> {
        let wanted: BTreeSet<i64> = ids.iter().map(|id| id.0).collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: Vec<i64> = wanted.into_iter().collect();
        let families: Vec<FamilyRecord> = self
            .conn
            .query(
                r#"
                SELECT id, parent_sha256_hash, created_at, updated_at
                FROM file_families
                WHERE id = ANY($1)
                ORDER BY id
                FOR UPDATE
                "#,
                &[&wanted],
            )?
            .iter()
            .map(row_to_family)
            .collect();

        if let Some(missing) = wanted
            .iter()
            .find(|id| !families.iter().any(|f| f.id.0 == **id))
        {
            return Err(StoreError::FamilyNotFound(FamilyId(*missing)));
        }
        Ok(families)
    }

    fn family_children(&mut self, family: FamilyId) -> StoreResult<Vec<ContentHash>> {
        let rows = self.conn.query(
            "SELECT sha256_hash FROM files WHERE parent_family_id = $1 ORDER BY sha256_hash",
            &[&family.0],
        )?;
        Ok(rows
            .iter()
            .map(|row| ContentHash::new(row.get::<_, String>(0)))
            .collect())
    }

    fn create_family(&mut self, parent: &ContentHash) -> StoreResult<FamilyRecord> {
        let row = self.conn.query_one(
            r#"
            INSERT INTO file_families (parent_sha256_hash)
            VALUES ($1)
            RETURNING id, parent_sha256_hash, created_at, updated_at
            "#,
            &[&parent.as_str()],
        )?;
        Ok(row_to_family(&row))
    }

    fn set_child(&mut self, file: &ContentHash, family: Option<FamilyId>) -> StoreResult<()> {
        let row = self
            .conn
            .query_opt(
                "SELECT parent_family_id FROM files WHERE sha256_hash = $1",
                &[&file.as_str()],
            )?
            .ok_or_else(|| StoreError::FileNotFound(file.clone()))?;
        let previous: Option<i64> = row.get(0);

        self.conn.execute(
            "UPDATE files SET parent_family_id = $1 WHERE sha256_hash = $2",
            &[&family.map(|f| f.0), &file.as_str()],
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
        let updated = self.conn.execute(
            "UPDATE file_families SET parent_sha256_hash = $1, updated_at = now() WHERE id = $2",
            &[&file.as_str(), &family.0],
        )?;
        if updated == 0 {
            return Err(StoreError::FamilyNotFound(family));
        }
        Ok(())
    }

    fn delete_family(&mut self, family: FamilyId) -> StoreResult<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM file_families WHERE id = $1", &[&family.0])?;
        if deleted == 0 {
            return Err(StoreError::FamilyNotFound(family));
        }
        Ok(())
    }

    fn commit(mut self) -> StoreResult<()> {
        self.finished = true;
        self.conn.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback(mut self) -> StoreResult<()> {
        self.finished = true;
        self.conn.batch_execute("ROLLBACK")?;
        Ok(())
    }
}
