//! Places a newly ingested file into the family structure.
//!
//! Every resolution is one store transaction. Files are locked (and re-read)
//! before any decision is made, the families they belong to are locked next,
//! and nothing is written until the final state has been decided. A failure
//! anywhere rolls the whole resolution back.

use std::collections::{BTreeSet, HashMap};

use crate::db::{
    sort_candidates, ContentHash, FamilyId, FamilyStore, FamilyTx, FileRecord, PerceptualHash,
    SimilarityCandidate, StoreError, SIMILARITY_THRESHOLD,
};

use super::parent::{decide, fold_best};
use super::{FamilyError, Resolution};

/// Transactions tried per resolution before a lock conflict is reported.
pub const MAX_ATTEMPTS: u32 = 3;

pub struct FamilyResolver<S: FamilyStore> {
    store: S,
    threshold: u32,
}

impl<S: FamilyStore> FamilyResolver<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            threshold: SIMILARITY_THRESHOLD,
        }
    }

    /// Maximum Hamming distance at which two files count as similar.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Find the files similar to `file` and update families accordingly.
    ///
    /// `file` must already be stored with `hash` as its perceptual hash. A
    /// resolution that loses a lock conflict (a PostgreSQL deadlock, or an
    /// exhausted SQLite busy timeout) is rolled back and run again from the
    /// start, up to [`MAX_ATTEMPTS`] times.
    pub fn resolve(&mut self, file: &ContentHash, hash: PerceptualHash) -> Result<Resolution, FamilyError> {
        let mut attempt = 1;
        loop {
            match self.resolve_once(file, hash) {
                Err(FamilyError::Store(StoreError::LockConflict(reason))) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(file = %file.short(), attempt, reason = %reason, "Lock conflict, retrying");
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    fn resolve_once(&mut self, file: &ContentHash, hash: PerceptualHash) -> Result<Resolution, FamilyError> {
        let threshold = self.threshold;
        let mut tx = self.store.begin()?;

        let outcome = tx
            .find_similar(hash, file, threshold)
            .map_err(FamilyError::from)
            .and_then(|candidates| on_new_file_similar(&mut tx, file, &candidates));

        match outcome {
            Ok(resolution) => {
                tx.commit()?;
                if resolution.changed() {
                    tracing::info!(file = %file.short(), outcome = %resolution, "Family resolved");
                } else {
                    tracing::debug!(file = %file.short(), outcome = %resolution, "Family unchanged");
                }
                Ok(resolution)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(file = %file.short(), error = %rollback_err, "Rollback failed");
                }
                if matches!(e, FamilyError::Invariant(_)) {
                    tracing::error!(file = %file.short(), error = %e, "Family resolution aborted");
                }
                Err(e)
            }
        }
    }
}

/// Files a decided resolution must leave in place, checked before commit.
struct Placement {
    family: FamilyId,
    parent: ContentHash,
    children: Vec<ContentHash>,
}

/// Apply one resolution inside `tx`.
///
/// `candidates` come from a similarity query for `new_file`; their family
/// references are re-read under lock, so they may be stale.
pub fn on_new_file_similar<T: FamilyTx>(
    tx: &mut T,
    new_file: &ContentHash,
    candidates: &[SimilarityCandidate],
) -> Result<Resolution, FamilyError> {
    if candidates.is_empty() {
        return Ok(Resolution::NoCandidates);
    }

    let mut candidates = candidates.to_vec();
    sort_candidates(&mut candidates);
    let candidate_ids: Vec<ContentHash> = candidates
        .iter()
        .map(|c| c.file.id.clone())
        .filter(|id| id != new_file)
        .collect();
    if candidate_ids.is_empty() {
        return Ok(Resolution::NoCandidates);
    }

    let mut wanted = candidate_ids.clone();
    wanted.push(new_file.clone());
    let locked = tx.lock_files(&wanted)?;
    let by_id: HashMap<&ContentHash, &FileRecord> = locked.iter().map(|f| (&f.id, f)).collect();
    let new_record = *by_id
        .get(new_file)
        .ok_or_else(|| FamilyError::Invariant(format!("file {} was not locked", new_file)))?;

    tracing::debug!(
        file = %new_file.short(),
        candidates = candidate_ids.len(),
        distances = ?candidates.iter().map(|c| c.distance).collect::<Vec<_>>(),
        "Similar files found"
    );

    let families: BTreeSet<FamilyId> = locked.iter().filter_map(FileRecord::family).collect();

    let (resolution, placement) = match families.len() {
        0 => {
            // Candidates in distance order, then the new file
            let cluster: Vec<&FileRecord> = candidate_ids
                .iter()
                .chain(std::iter::once(new_file))
                .filter_map(|id| by_id.get(id).copied())
                .collect();
            create_from_cluster(tx, &cluster)?
        }
        1 => {
            let family = *families
                .iter()
                .next()
                .ok_or_else(|| FamilyError::Invariant("empty family set".to_string()))?;
            if new_record.family() == Some(family) {
                already_placed(tx, new_record, family)?
            } else {
                add_to_family(tx, new_record, family)?
            }
        }
        _ => {
            let families: Vec<FamilyId> = families.into_iter().collect();
            merge_families(tx, new_file, &wanted, &families)?
        }
    };

    verify(tx, new_file, &placement)?;
    Ok(resolution)
}

fn create_from_cluster<T: FamilyTx>(
    tx: &mut T,
    cluster: &[&FileRecord],
) -> Result<(Resolution, Placement), FamilyError> {
    let parent = fold_best(cluster.iter().copied())
        .ok_or_else(|| FamilyError::Invariant("empty similarity cluster".to_string()))?;

    let family = tx.create_family(&parent.id)?;
    let children: Vec<ContentHash> = cluster
        .iter()
        .filter(|f| f.id != parent.id)
        .map(|f| f.id.clone())
        .collect();
    for child in &children {
        tx.set_child(child, Some(family.id))?;
    }

    Ok((
        Resolution::Created {
            family: family.id,
            parent: parent.id.clone(),
            children: children.clone(),
        },
        Placement {
            family: family.id,
            parent: parent.id.clone(),
            children,
        },
    ))
}

fn already_placed<T: FamilyTx>(
    tx: &mut T,
    new_record: &FileRecord,
    family: FamilyId,
) -> Result<(Resolution, Placement), FamilyError> {
    let family_record = tx
        .lock_families(&[family])?
        .pop()
        .ok_or_else(|| FamilyError::Invariant(format!("family {} was not locked", family)))?;
    let children = if family_record.parent == new_record.id {
        Vec::new()
    } else {
        vec![new_record.id.clone()]
    };
    Ok((
        Resolution::AlreadyPlaced { family },
        Placement {
            family,
            parent: family_record.parent,
            children,
        },
    ))
}

/// Attach or promote against the family's current parent only; the other
/// children are not re-ranked.
fn add_to_family<T: FamilyTx>(
    tx: &mut T,
    new_record: &FileRecord,
    family: FamilyId,
) -> Result<(Resolution, Placement), FamilyError> {
    let family_record = tx
        .lock_families(&[family])?
        .pop()
        .ok_or_else(|| FamilyError::Invariant(format!("family {} was not locked", family)))?;
    let current_parent = tx
        .lock_files(std::slice::from_ref(&family_record.parent))?
        .pop()
        .ok_or_else(|| FamilyError::Invariant(format!("parent of family {} was not locked", family)))?;

    let decision = decide(&current_parent, new_record);
    tracing::debug!(
        family = %family,
        parent = %current_parent.id.short(),
        file = %new_record.id.short(),
        winner = %decision.winner.id.short(),
        reason = %decision.reason,
        "Compared with family parent"
    );

    if decision.winner.id == new_record.id {
        tx.set_parent(family, &new_record.id)?;
        tx.set_child(&current_parent.id, Some(family))?;
        Ok((
            Resolution::Promoted {
                family,
                previous_parent: current_parent.id.clone(),
            },
            Placement {
                family,
                parent: new_record.id.clone(),
                children: vec![current_parent.id.clone()],
            },
        ))
    } else {
        tx.set_child(&new_record.id, Some(family))?;
        Ok((
            Resolution::Attached { family },
            Placement {
                family,
                parent: current_parent.id.clone(),
                children: vec![new_record.id.clone()],
            },
        ))
    }
}

fn merge_families<T: FamilyTx>(
    tx: &mut T,
    new_file: &ContentHash,
    similar: &[ContentHash],
    families: &[FamilyId],
) -> Result<(Resolution, Placement), FamilyError> {
    let family_records = tx.lock_families(families)?;

    let mut union: BTreeSet<ContentHash> = similar.iter().cloned().collect();
    union.insert(new_file.clone());
    for family in &family_records {
        union.insert(family.parent.clone());
        union.extend(tx.family_children(family.id)?);
    }
    let union: Vec<ContentHash> = union.into_iter().collect();

    // Ordered by identity, which also fixes the fold order
    let members = tx.lock_files(&union)?;
    let winner = fold_best(members.iter())
        .ok_or_else(|| FamilyError::Invariant("empty merge set".to_string()))?;

    let target = match family_records.iter().find(|f| f.parent == winner.id) {
        Some(family) => family.id,
        None => {
            if winner.family_as_child.is_some() {
                tx.set_child(&winner.id, None)?;
            }
            tx.create_family(&winner.id)?.id
        }
    };

    let mut children = Vec::with_capacity(members.len().saturating_sub(1));
    for member in &members {
        if member.id == winner.id {
            continue;
        }
        if member.family_as_child != Some(target) {
            tx.set_child(&member.id, Some(target))?;
        }
        children.push(member.id.clone());
    }

    let removed: Vec<FamilyId> = family_records
        .iter()
        .map(|f| f.id)
        .filter(|id| *id != target)
        .collect();
    for family in &removed {
        tx.delete_family(*family)?;
    }

    Ok((
        Resolution::Merged {
            family: target,
            parent: winner.id.clone(),
            removed,
            members: members.len(),
        },
        Placement {
            family: target,
            parent: winner.id.clone(),
            children,
        },
    ))
}

/// Re-read everything the resolution placed and refuse to commit a broken state.
fn verify<T: FamilyTx>(tx: &mut T, new_file: &ContentHash, placement: &Placement) -> Result<(), FamilyError> {
    let mut ids: Vec<ContentHash> = placement.children.clone();
    ids.push(placement.parent.clone());
    let records = tx.lock_files(&ids)?;

    for record in &records {
        if let (Some(parent_of), Some(child_of)) = (record.family_as_parent, record.family_as_child) {
            return Err(FamilyError::Invariant(format!(
                "file {} is parent of family {} and child of family {}",
                record.id, parent_of, child_of
            )));
        }
        let expected = if record.id == placement.parent {
            record.family_as_parent
        } else {
            record.family_as_child
        };
        if expected != Some(placement.family) {
            return Err(FamilyError::Invariant(format!(
                "file {} is not in family {}",
                record.id, placement.family
            )));
        }
    }

    if !records.iter().any(|r| &r.id == new_file) {
        return Err(FamilyError::Invariant(format!(
            "file {} was not placed in family {}",
            new_file, placement.family
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, DatabaseTx, FamilyRecord, FamilyView, NewFile, StoreResult};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    struct Art<'a> {
        id: &'a str,
        hash: u64,
        side: u32,
        age_days: i64,
    }

    fn art(id: &str, hash: u64, side: u32, age_days: i64) -> Art<'_> {
        Art {
            id,
            hash,
            side,
            age_days,
        }
    }

    fn insert(db: &Database, art: Art) -> ContentHash {
        insert_tagged(db, art, &[])
    }

    fn insert_tagged(db: &Database, art: Art, tags: &[&str]) -> ContentHash {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let id = ContentHash::new(art.id);
        db.insert_file(&NewFile {
            id: id.clone(),
            md5: "0".repeat(32),
            file_size: 100_000,
            original_filename: format!("{}.jpg", art.id),
            extension: "jpg".to_string(),
            width: Some(art.side),
            height: Some(art.side),
            perceptual_hash: Some(PerceptualHash(art.hash)),
            date_added: now - Duration::days(art.age_days),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        })
        .unwrap();
        id
    }

    fn resolver() -> FamilyResolver<Database> {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        FamilyResolver::new(db)
    }

    fn add(resolver: &mut FamilyResolver<Database>, art: Art) -> Resolution {
        let hash = PerceptualHash(art.hash);
        let id = insert(resolver.store(), art);
        resolver.resolve(&id, hash).unwrap()
    }

    fn only_family(resolver: &FamilyResolver<Database>) -> FamilyView {
        let mut families = resolver.store().list_families().unwrap();
        assert_eq!(families.len(), 1, "expected exactly one family");
        families.pop().unwrap()
    }

    fn ids(values: &[&str]) -> Vec<ContentHash> {
        values.iter().map(|v| ContentHash::new(*v)).collect()
    }

    /// Three unlinked similar files, the oldest being the largest.
    fn cluster(resolver: &mut FamilyResolver<Database>) -> FamilyId {
        insert(resolver.store(), art("a", 0b0, 1000, 30));
        insert(resolver.store(), art("b", 0b1, 500, 20));
        match add(resolver, art("c", 0b11, 500, 10)) {
            Resolution::Created {
                family,
                parent,
                children,
            } => {
                assert_eq!(parent.as_str(), "a");
                assert_eq!(children, ids(&["b", "c"]));
                family
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_no_similar_files_is_a_no_op() {
        let mut resolver = resolver();
        insert(resolver.store(), art("far", u64::MAX, 500, 5));

        let resolution = add(&mut resolver, art("x", 0, 500, 1));
        assert_eq!(resolution, Resolution::NoCandidates);
        assert_eq!(resolver.store().count_families().unwrap(), 0);
    }

    #[test]
    fn test_cluster_creates_one_family() {
        let mut resolver = resolver();
        let family = cluster(&mut resolver);

        let view = only_family(&resolver);
        assert_eq!(view.id, family);
        assert_eq!(view.parent.as_str(), "a");
        assert_eq!(view.children, ids(&["b", "c"]));
    }

    #[test]
    fn test_weaker_file_attaches() {
        let mut resolver = resolver();
        let family = cluster(&mut resolver);

        let resolution = add(&mut resolver, art("d", 0b111, 400, 5));
        assert_eq!(resolution, Resolution::Attached { family });

        let view = only_family(&resolver);
        assert_eq!(view.parent.as_str(), "a");
        assert_eq!(view.children, ids(&["b", "c", "d"]));
    }

    #[test]
    fn test_higher_resolution_file_is_promoted() {
        let mut resolver = resolver();
        let family = cluster(&mut resolver);
        add(&mut resolver, art("d", 0b111, 400, 5));

        let resolution = add(&mut resolver, art("e", 0b1111, 2000, 1));
        assert_eq!(
            resolution,
            Resolution::Promoted {
                family,
                previous_parent: ContentHash::new("a"),
            }
        );

        let view = only_family(&resolver);
        assert_eq!(view.id, family);
        assert_eq!(view.parent.as_str(), "e");
        assert_eq!(view.children, ids(&["a", "b", "c", "d"]));

        let old_parent = resolver.store().get_file(&ContentHash::new("a")).unwrap().unwrap();
        assert_eq!(old_parent.family_as_parent, None);
        assert_eq!(old_parent.family_as_child, Some(family));
    }

    #[test]
    fn test_promotion_compares_against_parent_only() {
        let mut resolver = resolver();
        insert(resolver.store(), art("p", 0b0, 600, 30));
        insert(resolver.store(), art("z", 0b1, 2000, 40));

        let mut tx = resolver.store_mut().begin().unwrap();
        let family = tx.create_family(&ContentHash::new("p")).unwrap().id;
        tx.set_child(&ContentHash::new("z"), Some(family)).unwrap();
        tx.commit().unwrap();

        // Beats the parent but not the larger child "z", which stays a child
        let resolution = add(&mut resolver, art("n", 0b11, 700, 1));
        assert_eq!(
            resolution,
            Resolution::Promoted {
                family,
                previous_parent: ContentHash::new("p"),
            }
        );

        let view = only_family(&resolver);
        assert_eq!(view.parent.as_str(), "n");
        assert_eq!(view.children, ids(&["p", "z"]));
    }

    fn two_families(db: &mut Database, strongest: &str) -> (FamilyId, FamilyId) {
        let side = |id: &str| if id == strongest { 2000 } else { 500 };
        insert(db, art("p1", 0x0, side("p1"), 30));
        insert(db, art("c1", 0x1, side("c1"), 29));
        insert(db, art("p2", 0xFFF, side("p2"), 28));
        insert(db, art("c2", 0x7FF, side("c2"), 27));

        let mut tx = db.begin().unwrap();
        let f1 = tx.create_family(&ContentHash::new("p1")).unwrap().id;
        tx.set_child(&ContentHash::new("c1"), Some(f1)).unwrap();
        let f2 = tx.create_family(&ContentHash::new("p2")).unwrap().id;
        tx.set_child(&ContentHash::new("c2"), Some(f2)).unwrap();
        tx.commit().unwrap();
        (f1, f2)
    }

    #[test]
    fn test_bridging_file_merges_families() {
        let mut resolver = resolver();
        let (f1, f2) = two_families(resolver.store_mut(), "p2");

        let resolution = add(&mut resolver, art("n", 0x3F, 500, 1));
        assert_eq!(
            resolution,
            Resolution::Merged {
                family: f2,
                parent: ContentHash::new("p2"),
                removed: vec![f1],
                members: 5,
            }
        );

        let view = only_family(&resolver);
        assert_eq!(view.id, f2);
        assert_eq!(view.parent.as_str(), "p2");
        assert_eq!(view.children, ids(&["c1", "c2", "n", "p1"]));
    }

    #[test]
    fn test_merge_with_child_winner_creates_new_family() {
        let mut resolver = resolver();
        let (f1, f2) = two_families(resolver.store_mut(), "c1");

        let resolution = add(&mut resolver, art("n", 0x3F, 500, 1));
        let Resolution::Merged {
            family,
            parent,
            removed,
            members,
        } = resolution
        else {
            panic!("expected a merge, got {resolution:?}");
        };
        assert_eq!(parent.as_str(), "c1");
        assert_eq!(removed, vec![f1, f2]);
        assert_eq!(members, 5);

        let view = only_family(&resolver);
        assert_eq!(view.id, family);
        assert_eq!(view.children, ids(&["c2", "n", "p1", "p2"]));

        let winner = resolver.store().get_file(&ContentHash::new("c1")).unwrap().unwrap();
        assert_eq!(winner.family_as_parent, Some(family));
        assert_eq!(winner.family_as_child, None);
    }

    #[test]
    fn test_resolving_twice_changes_nothing() {
        let mut resolver = resolver();
        let family = cluster(&mut resolver);
        let before = only_family(&resolver);

        for id in ["a", "b", "c"] {
            let file = resolver.store().get_file(&ContentHash::new(id)).unwrap().unwrap();
            let hash = file.perceptual_hash.unwrap();
            let resolution = resolver.resolve(&file.id, hash).unwrap();
            assert_eq!(resolution, Resolution::AlreadyPlaced { family });
        }

        let after = only_family(&resolver);
        assert_eq!(after.parent, before.parent);
        assert_eq!(after.children, before.children);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn test_failure_rolls_back() {
        let mut resolver = resolver();
        insert(resolver.store(), art("a", 0, 500, 3));
        insert(resolver.store(), art("b", 0, 500, 2));

        // Not stored, so locking it fails after the similarity query
        let err = resolver
            .resolve(&ContentHash::new("ghost"), PerceptualHash(0))
            .unwrap_err();
        assert!(matches!(err, FamilyError::Store(_)));
        assert_eq!(resolver.store().count_families().unwrap(), 0);

        // The store is usable afterwards
        let resolution = add(&mut resolver, art("c", 0, 500, 1));
        assert!(matches!(resolution, Resolution::Created { .. }));
    }

    #[test]
    fn test_upload_tags_count_in_parent_choice() {
        let mut resolver = resolver();
        insert_tagged(resolver.store(), art("new", 0b0, 500, 1), &["uncensored"]);
        let old = insert_tagged(resolver.store(), art("old", 0b1, 500, 5), &["uncensored"]);

        let resolution = resolver.resolve(&old, PerceptualHash(0b1)).unwrap();
        assert!(matches!(
            resolution,
            Resolution::Created { ref parent, .. } if parent.as_str() == "new"
        ));
    }

    /// Wraps the real store and breaks its transactions on demand.
    struct FaultyStore {
        db: Database,
        fail_on_write: Option<usize>,
        ignore_set_child: bool,
        /// Transactions still to be broken; later ones pass through untouched.
        faulty_transactions: usize,
        begun: usize,
    }

    struct FaultyTx<'a> {
        inner: DatabaseTx<'a>,
        writes: usize,
        fail_on_write: Option<usize>,
        ignore_set_child: bool,
    }

    impl FaultyStore {
        fn failing_on_write(db: Database, n: usize) -> Self {
            Self {
                db,
                fail_on_write: Some(n),
                ignore_set_child: false,
                faulty_transactions: usize::MAX,
                begun: 0,
            }
        }

        fn ignoring_set_child(db: Database) -> Self {
            Self {
                db,
                fail_on_write: None,
                ignore_set_child: true,
                faulty_transactions: usize::MAX,
                begun: 0,
            }
        }

        fn healing_after(mut self, transactions: usize) -> Self {
            self.faulty_transactions = transactions;
            self
        }
    }

    impl FamilyStore for FaultyStore {
        type Tx<'a>
            = FaultyTx<'a>
        where
            Self: 'a;

        fn begin(&mut self) -> StoreResult<FaultyTx<'_>> {
            self.begun += 1;
            let faulty = self.begun <= self.faulty_transactions;
            Ok(FaultyTx {
                inner: self.db.begin()?,
                writes: 0,
                fail_on_write: self.fail_on_write.filter(|_| faulty),
                ignore_set_child: self.ignore_set_child && faulty,
            })
        }
    }

    impl FaultyTx<'_> {
        fn write(&mut self) -> StoreResult<()> {
            self.writes += 1;
            if self.fail_on_write == Some(self.writes) {
                return Err(StoreError::LockConflict(format!("write {} refused", self.writes)));
            }
            Ok(())
        }
    }

    impl FamilyTx for FaultyTx<'_> {
        fn find_similar(
            &mut self,
            hash: PerceptualHash,
            exclude: &ContentHash,
            threshold: u32,
        ) -> StoreResult<Vec<SimilarityCandidate>> {
            self.inner.find_similar(hash, exclude, threshold)
        }

        fn lock_files(&mut self, ids: &[ContentHash]) -> StoreResult<Vec<FileRecord>> {
            self.inner.lock_files(ids)
        }

        fn lock_families(&mut self, ids: &[FamilyId]) -> StoreResult<Vec<FamilyRecord>> {
            self.inner.lock_families(ids)
        }

        fn family_children(&mut self, family: FamilyId) -> StoreResult<Vec<ContentHash>> {
            self.inner.family_children(family)
        }

        fn create_family(&mut self, parent: &ContentHash) -> StoreResult<FamilyRecord> {
            self.write()?;
            self.inner.create_family(parent)
        }

        fn set_child(&mut self, file: &ContentHash, family: Option<FamilyId>) -> StoreResult<()> {
            self.write()?;
            if self.ignore_set_child {
                return Ok(());
            }
            self.inner.set_child(file, family)
        }

        fn set_parent(&mut self, family: FamilyId, file: &ContentHash) -> StoreResult<()> {
            self.write()?;
            self.inner.set_parent(family, file)
        }

        fn delete_family(&mut self, family: FamilyId) -> StoreResult<()> {
            self.write()?;
            self.inner.delete_family(family)
        }

        fn commit(self) -> StoreResult<()> {
            self.inner.commit()
        }

        fn rollback(self) -> StoreResult<()> {
            self.inner.rollback()
        }
    }

    type FamilyRow = (FamilyId, ContentHash, Vec<ContentHash>);
    type FileRefs = (ContentHash, Option<FamilyId>, Option<FamilyId>);

    fn snapshot(db: &Database, files: &[&str]) -> (Vec<FamilyRow>, Vec<FileRefs>) {
        let families = db
            .list_families()
            .unwrap()
            .into_iter()
            .map(|f| (f.id, f.parent, f.children))
            .collect();
        let refs = files
            .iter()
            .map(|id| {
                let file = db.get_file(&ContentHash::new(*id)).unwrap().unwrap();
                (file.id, file.family_as_parent, file.family_as_child)
            })
            .collect();
        (families, refs)
    }

    #[test]
    fn test_create_failing_after_first_write_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        insert(&db, art("a", 0b0, 1000, 30));
        insert(&db, art("b", 0b1, 500, 20));
        let c = insert(&db, art("c", 0b11, 500, 10));
        let before = snapshot(&db, &["a", "b", "c"]);

        // create_family succeeds, the first set_child is refused
        let mut resolver = FamilyResolver::new(FaultyStore::failing_on_write(db, 2));
        let err = resolver.resolve(&c, PerceptualHash(0b11)).unwrap_err();
        assert!(matches!(err, FamilyError::Store(StoreError::LockConflict(_))));

        let db = &resolver.store().db;
        assert_eq!(db.count_families().unwrap(), 0);
        assert_eq!(snapshot(db, &["a", "b", "c"]), before);
    }

    #[test]
    fn test_merge_failing_before_delete_rolls_back() {
        let mut db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        two_families(&mut db, "p2");
        let n = insert(&db, art("n", 0x3F, 500, 1));
        let files = ["p1", "c1", "p2", "c2", "n"];
        let before = snapshot(&db, &files);

        // Three children move to the surviving family, then deleting the
        // other family is refused
        let mut resolver = FamilyResolver::new(FaultyStore::failing_on_write(db, 4));
        let err = resolver.resolve(&n, PerceptualHash(0x3F)).unwrap_err();
        assert!(matches!(err, FamilyError::Store(StoreError::LockConflict(_))));

        let db = &resolver.store().db;
        assert_eq!(db.count_families().unwrap(), 2);
        assert_eq!(snapshot(db, &files), before);
    }

    #[test]
    fn test_lock_conflict_is_retried() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        insert(&db, art("a", 0b0, 1000, 30));
        let b = insert(&db, art("b", 0b1, 500, 20));

        let mut resolver = FamilyResolver::new(FaultyStore::failing_on_write(db, 1).healing_after(2));
        let resolution = resolver.resolve(&b, PerceptualHash(0b1)).unwrap();
        assert!(matches!(
            resolution,
            Resolution::Created { ref parent, .. } if parent.as_str() == "a"
        ));
        assert_eq!(resolver.store().begun, 3);
        assert_eq!(resolver.store().db.count_families().unwrap(), 1);
    }

    #[test]
    fn test_persistent_lock_conflict_gives_up() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        insert(&db, art("a", 0b0, 1000, 30));
        let b = insert(&db, art("b", 0b1, 500, 20));

        let mut resolver = FamilyResolver::new(FaultyStore::failing_on_write(db, 1));
        let err = resolver.resolve(&b, PerceptualHash(0b1)).unwrap_err();
        assert!(matches!(err, FamilyError::Store(StoreError::LockConflict(_))));
        assert_eq!(resolver.store().begun, MAX_ATTEMPTS as usize);
        assert_eq!(resolver.store().db.count_families().unwrap(), 0);
    }

    #[test]
    fn test_invariant_error_is_not_retried() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        insert(&db, art("a", 0b0, 1000, 30));
        let b = insert(&db, art("b", 0b1, 500, 20));

        let mut resolver = FamilyResolver::new(FaultyStore::ignoring_set_child(db));
        assert!(matches!(
            resolver.resolve(&b, PerceptualHash(0b1)),
            Err(FamilyError::Invariant(_))
        ));
        assert_eq!(resolver.store().begun, 1);
    }

    #[test]
    fn test_broken_placement_is_an_invariant_error() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        insert(&db, art("a", 0b0, 1000, 30));
        let b = insert(&db, art("b", 0b1, 500, 20));
        let before = snapshot(&db, &["a", "b"]);

        // The family is created but its child is never linked
        let mut resolver = FamilyResolver::new(FaultyStore::ignoring_set_child(db));
        let err = resolver.resolve(&b, PerceptualHash(0b1)).unwrap_err();
        assert!(matches!(err, FamilyError::Invariant(_)), "unexpected error: {err:?}");

        let db = &resolver.store().db;
        assert_eq!(db.count_families().unwrap(), 0);
        assert_eq!(snapshot(db, &["a", "b"]), before);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let mut resolver = resolver().with_threshold(0);
        insert(resolver.store(), art("a", 0b1, 500, 3));

        let resolution = add(&mut resolver, art("b", 0b0, 500, 1));
        assert_eq!(resolution, Resolution::NoCandidates);
    }

    #[test]
    fn test_concurrent_resolvers_build_one_family() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.db");
        let db = Database::open_sqlite(&path, std::time::Duration::from_secs(10)).unwrap();
        db.initialize().unwrap();

        insert(&db, art("a", 0b0, 1000, 30));
        insert(&db, art("b", 0b1, 500, 20));
        let uploads = [("x", 0b10u64), ("y", 0b11u64)];
        for (id, hash) in uploads {
            insert(&db, art(id, hash, 500, 1));
        }

        let connector = db.connector().unwrap();
        let barrier = Arc::new(Barrier::new(uploads.len()));
        let handles: Vec<_> = uploads
            .iter()
            .map(|(id, hash)| {
                let connector = connector.clone();
                let barrier = Arc::clone(&barrier);
                let id = ContentHash::new(*id);
                let hash = PerceptualHash(*hash);
                std::thread::spawn(move || {
                    let mut resolver = FamilyResolver::new(connector.connect().unwrap());
                    barrier.wait();
                    resolver.resolve(&id, hash).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<Resolution> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            outcomes.iter().filter(|r| matches!(r, Resolution::Created { .. })).count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Resolution::AlreadyPlaced { .. }))
                .count(),
            1
        );

        let families = db.list_families().unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].parent.as_str(), "a");
        assert_eq!(families[0].children, ids(&["b", "x", "y"]));
    }
}
