//! Hand-made changes to families, each in its own transaction.
//!
//! Anything that would leave a file as both parent and child, or as a child of
//! two families, is rejected before it is written.

use crate::db::{ContentHash, FamilyId, FamilyRecord, FamilyStore, FamilyTx, FileRecord};

use super::FamilyError;

/// Commit on success, roll back otherwise.
fn finish<T: FamilyTx, R>(tx: T, result: Result<R, FamilyError>) -> Result<R, FamilyError> {
    match result {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback() {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

fn lock_one_file<T: FamilyTx>(tx: &mut T, id: &ContentHash) -> Result<FileRecord, FamilyError> {
    tx.lock_files(std::slice::from_ref(id))?
        .pop()
        .ok_or_else(|| FamilyError::Invariant(format!("file {} was not locked", id)))
}

fn lock_one_family<T: FamilyTx>(tx: &mut T, id: FamilyId) -> Result<FamilyRecord, FamilyError> {
    tx.lock_families(&[id])?
        .pop()
        .ok_or_else(|| FamilyError::Invariant(format!("family {} was not locked", id)))
}

/// Start a family with `parent` and no children.
pub fn create_family<S: FamilyStore>(store: &mut S, parent: &ContentHash) -> Result<FamilyRecord, FamilyError> {
    let mut tx = store.begin()?;
    let result = (|| -> Result<FamilyRecord, FamilyError> {
        let file = lock_one_file(&mut tx, parent)?;
        if let Some(family) = file.family_as_parent {
            return Err(FamilyError::Rejected(format!(
                "{} is already the parent of family {}",
                parent, family
            )));
        }
        if let Some(family) = file.family_as_child {
            return Err(FamilyError::Rejected(format!(
                "{} is already a child in family {}",
                parent, family
            )));
        }
        Ok(tx.create_family(parent)?)
    })();
    let family = finish(tx, result)?;
    tracing::info!(family = %family.id, parent = %parent.short(), "Family created");
    Ok(family)
}

pub fn add_child<S: FamilyStore>(store: &mut S, family: FamilyId, child: &ContentHash) -> Result<(), FamilyError> {
    let mut tx = store.begin()?;
    let result = (|| -> Result<(), FamilyError> {
        let file = lock_one_file(&mut tx, child)?;
        let record = lock_one_family(&mut tx, family)?;
        if let Some(current) = file.family_as_child {
            return Err(FamilyError::Rejected(format!(
                "{} is already a child in family {}",
                child, current
            )));
        }
        if record.parent == *child {
            return Err(FamilyError::Rejected(format!(
                "{} is the parent of family {} and cannot be its own child",
                child, family
            )));
        }
        if let Some(other) = file.family_as_parent {
            return Err(FamilyError::Rejected(format!(
                "{} is already the parent of family {}",
                child, other
            )));
        }
        Ok(tx.set_child(child, Some(family))?)
    })();
    finish(tx, result)?;
    tracing::info!(family = %family, child = %child.short(), "Child added");
    Ok(())
}

pub fn remove_child<S: FamilyStore>(store: &mut S, family: FamilyId, child: &ContentHash) -> Result<(), FamilyError> {
    let mut tx = store.begin()?;
    let result = (|| -> Result<(), FamilyError> {
        let file = lock_one_file(&mut tx, child)?;
        lock_one_family(&mut tx, family)?;
        if file.family_as_child != Some(family) {
            return Err(FamilyError::Rejected(format!(
                "{} is not a child in family {}",
                child, family
            )));
        }
        Ok(tx.set_child(child, None)?)
    })();
    finish(tx, result)?;
    tracing::info!(family = %family, child = %child.short(), "Child removed");
    Ok(())
}

/// Unlink every child, then delete the family row. Returns the number of
/// children that were unlinked. Files are kept.
pub fn delete_family<S: FamilyStore>(store: &mut S, family: FamilyId) -> Result<usize, FamilyError> {
    let mut tx = store.begin()?;
    let result = (|| -> Result<usize, FamilyError> {
        lock_one_family(&mut tx, family)?;
        let children = tx.family_children(family)?;
        tx.lock_files(&children)?;
        for child in &children {
            tx.set_child(child, None)?;
        }
        tx.delete_family(family)?;
        Ok(children.len())
    })();
    let unlinked = finish(tx, result)?;
    tracing::info!(family = %family, unlinked, "Family deleted");
    Ok(unlinked)
}
