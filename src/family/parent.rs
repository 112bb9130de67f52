//! Picks the authoritative file out of two visually similar ones.
//!
//! The rules run in a fixed order and the first one that separates the two
//! files decides:
//!
//! 1. recency, overridden by a resolution difference of more than 5%
//! 2. `uncensored` beats anything else, anything else beats `censored`
//! 3. lossless formats beat lossy ones
//! 4. larger file size
//! 5. the newer file
//!
//! "Newer" means the later `created_at`, with the greater content hash
//! counted as newer on a tie, so the outcome never depends on argument order.

use std::fmt;

use crate::db::FileRecord;

const LOSSLESS_EXTENSIONS: &[&str] = &["png", "flac", "wav"];
const LOSSY_EXTENSIONS: &[&str] = &["jpg", "jpeg", "webm", "mp4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentReason {
    /// The newer file is more than 5% smaller than the older one.
    ResolutionKeptOlder,
    HigherResolution,
    Uncensored,
    NotCensored,
    LosslessFormat,
    LargerFilesize,
    NewerRevision,
}

impl ParentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentReason::ResolutionKeptOlder => "resolution_kept_older",
            ParentReason::HigherResolution => "higher_resolution",
            ParentReason::Uncensored => "uncensored",
            ParentReason::NotCensored => "not_censored",
            ParentReason::LosslessFormat => "lossless_format",
            ParentReason::LargerFilesize => "larger_filesize",
            ParentReason::NewerRevision => "newer_revision",
        }
    }
}

impl fmt::Display for ParentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParentDecision<'a> {
    pub winner: &'a FileRecord,
    pub reason: ParentReason,
}

/// Which of `a` and `b` should be the parent.
pub fn choose<'a>(a: &'a FileRecord, b: &'a FileRecord) -> &'a FileRecord {
    decide(a, b).winner
}

/// Like [`choose`], also reporting the rule that decided.
pub fn decide<'a>(a: &'a FileRecord, b: &'a FileRecord) -> ParentDecision<'a> {
    let (newer, older) = if (a.created_at, &a.id) > (b.created_at, &b.id) {
        (a, b)
    } else {
        (b, a)
    };
    let pick = |winner, reason| ParentDecision { winner, reason };

    // 1. Resolution overrides recency only outside a 5% band
    let area_newer = newer.area() as f64;
    let area_older = older.area() as f64;
    if area_newer < area_older * 0.95 {
        return pick(older, ParentReason::ResolutionKeptOlder);
    }
    if area_newer > area_older * 1.05 {
        return pick(newer, ParentReason::HigherResolution);
    }

    // 2. Censorship tags
    match (newer.has_tag("uncensored"), older.has_tag("uncensored")) {
        (true, false) => return pick(newer, ParentReason::Uncensored),
        (false, true) => return pick(older, ParentReason::Uncensored),
        _ => {}
    }
    match (newer.has_tag("censored"), older.has_tag("censored")) {
        (true, false) => return pick(older, ParentReason::NotCensored),
        (false, true) => return pick(newer, ParentReason::NotCensored),
        _ => {}
    }

    // 3. Format
    if is_lossless(newer) && is_lossy(older) {
        return pick(newer, ParentReason::LosslessFormat);
    }
    if is_lossless(older) && is_lossy(newer) {
        return pick(older, ParentReason::LosslessFormat);
    }

    // 4. File size
    if newer.file_size != older.file_size {
        let larger = if newer.file_size > older.file_size { newer } else { older };
        return pick(larger, ParentReason::LargerFilesize);
    }

    // 5. Newer revision
    pick(newer, ParentReason::NewerRevision)
}

/// Pairwise reduction with [`choose`]; `None` for an empty input.
pub fn fold_best<'a, I>(files: I) -> Option<&'a FileRecord>
where
    I: IntoIterator<Item = &'a FileRecord>,
{
    files.into_iter().reduce(|best, file| choose(best, file))
}

fn is_lossless(file: &FileRecord) -> bool {
    LOSSLESS_EXTENSIONS.contains(&file.extension.to_ascii_lowercase().as_str())
}

fn is_lossy(file: &FileRecord) -> bool {
    LOSSY_EXTENSIONS.contains(&file.extension.to_ascii_lowercase().as_str())
}
