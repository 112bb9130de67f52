//! Row types shared by every backend.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::similarity::PerceptualHash;

/// Content identity of a file: the lowercase hex sha256 digest of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Parse user input as a sha256 digest (64 hex characters, case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyId(pub i64);

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored file as seen by the family engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: ContentHash,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: u64,
    /// Lowercase extension without the dot.
    pub extension: String,
    pub created_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub perceptual_hash: Option<PerceptualHash>,
    /// Family this file is the designated parent of.
    pub family_as_parent: Option<FamilyId>,
    /// Family this file belongs to as a child.
    pub family_as_child: Option<FamilyId>,
}

impl FileRecord {
    /// Pixel area; a missing dimension counts as zero.
    pub fn area(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains(name)
    }

    /// The family this file participates in, whichever side it is on.
    pub fn family(&self) -> Option<FamilyId> {
        self.family_as_parent.or(self.family_as_child)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FamilyRecord {
    pub id: FamilyId,
    pub parent: ContentHash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A file about to be inserted by the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub id: ContentHash,
    pub md5: String,
    pub file_size: u64,
    pub original_filename: String,
    pub extension: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub perceptual_hash: Option<PerceptualHash>,
    pub date_added: DateTime<Utc>,
    /// Tag names stored in the same transaction as the file row, so the file
    /// never shows up in a similarity search without them.
    pub tags: Vec<String>,
}

/// A family with its members, for read paths.
#[derive(Debug, Clone, Serialize)]
pub struct FamilyView {
    pub id: FamilyId,
    pub parent: ContentHash,
    pub children: Vec<ContentHash>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_hash() {
        let upper = "A".repeat(64);
        let parsed = ContentHash::parse(&upper).unwrap();
        assert_eq!(parsed.as_str(), "a".repeat(64));
        assert_eq!(parsed.short(), "aaaaaaaa");

        assert!(ContentHash::parse("abc").is_none());
        assert!(ContentHash::parse(&"g".repeat(64)).is_none());
    }

    #[test]
    fn test_area_treats_missing_dimension_as_zero() {
        let record = FileRecord {
            id: ContentHash::new("x"),
            width: Some(1920),
            height: None,
            file_size: 0,
            extension: "mp4".to_string(),
            created_at: Utc::now(),
            tags: BTreeSet::new(),
            perceptual_hash: None,
            family_as_parent: None,
            family_as_child: None,
        };
        assert_eq!(record.area(), 0);
        assert_eq!(record.id.short(), "x");
    }
}
