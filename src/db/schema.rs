pub const SCHEMA: &str = r#"
-- Files: content-addressed media objects
CREATE TABLE IF NOT EXISTS files (
    sha256_hash TEXT PRIMARY KEY,
    md5_hash TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    original_filename TEXT NOT NULL,
    file_ext TEXT NOT NULL,

    -- Image metadata (NULL for videos pending processing)
    width INTEGER,
    height INTEGER,

    -- Perceptual hash, signed 64-bit; NULL for anything that is not a still image
    phash INTEGER,

    date_added TEXT NOT NULL,

    -- Family membership as a child
    parent_family_id INTEGER REFERENCES file_families(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_files_phash ON files(phash);
CREATE INDEX IF NOT EXISTS idx_files_parent_family ON files(parent_family_id);

-- Families: visually similar files grouped under one parent
CREATE TABLE IF NOT EXISTS file_families (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_sha256_hash TEXT NOT NULL UNIQUE REFERENCES files(sha256_hash) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Tags and their assignment to files
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS file_tags (
    file_sha256_hash TEXT NOT NULL,
    tag_id INTEGER NOT NULL,
    PRIMARY KEY (file_sha256_hash, tag_id),
    FOREIGN KEY (file_sha256_hash) REFERENCES files(sha256_hash) ON DELETE CASCADE,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_file_tags_tag ON file_tags(tag_id);
"#;
