//! PostgreSQL DDL for the archive tables.

pub const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    sha256_hash VARCHAR(64) PRIMARY KEY,
    md5_hash VARCHAR(32) NOT NULL,
    file_size BIGINT NOT NULL,
    original_filename VARCHAR(255) NOT NULL,
    file_ext VARCHAR(16) NOT NULL,
    width INTEGER,
    height INTEGER,
    phash BIGINT,
    date_added TIMESTAMPTZ NOT NULL DEFAULT now(),
    parent_family_id BIGINT
);

CREATE INDEX IF NOT EXISTS idx_files_phash ON files(phash);
CREATE INDEX IF NOT EXISTS idx_files_parent_family ON files(parent_family_id);

CREATE TABLE IF NOT EXISTS file_families (
    id BIGSERIAL PRIMARY KEY,
    parent_sha256_hash VARCHAR(64) NOT NULL UNIQUE
        REFERENCES files(sha256_hash) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

DO $$
BEGIN
    IF NOT EXISTS (
        SELECT 1 FROM pg_constraint WHERE conname = 'files_parent_family_id_fkey'
    ) THEN
        ALTER TABLE files
            ADD CONSTRAINT files_parent_family_id_fkey
            FOREIGN KEY (parent_family_id) REFERENCES file_families(id) ON DELETE SET NULL;
    END IF;
END
$$;

CREATE TABLE IF NOT EXISTS tags (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS file_tags (
    file_sha256_hash VARCHAR(64) NOT NULL REFERENCES files(sha256_hash) ON DELETE CASCADE,
    tag_id BIGINT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (file_sha256_hash, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_file_tags_tag ON file_tags(tag_id);
"#;
