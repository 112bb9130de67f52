pub mod discovery;
pub mod hashing;
pub mod metadata;

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db::{Connector, ContentHash, NewFile};
use crate::family::{FamilyResolver, Resolution};

pub use discovery::discover_media;
pub use hashing::{compute_perceptual_hash, content_hashes, perceptual_hash_from_image, ContentDigests, HashError};
pub use metadata::{extract_metadata, MediaMetadata};

#[derive(Debug, Clone)]
pub enum IngestProgress {
    Started { total_files: usize },
    Processed { current: usize, total: usize, path: String },
    Completed { ingested: usize, duplicates: usize, failed: usize },
    Error { message: String },
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub ingested: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Family outcome of every ingested file that had a perceptual hash and
    /// resolved without error.
    pub resolutions: Vec<(ContentHash, Resolution)>,
}

#[derive(Debug)]
enum FileOutcome {
    Ingested {
        id: ContentHash,
        resolution: Option<Resolution>,
    },
    Duplicate,
}

pub struct Ingestor {
    config: Arc<Config>,
    connector: Connector,
}

impl Ingestor {
    pub fn new(config: Config, connector: Connector) -> Self {
        Self {
            config: Arc::new(config),
            connector,
        }
    }

    /// Ingest every media file under `paths`, tagging each new file with `tags`.
    pub async fn ingest(
        &self,
        paths: &[PathBuf],
        tags: &[String],
        progress_tx: Option<mpsc::Sender<IngestProgress>>,
    ) -> Result<IngestReport> {
        let extensions: Vec<String> = self
            .config
            .ingest
            .image_extensions
            .iter()
            .chain(&self.config.ingest.video_extensions)
            .cloned()
            .collect();

        let mut files = Vec::new();
        for path in paths {
            files.extend(discover_media(path, &extensions)?);
        }

        let total = files.len();
        if let Some(ref tx) = progress_tx {
            let _ = tx.send(IngestProgress::Started { total_files: total });
        }
        tracing::info!(files = total, "Ingestion started");

        let semaphore = Arc::new(Semaphore::new(self.config.ingest.concurrency.max(1)));
        let tags: Arc<Vec<String>> = Arc::new(tags.to_vec());
        let mut tasks = JoinSet::new();

        for path in files {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("Ingestion semaphore closed")?;
            let config = Arc::clone(&self.config);
            let connector = self.connector.clone();
            let tags = Arc::clone(&tags);

            tasks.spawn(async move {
                let task_path = path.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    ingest_file(&config, &connector, &task_path, &tags)
                })
                .await;
                drop(permit);
                (path, outcome)
            });
        }

        let mut report = IngestReport::default();
        let mut current = 0;
        while let Some(joined) = tasks.join_next().await {
            let (path, outcome) = joined.context("Ingestion task panicked")?;
            current += 1;

            match outcome {
                Ok(Ok(FileOutcome::Ingested { id, resolution })) => {
                    report.ingested += 1;
                    if let Some(resolution) = resolution {
                        report.resolutions.push((id, resolution));
                    }
                }
                Ok(Ok(FileOutcome::Duplicate)) => report.duplicates += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Failed to ingest file");
                    if let Some(ref tx) = progress_tx {
                        let _ = tx.send(IngestProgress::Error {
                            message: format!("Error ingesting {}: {}", path.display(), e),
                        });
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(path = %path.display(), error = %e, "Ingestion worker failed");
                }
            }

            if let Some(ref tx) = progress_tx {
                let _ = tx.send(IngestProgress::Processed {
                    current,
                    total,
                    path: path.to_string_lossy().to_string(),
                });
            }
        }

        if let Some(ref tx) = progress_tx {
            let _ = tx.send(IngestProgress::Completed {
                ingested: report.ingested,
                duplicates: report.duplicates,
                failed: report.failed,
            });
        }
        tracing::info!(
            ingested = report.ingested,
            duplicates = report.duplicates,
            failed = report.failed,
            "Ingestion finished"
        );

        Ok(report)
    }
}

/// Store one file and place it in a family. Runs on the blocking pool.
fn ingest_file(config: &Config, connector: &Connector, path: &Path, tags: &[String]) -> Result<FileOutcome> {
    let digests = content_hashes(path)?;
    let metadata = extract_metadata(path)?;

    let perceptual_hash = if config.ingest.is_image_extension(&metadata.extension) {
        match compute_perceptual_hash(path) {
            Ok(hash) => Some(hash),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Stored without perceptual hash");
                None
            }
        }
    } else {
        None
    };

    let db = connector.connect()?;
    let id = digests.sha256;
    let inserted = db.insert_file(&NewFile {
        id: id.clone(),
        md5: digests.md5,
        file_size: digests.size,
        original_filename: metadata.original_filename,
        extension: metadata.extension,
        width: metadata.width,
        height: metadata.height,
        perceptual_hash,
        date_added: Utc::now(),
        tags: tags.to_vec(),
    })?;
    if !inserted {
        tracing::debug!(file = %id.short(), path = %path.display(), "Duplicate content, skipped");
        return Ok(FileOutcome::Duplicate);
    }

    // Family linkage is best-effort: a failure leaves the file unlinked
    let resolution = match perceptual_hash {
        Some(hash) => {
            let mut resolver = FamilyResolver::new(db).with_threshold(config.similarity.threshold);
            match resolver.resolve(&id, hash) {
                Ok(resolution) => Some(resolution),
                Err(e) => {
                    tracing::warn!(file = %id.short(), error = %e, "Family resolution failed");
                    None
                }
            }
        }
        None => None,
    };

    Ok(FileOutcome::Ingested { id, resolution })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
    use std::time::Duration;
    use tempfile::tempdir;

    fn artwork(size: u32) -> DynamicImage {
        let img = RgbImage::from_fn(size, size, |x, y| {
            let fx = x as f32 / size as f32;
            let fy = y as f32 / size as f32;
            Rgb([(fx * 255.0) as u8, ((fx + fy) * 120.0) as u8, (fy * 255.0) as u8])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ingest_directory() {
        let media = tempdir().unwrap();
        let original = artwork(256);
        original.save(media.path().join("art.png")).unwrap();
        original.save(media.path().join("art_copy.png")).unwrap();
        original
            .resize_exact(200, 200, FilterType::Lanczos3)
            .save(media.path().join("art_small.png"))
            .unwrap();
        std::fs::write(media.path().join("broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(media.path().join("notes.txt"), b"ignored").unwrap();

        let data = tempdir().unwrap();
        let db = Database::open_sqlite(&data.path().join("archive.db"), Duration::from_secs(10)).unwrap();
        db.initialize().unwrap();

        let mut config = Config::default();
        config.ingest.concurrency = 3;
        let ingestor = Ingestor::new(config, db.connector().unwrap());

        let (progress_tx, progress_rx) = mpsc::channel();
        let report = ingestor
            .ingest(
                &[media.path().to_path_buf()],
                &["original".to_string()],
                Some(progress_tx),
            )
            .await
            .unwrap();

        assert_eq!(report.ingested, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            report
                .resolutions
                .iter()
                .filter(|(_, r)| matches!(r, Resolution::Created { .. }))
                .count(),
            1
        );

        let families = db.list_families().unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].children.len(), 1);
        let parent = db.get_file(&families[0].parent).unwrap().unwrap();
        assert_eq!(parent.width, Some(256));
        assert!(parent.has_tag("original"));

        let events: Vec<IngestProgress> = progress_rx.try_iter().collect();
        assert!(matches!(events.first(), Some(IngestProgress::Started { total_files: 4 })));
        assert!(matches!(events.last(), Some(IngestProgress::Completed { ingested: 3, .. })));
    }

    #[test]
    fn test_undecodable_image_is_stored_without_hash() {
        let media = tempdir().unwrap();
        let path = media.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();

        let data = tempdir().unwrap();
        let db = Database::open_sqlite(&data.path().join("archive.db"), Duration::from_secs(1)).unwrap();
        db.initialize().unwrap();

        let outcome = ingest_file(&Config::default(), &db.connector().unwrap(), &path, &[]).unwrap();
        let FileOutcome::Ingested { id, resolution } = outcome else {
            panic!("expected the file to be ingested");
        };
        assert!(resolution.is_none());

        let stored = db.get_file(&id).unwrap().unwrap();
        assert_eq!(stored.perceptual_hash, None);
        assert_eq!(stored.width, None);
        assert_eq!(stored.file_size, 9);
    }
}
