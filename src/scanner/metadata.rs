use anyhow::{anyhow, Result};
use std::path::Path;

/// What ingestion needs to know about a file besides its hashes.
#[derive(Debug, Clone, Default)]
pub struct MediaMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Lowercase, without the dot
    pub extension: String,
    pub original_filename: String,
}

pub fn extract_metadata(path: &Path) -> Result<MediaMetadata> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .ok_or_else(|| anyhow!("{} has no file extension", path.display()))?;
    let original_filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut metadata = MediaMetadata {
        extension,
        original_filename,
        ..Default::default()
    };

    // Header-only read; videos and unreadable images keep NULL dimensions
    if let Ok(reader) = image::ImageReader::open(path) {
        if let Ok(reader) = reader.with_guessed_format() {
            if let Ok((width, height)) = reader.into_dimensions() {
                metadata.width = Some(width);
                metadata.height = Some(height);
            }
        }
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    #[test]
    fn test_image_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Wide.PNG");
        RgbImage::new(40, 30).save_with_format(&path, image::ImageFormat::Png).unwrap();

        let metadata = extract_metadata(&path).unwrap();
        assert_eq!(metadata.width, Some(40));
        assert_eq!(metadata.height, Some(30));
        assert_eq!(metadata.extension, "png");
        assert_eq!(metadata.original_filename, "Wide.PNG");
    }

    #[test]
    fn test_video_has_no_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"\x00\x00\x00\x18ftypmp42").unwrap();

        let metadata = extract_metadata(&path).unwrap();
        assert_eq!(metadata.width, None);
        assert_eq!(metadata.extension, "mp4");
    }

    #[test]
    fn test_missing_extension_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("README");
        std::fs::write(&path, b"text").unwrap();
        assert!(extract_metadata(&path).is_err());
    }
}
