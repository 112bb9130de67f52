use anyhow::Result;
use image::DynamicImage;
use img_hash::{HashAlg, HasherConfig};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

use crate::db::{ContentHash, PerceptualHash};

/// Side length of the image handed to the hasher.
const HASH_INPUT_SIZE: u32 = 64;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot hash: {0}")]
    Undecodable(String),

    #[error("Perceptual hash has {0} bytes, expected 8")]
    UnexpectedLength(usize),
}

/// Cryptographic digests of a file's bytes.
#[derive(Debug, Clone)]
pub struct ContentDigests {
    pub sha256: ContentHash,
    pub md5: String,
    pub size: u64,
}

pub fn content_hashes(path: &Path) -> Result<ContentDigests> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut md5_hasher = Md5::new();
    let mut sha256_hasher = Sha256::new();
    let mut size = 0u64;

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        md5_hasher.update(&buffer[..bytes_read]);
        sha256_hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(ContentDigests {
        sha256: ContentHash::new(format!("{:x}", sha256_hasher.finalize())),
        md5: format!("{:x}", md5_hasher.finalize()),
        size,
    })
}

/// Perceptual hash of the still image at `path`.
pub fn compute_perceptual_hash(path: &Path) -> Result<PerceptualHash, HashError> {
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| HashError::Undecodable(e.to_string()))?;
    perceptual_hash_from_image(&img)
}

/// 64-bit DCT hash: visually similar images land within a few bits of each other.
pub fn perceptual_hash_from_image(img: &DynamicImage) -> Result<PerceptualHash, HashError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(HashError::Undecodable("image has no pixels".to_string()));
    }

    let thumbnail = img.thumbnail(HASH_INPUT_SIZE, HASH_INPUT_SIZE);

    let hasher = HasherConfig::new()
        .hash_size(8, 8)
        .hash_alg(HashAlg::Mean)
        .preproc_dct()
        .to_hasher();

    // img_hash carries its own version of the image crate
    let rgba = thumbnail.to_rgba8();
    let (width, height) = rgba.dimensions();
    let img_hash_image = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
        .ok_or_else(|| HashError::Undecodable("Failed to create image for hashing".to_string()))?;

    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(img_hash_image));

    let bytes: [u8; 8] = hash
        .as_bytes()
        .try_into()
        .map_err(|_| HashError::UnexpectedLength(hash.as_bytes().len()))?;
    Ok(PerceptualHash(u64::from_be_bytes(bytes)))
}
