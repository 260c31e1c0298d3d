//! Content-addressed photo storage.
//!
//! Files live at `<root>/<first two hex chars>/<sha256 hex>`. Writes go to a
//! temporary file in `<root>/tmp` and are renamed into place, so a reader
//! never sees a partially written photo.

pub mod thumbnails;

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

pub use thumbnails::ThumbnailCache;

/// Result of storing a photo's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPhoto {
    pub photo_id: String,
    pub path: PathBuf,
    pub byte_size: u64,
    /// False when identical bytes were already stored.
    pub newly_written: bool,
}

pub struct ContentStore {
    root: PathBuf,
}

/// Hex SHA-256 of `bytes`, the photo identifier.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn is_valid_id(photo_id: &str) -> bool {
    photo_id.len() == 64 && photo_id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl ContentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a photo with this id is stored at.
    pub fn path_for(&self, photo_id: &str) -> PathBuf {
        self.root.join(&photo_id[..2.min(photo_id.len())]).join(photo_id)
    }

    /// Store bytes under their content hash. Storing the same bytes again
    /// returns the same id and writes nothing.
    pub fn store(&self, bytes: &[u8]) -> Result<StoredPhoto> {
        let photo_id = content_hash(bytes);
        let path = self.path_for(&photo_id);
        let byte_size = bytes.len() as u64;

        if path.exists() {
            return Ok(StoredPhoto {
                photo_id,
                path,
                byte_size,
                newly_written: false,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.temp_path(&photo_id);
        let written = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!(photo_id = %photo_id, bytes = byte_size, "Stored photo");
        Ok(StoredPhoto {
            photo_id,
            path,
            byte_size,
            newly_written: true,
        })
    }

    /// Read a stored photo's bytes.
    pub fn fetch(&self, photo_id: &str) -> Result<Vec<u8>> {
        if !is_valid_id(photo_id) {
            return Err(Error::not_found("photo", photo_id));
        }
        match fs::read(self.path_for(photo_id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found("photo", photo_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, photo_id: &str) -> bool {
        is_valid_id(photo_id) && self.path_for(photo_id).exists()
    }

    /// Remove every stored photo, including leftover temporary files.
    pub fn delete_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        fs::create_dir_all(self.root.join("tmp"))?;
        tracing::info!(root = ?self.root, "Content store cleared");
        Ok(())
    }

    fn temp_path(&self, photo_id: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("{}.{}.{}.part", photo_id, std::process::id(), seq))
    }
}
