use image::{DynamicImage, ImageFormat};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::config::ThumbnailConfig;
use crate::db::BoundingBox;
use crate::error::Result;
use crate::faces::detector::crop_face;

/// Resized photos and face crops, cached on disk by photo id and size.
pub struct ThumbnailCache {
    cache_dir: PathBuf,
}

impl ThumbnailCache {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            cache_dir: config.path.clone(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn ensure_cache_dir(&self) -> Result<()> {
        if !self.cache_dir.exists() {
            fs::create_dir_all(&self.cache_dir)?;
        }
        Ok(())
    }

    fn cached(&self, name: &str, render: impl FnOnce() -> Result<Vec<u8>>) -> Result<Vec<u8>> {
        let path = self.cache_dir.join(name);
        if let Ok(bytes) = fs::read(&path) {
            return Ok(bytes);
        }

        let bytes = render()?;

        // Cache failures only cost a re-render next time.
        let written = self.ensure_cache_dir().and_then(|_| {
            let tmp = path.with_extension("part");
            fs::write(&tmp, &bytes)?;
            fs::rename(&tmp, &path)?;
            Ok(())
        });
        if let Err(e) = written {
            tracing::warn!(path = ?path, error = %e, "Failed to cache thumbnail");
        }

        Ok(bytes)
    }

    /// Photo scaled down to `width`, upright per its EXIF orientation.
    ///
    /// Photos that are already narrow enough and need no rotation are
    /// returned unchanged.
    pub fn resized(&self, photo_id: &str, original: &[u8], width: u32) -> Result<Vec<u8>> {
        let orientation = exif_orientation(original);
        let img = image::load_from_memory(original)?;
        if width >= img.width() && orientation == 1 {
            return Ok(original.to_vec());
        }

        self.cached(&format!("{}_w{}.jpg", photo_id, width), || {
            let img = apply_orientation(img, orientation);
            let img = if width < img.width() {
                let height = (img.height() as u64 * width as u64 / img.width() as u64).max(1) as u32;
                img.resize_exact(width, height, image::imageops::FilterType::Triangle)
            } else {
                img
            };
            encode_jpeg(&img)
        })
    }

    /// Square-ish crop around a face, padded like the embedding input, at most
    /// `size` pixels on its longer side.
    pub fn face_crop(&self, photo_id: &str, original: &[u8], bbox: &BoundingBox, size: u32) -> Result<Vec<u8>> {
        let name = format!(
            "{}_face_{}_{}_{}_{}_s{}.jpg",
            photo_id, bbox.x, bbox.y, bbox.width, bbox.height, size
        );
        self.cached(&name, || {
            let img = image::load_from_memory(original)?;
            let face = crop_face(&img, bbox, img.width(), img.height());
            let face = apply_orientation(face, exif_orientation(original));
            encode_jpeg(&face.thumbnail(size, size))
        })
    }

    /// Remove every cached image.
    pub fn clear(&self) -> Result<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)?;
        }
        Ok(())
    }
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}

/// EXIF orientation tag (1-8), or 1 when absent or unreadable.
pub fn exif_orientation(bytes: &[u8]) -> u32 {
    let mut reader = Cursor::new(bytes);
    exif::Reader::new()
        .read_from_container(&mut reader)
        .ok()
        .and_then(|exif| {
            exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .filter(|o| (1..=8).contains(o))
        .unwrap_or(1)
}

fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn cache(dir: &Path) -> ThumbnailCache {
        ThumbnailCache::new(&ThumbnailConfig {
            path: dir.join("thumbs"),
            default_width: 256,
        })
    }

    #[test]
    fn test_resize_scales_down_only() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let original = png(400, 200);

        let small = cache.resized("p1", &original, 100).unwrap();
        let img = image::load_from_memory(&small).unwrap();
        assert_eq!((img.width(), img.height()), (100, 50));
        assert!(cache.cache_dir().join("p1_w100.jpg").exists());

        let same = cache.resized("p1", &original, 800).unwrap();
        assert_eq!(same, original);
    }

    #[test]
    fn test_face_crop_is_bounded() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let original = png(300, 300);
        let bbox = BoundingBox { x: 100, y: 100, width: 100, height: 100 };

        let crop = cache.face_crop("p1", &original, &bbox, 64).unwrap();
        let img = image::load_from_memory(&crop).unwrap();
        assert!(img.width() <= 64 && img.height() <= 64);
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        assert!(cache.resized("p1", b"not an image", 10).is_err());
    }

    #[test]
    fn test_orientation_defaults_to_upright() {
        assert_eq!(exif_orientation(&png(2, 2)), 1);
        let img = DynamicImage::ImageRgb8(RgbImage::new(4, 2));
        let rotated = apply_orientation(img, 6);
        assert_eq!((rotated.width(), rotated.height()), (2, 4));
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        cache.resized("p1", &png(40, 40), 10).unwrap();
        cache.clear().unwrap();
        assert!(!cache.cache_dir().exists());
    }
}
