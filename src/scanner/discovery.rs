use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Whether `path` has one of the accepted image extensions (case-insensitive).
pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| e.to_lowercase() == ext))
}

pub fn discover_images(directory: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| has_image_extension(p, extensions))
        .collect();

    // Sort by path for consistent ordering
    images.sort();
    images
}

/// Expand upload arguments into image files: directories are walked,
/// files are kept when their extension is accepted.
pub fn collect_uploads(paths: &[PathBuf], extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut uploads = Vec::new();

    for path in paths {
        if path.is_dir() {
            uploads.extend(discover_images(path, extensions));
        } else if path.is_file() {
            if has_image_extension(path, extensions) {
                uploads.push(path.clone());
            } else {
                tracing::warn!(path = ?path, "Skipping file with unsupported extension");
            }
        } else {
            return Err(Error::not_found("path", path.display()));
        }
    }

    Ok(uploads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn extensions() -> Vec<String> {
        vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
    }

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let images = discover_images(dir.path(), &extensions());
        assert_eq!(images.len(), 3);
    }

    #[test]
    fn test_collect_uploads_mixes_files_and_dirs() {
        let dir = tempdir().unwrap();
        let album = dir.path().join("album");
        fs::create_dir(&album).unwrap();
        File::create(album.join("a.jpg")).unwrap();
        File::create(album.join("b.gif")).unwrap();
        let single = dir.path().join("c.png");
        File::create(&single).unwrap();
        let notes = dir.path().join("notes.md");
        File::create(&notes).unwrap();

        let uploads = collect_uploads(&[album.clone(), single.clone(), notes], &extensions()).unwrap();
        assert_eq!(uploads, vec![album.join("a.jpg"), single]);
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let dir = tempdir().unwrap();
        let result = collect_uploads(&[dir.path().join("nope")], &extensions());
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
