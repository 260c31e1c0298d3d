//! Finding uploadable photos on disk.

pub mod discovery;

pub use discovery::{collect_uploads, discover_images, has_image_extension};
