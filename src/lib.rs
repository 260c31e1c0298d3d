//! Organise a photo collection by the people in it.
//!
//! Photos are stored by content hash, faces are detected and embedded by a
//! pluggable [`faces::FaceEngine`], and every face is assigned to a person
//! group by nearest-representative clustering. [`Library`] ties it together.

pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod ingest;
pub mod library;
pub mod logging;
pub mod scanner;
pub mod store;
pub mod tasks;

pub use config::Config;
pub use error::{Error, Result};
pub use ingest::IngestItem;
pub use library::{Library, Status};
