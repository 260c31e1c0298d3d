use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::Database;
use crate::error::Result;

/// A stored photo. Identity is the content hash; rows are never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub photo_id: String,
    pub original_filename: String,
    pub stored_path: String,
    pub byte_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub face_count: usize,
    pub ingested_at: DateTime<Utc>,
}

impl Photo {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let ingested_at: String = row.get(7)?;
        let ingested_at = DateTime::parse_from_rfc3339(&ingested_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
            })?;

        Ok(Photo {
            photo_id: row.get(0)?,
            original_filename: row.get(1)?,
            stored_path: row.get(2)?,
            byte_size: row.get::<_, i64>(3)? as u64,
            width: row.get(4)?,
            height: row.get(5)?,
            face_count: row.get::<_, i64>(6)? as usize,
            ingested_at,
        })
    }
}

const PHOTO_COLUMNS: &str =
    "photo_id, original_filename, stored_path, byte_size, width, height, face_count, ingested_at";

impl Database {
    pub fn insert_photo(&self, photo: &Photo) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO photos (photo_id, original_filename, stored_path, byte_size, width, height, face_count, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                photo.photo_id,
                photo.original_filename,
                photo.stored_path,
                photo.byte_size as i64,
                photo.width,
                photo.height,
                photo.face_count as i64,
                photo.ingested_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn photo_exists(&self, photo_id: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM photos WHERE photo_id = ? LIMIT 1",
                [photo_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_photo(&self, photo_id: &str) -> Result<Option<Photo>> {
        let sql = format!("SELECT {} FROM photos WHERE photo_id = ?", PHOTO_COLUMNS);
        Ok(self.conn.query_row(&sql, [photo_id], Photo::from_row).optional()?)
    }

    /// All photos in ingestion order.
    pub fn list_photos(&self) -> Result<Vec<Photo>> {
        let sql = format!("SELECT {} FROM photos ORDER BY seq", PHOTO_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let photos = stmt
            .query_map([], Photo::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }
}
