//! Face observation storage.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Database;
use crate::error::Result;
use crate::faces::Metric;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
        let area_a = (self.width * self.height) as f32;
        let area_b = (other.width * other.height) as f32;
        let union = area_a + area_b - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A stored face observation. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub id: i64,
    pub photo_id: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Vec<f32>,
    pub engine_name: String,
    pub metric: Metric,
}

/// An observation about to be written.
#[derive(Debug, Clone)]
pub struct NewObservation<'a> {
    pub photo_id: &'a str,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: &'a [f32],
    pub engine_name: &'a str,
    pub metric: Metric,
}

impl FaceObservation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let embedding: Vec<u8> = row.get(7)?;
        let metric: String = row.get(9)?;
        let metric = metric.parse::<Metric>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(FaceObservation {
            id: row.get(0)?,
            photo_id: row.get(1)?,
            bbox: BoundingBox {
                x: row.get(2)?,
                y: row.get(3)?,
                width: row.get(4)?,
                height: row.get(5)?,
            },
            confidence: row.get::<_, f64>(6)? as f32,
            embedding: bytes_to_embedding(&embedding),
            engine_name: row.get(8)?,
            metric,
        })
    }
}

const FACE_COLUMNS: &str = "f.id, f.photo_id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, \
                            f.confidence, f.embedding, f.engine_name, f.metric";

impl Database {
    pub fn insert_observation(&self, obs: &NewObservation<'_>) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO faces (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence,
                               embedding, embedding_dim, engine_name, metric)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                obs.photo_id,
                obs.bbox.x,
                obs.bbox.y,
                obs.bbox.width,
                obs.bbox.height,
                obs.confidence as f64,
                embedding_to_bytes(obs.embedding),
                obs.embedding.len() as i64,
                obs.engine_name,
                obs.metric.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_observation(&self, id: i64) -> Result<Option<FaceObservation>> {
        let sql = format!("SELECT {} FROM faces f WHERE f.id = ?", FACE_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id], FaceObservation::from_row)
            .optional()?)
    }

    /// Every observation, ordered by photo insertion then detection order.
    pub fn list_observations(&self) -> Result<Vec<FaceObservation>> {
        let sql = format!(
            "SELECT {} FROM faces f JOIN photos p ON p.photo_id = f.photo_id ORDER BY p.seq, f.id",
            FACE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([], FaceObservation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    pub fn observations_for_photo(&self, photo_id: &str) -> Result<Vec<FaceObservation>> {
        let sql = format!("SELECT {} FROM faces f WHERE f.photo_id = ? ORDER BY f.id", FACE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([photo_id], FaceObservation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    pub fn count_observations(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Convert f32 embedding to little-endian bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
