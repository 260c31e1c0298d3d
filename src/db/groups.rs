//! Person group storage.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::faces::{bytes_to_embedding, BoundingBox};
use super::Database;
use crate::error::Result;
use crate::faces::Metric;

/// A group as shown to the user: size plus the face used as its cover.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub group_id: i64,
    pub size: usize,
    pub representative_face_id: i64,
    pub representative_photo_id: String,
    pub representative_bbox: BoundingBox,
    pub engine_name: String,
}

/// Library-wide counters for status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub total_photos: usize,
    pub photos_without_faces: usize,
    pub total_faces: usize,
    pub total_groups: usize,
}

/// Representative row used to rebuild the in-memory clustering table.
#[derive(Debug, Clone)]
pub struct StoredRepresentative {
    pub group_id: i64,
    pub engine_name: String,
    pub metric: Metric,
    pub embedding: Vec<f32>,
}

impl Database {
    pub fn create_group(&self, representative_face_id: i64, engine_name: &str, metric: Metric) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO face_groups (representative_face_id, engine_name, metric, created_at)
            VALUES (?, ?, ?, ?)
            "#,
            params![
                representative_face_id,
                engine_name,
                metric.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_group_member(&self, face_id: i64, group_id: i64, score: f32) -> Result<()> {
        self.conn.execute(
            "INSERT INTO group_members (face_id, group_id, score) VALUES (?, ?, ?)",
            params![face_id, group_id, score as f64],
        )?;
        Ok(())
    }

    pub fn group_exists(&self, group_id: i64) -> Result<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM face_groups WHERE id = ?", [group_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Groups ordered by size (largest first), then by id.
    pub fn list_groups(&self) -> Result<Vec<GroupSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT g.id, COUNT(m.face_id) AS size, g.representative_face_id,
                   f.photo_id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, g.engine_name
            FROM face_groups g
            JOIN faces f ON f.id = g.representative_face_id
            LEFT JOIN group_members m ON m.group_id = g.id
            GROUP BY g.id
            ORDER BY size DESC, g.id
            "#,
        )?;

        let groups = stmt
            .query_map([], |row| {
                Ok(GroupSummary {
                    group_id: row.get(0)?,
                    size: row.get::<_, i64>(1)? as usize,
                    representative_face_id: row.get(2)?,
                    representative_photo_id: row.get(3)?,
                    representative_bbox: BoundingBox {
                        x: row.get(4)?,
                        y: row.get(5)?,
                        width: row.get(6)?,
                        height: row.get(7)?,
                    },
                    engine_name: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(groups)
    }

    pub fn get_group(&self, group_id: i64) -> Result<Option<GroupSummary>> {
        Ok(self
            .list_groups()?
            .into_iter()
            .find(|g| g.group_id == group_id))
    }

    /// Member observation ids of a group, in assignment order.
    pub fn group_members(&self, group_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT face_id FROM group_members WHERE group_id = ? ORDER BY rowid")?;
        let ids = stmt
            .query_map([group_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Distinct photos containing a member of the group, in ingestion order.
    pub fn group_photos(&self, group_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.photo_id
            FROM group_members m
            JOIN faces f ON f.id = m.face_id
            JOIN photos p ON p.photo_id = f.photo_id
            WHERE m.group_id = ?
            GROUP BY p.photo_id
            ORDER BY MIN(p.seq)
            "#,
        )?;
        let ids = stmt
            .query_map([group_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Every group's representative embedding, in group creation order.
    pub fn list_representatives(&self) -> Result<Vec<StoredRepresentative>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT g.id, g.engine_name, g.metric, f.embedding
            FROM face_groups g
            JOIN faces f ON f.id = g.representative_face_id
            ORDER BY g.id
            "#,
        )?;

        let reps = stmt
            .query_map([], |row| {
                let metric: String = row.get(2)?;
                let metric = metric.parse::<Metric>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                })?;
                let embedding: Vec<u8> = row.get(3)?;
                Ok(StoredRepresentative {
                    group_id: row.get(0)?,
                    engine_name: row.get(1)?,
                    metric,
                    embedding: bytes_to_embedding(&embedding),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(reps)
    }

    /// Drop every group and membership, keeping observations.
    pub fn clear_groups(&self) -> Result<()> {
        self.conn.execute("DELETE FROM group_members", [])?;
        self.conn.execute("DELETE FROM face_groups", [])?;
        Ok(())
    }

    /// Observations that are not in any group.
    pub fn count_unassigned_observations(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM faces f
            LEFT JOIN group_members m ON m.face_id = f.id
            WHERE m.face_id IS NULL
            "#,
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let (total_photos, photos_without_faces): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(face_count = 0), 0) FROM photos",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total_groups: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM face_groups", [], |row| row.get(0))?;

        Ok(LibraryStats {
            total_photos: total_photos as usize,
            photos_without_faces: photos_without_faces as usize,
            total_faces: self.count_observations()?,
            total_groups: total_groups as usize,
        })
    }
}
