//! Persisted key/value settings.

use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::config::Thresholds;
use crate::error::Result;
use crate::faces::Metric;

fn threshold_key(metric: Metric) -> String {
    format!("threshold.{}", metric.as_str())
}

impl Database {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?", [key], |row| row.get(0))
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn save_threshold(&self, metric: Metric, value: f32) -> Result<()> {
        self.set_setting(&threshold_key(metric), &value.to_string())
    }

    /// Overlay persisted threshold overrides on `base`. Unreadable values are
    /// logged and ignored.
    pub fn load_thresholds(&self, base: Thresholds) -> Result<Thresholds> {
        let mut thresholds = base;
        for metric in [Metric::Cosine, Metric::Euclidean] {
            let Some(raw) = self.get_setting(&threshold_key(metric))? else {
                continue;
            };
            let applied = raw
                .parse::<f32>()
                .map_err(|e| e.to_string())
                .and_then(|value| thresholds.set(metric, value).map_err(|e| e.to_string()));
            if let Err(e) = applied {
                tracing::warn!(%metric, %raw, error = %e, "Ignoring stored threshold");
            }
        }
        Ok(thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_setting("k").unwrap(), None);
        db.set_setting("k", "1").unwrap();
        db.set_setting("k", "2").unwrap();
        assert_eq!(db.get_setting("k").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_stored_thresholds_override_base() {
        let db = Database::open_in_memory().unwrap();
        db.save_threshold(Metric::Cosine, 0.42).unwrap();
        db.set_setting("threshold.euclidean", "not-a-number").unwrap();

        let t = db.load_thresholds(Thresholds::default()).unwrap();
        assert_eq!(t.cosine, 0.42);
        assert_eq!(t.euclidean, Thresholds::default().euclidean);
    }
}
