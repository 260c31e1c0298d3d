//! Batch ingestion: store, detect, assign, persist.
//!
//! Store and detection run on the blocking pool with a per-item timeout, at
//! most `workers` items at a time. Commits go through the face index's writer
//! lock, one photo at a time.

use chrono::Utc;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{IngestConfig, Thresholds};
use crate::db::Photo;
use crate::error::{Error, Result};
use crate::faces::{CommitOutcome, DetectedFace, FaceEngine, FaceIndex};
use crate::store::{ContentStore, StoredPhoto};
use crate::tasks::{ItemReporter, TaskHandle};

/// One uploaded photo.
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl IngestItem {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Ok(Self::new(filename, std::fs::read(path)?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub workers: usize,
    pub item_timeout: Duration,
}

impl From<&IngestConfig> for PipelineOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            workers: config.workers,
            item_timeout: config.item_timeout(),
        }
    }
}

/// Totals for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub processed: usize,
    pub indexed: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub faces: usize,
}

enum ItemOutcome {
    Duplicate,
    Indexed { faces: usize, skipped: usize },
}

/// Result of the blocking half of an item.
enum Detected {
    Duplicate,
    Faces {
        stored: StoredPhoto,
        dimensions: Option<(u32, u32)>,
        faces: Vec<DetectedFace>,
    },
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<ContentStore>,
    index: Arc<FaceIndex>,
    engine: Arc<dyn FaceEngine>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        store: Arc<ContentStore>,
        index: Arc<FaceIndex>,
        engine: Arc<dyn FaceEngine>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            index,
            engine,
            options,
        }
    }

    /// Process every item, reporting through `handle`, then complete the task.
    ///
    /// Item failures are recorded and never stop the batch.
    pub async fn run(&self, items: Vec<IngestItem>, thresholds: Thresholds, handle: TaskHandle) -> IngestSummary {
        let workers = self.options.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut running: JoinSet<(String, Result<ItemOutcome>)> = JoinSet::new();
        let mut summary = IngestSummary::default();

        tracing::info!(
            task_id = %handle.id(),
            items = items.len(),
            workers,
            engine = self.engine.name(),
            "Ingestion started"
        );

        for item in items {
            // Permits are taken in item order, so a single worker is sequential.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let pipeline = self.clone();
            let reporter = handle.reporter();
            running.spawn(async move {
                let _permit = permit;
                let filename = item.filename.clone();
                let result = pipeline.process(item, thresholds, reporter).await;
                (filename, result)
            });

            while let Some(joined) = running.try_join_next() {
                self.record(joined, &handle, &mut summary);
            }
        }

        while let Some(joined) = running.join_next().await {
            self.record(joined, &handle, &mut summary);
        }

        tracing::info!(
            task_id = %handle.id(),
            processed = summary.processed,
            indexed = summary.indexed,
            duplicates = summary.duplicates,
            failed = summary.failed,
            faces = summary.faces,
            "Ingestion finished"
        );
        handle.complete();
        summary
    }

    fn record(
        &self,
        joined: std::result::Result<(String, Result<ItemOutcome>), tokio::task::JoinError>,
        handle: &TaskHandle,
        summary: &mut IngestSummary,
    ) {
        summary.processed += 1;
        match joined {
            Ok((_, Ok(ItemOutcome::Duplicate))) => {
                summary.duplicates += 1;
                handle.item_duplicate();
            }
            Ok((_, Ok(ItemOutcome::Indexed { faces, skipped }))) => {
                summary.indexed += 1;
                summary.faces += faces;
                handle.item_done(faces, skipped);
            }
            Ok((filename, Err(e))) => {
                summary.failed += 1;
                handle.item_failed(&filename, &e);
            }
            Err(e) => {
                summary.failed += 1;
                handle.item_failed("<worker>", &Error::from(e));
            }
        }
    }

    async fn process(&self, item: IngestItem, thresholds: Thresholds, reporter: ItemReporter) -> Result<ItemOutcome> {
        reporter.item_started(&item.filename);
        let IngestItem { filename, bytes } = item;

        let store = self.store.clone();
        let index = self.index.clone();
        let engine = self.engine.clone();
        let detect = tokio::task::spawn_blocking(move || -> Result<Detected> {
            let stored = store.store(&bytes)?;
            if index.contains_photo(&stored.photo_id)? {
                return Ok(Detected::Duplicate);
            }
            let dimensions = read_dimensions(&bytes);
            let faces = engine.detect(&bytes)?;
            Ok(Detected::Faces {
                stored,
                dimensions,
                faces,
            })
        });

        // A timed-out detection keeps its blocking thread until it returns;
        // its result is dropped.
        let detected = match tokio::time::timeout(self.options.item_timeout, detect).await {
            Ok(joined) => joined??,
            Err(_) => return Err(Error::Timeout(self.options.item_timeout)),
        };

        let (stored, dimensions, faces) = match detected {
            Detected::Duplicate => {
                tracing::debug!(filename = %filename, "Photo already indexed");
                return Ok(ItemOutcome::Duplicate);
            }
            Detected::Faces {
                stored,
                dimensions,
                faces,
            } => (stored, dimensions, faces),
        };

        let photo = Photo {
            photo_id: stored.photo_id,
            original_filename: filename,
            stored_path: stored.path.to_string_lossy().to_string(),
            byte_size: stored.byte_size,
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            face_count: faces.len(),
            ingested_at: Utc::now(),
        };

        let index = self.index.clone();
        let engine = self.engine.clone();
        let detected_faces = faces.len();
        let outcome = tokio::task::spawn_blocking(move || {
            index.commit_photo(&photo, &faces, engine.name(), &thresholds)
        })
        .await??;

        match outcome {
            CommitOutcome::AlreadyIndexed => Ok(ItemOutcome::Duplicate),
            CommitOutcome::Indexed {
                observations,
                new_groups,
                skipped,
            } => {
                tracing::debug!(observations, new_groups, skipped = skipped.len(), "Photo indexed");
                Ok(ItemOutcome::Indexed {
                    faces: detected_faces,
                    skipped: skipped.len(),
                })
            }
        }
    }
}

/// Image dimensions from the header, if the format is recognised.
fn read_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::faces::engine::testing::{Script, ScriptedEngine};
    use crate::tasks::{TaskKind, TaskState, TaskTracker};
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<ContentStore>,
        index: Arc<FaceIndex>,
        tracker: TaskTracker,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path().join("photos")).unwrap());
        let index = Arc::new(FaceIndex::open(Database::open_in_memory().unwrap()).unwrap());
        Harness {
            _dir: dir,
            store,
            index,
            tracker: TaskTracker::new(),
        }
    }

    impl Harness {
        fn pipeline(&self, engine: ScriptedEngine, workers: usize, timeout: Duration) -> Pipeline {
            Pipeline::new(
                self.store.clone(),
                self.index.clone(),
                Arc::new(engine),
                PipelineOptions {
                    workers,
                    item_timeout: timeout,
                },
            )
        }

        async fn ingest(&self, pipeline: &Pipeline, items: Vec<IngestItem>) -> IngestSummary {
            let handle = self.tracker.begin(TaskKind::Ingest, items.len()).unwrap();
            pipeline.run(items, Thresholds::default(), handle).await
        }
    }

    fn item(name: &str) -> IngestItem {
        IngestItem::new(format!("{name}.jpg"), name.as_bytes().to_vec())
    }

    fn person_a() -> Vec<f32> {
        vec![1.0, 0.0, 0.0]
    }

    #[tokio::test]
    async fn test_two_people_three_photos() {
        let h = harness();
        let engine = ScriptedEngine::cosine()
            .with_faces(b"A", vec![person_a()])
            .with_faces(b"B", vec![vec![0.95, 0.1, 0.0]])
            .with_faces(b"C", vec![vec![0.0, 0.0, 1.0]]);
        let pipeline = h.pipeline(engine, 2, Duration::from_secs(5));

        let summary = h.ingest(&pipeline, vec![item("A"), item("B"), item("C")]).await;
        assert_eq!(summary.indexed, 3);

        let groups = h.index.list_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].size, 2);
        assert_eq!(groups[1].size, 1);

        let mut pair = h.index.group_photos(groups[0].group_id).unwrap();
        pair.sort();
        let mut expected = vec![crate::store::content_hash(b"A"), crate::store::content_hash(b"B")];
        expected.sort();
        assert_eq!(pair, expected);

        let snap = h.tracker.snapshot();
        assert_eq!(snap.state, TaskState::Completed);
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.faces_found, 3);
    }

    #[tokio::test]
    async fn test_zero_face_photo_is_stored_and_counted() {
        let h = harness();
        let engine = ScriptedEngine::cosine().with_faces(b"empty", vec![]);
        let pipeline = h.pipeline(engine, 1, Duration::from_secs(5));

        h.ingest(&pipeline, vec![item("empty")]).await;

        let stats = h.index.stats().unwrap();
        assert_eq!(stats.total_photos, 1);
        assert_eq!(stats.total_faces, 0);
        assert_eq!(stats.total_groups, 0);

        let snap = h.tracker.snapshot();
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.photos_without_faces, 1);
        assert!(h.store.contains(&crate::store::content_hash(b"empty")));
    }

    #[tokio::test]
    async fn test_reingest_short_circuits() {
        let h = harness();
        let engine = Arc::new(ScriptedEngine::cosine().with_faces(b"A", vec![person_a()]));
        let pipeline = Pipeline::new(
            h.store.clone(),
            h.index.clone(),
            engine.clone(),
            PipelineOptions {
                workers: 1,
                item_timeout: Duration::from_secs(5),
            },
        );

        h.ingest(&pipeline, vec![item("A")]).await;
        h.ingest(&pipeline, vec![item("A")]).await;

        assert_eq!(engine.calls(), 1);
        let stats = h.index.stats().unwrap();
        assert_eq!(stats.total_photos, 1);
        assert_eq!(stats.total_faces, 1);
        assert_eq!(h.tracker.snapshot().duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_yields_one_photo() {
        let h = harness();
        let engine = ScriptedEngine::cosine().with_faces(b"A", vec![person_a()]);
        let pipeline = h.pipeline(engine, 4, Duration::from_secs(5));

        let summary = h.ingest(&pipeline, vec![item("A"), item("A"), item("A")]).await;

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(h.index.stats().unwrap().total_faces, 1);
    }

    #[tokio::test]
    async fn test_item_failures_do_not_stop_batch() {
        let h = harness();
        let engine = ScriptedEngine::cosine()
            .with_faces(b"A", vec![person_a()])
            .with(b"broken", Script::Fail("model error".into()));
        let pipeline = h.pipeline(engine, 2, Duration::from_secs(5));

        let summary = h
            .ingest(&pipeline, vec![item("broken"), item("garbage"), item("A")])
            .await;
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.indexed, 1);

        let snap = h.tracker.snapshot();
        assert_eq!(snap.state, TaskState::Completed);
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.errors.len(), 2);
        assert_eq!(h.index.stats().unwrap().total_photos, 1);
    }

    #[tokio::test]
    async fn test_every_item_failing_still_completes() {
        let h = harness();
        let pipeline = h.pipeline(ScriptedEngine::cosine(), 2, Duration::from_secs(5));

        h.ingest(&pipeline, vec![item("x"), item("y")]).await;

        let snap = h.tracker.snapshot();
        assert_eq!(snap.state, TaskState::Completed);
        assert_eq!(snap.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_stuck_item_times_out() {
        let h = harness();
        let engine = ScriptedEngine::cosine()
            .with(b"slow", Script::Sleep(Duration::from_millis(500), vec![person_a()]))
            .with_faces(b"A", vec![vec![0.0, 1.0, 0.0]]);
        let pipeline = h.pipeline(engine, 2, Duration::from_millis(50));

        let summary = h.ingest(&pipeline, vec![item("slow"), item("A")]).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.indexed, 1);

        let snap = h.tracker.snapshot();
        assert_eq!(snap.state, TaskState::Completed);
        assert!(snap.errors[0].contains("timed out"));
        assert!(!h.index.contains_photo(&crate::store::content_hash(b"slow")).unwrap());
    }

    #[tokio::test]
    async fn test_incompatible_embeddings_are_skipped() {
        let h = harness();
        let engine = ScriptedEngine::cosine()
            .with_faces(b"A", vec![person_a()])
            .with_faces(b"odd", vec![vec![1.0, 0.0], vec![0.0, 0.0, 1.0]]);
        let pipeline = h.pipeline(engine, 1, Duration::from_secs(5));

        h.ingest(&pipeline, vec![item("A"), item("odd")]).await;

        let snap = h.tracker.snapshot();
        assert_eq!(snap.observations_skipped, 1);
        assert!(snap.errors.is_empty());
        assert_eq!(h.index.stats().unwrap().total_faces, 2);
        assert_eq!(h.index.unassigned_observations().unwrap(), 0);
    }

    #[test]
    fn test_read_dimensions() {
        let img = image::RgbImage::new(7, 3);
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        assert_eq!(read_dimensions(&buf), Some((7, 3)));
        assert_eq!(read_dimensions(b"nope"), None);
    }
}
