//! The boundary facade: everything a front end needs to ingest photos and
//! browse the people in them.

use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;

use crate::config::{Config, Thresholds};
use crate::db::{Database, GroupSummary, LibraryStats, Photo};
use crate::error::{Error, Result};
use crate::faces::{select_engine, FaceEngine, FaceIndex, GroupId, Metric, RebuildSummary};
use crate::ingest::{IngestItem, IngestSummary, Pipeline, PipelineOptions};
use crate::store::{ContentStore, ThumbnailCache};
use crate::tasks::{TaskKind, TaskSnapshot, TaskTracker};

/// Everything shown on a status page.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub task: TaskSnapshot,
    pub library: LibraryStats,
    pub engine: Option<String>,
    /// Why no engine is available, when none is.
    pub engine_error: Option<String>,
    pub thresholds: Thresholds,
}

pub struct Library {
    config: Config,
    store: Arc<ContentStore>,
    index: Arc<FaceIndex>,
    thumbnails: ThumbnailCache,
    engine: std::result::Result<Arc<dyn FaceEngine>, String>,
    tracker: Arc<TaskTracker>,
    thresholds: RwLock<Thresholds>,
}

impl Library {
    /// Open the library and load the configured face engine.
    ///
    /// A missing engine does not prevent browsing; ingestion then fails with
    /// `EngineUnavailable`.
    pub fn open(config: Config) -> Result<Self> {
        let engine = match select_engine(&config.engine) {
            Ok(engine) => Ok(engine),
            Err(Error::EngineUnavailable(msg)) => {
                tracing::warn!("Face engine unavailable; ingestion disabled");
                Err(msg)
            }
            Err(e) => return Err(e),
        };
        Self::open_inner(config, engine)
    }

    /// Open with an explicit engine, or none.
    pub fn open_with_engine(config: Config, engine: Option<Arc<dyn FaceEngine>>) -> Result<Self> {
        let engine = engine.ok_or_else(|| "no face engine configured".to_string());
        Self::open_inner(config, engine)
    }

    fn open_inner(config: Config, engine: std::result::Result<Arc<dyn FaceEngine>, String>) -> Result<Self> {
        let store = Arc::new(ContentStore::open(&config.store.path)?);
        let index = Arc::new(FaceIndex::open(Database::open(&config.db_path)?)?);
        let thresholds = index.load_thresholds(config.thresholds)?;
        let thumbnails = ThumbnailCache::new(&config.thumbnails);

        tracing::info!(
            db = ?config.db_path,
            store = ?config.store.path,
            cosine = thresholds.cosine,
            euclidean = thresholds.euclidean,
            "Library opened"
        );

        Ok(Self {
            config,
            store,
            index,
            thumbnails,
            engine,
            tracker: Arc::new(TaskTracker::new()),
            thresholds: RwLock::new(thresholds),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine_name(&self) -> Option<&str> {
        self.engine.as_ref().ok().map(|e| e.name())
    }

    /// Thresholds new work will use.
    pub fn thresholds(&self) -> Thresholds {
        match self.thresholds.read() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Validate, persist and apply a threshold. Existing groups are not
    /// touched until the next rebuild.
    pub fn set_threshold(&self, metric_name: &str, value: f32) -> Result<Thresholds> {
        let metric: Metric = metric_name.parse()?;
        let mut next = self.thresholds();
        next.set(metric, value)?;
        self.index.save_thresholds(&next)?;

        match self.thresholds.write() {
            Ok(mut t) => *t = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(%metric, value, "Threshold updated");
        Ok(next)
    }

    /// Claim the tracker and ingest `items` in the background.
    ///
    /// Returns `TaskInProgress` at once if a task is running. Must be called
    /// from within a tokio runtime.
    pub fn start_ingest(&self, items: Vec<IngestItem>) -> Result<JoinHandle<IngestSummary>> {
        let handle = self.tracker.begin(TaskKind::Ingest, items.len())?;

        let engine = match &self.engine {
            Ok(engine) => engine.clone(),
            Err(msg) => {
                handle.fail(&Error::EngineUnavailable(msg.clone()));
                return Err(Error::EngineUnavailable(msg.clone()));
            }
        };

        let pipeline = Pipeline::new(
            self.store.clone(),
            self.index.clone(),
            engine,
            PipelineOptions::from(&self.config.ingest),
        );
        let thresholds = self.thresholds();

        Ok(tokio::spawn(async move { pipeline.run(items, thresholds, handle).await }))
    }

    pub async fn ingest(&self, items: Vec<IngestItem>) -> Result<IngestSummary> {
        Ok(self.start_ingest(items)?.await?)
    }

    /// Claim the tracker and recluster every observation in the background.
    pub fn start_rebuild(&self) -> Result<JoinHandle<Result<RebuildSummary>>> {
        let total = self.index.stats()?.total_faces;
        let handle = self.tracker.begin(TaskKind::Rebuild, total)?;
        let index = self.index.clone();
        let thresholds = self.thresholds();

        Ok(tokio::task::spawn_blocking(move || {
            let result = index.rebuild(&thresholds, |done, _| handle.progress(done));
            match &result {
                Ok(summary) => {
                    tracing::info!(
                        observations = summary.observations,
                        groups = summary.groups,
                        skipped = summary.skipped,
                        "Rebuild finished"
                    );
                    handle.complete();
                }
                Err(e) => handle.fail(e),
            }
            result
        }))
    }

    pub async fn rebuild(&self) -> Result<RebuildSummary> {
        self.start_rebuild()?.await?
    }

    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            task: self.tracker.snapshot(),
            library: self.index.stats()?,
            engine: self.engine_name().map(str::to_string),
            engine_error: self.engine.as_ref().err().cloned(),
            thresholds: self.thresholds(),
        })
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        self.index.stats()
    }

    /// Groups by size, largest first.
    pub fn groups(&self) -> Result<Vec<GroupSummary>> {
        self.index.list_groups()
    }

    pub fn group(&self, group_id: GroupId) -> Result<GroupSummary> {
        self.index.get_group(group_id)
    }

    pub fn group_photos(&self, group_id: GroupId) -> Result<Vec<String>> {
        self.index.group_photos(group_id)
    }

    pub fn photo(&self, photo_id: &str) -> Result<Photo> {
        self.index.get_photo(photo_id)
    }

    /// A photo's bytes, downscaled to `width` when given.
    pub fn photo_bytes(&self, photo_id: &str, width: Option<u32>) -> Result<Vec<u8>> {
        let photo = self.index.get_photo(photo_id)?;
        let bytes = self.store.fetch(&photo.photo_id)?;
        match width {
            Some(width) => self.thumbnails.resized(&photo.photo_id, &bytes, width),
            None => Ok(bytes),
        }
    }

    /// Cover image for a group: its representative face, cropped.
    pub fn face_thumbnail(&self, group_id: GroupId, size: Option<u32>) -> Result<Vec<u8>> {
        let group = self.index.get_group(group_id)?;
        let bytes = self.store.fetch(&group.representative_photo_id)?;
        let size = size.unwrap_or(self.config.thumbnails.default_width);
        self.thumbnails
            .face_crop(&group.representative_photo_id, &bytes, &group.representative_bbox, size)
    }

    /// Delete every photo, observation, group and cached thumbnail.
    /// Thresholds are kept.
    pub fn clear_cache(&self) -> Result<()> {
        self.tracker.while_idle(|| {
            self.index.clear()?;
            self.store.delete_all()?;
            self.thumbnails.clear()?;
            tracing::info!("Library cleared");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::engine::testing::ScriptedEngine;
    use crate::tasks::TaskState;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn png(shade: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(64, 48, Rgb([shade, 80, 120]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::rooted_at(root);
        config.ingest.workers = 1;
        config
    }

    /// Four photos of one face each along an arc, 0.8 apart in cosine
    /// terms between neighbours.
    fn arc_engine() -> (ScriptedEngine, Vec<IngestItem>) {
        let embeddings = [
            vec![1.0, 0.0],
            vec![0.8, 0.6],
            vec![0.6, 0.8],
            vec![0.0, 1.0],
        ];
        let mut engine = ScriptedEngine::cosine();
        let mut items = Vec::new();
        for (i, e) in embeddings.into_iter().enumerate() {
            let bytes = png(i as u8 * 10);
            engine = engine.with_faces(&bytes, vec![e]);
            items.push(IngestItem::new(format!("{i}.png"), bytes));
        }
        (engine, items)
    }

    fn assert_partition(library: &Library) {
        let stats = library.stats().unwrap();
        let members: usize = library.groups().unwrap().iter().map(|g| g.size).sum();
        assert_eq!(members, stats.total_faces);
        assert_eq!(library.index.unassigned_observations().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permissive_threshold_takes_effect_on_rebuild() {
        let dir = tempdir().unwrap();
        let (engine, items) = arc_engine();
        let library = Library::open_with_engine(config(dir.path()), Some(Arc::new(engine))).unwrap();

        library.set_threshold("cosine", 0.9).unwrap();
        library.ingest(items).await.unwrap();
        assert_eq!(library.groups().unwrap().len(), 3);
        assert_partition(&library);

        library.set_threshold("cosine", 0.5).unwrap();
        assert_eq!(library.groups().unwrap().len(), 3);

        let summary = library.rebuild().await.unwrap();
        assert_eq!(summary.observations, 4);
        assert_eq!(summary.groups, 2);
        assert_eq!(library.groups().unwrap().len(), 2);
        assert_partition(&library);

        let status = library.status().unwrap();
        assert_eq!(status.task.kind, Some(TaskKind::Rebuild));
        assert_eq!(status.task.state, TaskState::Completed);
        assert_eq!(status.task.processed, 4);
    }

    #[tokio::test]
    async fn test_rebuild_is_deterministic() {
        let dir = tempdir().unwrap();
        let (engine, items) = arc_engine();
        let library = Library::open_with_engine(config(dir.path()), Some(Arc::new(engine))).unwrap();
        library.ingest(items).await.unwrap();

        library.rebuild().await.unwrap();
        let first = library.index.membership().unwrap();
        library.rebuild().await.unwrap();
        assert_eq!(library.index.membership().unwrap(), first);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempdir().unwrap();
        let (engine, items) = arc_engine();
        let engine: Arc<dyn FaceEngine> = Arc::new(engine);

        let groups = {
            let library = Library::open_with_engine(config(dir.path()), Some(engine.clone())).unwrap();
            library.set_threshold("cosine", 0.75).unwrap();
            library.ingest(items).await.unwrap();
            library.groups().unwrap()
        };

        let library = Library::open_with_engine(config(dir.path()), Some(engine)).unwrap();
        assert_eq!(library.thresholds().cosine, 0.75);
        assert_eq!(library.groups().unwrap(), groups);
        assert_eq!(library.stats().unwrap().total_photos, 4);
    }

    #[tokio::test]
    async fn test_missing_engine_fails_task_but_browsing_works() {
        let dir = tempdir().unwrap();
        let library = Library::open_with_engine(config(dir.path()), None).unwrap();

        let result = library.ingest(vec![IngestItem::new("a.png", png(1))]).await;
        assert!(matches!(result, Err(Error::EngineUnavailable(_))));

        let status = library.status().unwrap();
        assert!(matches!(status.task.state, TaskState::Failed(_)));
        assert!(status.engine.is_none());
        assert!(status.engine_error.is_some());
        assert!(library.groups().unwrap().is_empty());

        // Rebuild needs no engine.
        library.rebuild().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_task_rejected_while_running() {
        let dir = tempdir().unwrap();
        let first = png(1);
        let (engine, gate) = ScriptedEngine::cosine().with_gate(&first, vec![vec![1.0, 0.0]]);
        let engine = engine.with_faces(&png(2), vec![vec![0.0, 1.0]]);
        let library = Library::open_with_engine(config(dir.path()), Some(Arc::new(engine))).unwrap();

        let job = library.start_ingest(vec![IngestItem::new("a.png", first)]).unwrap();

        let second = library.start_ingest(vec![IngestItem::new("b.png", png(2))]);
        assert!(matches!(second, Err(Error::TaskInProgress)));
        assert!(matches!(library.start_rebuild(), Err(Error::TaskInProgress)));
        assert!(matches!(library.clear_cache(), Err(Error::TaskInProgress)));
        assert!(library.status().unwrap().task.state.is_running());

        gate.send(()).unwrap();
        let summary = job.await.unwrap();
        assert_eq!(summary.indexed, 1);

        let status = library.status().unwrap();
        assert_eq!(status.task.state, TaskState::Completed);
        assert_eq!(status.library.total_photos, 1);
        assert_partition(&library);

        library.ingest(vec![IngestItem::new("b.png", png(2))]).await.unwrap();
        assert_eq!(library.groups().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_photo_bytes_and_cover() {
        let dir = tempdir().unwrap();
        let bytes = png(7);
        let engine = ScriptedEngine::cosine().with_faces(&bytes, vec![vec![1.0, 0.0]]);
        let library = Library::open_with_engine(config(dir.path()), Some(Arc::new(engine))).unwrap();
        library.ingest(vec![IngestItem::new("a.png", bytes.clone())]).await.unwrap();

        let group = library.groups().unwrap().remove(0);
        let photo_id = library.group_photos(group.group_id).unwrap().remove(0);
        assert_eq!(library.photo(&photo_id).unwrap().width, Some(64));

        assert_eq!(library.photo_bytes(&photo_id, None).unwrap(), bytes);
        let small = image::load_from_memory(&library.photo_bytes(&photo_id, Some(32)).unwrap()).unwrap();
        assert_eq!((small.width(), small.height()), (32, 24));

        let cover = image::load_from_memory(&library.face_thumbnail(group.group_id, Some(16)).unwrap()).unwrap();
        assert!(cover.width() <= 16 && cover.height() <= 16);

        assert!(matches!(library.photo_bytes("missing", None), Err(Error::NotFound { .. })));
        assert!(matches!(library.face_thumbnail(999, None), Err(Error::NotFound { .. })));
        assert!(matches!(library.group_photos(999), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_clear_cache_resets_library() {
        let dir = tempdir().unwrap();
        let (engine, items) = arc_engine();
        let library = Library::open_with_engine(config(dir.path()), Some(Arc::new(engine))).unwrap();
        library.set_threshold("cosine", 0.7).unwrap();
        library.ingest(items.clone()).await.unwrap();

        library.clear_cache().unwrap();
        assert_eq!(library.stats().unwrap(), LibraryStats::default());
        assert!(library.groups().unwrap().is_empty());
        assert_eq!(library.thresholds().cosine, 0.7);

        // Everything can be ingested again from scratch.
        let summary = library.ingest(items).await.unwrap();
        assert_eq!(summary.indexed, 4);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let dir = tempdir().unwrap();
        let library = Library::open_with_engine(config(dir.path()), None).unwrap();

        assert!(matches!(library.set_threshold("cosine", 1.5), Err(Error::InvalidSetting(_))));
        assert!(matches!(library.set_threshold("manhattan", 0.5), Err(Error::InvalidSetting(_))));
        assert!(matches!(library.set_threshold("euclidean", -1.0), Err(Error::InvalidSetting(_))));
        assert_eq!(library.thresholds(), Thresholds::default());
    }
}
