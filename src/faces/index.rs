//! The persisted face index: photos, observations and their groups.
//!
//! All mutation goes through one lock, which serialises group creation and
//! membership changes. Detection happens outside it.

use std::sync::{Mutex, MutexGuard};

use crate::config::Thresholds;
use crate::db::{
    Database, FaceObservation, GroupSummary, LibraryStats, NewObservation, Photo,
};
use crate::error::{Error, Result};

use super::clustering::{self, Assignment, Clusterer, GroupId, PartitionKey};
use super::engine::DetectedFace;

/// What happened when a photo's faces were committed.
#[derive(Debug)]
pub enum CommitOutcome {
    /// The photo was indexed earlier; nothing was written.
    AlreadyIndexed,
    Indexed {
        observations: usize,
        new_groups: usize,
        /// Faces left out because their embeddings could not be compared.
        skipped: Vec<Error>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    pub observations: usize,
    pub groups: usize,
    pub skipped: usize,
}

struct IndexState {
    db: Database,
    clusterer: Clusterer,
}

impl IndexState {
    /// Reload representatives from the database, the source of truth.
    fn reload(&mut self) -> Result<()> {
        self.clusterer.clear();
        for rep in self.db.list_representatives()? {
            self.clusterer.insert_group(
                PartitionKey::new(rep.engine_name, rep.metric),
                rep.group_id,
                rep.embedding,
            );
        }
        Ok(())
    }
}

pub struct FaceIndex {
    state: Mutex<IndexState>,
}

impl FaceIndex {
    pub fn open(db: Database) -> Result<Self> {
        let mut state = IndexState {
            db,
            clusterer: Clusterer::new(),
        };
        state.reload()?;
        tracing::debug!(groups = state.clusterer.group_count(), "Face index loaded");
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        // A panic mid-commit leaves the transaction rolled back, so the data
        // behind a poisoned lock is still consistent with the database.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                if let Err(e) = guard.reload() {
                    tracing::error!(error = %e, "Failed to reload face index after panic");
                }
                guard
            }
        }
    }

    pub fn contains_photo(&self, photo_id: &str) -> Result<bool> {
        self.lock().db.photo_exists(photo_id)
    }

    /// Store a photo with its detected faces, assigning every face to a group.
    ///
    /// Either everything is written or nothing is. A photo that is already
    /// indexed is left untouched.
    pub fn commit_photo(
        &self,
        photo: &Photo,
        faces: &[DetectedFace],
        engine_name: &str,
        thresholds: &Thresholds,
    ) -> Result<CommitOutcome> {
        let mut state = self.lock();
        if state.db.photo_exists(&photo.photo_id)? {
            return Ok(CommitOutcome::AlreadyIndexed);
        }

        let result = Self::commit_locked(&mut state, photo, faces, engine_name, thresholds);
        if result.is_err() {
            if let Err(e) = state.reload() {
                tracing::error!(error = %e, "Failed to reload face index after aborted commit");
            }
        }
        result
    }

    fn commit_locked(
        state: &mut IndexState,
        photo: &Photo,
        faces: &[DetectedFace],
        engine_name: &str,
        thresholds: &Thresholds,
    ) -> Result<CommitOutcome> {
        let tx = state.db.transaction()?;
        state.db.insert_photo(photo)?;

        let mut observations = 0;
        let mut new_groups = 0;
        let mut skipped = Vec::new();

        for face in faces {
            let key = PartitionKey::new(engine_name, face.metric);
            let threshold = thresholds.for_metric(face.metric);

            let assignment = match state.clusterer.best_match(&key, &face.embedding, threshold) {
                Ok(assignment) => assignment,
                Err(e @ Error::IncompatibleEmbedding { .. }) => {
                    tracing::warn!(photo_id = %photo.photo_id, error = %e, "Skipping face");
                    skipped.push(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let face_id = state.db.insert_observation(&NewObservation {
                photo_id: &photo.photo_id,
                bbox: face.bbox,
                confidence: face.confidence,
                embedding: &face.embedding,
                engine_name,
                metric: face.metric,
            })?;
            observations += 1;

            match assignment {
                Assignment::Join { group_id, score } => {
                    state.db.add_group_member(face_id, group_id, score)?;
                    tracing::debug!(face_id, group_id, score, "Face joined group");
                }
                Assignment::NewGroup => {
                    let group_id = state.db.create_group(face_id, engine_name, face.metric)?;
                    state
                        .db
                        .add_group_member(face_id, group_id, clustering::self_score(face.metric))?;
                    state
                        .clusterer
                        .insert_group(key, group_id, face.embedding.clone());
                    new_groups += 1;
                    tracing::debug!(face_id, group_id, "Face started new group");
                }
            }
        }

        tx.commit()?;

        Ok(CommitOutcome::Indexed {
            observations,
            new_groups,
            skipped,
        })
    }

    /// Discard every group and recluster all observations in insertion order.
    ///
    /// `on_progress(done, total)` is called as observations are placed.
    pub fn rebuild(
        &self,
        thresholds: &Thresholds,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<RebuildSummary> {
        let mut state = self.lock();
        let observations = state.db.list_observations()?;
        let total = observations.len();
        on_progress(0, total);

        let partition = clustering::partition(&observations, thresholds);

        let result = (|| {
            let tx = state.db.transaction()?;
            state.db.clear_groups()?;

            let mut placed = 0;
            for group in &partition.groups {
                let group_id = state.db.create_group(
                    group.representative,
                    &group.key.engine_name,
                    group.key.metric,
                )?;
                for &(face_id, score) in &group.members {
                    state.db.add_group_member(face_id, group_id, score)?;
                }
                placed += group.members.len();
                on_progress(placed, total);
            }

            tx.commit()?;
            Ok::<_, Error>(())
        })();

        // Reload even on failure: the rolled-back database is authoritative.
        state.reload()?;
        result?;

        Ok(RebuildSummary {
            observations: total,
            groups: partition.groups.len(),
            skipped: partition.skipped.len(),
        })
    }

    /// Remove every photo, observation and group.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        state.db.clear_all()?;
        state.clusterer.clear();
        Ok(())
    }

    pub fn list_groups(&self) -> Result<Vec<GroupSummary>> {
        self.lock().db.list_groups()
    }

    pub fn get_group(&self, group_id: GroupId) -> Result<GroupSummary> {
        self.lock()
            .db
            .get_group(group_id)?
            .ok_or_else(|| Error::not_found("group", group_id))
    }

    pub fn group_photos(&self, group_id: GroupId) -> Result<Vec<String>> {
        let state = self.lock();
        if !state.db.group_exists(group_id)? {
            return Err(Error::not_found("group", group_id));
        }
        state.db.group_photos(group_id)
    }

    pub fn get_photo(&self, photo_id: &str) -> Result<Photo> {
        self.lock()
            .db
            .get_photo(photo_id)?
            .ok_or_else(|| Error::not_found("photo", photo_id))
    }

    pub fn list_photos(&self) -> Result<Vec<Photo>> {
        self.lock().db.list_photos()
    }

    pub fn observations_for_photo(&self, photo_id: &str) -> Result<Vec<FaceObservation>> {
        self.lock().db.observations_for_photo(photo_id)
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        self.lock().db.stats()
    }

    /// Sorted member sets of every group, for comparing partitions.
    pub fn membership(&self) -> Result<Vec<Vec<i64>>> {
        let state = self.lock();
        let mut sets = Vec::new();
        for group in state.db.list_groups()? {
            let mut members = state.db.group_members(group.group_id)?;
            members.sort_unstable();
            sets.push(members);
        }
        sets.sort();
        Ok(sets)
    }

    /// Observations that are in no group. Zero whenever the index is consistent.
    pub fn unassigned_observations(&self) -> Result<usize> {
        self.lock().db.count_unassigned_observations()
    }

    pub fn load_thresholds(&self, base: Thresholds) -> Result<Thresholds> {
        self.lock().db.load_thresholds(base)
    }

    pub fn save_thresholds(&self, thresholds: &Thresholds) -> Result<()> {
        let state = self.lock();
        let tx = state.db.transaction()?;
        state.db.save_threshold(super::Metric::Cosine, thresholds.cosine)?;
        state.db.save_threshold(super::Metric::Euclidean, thresholds.euclidean)?;
        tx.commit()?;
        Ok(())
    }
}
