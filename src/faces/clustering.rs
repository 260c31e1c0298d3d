//! Nearest-representative, single-pass clustering of face embeddings.
//!
//! Each group is represented by the embedding of its first member. A new
//! observation joins the best-scoring group whose representative passes the
//! threshold for the observation's metric, or starts a new group. This is
//! greedy and order dependent: incremental assignment never revisits earlier
//! decisions, so the partition after a series of ingests can differ from the
//! one a full rebuild produces over the same observations. A rebuild always
//! replays observations in insertion order, so it is deterministic.

use std::collections::HashMap;

use crate::config::Thresholds;
use crate::db::FaceObservation;
use crate::error::{Error, Result};

use super::engine::Metric;

pub type GroupId = i64;
pub type ObservationId = i64;

/// Embeddings are only ever compared within one engine and metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub engine_name: String,
    pub metric: Metric,
}

impl PartitionKey {
    pub fn new(engine_name: impl Into<String>, metric: Metric) -> Self {
        Self {
            engine_name: engine_name.into(),
            metric,
        }
    }

    pub fn of(observation: &FaceObservation) -> Self {
        Self::new(observation.engine_name.clone(), observation.metric)
    }
}

#[derive(Debug, Clone)]
struct Representative {
    group_id: GroupId,
    embedding: Vec<f32>,
}

/// Outcome of matching one embedding against the current representatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assignment {
    Join { group_id: GroupId, score: f32 },
    NewGroup,
}

/// In-memory table of group representatives, keyed by partition.
#[derive(Debug, Default)]
pub struct Clusterer {
    partitions: HashMap<PartitionKey, Vec<Representative>>,
}

impl Clusterer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group whose representative has `embedding`.
    ///
    /// Groups are scanned in registration order, which breaks score ties.
    pub fn insert_group(&mut self, key: PartitionKey, group_id: GroupId, embedding: Vec<f32>) {
        self.partitions.entry(key).or_default().push(Representative {
            group_id,
            embedding,
        });
    }

    pub fn group_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
    }

    /// Dimensionality shared by a partition's representatives, if any.
    pub fn dimension(&self, key: &PartitionKey) -> Option<usize> {
        self.partitions
            .get(key)
            .and_then(|reps| reps.first())
            .map(|r| r.embedding.len())
    }

    /// Decide where an embedding belongs without mutating anything.
    pub fn best_match(&self, key: &PartitionKey, embedding: &[f32], threshold: f32) -> Result<Assignment> {
        let expected = self.dimension(key);
        if embedding.is_empty() || expected.is_some_and(|dim| dim != embedding.len()) {
            return Err(Error::IncompatibleEmbedding {
                expected: expected.unwrap_or(0),
                found: embedding.len(),
            });
        }

        let Some(reps) = self.partitions.get(key) else {
            return Ok(Assignment::NewGroup);
        };

        let metric = key.metric;
        let mut best: Option<(GroupId, f32)> = None;
        for rep in reps {
            let score = metric.score(embedding, &rep.embedding);
            match best {
                Some((_, best_score)) if !metric.is_better(score, best_score) => {}
                _ => best = Some((rep.group_id, score)),
            }
        }

        Ok(match best {
            Some((group_id, score)) if metric.passes(score, threshold) => {
                Assignment::Join { group_id, score }
            }
            _ => Assignment::NewGroup,
        })
    }
}

/// A group produced by [`partition`], before it has a persisted id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedGroup {
    pub key: PartitionKey,
    pub representative: ObservationId,
    /// Members in assignment order with their score against the representative.
    pub members: Vec<(ObservationId, f32)>,
}

/// Result of clustering a full set of observations from scratch.
#[derive(Debug, Default)]
pub struct Partition {
    pub groups: Vec<PlannedGroup>,
    /// Observations left out, with the reason.
    pub skipped: Vec<(ObservationId, Error)>,
}

impl Partition {
    pub fn member_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }

    /// Member id sets, sorted, for comparing partitions irrespective of ids.
    pub fn membership(&self) -> Vec<Vec<ObservationId>> {
        let mut sets: Vec<Vec<ObservationId>> = self
            .groups
            .iter()
            .map(|g| {
                let mut ids: Vec<ObservationId> = g.members.iter().map(|(id, _)| *id).collect();
                ids.sort_unstable();
                ids
            })
            .collect();
        sets.sort();
        sets
    }
}

/// Score reported for a representative against itself.
pub fn self_score(metric: Metric) -> f32 {
    match metric {
        Metric::Cosine => 1.0,
        Metric::Euclidean => 0.0,
    }
}

/// Cluster `observations` from scratch, in the order given.
pub fn partition(observations: &[FaceObservation], thresholds: &Thresholds) -> Partition {
    let mut clusterer = Clusterer::new();
    let mut result = Partition::default();

    for obs in observations {
        let key = PartitionKey::of(obs);
        let threshold = thresholds.for_metric(obs.metric);

        match clusterer.best_match(&key, &obs.embedding, threshold) {
            Ok(Assignment::Join { group_id, score }) => {
                result.groups[group_id as usize].members.push((obs.id, score));
            }
            Ok(Assignment::NewGroup) => {
                let index = result.groups.len() as GroupId;
                clusterer.insert_group(key.clone(), index, obs.embedding.clone());
                result.groups.push(PlannedGroup {
                    key,
                    representative: obs.id,
                    members: vec![(obs.id, self_score(obs.metric))],
                });
            }
            Err(e) => {
                tracing::warn!(observation_id = obs.id, error = %e, "Skipping observation");
                result.skipped.push((obs.id, e));
            }
        }
    }

    result
}
