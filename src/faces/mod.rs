pub mod clustering;
pub mod detector;
pub mod engine;
pub mod index;

pub use clustering::{GroupId, ObservationId, PartitionKey};
pub use engine::{select_engine, DetectedFace, FaceEngine, Metric};
pub use index::{CommitOutcome, FaceIndex, RebuildSummary};
