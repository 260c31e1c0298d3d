//! Face engine capability: turn photo bytes into face observations.
//!
//! Clustering code only ever sees the [`FaceEngine`] trait. Concrete
//! backends live in [`super::detector`] and are chosen once at startup by
//! [`select_engine`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{EngineBackend, EngineConfig};
use crate::db::BoundingBox;
use crate::error::{Error, Result};

use super::detector::{OnnxFaceEngine, ARCFACE, FACENET};

/// How two embeddings from the same engine are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Cosine similarity, higher is closer.
    Cosine,
    /// Euclidean distance, lower is closer.
    Euclidean,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        }
    }

    /// Compare two embeddings of equal length.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Euclidean => euclidean_distance(a, b),
        }
    }

    /// Whether `score` is close enough to count as the same person.
    pub fn passes(&self, score: f32, threshold: f32) -> bool {
        match self {
            Metric::Cosine => score >= threshold,
            Metric::Euclidean => score <= threshold,
        }
    }

    /// Whether `candidate` is strictly closer than `best`.
    pub fn is_better(&self, candidate: f32, best: f32) -> bool {
        match self {
            Metric::Cosine => candidate > best,
            Metric::Euclidean => candidate < best,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            other => Err(Error::InvalidSetting(format!("unknown metric: {}", other))),
        }
    }
}

/// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// One face found by an engine.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub metric: Metric,
    pub confidence: f32,
}

/// A face detection and embedding backend.
///
/// `detect` returns every face in the image, possibly none. Embeddings from
/// different engines are never compared, so callers key everything they
/// store on [`FaceEngine::name`] as well as the metric.
pub trait FaceEngine: Send + Sync {
    fn name(&self) -> &str;

    fn metric(&self) -> Metric;

    fn detect(&self, image_bytes: &[u8]) -> Result<Vec<DetectedFace>>;
}

/// Load the configured backend. With [`EngineBackend::Auto`] ArcFace is
/// tried first and FaceNet second.
pub fn select_engine(config: &EngineConfig) -> Result<Arc<dyn FaceEngine>> {
    let candidates = match config.backend {
        EngineBackend::Auto => vec![&ARCFACE, &FACENET],
        EngineBackend::ArcFace => vec![&ARCFACE],
        EngineBackend::FaceNet => vec![&FACENET],
    };

    let mut failures = Vec::new();
    for model in candidates {
        match OnnxFaceEngine::load(model, config) {
            Ok(engine) => {
                tracing::info!(engine = model.name, metric = %model.metric, "Face engine loaded");
                return Ok(Arc::new(engine));
            }
            Err(e) => {
                tracing::warn!(engine = model.name, error = %e, "Face engine failed to load");
                failures.push(format!("- Tried {}: {:#}", model.name, e));
            }
        }
    }

    Err(Error::EngineUnavailable(help_text(config, &failures)))
}

fn help_text(config: &EngineConfig, failures: &[String]) -> String {
    format!(
        "{}\n\n\
         Install the ONNX Runtime shared library (e.g. `onnxruntime` from your package manager) \
         and make sure it is on the library path or ORT_DYLIB_PATH points to it.\n\
         Model files are read from {}; set `engine.download_models = true` to fetch them, \
         or copy them there manually.",
        failures.join("\n"),
        config.models_dir.display()
    )
}

#[cfg(test)]
pub mod testing {
    //! A scripted engine that maps exact photo bytes to canned faces.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    pub enum Script {
        Faces(Vec<Vec<f32>>),
        Fail(String),
        Sleep(Duration, Vec<Vec<f32>>),
        /// Block until the paired sender fires (or is dropped).
        WaitFor(Mutex<mpsc::Receiver<()>>, Vec<Vec<f32>>),
    }

    pub struct ScriptedEngine {
        name: String,
        metric: Metric,
        scripts: HashMap<Vec<u8>, Script>,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        pub fn new(name: &str, metric: Metric) -> Self {
            Self {
                name: name.to_string(),
                metric,
                scripts: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn cosine() -> Self {
            Self::new("scripted-cosine", Metric::Cosine)
        }

        pub fn with(mut self, bytes: &[u8], script: Script) -> Self {
            self.scripts.insert(bytes.to_vec(), script);
            self
        }

        pub fn with_faces(self, bytes: &[u8], faces: Vec<Vec<f32>>) -> Self {
            self.with(bytes, Script::Faces(faces))
        }

        /// Block detection of `bytes` until the returned sender fires.
        pub fn with_gate(self, bytes: &[u8], faces: Vec<Vec<f32>>) -> (Self, mpsc::Sender<()>) {
            let (tx, rx) = mpsc::channel();
            (self.with(bytes, Script::WaitFor(Mutex::new(rx), faces)), tx)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn faces(&self, embeddings: &[Vec<f32>]) -> Vec<DetectedFace> {
            embeddings
                .iter()
                .enumerate()
                .map(|(i, embedding)| DetectedFace {
                    bbox: BoundingBox {
                        x: 10 * i as i32,
                        y: 0,
                        width: 8,
                        height: 8,
                    },
                    embedding: embedding.clone(),
                    metric: self.metric,
                    confidence: 0.99,
                })
                .collect()
        }
    }

    impl FaceEngine for ScriptedEngine {
        fn name(&self) -> &str {
            &self.name
        }

        fn metric(&self) -> Metric {
            self.metric
        }

        fn detect(&self, image_bytes: &[u8]) -> Result<Vec<DetectedFace>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.scripts.get(image_bytes) {
                Some(Script::Faces(e)) => Ok(self.faces(e)),
                Some(Script::Fail(msg)) => Err(Error::Detection(msg.clone())),
                Some(Script::Sleep(d, e)) => {
                    std::thread::sleep(*d);
                    Ok(self.faces(e))
                }
                Some(Script::WaitFor(rx, e)) => {
                    if let Ok(rx) = rx.lock() {
                        let _ = rx.recv();
                    }
                    Ok(self.faces(e))
                }
                None => Err(Error::Decode("unrecognised image data".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 0.0001);
        assert_eq!(euclidean_distance(&a, &[1.0]), f32::MAX);
    }

    #[test]
    fn test_metric_direction() {
        assert!(Metric::Cosine.passes(0.7, 0.6));
        assert!(!Metric::Cosine.passes(0.5, 0.6));
        assert!(Metric::Euclidean.passes(0.5, 0.6));
        assert!(!Metric::Euclidean.passes(0.7, 0.6));

        assert!(Metric::Cosine.is_better(0.9, 0.8));
        assert!(Metric::Euclidean.is_better(0.1, 0.2));
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("euclidean".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert!("manhattan".parse::<Metric>().is_err());
    }

    #[test]
    fn test_missing_models_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            models_dir: dir.path().to_path_buf(),
            download_models: false,
            ..EngineConfig::default()
        };

        match select_engine(&config) {
            Err(Error::EngineUnavailable(msg)) => {
                assert!(msg.contains("arcface"));
                assert!(msg.contains("facenet"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("engine should not load without model files"),
        }
    }
}
