use anyhow::{anyhow, bail, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::EngineConfig;
use crate::db::BoundingBox;
use crate::error::Error;

use super::engine::{DetectedFace, FaceEngine, Metric};

/// UltraFace (320x240) detector shared by every embedding backend.
const DETECTION_MODEL_FILE: &str = "ultraface-320.onnx";
const DETECTION_MODEL_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";

/// Description of an embedding network and how its output is compared.
#[derive(Debug)]
pub struct EmbeddingModel {
    pub name: &'static str,
    pub file: &'static str,
    pub url: Option<&'static str>,
    pub input_size: u32,
    pub mean: f32,
    pub std: f32,
    pub metric: Metric,
}

/// ArcFace ResNet100, 512-dim embeddings compared by cosine similarity.
pub static ARCFACE: EmbeddingModel = EmbeddingModel {
    name: "arcface",
    file: "arcface-resnet100.onnx",
    url: Some(
        "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx",
    ),
    input_size: 112,
    mean: 127.5,
    std: 127.5,
    metric: Metric::Cosine,
};

/// FaceNet (InceptionResnetV1), compared by euclidean distance. There is no
/// canonical hosted export, so the file has to be provided by the user.
pub static FACENET: EmbeddingModel = EmbeddingModel {
    name: "facenet",
    file: "facenet.onnx",
    url: None,
    input_size: 160,
    mean: 127.5,
    std: 128.0,
    metric: Metric::Euclidean,
};

/// Face engine backed by ONNX Runtime sessions.
pub struct OnnxFaceEngine {
    model: &'static EmbeddingModel,
    detection: Mutex<Session>,
    embedding: Mutex<Session>,
}

impl OnnxFaceEngine {
    pub fn load(model: &'static EmbeddingModel, config: &EngineConfig) -> Result<Self> {
        let detection_path = ensure_model(config, DETECTION_MODEL_FILE, Some(DETECTION_MODEL_URL))?;
        let embedding_path = ensure_model(config, model.file, model.url)?;

        let detection = build_session(&detection_path, config.intra_threads)?;
        let embedding = build_session(&embedding_path, config.intra_threads)?;

        Ok(Self {
            model,
            detection: Mutex::new(detection),
            embedding: Mutex::new(embedding),
        })
    }

    fn detect_in_image(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let face_boxes = {
            let mut session = self
                .detection
                .lock()
                .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
            run_ultraface_detection(&mut session, img)?
        };

        if face_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self
            .embedding
            .lock()
            .map_err(|e| anyhow!("Failed to lock embedding model: {}", e))?;

        let (orig_width, orig_height) = img.dimensions();
        let mut detected = Vec::with_capacity(face_boxes.len());

        for (bbox, confidence) in face_boxes {
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }

            let face_crop = crop_face(img, &bbox, orig_width, orig_height);
            let embedding = run_embedding(&mut session, self.model, &face_crop)?;

            detected.push(DetectedFace {
                bbox,
                embedding,
                metric: self.model.metric,
                confidence,
            });
        }

        Ok(detected)
    }
}

impl FaceEngine for OnnxFaceEngine {
    fn name(&self) -> &str {
        self.model.name
    }

    fn metric(&self) -> Metric {
        self.model.metric
    }

    fn detect(&self, image_bytes: &[u8]) -> crate::error::Result<Vec<DetectedFace>> {
        let img = image::load_from_memory(image_bytes).map_err(|e| Error::Decode(e.to_string()))?;
        self.detect_in_image(&img)
            .map_err(|e| Error::Detection(format!("{:#}", e)))
    }
}

fn build_session(path: &Path, intra_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads.max(1))?
        .commit_from_file(path)?;
    Ok(session)
}

/// Locate a model file, downloading it when allowed.
fn ensure_model(config: &EngineConfig, filename: &str, url: Option<&str>) -> Result<PathBuf> {
    let model_path = config.models_dir.join(filename);
    if model_path.exists() {
        return Ok(model_path);
    }

    let url = match url {
        Some(url) if config.download_models => url,
        _ => bail!("model file missing: {}", model_path.display()),
    };

    std::fs::create_dir_all(&config.models_dir)?;
    tracing::info!(model = %filename, "Downloading model...");
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow!("Failed to download model: {}", e))?;

    // Download next to the target so an interrupted fetch never leaves a
    // truncated model under the real name.
    let partial = model_path.with_extension("onnx.part");
    let mut file = std::fs::File::create(&partial)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    file.sync_all()?;
    std::fs::rename(&partial, &model_path)?;
    tracing::info!(model = %filename, path = ?model_path, "Model downloaded");

    Ok(model_path)
}

/// Run UltraFace detection model
fn run_ultraface_detection(session: &mut Session, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: u32 = 320;
    const INPUT_HEIGHT: u32 = 240;
    const CONFIDENCE_THRESHOLD: f32 = 0.7;
    const NMS_THRESHOLD: f32 = 0.3;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(INPUT_WIDTH, INPUT_HEIGHT, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, normalized to roughly [-1, 1]
    let plane = (INPUT_HEIGHT * INPUT_WIDTH) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized x1 y1 x2 y2
    let num_anchors = scores_shape[1] as usize;
    let mut face_boxes = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= CONFIDENCE_THRESHOLD {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        let bbox = BoundingBox {
            x: x1.max(0),
            y: y1.max(0),
            width: (x2 - x1).max(1),
            height: (y2 - y1).max(1),
        };

        face_boxes.push((bbox, confidence));
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(boxes[i].clone());

        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && boxes[i].0.iou(&boxes[j].0) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Crop face region from image with 20% padding on each side
pub(crate) fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2).max(1) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2).max(1) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run an embedding network on a face crop and L2-normalize the output.
fn run_embedding(session: &mut Session, model: &EmbeddingModel, face_img: &DynamicImage) -> Result<Vec<f32>> {
    let size = model.input_size;
    let resized = face_img.resize_exact(size, size, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let plane = (size * size) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * size as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - model.mean) / model.std;
        input_data[plane + idx] = (pixel[1] as f32 - model.mean) / model.std;
        input_data[2 * plane + idx] = (pixel[2] as f32 - model.mean) / model.std;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, size as usize, size as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs![input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;

    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    Ok(l2_normalize(embedding_data.to_vec()))
}

fn l2_normalize(embedding: Vec<f32>) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.into_iter().map(|x| x / norm).collect()
    } else {
        embedding
    }
}
