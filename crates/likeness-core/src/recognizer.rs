//! Face embedding extraction via ONNX Runtime.
//!
//! Turns a cropped face region into a fixed-length, L2-normalized embedding.

use crate::types::{Embedding, Embedder};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — place the face embedding model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX face embedding model.
pub struct FaceRecognizer {
    session: Session,
    dimension: usize,
}

impl FaceRecognizer {
    /// Load the embedding model, expecting it to produce `dimension` floats.
    pub fn load(model_path: &str, dimension: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            dimension,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face embedding model"
        );

        Ok(Self { session, dimension })
    }

    /// Extract an embedding from a cropped face region.
    pub fn extract(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(RecognizerError::EmptyRegion);
        }

        let input = preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        to_embedding(raw_data, self.dimension)
    }
}

impl Embedder for FaceRecognizer {
    fn embed(&mut self, face: &RgbImage) -> Option<Embedding> {
        match self.extract(face) {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(error = %e, "embedding extraction failed");
                None
            }
        }
    }
}

/// Resize a face crop to the model input and convert to a normalized NCHW tensor.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = EMBEDDER_INPUT_SIZE as usize;
    let resized = imageops::resize(face, EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
        }
    }

    tensor
}

/// Validate raw model output and normalize it into an [`Embedding`].
fn to_embedding(raw: &[f32], dimension: usize) -> Result<Embedding, RecognizerError> {
    if raw.len() != dimension {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {dimension}-dim embedding, got {}",
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed("embedding contains non-finite values".into()));
    }
    Ok(Embedding::new(l2_normalize(raw.to_vec())))
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(37, 53, image::Rgb([128, 128, 128]));
        let tensor = preprocess(&face);
        let size = EMBEDDER_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, size, size]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let face = RgbImage::from_pixel(112, 112, image::Rgb([255, 0, 128]));
        let tensor = preprocess(&face);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - EMBEDDER_MEAN) / EMBEDDER_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_to_embedding_checks_dimension() {
        assert!(matches!(
            to_embedding(&[1.0, 0.0, 0.0], 4),
            Err(RecognizerError::InferenceFailed(_))
        ));
        let emb = to_embedding(&[0.0, 3.0, 0.0, 4.0], 4).unwrap();
        assert!((emb.values[3] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_to_embedding_rejects_non_finite() {
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            assert!(matches!(
                to_embedding(&[0.5, bad], 2),
                Err(RecognizerError::InferenceFailed(_))
            ));
        }
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
