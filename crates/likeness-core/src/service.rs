//! Registration and recognition on top of the detector, embedder and identity store.

use crate::detector::DetectorError;
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::store::{IdentityStore, StoreError};
use crate::types::{BoundingBox, DetectedFace, Detector, Embedder, IdentitySummary};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected; registration needs exactly one")]
    AmbiguousInput(usize),
    #[error("feature extraction failed: {0}")]
    FeatureExtractionFailed(String),
    #[error("identity {0} not found")]
    NotFound(u64),
    #[error("failed to persist identities: {0}")]
    PersistenceFailed(String),
    #[error("face detection failed: {0}")]
    DetectionFailed(#[from] DetectorError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EmptyName => ServiceError::InvalidInput(e.to_string()),
            StoreError::DimensionMismatch { .. } | StoreError::InvalidEmbedding => {
                ServiceError::FeatureExtractionFailed(e.to_string())
            }
            StoreError::Read { .. }
            | StoreError::Corrupt { .. }
            | StoreError::Persist(_)
            | StoreError::IdsExhausted => ServiceError::PersistenceFailed(e.to_string()),
        }
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub id: u64,
    pub name: String,
    pub bbox: BoundingBox,
}

/// What recognition concluded about one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FaceOutcome {
    Matched { id: u64, name: String, similarity: f32 },
    /// Best similarity was below the threshold (0.0 for an empty gallery).
    Unknown { similarity: f32 },
    /// The embedder produced no encoding for this face.
    ExtractionFailed,
}

/// Recognition result for one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct FaceRecognition {
    pub bbox: BoundingBox,
    pub outcome: FaceOutcome,
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGB pixel buffer.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::InvalidInput("image is empty".into()));
    }
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ServiceError::InvalidInput(format!("image decoding failed: {e}")))
}

/// Orchestrates detection and embedding with the identity store and matcher.
///
/// Inference runs without touching the store; only the store access itself
/// takes the store lock.
pub struct RecognitionService<D, E> {
    detector: D,
    embedder: E,
    store: Arc<IdentityStore>,
    matcher: EuclideanMatcher,
    threshold: f32,
}

impl<D: Detector, E: Embedder> RecognitionService<D, E> {
    pub fn new(detector: D, embedder: E, store: Arc<IdentityStore>, threshold: f32) -> Self {
        Self {
            detector,
            embedder,
            store,
            matcher: EuclideanMatcher::default(),
            threshold,
        }
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    /// Register the single face in `image` under `name`, updating the
    /// existing identity when the name is already known.
    pub fn register(
        &mut self,
        image: &RgbImage,
        name: &str,
        description: &str,
    ) -> Result<Registration, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidInput("name is required".into()));
        }

        let mut faces = self.detector.detect(image)?;
        let face = match faces.len() {
            0 => return Err(ServiceError::NoFaceDetected),
            1 => faces.remove(0),
            n => return Err(ServiceError::AmbiguousInput(n)),
        };

        let embedding = self.embedder.embed(&face.region).ok_or_else(|| {
            ServiceError::FeatureExtractionFailed("no encoding produced for the detected face".into())
        })?;

        let thumbnail = encode_thumbnail(&face);
        let id = self.store.upsert_by_name(name, embedding, thumbnail, description)?;

        tracing::info!(id, name, confidence = face.bbox.confidence, "face registered");
        Ok(Registration {
            id,
            name: name.to_string(),
            bbox: face.bbox,
        })
    }

    /// Identify every face in `image`. One entry per detected face, in
    /// detection order; an image without faces yields an empty list.
    pub fn recognize(&mut self, image: &RgbImage) -> Result<Vec<FaceRecognition>, ServiceError> {
        let faces = self.detector.detect(image)?;
        if faces.is_empty() {
            tracing::debug!("recognize: no face detected");
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(faces.len());
        for face in &faces {
            let outcome = match self.embedder.embed(&face.region) {
                Some(embedding) => {
                    let result = self
                        .store
                        .with_records(|gallery| self.matcher.compare(&embedding, gallery, self.threshold));
                    match result.identity {
                        Some(identity) => FaceOutcome::Matched {
                            id: identity.id,
                            name: identity.name,
                            similarity: result.similarity,
                        },
                        None => FaceOutcome::Unknown {
                            similarity: result.similarity,
                        },
                    }
                }
                None => FaceOutcome::ExtractionFailed,
            };
            results.push(FaceRecognition {
                bbox: face.bbox,
                outcome,
            });
        }

        tracing::info!(
            faces = results.len(),
            matched = results
                .iter()
                .filter(|r| matches!(r.outcome, FaceOutcome::Matched { .. }))
                .count(),
            "recognize complete"
        );
        Ok(results)
    }

    /// Locate faces without embedding or matching them.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ServiceError> {
        let boxes: Vec<BoundingBox> = self.detector.detect(image)?.into_iter().map(|f| f.bbox).collect();
        tracing::info!(faces = boxes.len(), "detect complete");
        Ok(boxes)
    }

    /// All identities, embeddings stripped.
    pub fn list_identities(&self) -> Vec<IdentitySummary> {
        self.store.list_all().iter().map(|r| r.summary()).collect()
    }

    pub fn delete_identity(&self, id: u64) -> Result<(), ServiceError> {
        if self.store.delete_by_id(id)? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(id))
        }
    }
}

/// Base64 JPEG of the face region. `None` if encoding fails.
fn encode_thumbnail(face: &DetectedFace) -> Option<String> {
    let mut buf = Cursor::new(Vec::new());
    match face.region.write_to(&mut buf, ImageFormat::Jpeg) {
        Ok(()) => Some(BASE64.encode(buf.into_inner())),
        Err(e) => {
            tracing::warn!(error = %e, "thumbnail encoding failed; storing identity without one");
            None
        }
    }
}
