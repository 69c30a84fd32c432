use likeness_core::{BoundingBox, IdentityStore, ServiceError};
use serde::Serialize;
use std::sync::Arc;
use zbus::{interface, DBusError};

use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.likeness.Likeness1";
pub const OBJECT_PATH: &str = "/org/likeness/Likeness1";

/// Errors returned over D-Bus, one name per failure kind.
#[derive(Debug, DBusError)]
#[zbus(prefix = "org.likeness.Likeness1.Error")]
pub enum LikenessError {
    #[zbus(error)]
    ZBus(zbus::Error),
    InvalidInput(String),
    NoFaceDetected(String),
    AmbiguousInput(String),
    FeatureExtractionFailed(String),
    NotFound(String),
    PersistenceFailed(String),
    DetectionFailed(String),
    EngineUnavailable(String),
}

impl From<EngineError> for LikenessError {
    fn from(e: EngineError) -> Self {
        let msg = e.to_string();
        match e {
            EngineError::Service(err) => match err {
                ServiceError::InvalidInput(_) => Self::InvalidInput(msg),
                ServiceError::NoFaceDetected => Self::NoFaceDetected(msg),
                ServiceError::AmbiguousInput(_) => Self::AmbiguousInput(msg),
                ServiceError::FeatureExtractionFailed(_) => Self::FeatureExtractionFailed(msg),
                ServiceError::NotFound(_) => Self::NotFound(msg),
                ServiceError::PersistenceFailed(_) => Self::PersistenceFailed(msg),
                ServiceError::DetectionFailed(_) => Self::DetectionFailed(msg),
            },
            _ => Self::EngineUnavailable(msg),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, LikenessError> {
    serde_json::to_string(value).map_err(|e| LikenessError::ZBus(zbus::Error::Failure(e.to_string())))
}

/// One located face in a `Detect` reply.
#[derive(Debug, Serialize)]
struct DetectedBox {
    #[serde(rename = "box")]
    bbox: [f32; 4],
    confidence: f32,
}

/// JSON body of a `Detect` reply.
#[derive(Debug, Serialize)]
struct DetectReport {
    faces: Vec<DetectedBox>,
    count: usize,
}

impl DetectReport {
    fn new(boxes: &[BoundingBox]) -> Self {
        let faces: Vec<DetectedBox> = boxes
            .iter()
            .map(|b| DetectedBox {
                bbox: [b.x1, b.y1, b.x2, b.y2],
                confidence: b.confidence,
            })
            .collect();
        Self {
            count: faces.len(),
            faces,
        }
    }
}

/// D-Bus interface for the Likeness daemon.
///
/// Bus name: org.likeness.Likeness1
/// Object path: /org/likeness/Likeness1
pub struct LikenessService {
    engine: EngineHandle,
    store: Arc<IdentityStore>,
    threshold: f32,
}

impl LikenessService {
    pub fn new(engine: EngineHandle, store: Arc<IdentityStore>, threshold: f32) -> Self {
        Self {
            engine,
            store,
            threshold,
        }
    }
}

#[interface(name = "org.likeness.Likeness1")]
impl LikenessService {
    /// Register the single face in an encoded image; returns the identity id.
    async fn register(
        &self,
        image: Vec<u8>,
        name: String,
        description: String,
    ) -> Result<u64, LikenessError> {
        tracing::info!(name = %name, bytes = image.len(), "register requested");
        let reg = self.engine.register(image, name, description).await?;
        Ok(reg.id)
    }

    /// Recognize every face in an encoded image; returns a JSON array of results.
    async fn recognize(&self, image: Vec<u8>) -> Result<String, LikenessError> {
        tracing::info!(bytes = image.len(), "recognize requested");
        let results = self.engine.recognize(image).await?;
        to_json(&results)
    }

    /// Locate faces in an encoded image without matching them; returns JSON
    /// with one box per face and a count.
    async fn detect(&self, image: Vec<u8>) -> Result<String, LikenessError> {
        tracing::info!(bytes = image.len(), "detect requested");
        let boxes = self.engine.detect(image).await?;
        to_json(&DetectReport::new(&boxes))
    }

    /// List registered identities (without embeddings) as JSON.
    async fn list_identities(&self) -> Result<String, LikenessError> {
        let identities = self.engine.list().await?;
        to_json(&identities)
    }

    /// Delete an identity by id.
    async fn delete_identity(&self, id: u64) -> Result<bool, LikenessError> {
        tracing::info!(id, "delete requested");
        self.engine.delete(id).await?;
        Ok(true)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, LikenessError> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": self.store.len(),
            "embedding_dim": self.store.dimension(),
            "similarity_threshold": self.threshold,
            "store_path": self.store.path().display().to_string(),
        })
        .to_string())
    }
}
