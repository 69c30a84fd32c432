use likeness_core::{
    decode_image, BoundingBox, Detector, Embedder, FaceDetector, FaceRecognition, FaceRecognizer,
    IdentityStore, IdentitySummary, RecognitionService, Registration, ServiceError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] likeness_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] likeness_core::recognizer::RecognizerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        image: Vec<u8>,
        name: String,
        description: String,
        reply: oneshot::Sender<Result<Registration, ServiceError>>,
    },
    Recognize {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<FaceRecognition>, ServiceError>>,
    },
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<BoundingBox>, ServiceError>>,
    },
    List {
        reply: oneshot::Sender<Vec<IdentitySummary>>,
    },
    Delete {
        id: u64,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Register the single face in an encoded image under `name`.
    pub async fn register(
        &self,
        image: Vec<u8>,
        name: String,
        description: String,
    ) -> Result<Registration, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Register {
                image,
                name,
                description,
                reply,
            })
            .await??)
    }

    /// Identify every face in an encoded image.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<Vec<FaceRecognition>, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Recognize { image, reply })
            .await??)
    }

    /// Locate faces in an encoded image without matching them.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Vec<BoundingBox>, EngineError> {
        Ok(self.call(|reply| EngineRequest::Detect { image, reply }).await??)
    }

    pub async fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }

    pub async fn delete(&self, id: u64) -> Result<(), EngineError> {
        Ok(self.call(|reply| EngineRequest::Delete { id, reply }).await??)
    }
}

/// Load both ONNX models and spawn the engine on a dedicated OS thread.
///
/// Fails fast at startup if either model is unavailable.
pub fn spawn_engine(
    detector_path: &str,
    embedder_path: &str,
    detector_confidence: f32,
    store: Arc<IdentityStore>,
    threshold: f32,
) -> Result<EngineHandle, EngineError> {
    let detector = FaceDetector::load(detector_path, detector_confidence)?;
    tracing::info!(path = detector_path, "face detector loaded");

    let recognizer = FaceRecognizer::load(embedder_path, store.dimension())?;
    tracing::info!(path = embedder_path, "face embedder loaded");

    let service = RecognitionService::new(detector, recognizer, store, threshold);
    spawn_service(service)
}

/// Run `service` on its own thread, serving requests until every handle is dropped.
pub fn spawn_service<D, E>(mut service: RecognitionService<D, E>) -> Result<EngineHandle, EngineError>
where
    D: Detector + Send + 'static,
    E: Embedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("likeness-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register {
                        image,
                        name,
                        description,
                        reply,
                    } => {
                        let result = decode_image(&image)
                            .and_then(|img| service.register(&img, &name, &description));
                        if let Err(e) = &result {
                            tracing::info!(name = %name, error = %e, "register rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize { image, reply } => {
                        let result = decode_image(&image).and_then(|img| service.recognize(&img));
                        if let Err(e) = &result {
                            tracing::info!(error = %e, "recognize rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Detect { image, reply } => {
                        let result = decode_image(&image).and_then(|img| service.detect(&img));
                        if let Err(e) = &result {
                            tracing::info!(error = %e, "detect rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::List { reply } => {
                        let _ = reply.send(service.list_identities());
                    }
                    EngineRequest::Delete { id, reply } => {
                        let _ = reply.send(service.delete_identity(id));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use likeness_core::detector::{crop_face, DetectorError};
    use likeness_core::{DetectedFace, Embedding, FaceOutcome};
    use std::io::Cursor;

    struct OneFace;

    impl Detector for OneFace {
        fn detect(&mut self, image: &image::RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
            let bbox = BoundingBox { x1: 0.0, y1: 0.0, x2: 4.0, y2: 4.0, confidence: 0.9 };
            Ok(vec![crop_face(image, bbox)])
        }
    }

    struct Constant;

    impl Embedder for Constant {
        fn embed(&mut self, _face: &image::RgbImage) -> Option<Embedding> {
            Some(Embedding::new(vec![0.5, 0.5]))
        }
    }

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([90, 90, 90]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn engine(dir: &tempfile::TempDir) -> EngineHandle {
        let store = Arc::new(IdentityStore::load(dir.path().join("faces.json"), 2).unwrap());
        spawn_service(RecognitionService::new(OneFace, Constant, store, 0.4)).unwrap()
    }

    #[tokio::test]
    async fn test_register_recognize_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(&dir);

        let reg = engine
            .register(png(), "alice".into(), "lab".into())
            .await
            .unwrap();
        assert_eq!(reg.id, 1);

        let results = engine.recognize(png()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].outcome,
            FaceOutcome::Matched { id: 1, .. }
        ));

        let listed = engine.list().await.unwrap();
        assert_eq!(listed[0].description, "lab");

        engine.delete(1).await.unwrap();
        assert!(matches!(
            engine.delete(1).await,
            Err(EngineError::Service(ServiceError::NotFound(1)))
        ));
    }

    #[tokio::test]
    async fn test_detect_leaves_store_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(&dir);

        let boxes = engine.detect(png()).await.unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].x2, 4.0);
        assert!(engine.list().await.unwrap().is_empty());
        assert!(!dir.path().join("faces.json").exists());

        assert!(matches!(
            engine.detect(Vec::new()).await,
            Err(EngineError::Service(ServiceError::InvalidInput(_)))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_image_is_invalid_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(matches!(
            engine.recognize(vec![1, 2, 3]).await,
            Err(EngineError::Service(ServiceError::InvalidInput(_)))
        ));
    }
}
