//! likeness-core — Face identity store and recognition engine.
//!
//! Keeps named face embeddings in a JSON-backed store, matches probe
//! embeddings by Euclidean distance, and orchestrates the detector and
//! embedding models (ONNX Runtime) for registration and recognition.

pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod service;
pub mod store;
pub mod types;

pub use detector::FaceDetector;
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_SIMILARITY_THRESHOLD, DISTANCE_SCALE};
pub use recognizer::FaceRecognizer;
pub use service::{decode_image, FaceOutcome, FaceRecognition, RecognitionService, Registration, ServiceError};
pub use store::{IdentityStore, StoreError};
pub use types::{BoundingBox, DetectedFace, Detector, Embedder, Embedding, IdentityRecord, IdentitySummary};
