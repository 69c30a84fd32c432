use serde::Deserialize;
use std::path::{Path, PathBuf};

use likeness_core::detector::DEFAULT_CONFIDENCE_THRESHOLD;
use likeness_core::recognizer::DEFAULT_EMBEDDING_DIM;
use likeness_core::DEFAULT_SIMILARITY_THRESHOLD;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Session,
    System,
}

/// Optional `likenessd.toml`. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    embedding_dim: Option<usize>,
    detector_confidence: Option<f32>,
    bus: Option<Bus>,
}

/// Daemon configuration: TOML file values overridden by `LIKENESS_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the identity store JSON document.
    pub store_path: PathBuf,
    /// Minimum similarity for a positive match.
    pub similarity_threshold: f32,
    /// Embedding length produced by the embedding model.
    pub embedding_dim: usize,
    /// Minimum detector score for a face.
    pub detector_confidence: f32,
    pub bus: Bus,
}

impl Config {
    /// Load `$LIKENESS_CONFIG` (or the XDG default) and apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("LIKENESS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| xdg_dir("XDG_CONFIG_HOME", ".config").join("likenessd.toml"));
        let file = read_file_config(&path)?;
        Self::from_parts(file, |key| std::env::var(key).ok())
    }

    fn from_parts(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_dir = xdg_dir("XDG_DATA_HOME", ".local/share");

        let model_dir = env("LIKENESS_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let store_path = env("LIKENESS_STORE_PATH")
            .map(PathBuf::from)
            .or(file.store_path)
            .unwrap_or_else(|| data_dir.join("faces.json"));

        let bus = match env("LIKENESS_BUS").as_deref() {
            Some("system") => Bus::System,
            Some("session") => Bus::Session,
            Some(other) => {
                tracing::warn!(value = other, "unknown LIKENESS_BUS; using the configured bus");
                file.bus.unwrap_or(Bus::Session)
            }
            None => file.bus.unwrap_or(Bus::Session),
        };

        let similarity_threshold = env_parse(&env, "LIKENESS_SIMILARITY_THRESHOLD")
            .or(file.similarity_threshold)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        if !(0.0..=1.0).contains(&similarity_threshold) {
            anyhow::bail!("similarity threshold must be within [0, 1], got {similarity_threshold}");
        }

        Ok(Self {
            model_dir,
            store_path,
            similarity_threshold,
            embedding_dim: env_parse(&env, "LIKENESS_EMBEDDING_DIM")
                .or(file.embedding_dim)
                .unwrap_or(DEFAULT_EMBEDDING_DIM),
            detector_confidence: env_parse(&env, "LIKENESS_DETECTOR_CONFIDENCE")
                .or(file.detector_confidence)
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            bus,
        })
    }

    /// Path to the YOLO face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("face_detector.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("face_embedding.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let file = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded config file");
            Ok(file)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => Err(anyhow::anyhow!("failed to read config {}: {e}", path.display())),
    }
}

/// `$<var>/likeness`, falling back to `$HOME/<fallback>/likeness`.
fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(fallback)
        })
        .join("likeness")
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
