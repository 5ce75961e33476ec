use facetrack_core::TrackerOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Euclidean tolerance for the L2-normalized ArcFace embeddings the daemon
/// produces. Equivalent to cosine similarity >= 0.40 (`d = sqrt(2 - 2cos)`).
pub const ARCFACE_TOLERANCE: f32 = 1.1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `FACETRACK_CONFIG`
/// (or `$XDG_CONFIG_HOME/facetrack/facetrackd.toml` if present), then
/// `FACETRACK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Identity storage: catalog plus one folder per identity.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance for a match.
    pub tolerance: f32,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Write the catalog after every edit instead of only at shutdown.
    pub persist_on_edit: bool,
    pub draw_landmarks: bool,
}

/// On-disk form of [`Config`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    data_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    tolerance: Option<f32>,
    warmup_frames: Option<usize>,
    persist_on_edit: Option<bool>,
    draw_landmarks: Option<bool>,
}

fn xdg_dir(var: &str, fallback: &str, lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup(var).map(PathBuf::from).unwrap_or_else(|| {
        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

impl Config {
    /// Defaults derived from the XDG base directories.
    fn defaults(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let share = xdg_dir("XDG_DATA_HOME", ".local/share", lookup).join("facetrack");
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            data_dir: share.join("face_data"),
            model_dir: share.join("models"),
            tolerance: ARCFACE_TOLERANCE,
            warmup_frames: 4,
            persist_on_edit: true,
            draw_landmarks: false,
        }
    }

    /// Load from the process environment and the optional config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&lookup);

        let explicit = lookup("FACETRACK_CONFIG").map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| xdg_dir("XDG_CONFIG_HOME", ".config", &lookup).join("facetrack/facetrackd.toml"));
        if explicit.is_some() || path.is_file() {
            config.apply_file(&path)?;
            tracing::info!(path = %path.display(), "config file loaded");
        }

        config.apply_env(&lookup);
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.frame_width {
            self.frame_width = v;
        }
        if let Some(v) = file.frame_height {
            self.frame_height = v;
        }
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.tolerance {
            self.tolerance = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.persist_on_edit {
            self.persist_on_edit = v;
        }
        if let Some(v) = file.draw_landmarks {
            self.draw_landmarks = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACETRACK_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        self.frame_width = env_parse(lookup, "FACETRACK_FRAME_WIDTH", self.frame_width);
        self.frame_height = env_parse(lookup, "FACETRACK_FRAME_HEIGHT", self.frame_height);
        if let Some(v) = lookup("FACETRACK_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACETRACK_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        self.tolerance = env_parse(lookup, "FACETRACK_TOLERANCE", self.tolerance);
        self.warmup_frames = env_parse(lookup, "FACETRACK_WARMUP_FRAMES", self.warmup_frames);
        self.persist_on_edit = env_flag(lookup, "FACETRACK_PERSIST_ON_EDIT", self.persist_on_edit);
        self.draw_landmarks = env_flag(lookup, "FACETRACK_DRAW_LANDMARKS", self.draw_landmarks);
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            tolerance: self.tolerance,
            persist_on_edit: self.persist_on_edit,
            draw_landmarks: self.draw_landmarks,
        }
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable value");
                current
            }
        },
        None => current,
    }
}

fn env_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: bool) -> bool {
    lookup(key).map(|v| v != "0").unwrap_or(current)
}
