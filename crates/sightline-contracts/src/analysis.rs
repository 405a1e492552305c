use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::now_utc_iso;
use crate::validation::ValidatedImage;

/// Which backend services a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Local,
    Cloud,
}

impl AnalysisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(format!("unknown analysis mode '{other}' (expected local or cloud)")),
        }
    }
}

/// Immutable input to routing. Only constructible from a [`ValidatedImage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub image_path: PathBuf,
    pub mime_type: String,
    pub file_size: u64,
    pub model_identifier: String,
    pub confidence_threshold: f64,
    pub mode: AnalysisMode,
    pub working_directory: PathBuf,
}

impl AnalysisRequest {
    pub fn new(
        image: &ValidatedImage,
        model_identifier: impl Into<String>,
        confidence_threshold: f64,
        mode: AnalysisMode,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        let confidence_threshold = if confidence_threshold.is_finite() {
            confidence_threshold.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            image_path: image.path.clone(),
            mime_type: image.mime_type.clone(),
            file_size: image.file_size,
            model_identifier: model_identifier.into(),
            confidence_threshold,
            mode,
            working_directory: working_directory.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn is_valid(&self) -> bool {
        self.width >= 1 && self.height >= 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionLabel {
    pub label: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

impl DetectionLabel {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
            bounding_box: None,
        }
    }

    pub fn with_box(mut self, bounding_box: BoundingBox) -> Self {
        self.bounding_box = Some(bounding_box);
        self
    }
}

/// Normalized output of either backend.
///
/// Labels keep the order the backend reported them in. `image_path` is empty on
/// results coming straight out of the cloud adapter; the router fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    pub image_path: PathBuf,
    pub timestamp: String,
    pub model_identifier: String,
    pub mode: AnalysisMode,
    pub duration_millis: u64,
    #[serde(default)]
    pub labels: Vec<DetectionLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
}

impl AnalysisResult {
    pub fn new(mode: AnalysisMode, model_identifier: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            image_path: PathBuf::new(),
            timestamp: now_utc_iso(),
            model_identifier: model_identifier.into(),
            mode,
            duration_millis: 0,
            labels: Vec::new(),
            ocr_text: None,
            raw_response: None,
        }
    }

    pub fn with_image_path(mut self, image_path: impl AsRef<Path>) -> Self {
        self.image_path = image_path.as_ref().to_path_buf();
        self
    }

    /// Copy of this result without labels scoring below `threshold`.
    pub fn retain_confident(&self, threshold: f64) -> Self {
        let mut next = self.clone();
        next.labels.retain(|label| label.confidence >= threshold);
        next
    }
}
