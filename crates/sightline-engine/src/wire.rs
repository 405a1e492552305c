//! Response body shape shared by the cloud endpoint and the local engine:
//! `{"labels": [{"label", "confidence", "boundingBox"?}], "ocrText"?, "modelId"?}`
//! or a top-level `"error"`.

use serde_json::Value;
use sightline_contracts::{AnalysisMode, AnalysisResult, BoundingBox, DetectionLabel};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireAnalysis {
    pub labels: Vec<DetectionLabel>,
    pub ocr_text: Option<String>,
    pub model_id: Option<String>,
}

impl WireAnalysis {
    pub fn into_result(self, mode: AnalysisMode, fallback_model: &str) -> AnalysisResult {
        let model = self
            .model_id
            .unwrap_or_else(|| fallback_model.to_string());
        let mut result = AnalysisResult::new(mode, model);
        result.labels = self.labels;
        result.ocr_text = self.ocr_text;
        result
    }
}

/// Message carried by a top-level `error` field, if one is present and non-null.
pub(crate) fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    match error {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        ),
        other => Some(other.to_string()),
    }
}

pub(crate) fn parse_analysis(body: &Value) -> Result<WireAnalysis, String> {
    let Some(object) = body.as_object() else {
        return Err("response body is not a JSON object".to_string());
    };
    let labels = object
        .get("labels")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(parse_label).collect())
        .unwrap_or_default();
    let ocr_text = object
        .get("ocrText")
        .and_then(Value::as_str)
        .map(str::to_string);
    let model_id = object
        .get("modelId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    Ok(WireAnalysis {
        labels,
        ocr_text,
        model_id,
    })
}

fn parse_label(row: &Value) -> Option<DetectionLabel> {
    let label = row.get("label").and_then(Value::as_str)?;
    let confidence = row
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let mut parsed = DetectionLabel::new(label, confidence);
    parsed.bounding_box = row.get("boundingBox").and_then(parse_box);
    Some(parsed)
}

fn parse_box(raw: &Value) -> Option<BoundingBox> {
    let field = |key: &str| {
        raw.get(key)
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
    };
    let bounding_box = BoundingBox {
        x: field("x")?,
        y: field("y")?,
        width: field("width")?,
        height: field("height")?,
    };
    bounding_box.is_valid().then_some(bounding_box)
}
