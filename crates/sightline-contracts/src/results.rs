use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::analysis::{AnalysisMode, AnalysisResult};
use crate::now_utc_iso;
use crate::plugins::PluginExecutionLogEntry;

pub const RESULT_SCHEMA_VERSION: u64 = 1;

/// Request inputs a stored analysis was produced under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisInputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    /// Requested plugin ids, in execution order.
    #[serde(default)]
    pub plugin_ids: Vec<String>,
}

impl AnalysisInputs {
    pub fn new(image_sha256: impl Into<String>, confidence_threshold: f64, plugin_ids: &[String]) -> Self {
        Self {
            image_sha256: Some(image_sha256.into()),
            confidence_threshold: Some(confidence_threshold),
            plugin_ids: plugin_ids.to_vec(),
        }
    }

    fn same_run(&self, other: &Self) -> bool {
        let same_threshold = match (self.confidence_threshold, other.confidence_threshold) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-9,
            (None, None) => true,
            _ => false,
        };
        self.image_sha256 == other.image_sha256 && same_threshold && self.plugin_ids == other.plugin_ids
    }
}

/// Persisted form of a finished analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAnalysis {
    pub schema_version: u64,
    pub saved_at: String,
    #[serde(flatten)]
    pub inputs: AnalysisInputs,
    pub result: AnalysisResult,
    #[serde(default)]
    pub plugin_log: Vec<PluginExecutionLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSummary {
    pub id: String,
    pub timestamp: String,
    pub mode: AnalysisMode,
    pub model_identifier: String,
    pub image_path: PathBuf,
    pub label_count: usize,
    pub path: PathBuf,
}

/// Directory-backed history of analysis results, one JSON document per id.
#[derive(Debug, Clone)]
pub struct ResultsManager {
    root: PathBuf,
}

impl ResultsManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(
        &self,
        result: &AnalysisResult,
        plugin_log: &[PluginExecutionLogEntry],
        inputs: AnalysisInputs,
    ) -> anyhow::Result<PathBuf> {
        let path = self.path_for(&result.id)?;
        let mut stored_result = result.clone();
        stored_result.raw_response = stored_result.raw_response.as_ref().map(sanitize_payload);
        let record = StoredAnalysis {
            schema_version: RESULT_SCHEMA_VERSION,
            saved_at: now_utc_iso(),
            inputs,
            result: stored_result,
            plugin_log: plugin_log.to_vec(),
        };
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        Ok(path)
    }

    pub fn load(&self, id: &str) -> anyhow::Result<Option<StoredAnalysis>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Newest first. Files that fail to parse are skipped.
    pub fn list(&self) -> anyhow::Result<Vec<StoredSummary>> {
        let mut rows = self
            .records()?
            .into_iter()
            .map(|(path, record)| StoredSummary {
                id: record.result.id,
                timestamp: record.result.timestamp,
                mode: record.result.mode,
                model_identifier: record.result.model_identifier,
                image_path: record.result.image_path,
                label_count: record.result.labels.len(),
                path,
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }

    /// Most recent stored analysis of the same image bytes, produced with the same
    /// model, mode, threshold and plugin chain. Inputs without a digest never match.
    pub fn find_by_digest(
        &self,
        inputs: &AnalysisInputs,
        model_identifier: &str,
        mode: AnalysisMode,
    ) -> anyhow::Result<Option<StoredAnalysis>> {
        if inputs.image_sha256.is_none() {
            return Ok(None);
        }
        let best = self
            .records()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| {
                record.inputs.same_run(inputs)
                    && record.result.model_identifier == model_identifier
                    && record.result.mode == mode
            })
            .max_by(|a, b| a.result.timestamp.cmp(&b.result.timestamp));
        Ok(best)
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    /// Removes every stored result and returns how many were removed.
    pub fn clear(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for path in self.record_paths()? {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn path_for(&self, id: &str) -> anyhow::Result<PathBuf> {
        let trimmed = id.trim();
        let valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            anyhow::bail!("invalid result id '{id}'");
        }
        Ok(self.root.join(format!("{trimmed}.json")))
    }

    fn record_paths(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn records(&self) -> anyhow::Result<Vec<(PathBuf, StoredAnalysis)>> {
        let mut out = Vec::new();
        for path in self.record_paths()? {
            match read_record(&path) {
                Ok(record) => out.push((path, record)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable result: {err:#}")
                }
            }
        }
        Ok(out)
    }
}

/// Hex SHA-256 of a file's bytes.
pub fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|err| anyhow::anyhow!("failed reading {}: {err}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn read_record(path: &Path) -> anyhow::Result<StoredAnalysis> {
    let raw = std::fs::read_to_string(path)?;
    let record: StoredAnalysis = serde_json::from_str(&raw)?;
    Ok(record)
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "image_bytes" | "data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{file_sha256, AnalysisInputs, ResultsManager};
    use crate::analysis::{AnalysisMode, AnalysisResult, BoundingBox, DetectionLabel};
    use crate::plugins::PluginExecutionLogEntry;

    fn sample_result(ocr: &str) -> AnalysisResult {
        let mut result = AnalysisResult::new(AnalysisMode::Cloud, "vision-large")
            .with_image_path("/photos/straße.png");
        result.labels = vec![
            DetectionLabel::new("Straßenschild", 0.875).with_box(BoundingBox {
                x: 0,
                y: 12,
                width: 64,
                height: 1,
            }),
            DetectionLabel::new("自転車", 0.3125),
        ];
        result.ocr_text = Some(ocr.to_string());
        result.duration_millis = 42;
        result
    }

    #[test]
    fn round_trip_preserves_result_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path().join("results"));
        let result = sample_result("Ausfahrt freihalten: 出口 ✓");
        let log = vec![PluginExecutionLogEntry::succeeded("label-normalize", 1)];

        let inputs = AnalysisInputs::new("abc", 0.25, &["label-normalize".to_string()]);
        let path = store.save(&result, &log, inputs.clone())?;
        assert!(path.ends_with(format!("{}.json", result.id)));

        let loaded = store.load(&result.id)?.expect("stored result");
        assert_eq!(loaded.result.id, result.id);
        assert_eq!(loaded.result.timestamp, result.timestamp);
        assert_eq!(loaded.result.labels, result.labels);
        assert_eq!(loaded.result.ocr_text, result.ocr_text);
        assert_eq!(loaded.result, result);
        assert_eq!(loaded.plugin_log, log);
        assert_eq!(loaded.inputs, inputs);
        Ok(())
    }

    #[test]
    fn raw_image_payloads_are_omitted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path());
        let mut result = sample_result("x");
        result.raw_response = Some(json!({"labels": [], "debug": {"image": "aGVsbG8="}}));
        store.save(&result, &[], AnalysisInputs::default())?;

        let loaded = store.load(&result.id)?.expect("stored result");
        assert_eq!(
            loaded.result.raw_response,
            Some(json!({"labels": [], "debug": {"image": "<omitted>"}}))
        );
        Ok(())
    }

    #[test]
    fn list_is_newest_first_and_skips_garbage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path());
        let mut older = sample_result("a");
        older.timestamp = "2026-01-01T00:00:00.000000+00:00".to_string();
        let mut newer = sample_result("b");
        newer.timestamp = "2026-03-01T00:00:00.000000+00:00".to_string();
        store.save(&older, &[], AnalysisInputs::default())?;
        store.save(&newer, &[], AnalysisInputs::default())?;
        std::fs::write(temp.path().join("broken.json"), "{not json")?;

        let rows = store.list()?;
        let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
        assert_eq!(rows[0].label_count, 2);
        Ok(())
    }

    #[test]
    fn find_by_digest_matches_model_and_mode() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path());
        let result = sample_result("a");
        let inputs = AnalysisInputs::new("d1", 0.5, &[]);
        store.save(&result, &[], inputs.clone())?;

        let hit = store.find_by_digest(&inputs, "vision-large", AnalysisMode::Cloud)?;
        assert_eq!(hit.map(|record| record.result.id), Some(result.id.clone()));
        assert!(store
            .find_by_digest(&inputs, "vision-large", AnalysisMode::Local)?
            .is_none());
        assert!(store
            .find_by_digest(&AnalysisInputs::new("d2", 0.5, &[]), "vision-large", AnalysisMode::Cloud)?
            .is_none());
        assert!(store
            .find_by_digest(&AnalysisInputs::default(), "vision-large", AnalysisMode::Cloud)?
            .is_none());
        Ok(())
    }

    #[test]
    fn find_by_digest_requires_same_threshold_and_plugin_chain() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path());
        let chain = vec!["label-normalize".to_string(), "ocr-whitespace".to_string()];
        store.save(&sample_result("a"), &[], AnalysisInputs::new("d1", 0.3, &chain))?;

        let find = |inputs: AnalysisInputs| {
            store.find_by_digest(&inputs, "vision-large", AnalysisMode::Cloud)
        };
        assert!(find(AnalysisInputs::new("d1", 0.3, &chain))?.is_some());
        assert!(find(AnalysisInputs::new("d1", 0.9, &chain))?.is_none());
        assert!(find(AnalysisInputs::new("d1", 0.3, &[]))?.is_none());
        let reversed: Vec<String> = chain.iter().rev().cloned().collect();
        assert!(find(AnalysisInputs::new("d1", 0.3, &reversed))?.is_none());
        Ok(())
    }

    #[test]
    fn records_without_run_inputs_still_load() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path());
        let result = sample_result("a");
        let legacy = json!({
            "schemaVersion": 1,
            "savedAt": "2026-01-01T00:00:00.000000+00:00",
            "imageSha256": "d1",
            "result": result,
        });
        std::fs::write(
            temp.path().join(format!("{}.json", result.id)),
            serde_json::to_string(&legacy)?,
        )?;

        let loaded = store.load(&result.id)?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(loaded.inputs.image_sha256.as_deref(), Some("d1"));
        assert_eq!(loaded.inputs.confidence_threshold, None);
        assert!(store
            .find_by_digest(&AnalysisInputs::new("d1", 0.0, &[]), "vision-large", AnalysisMode::Cloud)?
            .is_none());
        Ok(())
    }

    #[test]
    fn delete_and_clear_remove_history() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path().join("results"));
        assert_eq!(store.clear()?, 0);

        let first = sample_result("a");
        let second = sample_result("b");
        store.save(&first, &[], AnalysisInputs::default())?;
        store.save(&second, &[], AnalysisInputs::default())?;

        assert!(store.delete(&first.id)?);
        assert!(!store.delete(&first.id)?);
        assert!(store.load(&first.id)?.is_none());
        assert_eq!(store.clear()?, 1);
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn ids_cannot_escape_the_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ResultsManager::new(temp.path());
        assert!(store.load("../secrets").is_err());
        assert!(store.delete("a/b").is_err());
        Ok(())
    }

    #[test]
    fn file_digest_is_stable_hex() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("bytes.bin");
        std::fs::write(&path, b"abc")?;
        assert_eq!(
            file_sha256(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }
}
