use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE_NAME: &str = "plugin.json";
pub const DEFAULT_ENTRY: &str = "index";

/// Descriptor read from `plugin.json` inside a plugin directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_entry")]
    pub main: String,
    /// Program used to run `main`, e.g. `sh` or `python3`. When absent the entry
    /// file itself must be executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

impl PluginManifest {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let manifest: Self = serde_json::from_str(raw)?;
        Ok(manifest)
    }

    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| anyhow::anyhow!("failed reading {}: {err}", path.display()))?;
        Self::from_json(&raw)
            .map_err(|err| anyhow::anyhow!("invalid manifest {}: {err}", path.display()))
    }

    /// Structural contract shared with in-memory plugins plus entry path hygiene.
    pub fn validate(&self) -> Result<(), String> {
        validate_identity(&self.id, &self.name, &self.version)?;
        let main = self.main.trim();
        if main.is_empty() {
            return Err(format!("plugin '{}' declares an empty entry point", self.id));
        }
        let escapes = Path::new(main)
            .components()
            .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(format!(
                "plugin '{}' entry point '{}' must stay inside the plugin directory",
                self.id, self.main
            ));
        }
        Ok(())
    }
}

/// Non-empty id, name and version: the minimum every registered plugin carries.
pub fn validate_identity(id: &str, name: &str, version: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("plugin id must not be empty".to_string());
    }
    if name.trim().is_empty() {
        return Err(format!("plugin '{id}' has an empty name"));
    }
    if version.trim().is_empty() {
        return Err(format!("plugin '{id}' has an empty version"));
    }
    Ok(())
}

fn default_entry() -> String {
    DEFAULT_ENTRY.to_string()
}

/// One row per attempted plugin in a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginExecutionLogEntry {
    pub plugin_identifier: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub duration_millis: u64,
}

impl PluginExecutionLogEntry {
    pub fn succeeded(plugin_identifier: impl Into<String>, duration_millis: u64) -> Self {
        Self {
            plugin_identifier: plugin_identifier.into(),
            success: true,
            error: None,
            stack_trace: None,
            duration_millis,
        }
    }

    pub fn failed(
        plugin_identifier: impl Into<String>,
        error: impl Into<String>,
        stack_trace: Option<String>,
        duration_millis: u64,
    ) -> Self {
        Self {
            plugin_identifier: plugin_identifier.into(),
            success: false,
            error: Some(error.into()),
            stack_trace,
            duration_millis,
        }
    }

    pub fn not_found(plugin_identifier: impl Into<String>) -> Self {
        Self::failed(plugin_identifier, "not found", None, 0)
    }
}
