use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use sightline_contracts::plugins::{PluginManifest, MANIFEST_FILE_NAME};
use sightline_contracts::AnalysisResult;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Plugin, PluginDiscovery, PluginSource};
use crate::truncate_text;

/// Scans the immediate sub-directories of `root` (sorted by name) for
/// `plugin.json` manifests.
#[derive(Debug, Clone)]
pub struct DirectoryPluginSource {
    root: PathBuf,
}

impl DirectoryPluginSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PluginSource for DirectoryPluginSource {
    fn discover(&self) -> PluginDiscovery {
        let mut discovery = PluginDiscovery::default();
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "plugin directory does not exist");
            return discovery;
        }
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                discovery.reject(
                    &self.root.display().to_string(),
                    format!("failed reading plugin directory: {err}"),
                );
                return discovery;
            }
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let location = dir.display().to_string();
            match ProcessPlugin::load(&dir) {
                Ok(plugin) => discovery.register(Arc::new(plugin), &location),
                Err(reason) => discovery.reject(&location, reason),
            }
        }
        discovery
    }
}

/// Plugin backed by an executable in its own directory. The entry point is run
/// with `--image <path>`, reads the current result as JSON on stdin and prints
/// the new result as JSON on stdout.
#[derive(Debug, Clone)]
pub struct ProcessPlugin {
    manifest: PluginManifest,
    dir: PathBuf,
    entry: PathBuf,
    interpreter: Vec<String>,
}

impl ProcessPlugin {
    pub fn load(dir: &Path) -> Result<Self, String> {
        if !dir.join(MANIFEST_FILE_NAME).is_file() {
            return Err(format!("missing {MANIFEST_FILE_NAME}"));
        }
        let manifest = PluginManifest::load(dir).map_err(|err| format!("{err:#}"))?;
        manifest.validate()?;
        let entry = dir.join(manifest.main.trim());
        if !entry.is_file() {
            return Err(format!(
                "plugin '{}' entry point {} does not exist",
                manifest.id,
                entry.display()
            ));
        }
        let interpreter = match manifest.interpreter.as_deref() {
            Some(raw) => shell_words::split(raw).map_err(|err| {
                format!("plugin '{}' interpreter is not parseable: {err}", manifest.id)
            })?,
            None => Vec::new(),
        };
        if interpreter.is_empty() && !is_executable(&entry) {
            return Err(format!(
                "plugin '{}' entry point is not executable and no interpreter is declared",
                manifest.id
            ));
        }
        Ok(Self {
            manifest,
            dir: dir.to_path_buf(),
            entry,
            interpreter,
        })
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn command(&self) -> Command {
        let mut command = match self.interpreter.split_first() {
            Some((program, leading)) => {
                let mut command = Command::new(program);
                command.args(leading).arg(&self.entry);
                command
            }
            None => Command::new(&self.entry),
        };
        command.current_dir(&self.dir);
        command
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    fn id(&self) -> &str {
        &self.manifest.id
    }

    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn version(&self) -> &str {
        &self.manifest.version
    }

    async fn process(
        &self,
        image_path: &Path,
        result: &AnalysisResult,
    ) -> anyhow::Result<AnalysisResult> {
        let payload = serde_json::to_vec(result)?;
        let mut child = self
            .command()
            .arg("--image")
            .arg(image_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start plugin {}", self.entry.display()))?;

        // Feed stdin while stdout is drained.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                written => written,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("failed waiting for plugin process")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "plugin process exited with {}: {}",
                output.status,
                truncate_text(stderr.trim(), 400)
            );
        }
        fed.context("failed writing result to plugin stdin")?;
        let next: AnalysisResult = serde_json::from_slice(&output.stdout)
            .context("plugin did not print a valid analysis result")?;
        Ok(next)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
