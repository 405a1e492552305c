use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde_json::Value;
use sightline_contracts::config::{LocalConfigUpdate, LocalEngineConfig};
use sightline_contracts::{AnalysisError, AnalysisMode, AnalysisResult, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::wire::{error_message, parse_analysis};
use crate::{elapsed_millis, truncate_text};

const STDERR_SNIPPET_CHARS: usize = 400;

/// Runs the on-device analysis binary once per request:
/// `<command> --image <path> --model <id> --output json`.
pub struct LocalEngineAdapter {
    config: RwLock<Arc<LocalEngineConfig>>,
}

impl Default for LocalEngineAdapter {
    fn default() -> Self {
        Self::new(LocalEngineConfig::default())
    }
}

impl LocalEngineAdapter {
    pub fn new(config: LocalEngineConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn config(&self) -> Arc<LocalEngineConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config(&self, update: &LocalConfigUpdate) {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let next = guard.updated(update);
        *guard = Arc::new(next);
    }

    /// True when `<command> --version` exits 0 within the version timeout.
    pub async fn is_available(&self) -> bool {
        let config = self.config();
        let Ok((program, leading)) = config.command_line() else {
            return false;
        };
        let mut command = Command::new(&program);
        command
            .args(&leading)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                debug!(program = %program, "local engine not spawnable: {err}");
                return false;
            }
        };
        match tokio::time::timeout(config.version_timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(err)) => {
                debug!("local engine version check failed: {err}");
                false
            }
            Err(_) => {
                debug!("local engine version check timed out");
                let _ = child.start_kill();
                let _ = child.wait().await;
                false
            }
        }
    }

    pub async fn analyze(
        &self,
        image_path: &Path,
        model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        if !image_path.is_file() {
            return Err(AnalysisError::file_not_found(image_path).with_model(model_identifier));
        }
        let config = self.config();
        let engine_failure = |message: String| {
            AnalysisError::new(ErrorKind::LocalEngineNotFound, message)
                .with_model(model_identifier)
                .non_retryable()
        };
        let (program, leading) = config.command_line().map_err(engine_failure)?;

        let started = Instant::now();
        let mut command = Command::new(&program);
        command
            .args(&leading)
            .arg("--image")
            .arg(image_path)
            .arg("--model")
            .arg(model_identifier)
            .arg("--output")
            .arg("json")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(program = %program, image = %image_path.display(), model = model_identifier, "spawning local engine");
        let mut child = command
            .spawn()
            .map_err(|err| engine_failure(format!("failed to start local engine '{program}': {err}")))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let finished = tokio::time::timeout(config.timeout, async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), read_pipe(stdout_pipe), read_pipe(stderr_pipe));
            status.map(|status| (status, stdout, stderr))
        })
        .await;

        // The deadline covers output collection, not just exit.
        let (status, stdout, stderr) = match finished {
            Ok(Ok(collected)) => collected,
            Ok(Err(err)) => {
                return Err(engine_failure(format!("failed waiting for local engine: {err}")));
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(AnalysisError::new(
                    ErrorKind::LocalEngineTimeout,
                    format!(
                        "local engine did not finish within {}ms and was stopped",
                        config.timeout.as_millis()
                    ),
                )
                .with_model(model_identifier));
            }
        };

        if !status.success() {
            let code = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "a signal".to_string());
            let stderr = String::from_utf8_lossy(&stderr);
            let stderr = truncate_text(stderr.trim(), STDERR_SNIPPET_CHARS);
            let message = if stderr.is_empty() {
                format!("local engine exited with code {code}")
            } else {
                format!("local engine exited with code {code}: {stderr}")
            };
            return Err(engine_failure(message));
        }

        let parsed: Value = serde_json::from_slice(&stdout)
            .map_err(|err| engine_failure(format!("local engine printed invalid JSON: {err}")))?;
        if let Some(message) = error_message(&parsed) {
            return Err(engine_failure(format!("local engine reported an error: {message}")));
        }
        let wire = parse_analysis(&parsed).map_err(engine_failure)?;
        let mut result = wire
            .into_result(AnalysisMode::Local, model_identifier)
            .with_image_path(image_path);
        result.duration_millis = elapsed_millis(started);
        debug!(labels = result.labels.len(), duration_ms = result.duration_millis, "local engine finished");
        Ok(result)
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(err) = pipe.read_to_end(&mut buffer).await {
            debug!("failed reading local engine output: {err}");
        }
    }
    buffer
}
