use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    FileNotFound,
    EndpointUnreachable,
    #[serde(rename = "ENDPOINT_ERROR_4XX")]
    EndpointError4xx,
    #[serde(rename = "ENDPOINT_ERROR_5XX")]
    EndpointError5xx,
    LocalEngineNotFound,
    LocalEngineTimeout,
    PluginExecutionError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::FileNotFound,
        ErrorKind::EndpointUnreachable,
        ErrorKind::EndpointError4xx,
        ErrorKind::EndpointError5xx,
        ErrorKind::LocalEngineNotFound,
        ErrorKind::LocalEngineTimeout,
        ErrorKind::PluginExecutionError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::EndpointUnreachable => "ENDPOINT_UNREACHABLE",
            Self::EndpointError4xx => "ENDPOINT_ERROR_4XX",
            Self::EndpointError5xx => "ENDPOINT_ERROR_5XX",
            Self::LocalEngineNotFound => "LOCAL_ENGINE_NOT_FOUND",
            Self::LocalEngineTimeout => "LOCAL_ENGINE_TIMEOUT",
            Self::PluginExecutionError => "PLUGIN_EXECUTION_ERROR",
        }
    }

    /// Policy default. Only the cloud adapter acts on it automatically.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::EndpointError5xx | Self::EndpointUnreachable | Self::LocalEngineTimeout
        )
    }

    pub fn recovery_hint(self) -> &'static str {
        match self {
            Self::FileNotFound => "Check that the image path exists and is readable.",
            Self::EndpointUnreachable => {
                "Check network connectivity and the configured endpoint URL, then try again."
            }
            Self::EndpointError4xx => {
                "The endpoint rejected the request; verify the endpoint URL, model identifier and image payload."
            }
            Self::EndpointError5xx => {
                "The endpoint failed while processing the request; try again later."
            }
            Self::LocalEngineNotFound => {
                "Install the local analysis engine or fix the configured engine command."
            }
            Self::LocalEngineTimeout => {
                "The local engine did not finish in time; raise the timeout or try a smaller image."
            }
            Self::PluginExecutionError => {
                "Inspect the plugin execution log and fix or disable the failing plugin."
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of a failed analysis operation. Never a partial success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct AnalysisError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "ErrorDetails::is_empty")]
    pub details: ErrorDetails,
    pub recovery_hint: String,
    pub retryable: bool,
}

impl AnalysisError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: ErrorDetails::default(),
            recovery_hint: kind.recovery_hint().to_string(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn file_not_found(path: &std::path::Path) -> Self {
        Self::new(
            ErrorKind::FileNotFound,
            format!("image file not found: {}", path.display()),
        )
    }

    /// Records the endpoint with its query string removed.
    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.details.endpoint_url = Some(strip_query(url));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.details.http_status = Some(status);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.details.model_identifier = Some(model.into());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.details.plugin_identifier = Some(plugin.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.details.stack_trace = Some(stack.into());
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

fn strip_query(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_string()
}
