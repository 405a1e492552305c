use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use sightline_contracts::config::{CloudConfigUpdate, CloudEndpointConfig};
use sightline_contracts::{AnalysisError, AnalysisMode, AnalysisResult, ErrorKind};
use tracing::{debug, warn};

use crate::wire::{error_message, parse_analysis};
use crate::{elapsed_millis, truncate_text};

/// Query keys that look like credentials. Matched case-sensitively, any value.
pub const SENSITIVE_QUERY_KEYS: [&str; 8] = [
    "token",
    "api_key",
    "apikey",
    "key",
    "secret",
    "auth",
    "password",
    "access_token",
];

const BODY_SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to endpoint: {0}")]
    Connect(String),
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Other(String),
}

/// HTTP seam in front of the cloud adapter.
#[async_trait]
pub trait EndpointTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;

    /// Body-less reachability request; returns the HTTP status.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, TransportError>;
}

/// Production transport: TLS 1.2 or newer, https only, redirects never followed.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .https_only(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build HTTPS client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl EndpointTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| classify_transport_error(err, timeout))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport_error(err, timeout))?;
        Ok(TransportResponse { status, body })
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, TransportError> {
        let response = self
            .http
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_transport_error(err, timeout))?;
        Ok(response.status().as_u16())
    }
}

fn classify_transport_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// Rejects anything but plain `https` endpoints without credential-like query keys.
/// Runs before any network I/O.
pub fn check_endpoint_security(endpoint_url: &str) -> Result<Url, AnalysisError> {
    let insecure = |message: String| {
        AnalysisError::new(ErrorKind::EndpointError4xx, message)
            .with_endpoint(endpoint_url)
            .non_retryable()
    };
    let trimmed = endpoint_url.trim();
    if trimmed.is_empty() {
        return Err(insecure("no cloud endpoint is configured".to_string()));
    }
    let url = Url::parse(trimmed)
        .map_err(|err| insecure(format!("endpoint URL is not valid: {err}")))?;
    if url.scheme() != "https" {
        return Err(insecure(format!(
            "endpoint must use https, got '{}'",
            url.scheme()
        )));
    }
    if let Some((key, _)) = url
        .query_pairs()
        .find(|(key, _)| SENSITIVE_QUERY_KEYS.contains(&key.as_ref()))
    {
        return Err(insecure(format!(
            "endpoint URL carries credential query parameter '{key}'; credentials must not travel in the URL"
        )));
    }
    Ok(url)
}

/// Sends base64 image payloads to the configured HTTPS endpoint with bounded
/// retries for transient failures.
pub struct CloudEndpointAdapter {
    config: RwLock<Arc<CloudEndpointConfig>>,
    transport: Arc<dyn EndpointTransport>,
}

impl CloudEndpointAdapter {
    pub fn new(config: CloudEndpointConfig) -> anyhow::Result<Self> {
        Ok(Self::with_transport(config, Arc::new(ReqwestTransport::new()?)))
    }

    pub fn with_transport(config: CloudEndpointConfig, transport: Arc<dyn EndpointTransport>) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            transport,
        }
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Arc<CloudEndpointConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls already in flight keep the snapshot they started with.
    pub fn update_config(&self, update: &CloudConfigUpdate) {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let next = guard.updated(update);
        *guard = Arc::new(next);
    }

    pub async fn is_available(&self) -> bool {
        let config = self.config();
        if let Err(err) = check_endpoint_security(&config.endpoint_url) {
            debug!(reason = %err.message, "cloud endpoint unavailable");
            return false;
        }
        let probe = self
            .transport
            .probe(&config.endpoint_url, config.probe_timeout);
        match tokio::time::timeout(config.probe_timeout, probe).await {
            Ok(Ok(status)) => {
                debug!(status, "cloud endpoint probe answered");
                status < 500
            }
            Ok(Err(err)) => {
                debug!("cloud endpoint probe failed: {err}");
                false
            }
            Err(_) => {
                debug!("cloud endpoint probe timed out");
                false
            }
        }
    }

    pub async fn analyze(
        &self,
        image_data: &str,
        model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        let config = self.config();
        check_endpoint_security(&config.endpoint_url)
            .map_err(|err| err.with_model(model_identifier))?;

        let body = json!({
            "image": image_data,
            "modelId": model_identifier,
        });
        let max_attempts = config.retry.max_attempts();
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(attempt, max_attempts, model = model_identifier, "posting analysis request");
            let err = match self
                .attempt_once(&config, &body, model_identifier, started)
                .await
            {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            if !err.retryable || !config.retry.should_retry(err.kind) {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempt, kind = %err.kind, "cloud analysis retries exhausted");
                let message = format!("{} (failed after {attempt} attempts)", err.message);
                return Err(AnalysisError { message, ..err }.non_retryable());
            }
            let delay = config.retry.backoff_for((attempt - 1) as usize);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind,
                "retrying cloud analysis after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_once(
        &self,
        config: &CloudEndpointConfig,
        body: &Value,
        model_identifier: &str,
        started: Instant,
    ) -> Result<AnalysisResult, AnalysisError> {
        let endpoint = config.endpoint_url.as_str();
        let response = self
            .transport
            .post_json(endpoint, body, config.request_timeout)
            .await
            .map_err(|err| transport_failure(&err, endpoint, model_identifier))?;
        let status = response.status;
        let failure = |kind: ErrorKind, message: String| {
            AnalysisError::new(kind, message)
                .with_endpoint(endpoint)
                .with_status(status)
                .with_model(model_identifier)
        };

        match status {
            200..=299 => {
                let parsed: Value = serde_json::from_str(&response.body).map_err(|err| {
                    failure(
                        ErrorKind::EndpointError5xx,
                        format!("endpoint returned invalid JSON: {err}"),
                    )
                    .non_retryable()
                })?;
                if let Some(message) = error_message(&parsed) {
                    return Err(failure(
                        ErrorKind::EndpointError4xx,
                        format!("endpoint reported an error: {message}"),
                    )
                    .non_retryable());
                }
                let wire = parse_analysis(&parsed).map_err(|message| {
                    failure(ErrorKind::EndpointError5xx, message).non_retryable()
                })?;
                let mut result = wire.into_result(AnalysisMode::Cloud, model_identifier);
                result.duration_millis = elapsed_millis(started);
                result.raw_response = Some(parsed);
                Ok(result)
            }
            400..=499 => Err(failure(
                ErrorKind::EndpointError4xx,
                format!(
                    "endpoint rejected the request with HTTP {status}{}",
                    body_detail(&response.body)
                ),
            )
            .non_retryable()),
            500..=599 => Err(failure(
                ErrorKind::EndpointError5xx,
                format!(
                    "endpoint failed with HTTP {status}{}",
                    body_detail(&response.body)
                ),
            )),
            _ => Err(failure(
                ErrorKind::EndpointError4xx,
                format!("endpoint answered with unexpected HTTP status {status}"),
            )
            .non_retryable()),
        }
    }
}

fn transport_failure(err: &TransportError, endpoint: &str, model_identifier: &str) -> AnalysisError {
    let error = AnalysisError::new(ErrorKind::EndpointUnreachable, err.to_string())
        .with_endpoint(endpoint)
        .with_model(model_identifier);
    match err {
        TransportError::Connect(_) | TransportError::Timeout(_) => error,
        TransportError::Other(_) => error.non_retryable(),
    }
}

fn body_detail(body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| error_message(&parsed))
        .unwrap_or_else(|| body.trim().to_string());
    if detail.is_empty() {
        return String::new();
    }
    format!(": {}", truncate_text(&detail, BODY_SNIPPET_CHARS))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sightline_contracts::config::{CloudConfigUpdate, CloudEndpointConfig, RetryConfig};
    use sightline_contracts::{AnalysisMode, ErrorKind};

    use super::{
        check_endpoint_security, CloudEndpointAdapter, EndpointTransport, TransportError,
        TransportResponse,
    };

    const ENDPOINT: &str = "https://vision.example.com/v1/analyze";

    type Reply = Result<TransportResponse, TransportError>;

    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        fallback: Option<Reply>,
        probe_reply: Option<Result<u16, TransportError>>,
        calls: Mutex<Vec<(Instant, String, Value)>>,
        probes: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn replying(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        fn always(reply: Reply) -> Self {
            Self {
                fallback: Some(reply),
                ..Self::default()
            }
        }

        fn probing(reply: Result<u16, TransportError>) -> Self {
            Self {
                probe_reply: Some(reply),
                ..Self::default()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
        }

        fn call_instants(&self) -> Vec<Instant> {
            self.calls
                .lock()
                .map(|calls| calls.iter().map(|(at, _, _)| *at).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl EndpointTransport for ScriptedTransport {
        async fn post_json(
            &self,
            url: &str,
            body: &Value,
            _timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((Instant::now(), url.to_string(), body.clone()));
            }
            let next = self.replies.lock().ok().and_then(|mut queue| queue.pop_front());
            next.or_else(|| self.fallback.clone())
                .unwrap_or_else(|| Err(TransportError::Other("no scripted reply".to_string())))
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, TransportError> {
            if let Ok(mut probes) = self.probes.lock() {
                *probes += 1;
            }
            self.probe_reply
                .clone()
                .unwrap_or(Err(TransportError::Connect("refused".to_string())))
        }
    }

    fn status(status: u16, body: &str) -> Reply {
        Ok(TransportResponse {
            status,
            body: body.to_string(),
        })
    }

    fn adapter(
        endpoint: &str,
        retry: RetryConfig,
        transport: Arc<ScriptedTransport>,
    ) -> CloudEndpointAdapter {
        CloudEndpointAdapter::with_transport(
            CloudEndpointConfig::new(endpoint).with_retry(retry),
            transport,
        )
    }

    #[tokio::test]
    async fn server_errors_retry_with_backoff_until_exhausted() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::always(status(500, "overloaded")));
        let cloud = adapter(ENDPOINT, RetryConfig::new(3, vec![10, 20]), transport.clone());

        let err = match cloud.analyze("aGk=", "vision-large").await {
            Ok(_) => anyhow::bail!("expected failure"),
            Err(err) => err,
        };

        assert_eq!(transport.call_count(), 3);
        let instants = transport.call_instants();
        assert!(instants[1].duration_since(instants[0]) >= Duration::from_millis(8));
        assert!(instants[2].duration_since(instants[1]) >= Duration::from_millis(18));
        assert_eq!(err.kind, ErrorKind::EndpointError5xx);
        assert!(err.message.contains("after 3 attempts"), "{}", err.message);
        assert!(!err.retryable);
        assert_eq!(err.details.http_status, Some(500));
        Ok(())
    }

    #[tokio::test]
    async fn client_errors_fail_immediately() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::always(status(
            404,
            r#"{"error":"unknown model"}"#,
        )));
        let cloud = adapter(ENDPOINT, RetryConfig::new(5, vec![1]), transport.clone());

        let err = cloud
            .analyze("aGk=", "nope")
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert_eq!(transport.call_count(), 1);
        assert_eq!(err.kind, ErrorKind::EndpointError4xx);
        assert!(!err.retryable);
        assert!(err.message.contains("unknown model"));
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_recover_within_budget() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::replying(vec![
            Err(TransportError::Connect("connection refused".to_string())),
            status(503, ""),
            status(
                200,
                r#"{"labels":[{"label":"cat","confidence":0.93}],"ocrText":"MEOW"}"#,
            ),
        ]));
        let cloud = adapter(ENDPOINT, RetryConfig::new(3, vec![1]), transport.clone());

        let result = cloud.analyze("aGk=", "vision-large").await?;
        assert_eq!(transport.call_count(), 3);
        assert_eq!(result.labels.len(), 1);
        assert_eq!(result.labels[0].label, "cat");
        assert_eq!(result.ocr_text.as_deref(), Some("MEOW"));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_attempts() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::always(Err(TransportError::Timeout(
            Duration::from_millis(5),
        ))));
        let cloud = adapter(ENDPOINT, RetryConfig::new(2, vec![1]), transport.clone());

        let err = cloud
            .analyze("aGk=", "m")
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert_eq!(transport.call_count(), 2);
        assert_eq!(err.kind, ErrorKind::EndpointUnreachable);
        assert!(err.message.contains("after 2 attempts"));
        assert!(!err.retryable);
        Ok(())
    }

    #[tokio::test]
    async fn insecure_endpoints_are_rejected_without_network() -> anyhow::Result<()> {
        for endpoint in [
            "http://vision.example.com/v1/analyze",
            "https://vision.example.com/v1/analyze?token=abc",
            "https://vision.example.com/v1/analyze?mode=fast&api_key=",
            "https://vision.example.com/v1/analyze?access_token=x",
            "not a url",
            "",
        ] {
            let transport = Arc::new(ScriptedTransport::always(status(200, "{}")));
            let cloud = adapter(endpoint, RetryConfig::default(), transport.clone());
            let err = cloud
                .analyze("aGk=", "m")
                .await
                .err()
                .ok_or_else(|| anyhow::anyhow!("{endpoint} was accepted"))?;
            assert_eq!(err.kind, ErrorKind::EndpointError4xx, "{endpoint}");
            assert!(!err.retryable);
            assert_eq!(transport.call_count(), 0, "{endpoint}");
            assert!(!cloud.is_available().await);
            if let Some(recorded) = err.details.endpoint_url.as_deref() {
                assert!(!recorded.contains('?'));
            }
        }
        Ok(())
    }

    #[test]
    fn sensitive_keys_match_case_sensitively() {
        assert!(check_endpoint_security("https://a.example.com/x?Token=1&page=2").is_ok());
        assert!(check_endpoint_security("https://a.example.com/x?page=2&secret=1").is_err());
        assert!(check_endpoint_security("HTTPS://a.example.com/x").is_ok());
    }

    #[tokio::test]
    async fn error_field_in_success_body_is_not_retried() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::always(status(
            200,
            r#"{"error":"model not loaded"}"#,
        )));
        let cloud = adapter(ENDPOINT, RetryConfig::new(3, vec![1]), transport.clone());

        let err = cloud
            .analyze("aGk=", "m")
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert_eq!(transport.call_count(), 1);
        assert_eq!(err.kind, ErrorKind::EndpointError4xx);
        assert!(err.message.contains("model not loaded"));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_json_is_a_non_retryable_server_error() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::always(status(200, "<html>oops</html>")));
        let cloud = adapter(ENDPOINT, RetryConfig::new(3, vec![1]), transport.clone());

        let err = cloud
            .analyze("aGk=", "m")
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert_eq!(transport.call_count(), 1);
        assert_eq!(err.kind, ErrorKind::EndpointError5xx);
        assert!(!err.retryable);
        Ok(())
    }

    #[tokio::test]
    async fn success_maps_response_and_sends_expected_body() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::always(status(
            200,
            r#"{"labels":[{"label":"sign","confidence":1.4,"boundingBox":{"x":1,"y":1,"width":0,"height":5}}],"modelId":"vision-large@2"}"#,
        )));
        let cloud = adapter(ENDPOINT, RetryConfig::default(), transport.clone());

        let result = cloud.analyze("aGk=", "vision-large").await?;
        assert_eq!(result.mode, AnalysisMode::Cloud);
        assert_eq!(result.model_identifier, "vision-large@2");
        assert!(result.image_path.as_os_str().is_empty());
        assert_eq!(result.labels[0].confidence, 1.0);
        assert_eq!(result.labels[0].bounding_box, None);
        assert!(result.raw_response.is_some());

        let calls = transport.calls.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(calls[0].1, ENDPOINT);
        assert_eq!(calls[0].2, json!({"image": "aGk=", "modelId": "vision-large"}));
        Ok(())
    }

    #[tokio::test]
    async fn availability_follows_probe_status() {
        for (reply, expected) in [
            (Ok(200), true),
            (Ok(405), true),
            (Ok(503), false),
            (Err(TransportError::Connect("refused".to_string())), false),
        ] {
            let transport = Arc::new(ScriptedTransport::probing(reply));
            let cloud = adapter(ENDPOINT, RetryConfig::default(), transport.clone());
            assert_eq!(cloud.is_available().await, expected);
        }

        let transport = Arc::new(ScriptedTransport::probing(Ok(200)));
        let cloud = adapter("http://vision.example.com", RetryConfig::default(), transport.clone());
        assert!(!cloud.is_available().await);
        assert_eq!(transport.probes.lock().map(|n| *n).unwrap_or(99), 0);
    }

    #[tokio::test]
    async fn config_updates_apply_to_later_calls() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::always(status(200, "{}")));
        let cloud = adapter(ENDPOINT, RetryConfig::default(), transport.clone());
        let before = cloud.config();

        cloud.update_config(&CloudConfigUpdate {
            endpoint_url: Some("https://backup.example.com/analyze".to_string()),
            ..CloudConfigUpdate::default()
        });
        cloud.analyze("aGk=", "m").await?;

        assert_eq!(before.endpoint_url, ENDPOINT);
        assert_eq!(cloud.config().endpoint_url, "https://backup.example.com/analyze");
        let calls = transport.calls.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(calls[0].1, "https://backup.example.com/analyze");
        Ok(())
    }
}
