use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde_json::{json, Map, Value};

use crate::now_utc_iso;

pub type EventPayload = Map<String, Value>;

/// Observability capability handed to the engine at construction time.
///
/// Recording never fails from the caller's point of view; sinks that can fail
/// report the problem through `tracing` and drop the event.
pub trait EventSink: Send + Sync {
    fn record(&self, event_type: &str, payload: EventPayload);
}

/// Sink used when no event stream is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event_type: &str, _payload: EventPayload) {}
}

const RESERVED_KEYS: [&str; 4] = ["type", "session_id", "seq", "ts"];

/// JSONL event stream for one CLI session.
///
/// Every line is `{type, session_id, seq, ts, ..payload}`. `seq` counts from 1 per
/// writer so lines from concurrent sessions sharing a file can be ordered.
/// Payload keys that collide with the envelope are dropped.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventStream>,
}

#[derive(Debug)]
struct EventStream {
    path: PathBuf,
    session_id: String,
    state: Mutex<StreamState>,
}

#[derive(Debug, Default)]
struct StreamState {
    file: Option<File>,
    seq: u64,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventStream {
                path: path.into(),
                session_id: session_id.into(),
                state: Mutex::new(StreamState::default()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Appends one event and returns the line as written.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("event stream lock poisoned"))?;
        let seq = state.seq + 1;

        let mut event = Map::new();
        event.insert("type".to_string(), json!(event_type));
        event.insert("session_id".to_string(), json!(self.inner.session_id));
        event.insert("seq".to_string(), json!(seq));
        event.insert("ts".to_string(), json!(now_utc_iso()));
        for (key, value) in payload {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                event.insert(key, value);
            }
        }
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = match state.file.take() {
            Some(file) => file,
            None => self.open()?,
        };
        file.write_all(&line).context("failed appending event")?;
        state.file = Some(file);
        state.seq = seq;
        Ok(Value::Object(event))
    }

    fn open(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed opening {}", self.inner.path.display()))
    }
}

impl EventSink for EventWriter {
    fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            tracing::warn!(
                path = %self.inner.path.display(),
                event_type,
                "dropping event: {err:#}"
            );
        }
    }
}
