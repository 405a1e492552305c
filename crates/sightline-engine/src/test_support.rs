//! In-crate test doubles shared by the router, plugin and pipeline tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sightline_contracts::events::{EventPayload, EventSink};
use sightline_contracts::{AnalysisError, AnalysisMode, AnalysisResult};

use crate::backend::{CloudBackend, LocalBackend};

pub(crate) const PNG_BYTES: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13, b'I', b'H', b'D', b'R',
];

pub(crate) type Canned = Result<AnalysisResult, AnalysisError>;

pub(crate) struct FakeLocal {
    pub available: bool,
    pub reply: Canned,
    pub calls: Mutex<Vec<(PathBuf, String)>>,
}

impl FakeLocal {
    pub fn new(available: bool, reply: Canned) -> Self {
        Self {
            available,
            reply,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LocalBackend for FakeLocal {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn analyze(
        &self,
        image_path: &Path,
        model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((image_path.to_path_buf(), model_identifier.to_string()));
        }
        self.reply
            .clone()
            .map(|result| result.with_image_path(image_path))
    }
}

pub(crate) struct FakeCloud {
    pub available: bool,
    pub reply: Canned,
    pub payloads: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn new(available: bool, reply: Canned) -> Self {
        Self {
            available,
            reply,
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.payloads.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CloudBackend for FakeCloud {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn analyze(
        &self,
        image_data: &str,
        _model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(image_data.to_string());
        }
        self.reply.clone()
    }
}

pub(crate) fn labelled(mode: AnalysisMode, labels: &[(&str, f64)]) -> AnalysisResult {
    let mut result = AnalysisResult::new(mode, "fake-model");
    result.labels = labels
        .iter()
        .map(|(label, confidence)| sightline_contracts::DetectionLabel::new(*label, *confidence))
        .collect();
    result
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub events: Mutex<Vec<(String, EventPayload)>>,
}

impl RecordingSink {
    pub fn types(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(kind, _)| kind.clone()).collect())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event_type: &str, payload: EventPayload) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event_type.to_string(), payload));
        }
    }
}
