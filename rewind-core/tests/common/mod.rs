#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use rewind_core::backend::{InMemoryBackend, Rpc};
use rewind_core::{
    ConnectionError, ReplayOutcome, RetryListener, RetryResult, Runtime, RuntimeConfig,
};

pub async fn runtime(backend: &Arc<InMemoryBackend>) -> Result<Runtime> {
    runtime_with(backend, RuntimeConfig::default()).await
}

pub async fn runtime_with(backend: &Arc<InMemoryBackend>, config: RuntimeConfig) -> Result<Runtime> {
    let runtime = Runtime::connect(backend.clone(), config).await?;
    Ok(runtime)
}

pub fn backend() -> Arc<InMemoryBackend> {
    Arc::new(InMemoryBackend::new())
}

/// SQL text of every request of one kind, in order.
pub fn sql_of(backend: &InMemoryBackend, rpc: Rpc) -> Vec<String> {
    backend
        .requests_for(rpc)
        .into_iter()
        .flat_map(|request| request.sql)
        .collect()
}

/// Records retry callbacks as strings, tagged with the listener name.
#[derive(Default)]
pub struct RecordingListener {
    name: String,
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    pub fn new(name: &str, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            events,
        }
    }

    fn push(&self, event: String) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{}:{event}", self.name));
    }
}

impl RetryListener for RecordingListener {
    fn retry_starting(&self, attempt: u32) {
        self.push(format!("start {attempt}"));
    }

    fn entry_replayed(&self, attempt: u32, index: usize, outcome: ReplayOutcome) {
        if outcome == ReplayOutcome::ResultChanged {
            self.push(format!("changed {attempt}/{index}"));
        }
    }

    fn entry_failed(&self, attempt: u32, index: usize, _error: &ConnectionError) {
        self.push(format!("failed {attempt}/{index}"));
    }

    fn retry_finished(&self, attempt: u32, result: RetryResult) {
        self.push(format!("finish {attempt} {result:?}"));
    }
}

pub fn events(events: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
