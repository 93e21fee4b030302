//! Test doubles for handlers.
//!
//! Storage doubles live in [`crate::store::MemoryStore`]; HTTP doubles in
//! [`fetch_guard::testing`].

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HandlerError, HandlerResult};
use crate::progress::ProgressReporter;
use crate::registry::JobHandler;

/// One call made to a [`RecordingHandler`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job_id: Uuid,
    pub attempt: i32,
    pub payload: Value,
}

/// Handler that reports scripted stages and returns scripted results.
///
/// Queued results are returned in order; once they run out the default
/// result repeats.
pub struct RecordingHandler {
    stages: Vec<(String, u8)>,
    results: Mutex<VecDeque<HandlerResult>>,
    default: HandlerResult,
    invocations: Mutex<Vec<Invocation>>,
}

impl RecordingHandler {
    /// Always succeeds with `summary`.
    pub fn succeeding(summary: Value) -> Self {
        Self::with_default(Ok(summary))
    }

    /// Always fails with `error`.
    pub fn failing(error: HandlerError) -> Self {
        Self::with_default(Err(error))
    }

    fn with_default(default: HandlerResult) -> Self {
        Self {
            stages: Vec::new(),
            results: Mutex::new(VecDeque::new()),
            default,
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Return these before falling back to the default.
    pub fn with_results(self, results: impl IntoIterator<Item = HandlerResult>) -> Self {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(results);
        self
    }

    /// Report these stages, in order, on every run.
    pub fn with_stages(mut self, stages: &[(&str, u8)]) -> Self {
        self.stages = stages
            .iter()
            .map(|(name, pct)| (name.to_string(), *pct))
            .collect();
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn run(&self, payload: Value, progress: ProgressReporter) -> HandlerResult {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Invocation {
                job_id: progress.job_id(),
                attempt: progress.attempt(),
                payload,
            });

        for (name, pct) in &self.stages {
            progress.stage(name, format!("running {}", name), *pct).await?;
        }

        let next = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| self.default.clone())
    }
}
