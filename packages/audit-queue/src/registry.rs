//! Handler registry.
//!
//! Maps job type strings (e.g., "site_audit") to handlers. Tags are checked
//! when registering, so a misconfigured worker fails at startup rather than
//! when the first job arrives.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{HandlerResult, RegistryError};
use crate::progress::ProgressReporter;

/// Runs one job type.
///
/// Return the result summary on success. Call
/// [`ProgressReporter::stage`] at every stage boundary and stop on error.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: serde_json::Value, progress: ProgressReporter) -> HandlerResult;
}

/// Adapter for async closures over a typed payload.
struct FnHandler<J, F> {
    handler: F,
    _payload: PhantomData<fn() -> J>,
}

#[async_trait]
impl<J, F, Fut> JobHandler for FnHandler<J, F>
where
    J: DeserializeOwned + Send + 'static,
    F: Fn(J, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn run(&self, payload: serde_json::Value, progress: ProgressReporter) -> HandlerResult {
        // A payload that does not parse will never parse
        let job: J = serde_json::from_value(payload)?;
        (self.handler)(job, progress).await
    }
}

/// Registry that maps job type strings to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = HandlerRegistry::new();
///
/// registry.register_fn::<ProbeJob, _, _>("site_probe", |job, progress| async move {
///     progress.stage("fetch", "fetching page", 50).await?;
///     Ok(json!({ "url": job.url }))
/// })?;
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(RegistryError::EmptyJobType);
        }
        if self.handlers.contains_key(&job_type) {
            return Err(RegistryError::Duplicate(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Register an async function taking the deserialized payload.
    ///
    /// Payloads that fail to deserialize fail the job permanently.
    pub fn register_fn<J, F, Fut>(
        &mut self,
        job_type: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        J: DeserializeOwned + Send + 'static,
        F: Fn(J, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(
            job_type,
            Arc::new(FnHandler {
                handler,
                _payload: PhantomData,
            }),
        )
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
