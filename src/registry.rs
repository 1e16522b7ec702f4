//! Process-wide job registry
//!
//! Maps configuration function names to callable jobs so that declarative
//! task files can reference work by name. The map lives for the whole
//! process and is initialised on first insert.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};

use crate::types::JobFuture;

/// A registered job function
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

fn registry() -> &'static RwLock<HashMap<String, JobFn>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, JobFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a job function under a name, replacing any previous entry
pub fn register_job<F, Fut>(name: impl Into<String>, func: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::types::Result<()>> + Send + 'static,
{
    let wrapped: JobFn = Arc::new(move || Box::pin(func()) as JobFuture);
    registry()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(name.into(), wrapped);
}

/// Look up a job function by name
pub fn lookup_job(name: &str) -> Option<JobFn> {
    registry()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(name)
        .cloned()
}
