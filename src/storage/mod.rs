//! Task storage backends
//!
//! Two interchangeable containers hold scheduled tasks keyed on their next
//! fire time: an ordered binary-heap queue and a dynamic hierarchical
//! timing wheel. Both guard their state with a single internal lock, so
//! `add`, `remove`, `exists`, `tick` and `list` are linearizable with
//! respect to each other.

mod queue;
mod wheel;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::Task;

pub use queue::TaskQueue;
pub use wheel::DynamicTimingWheel;

/// Which storage backend a scheduler should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// Binary min-heap keyed on next fire time
    #[default]
    Heap,
    /// Dynamic hierarchical timing wheel
    TimingWheel,
}

/// Container of scheduled tasks, polymorphic over the backend
#[async_trait]
pub trait TaskStorage: Send + Sync {
    /// Whether a task with the given ID is currently stored
    async fn exists(&self, id: &str) -> bool;

    /// Insert a task. Re-inserting an ID replaces its previous placement.
    async fn add(&self, task: Task);

    /// Remove a task by ID; returns whether it was present
    async fn remove(&self, id: &str) -> bool;

    /// Remove and return every task whose `next_run` is at or before `now`
    async fn tick(&self, now: DateTime<Utc>) -> Vec<Task>;

    /// Snapshot of all stored tasks, safe for external inspection
    async fn list(&self) -> Vec<Task>;
}

/// Instantiate the backend for a [`StorageKind`]
pub(crate) fn create_storage(kind: StorageKind) -> Arc<dyn TaskStorage> {
    match kind {
        StorageKind::Heap => Arc::new(TaskQueue::new()),
        StorageKind::TimingWheel => Arc::new(DynamicTimingWheel::new()),
    }
}
