//! Binary-heap task storage
//!
//! A min-heap orders tasks by next fire time while an ID map remains the
//! authority on membership. Removal just drops the map entry; superseded
//! heap entries are recognised and skipped when they surface at the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::storage::TaskStorage;
use crate::types::Task;

/// Heap entry ordered by `(next_run, id)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    next_run: DateTime<Utc>,
    id: String,
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    tasks: HashMap<String, Task>,
}

impl QueueInner {
    /// A heap entry is live iff the ID map still holds the task at the
    /// same fire time; anything else was removed or re-inserted since.
    fn is_live(&self, entry: &QueueEntry) -> bool {
        self.tasks
            .get(&entry.id)
            .is_some_and(|task| task.next_run == entry.next_run)
    }
}

/// Ordered priority-queue storage backend
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStorage for TaskQueue {
    async fn exists(&self, id: &str) -> bool {
        self.inner.lock().await.tasks.contains_key(id)
    }

    async fn add(&self, task: Task) {
        let mut inner = self.inner.lock().await;
        inner.heap.push(Reverse(QueueEntry {
            next_run: task.next_run,
            id: task.id.clone(),
        }));
        inner.tasks.insert(task.id.clone(), task);
    }

    async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.tasks.remove(id).is_some()
    }

    async fn tick(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut inner = self.inner.lock().await;
        let mut due = Vec::new();

        // drain the whole burst at or before `now`, not just the root
        loop {
            let due_at_top = inner
                .heap
                .peek()
                .is_some_and(|Reverse(entry)| entry.next_run <= now);
            if !due_at_top {
                break;
            }
            let Some(Reverse(entry)) = inner.heap.pop() else {
                break;
            };
            if !inner.is_live(&entry) {
                continue;
            }
            if let Some(task) = inner.tasks.remove(&entry.id) {
                due.push(task);
            }
        }

        due
    }

    async fn list(&self) -> Vec<Task> {
        self.inner.lock().await.tasks.values().cloned().collect()
    }
}
