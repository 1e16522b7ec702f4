//! Dynamic hierarchical timing-wheel storage
//!
//! Levels of 60 slots each. Level 0 advances one slot per base tick
//! (1 second by default); every higher level's tick equals the full
//! coverage of the level below, so each new level multiplies the horizon
//! by the wheel size. Levels are appended on demand when a task's delay
//! exceeds the current top level's coverage.
//!
//! Tasks sit in exactly one slot, indexed by ID for O(1) removal and
//! re-placement. Advancing a level drains every slot it steps through:
//! drained tasks cascade down one level, or surface as due at level 0.
//! The whole wheel shares one lock, so a cascade never has to order
//! per-level lock acquisitions.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::storage::TaskStorage;
use crate::types::Task;

const DEFAULT_WHEEL_SIZE: usize = 60;
const DEFAULT_BASE_TICK: StdDuration = StdDuration::from_secs(1);

struct Level {
    tick: Duration,
    slots: Vec<HashMap<String, Task>>,
    current_slot: usize,
    last_tick: DateTime<Utc>,
}

impl Level {
    fn new(tick: Duration, size: usize, now: DateTime<Utc>) -> Self {
        Self {
            tick,
            slots: (0..size).map(|_| HashMap::new()).collect(),
            current_slot: 0,
            last_tick: now,
        }
    }

    fn wheel_size(&self) -> usize {
        self.slots.len()
    }

    /// Maximum delay this level can represent
    fn coverage(&self) -> Duration {
        self.tick * self.wheel_size() as i32
    }
}

struct WheelInner {
    levels: Vec<Level>,
    /// id -> (level, slot) handle for O(1) removal
    index: HashMap<String, (usize, usize)>,
    wheel_size: usize,
}

impl WheelInner {
    /// Insert a task, replacing any previous placement of the same ID.
    ///
    /// Picks the lowest level whose coverage exceeds the task's delay,
    /// growing the wheel when even the top level is too small. With
    /// `max_level` set (the cascade path) the search is capped instead and
    /// the slot offset clamps to the farthest slot.
    fn place(&mut self, task: Task, now: DateTime<Utc>, max_level: Option<usize>) {
        if let Some((level, slot)) = self.index.remove(&task.id) {
            self.levels[level].slots[slot].remove(&task.id);
        }

        let delay = (task.next_run - now).max(Duration::zero());

        if max_level.is_none() {
            while self
                .levels
                .last()
                .is_some_and(|top| top.coverage() <= delay)
            {
                self.grow(now);
            }
        }

        let cap = max_level
            .unwrap_or(self.levels.len() - 1)
            .min(self.levels.len() - 1);
        let mut chosen = cap;
        for (i, level) in self.levels.iter().enumerate().take(cap + 1) {
            if level.coverage() > delay {
                chosen = i;
                break;
            }
        }

        let slot = {
            let level = &self.levels[chosen];
            let size = level.wheel_size();
            let tick_ms = level.tick.num_milliseconds().max(1);
            let offset = (delay.num_milliseconds() / tick_ms).min(size as i64 - 1) as usize;
            (level.current_slot + offset) % size
        };

        self.index.insert(task.id.clone(), (chosen, slot));
        self.levels[chosen].slots[slot].insert(task.id.clone(), task);
    }

    /// Append a level whose tick equals the current top level's coverage
    fn grow(&mut self, now: DateTime<Utc>) {
        let tick = match self.levels.last() {
            Some(top) => top.coverage(),
            None => Duration::seconds(1),
        };
        self.levels.push(Level::new(tick, self.wheel_size, now));
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.index.remove(id) {
            Some((level, slot)) => {
                self.levels[level].slots[slot].remove(id);
                true
            }
            None => false,
        }
    }

    fn tick(&mut self, now: DateTime<Utc>) -> Vec<Task> {
        let mut due = Vec::new();

        for level_idx in (0..self.levels.len()).rev() {
            let drained = {
                let level = &mut self.levels[level_idx];
                let size = level.wheel_size();
                let tick_ms = level.tick.num_milliseconds().max(1);
                let elapsed = (now - level.last_tick).num_milliseconds().max(0);
                let ticks = elapsed / tick_ms;
                if ticks == 0 && level_idx != 0 {
                    continue;
                }

                let mut drained = Vec::new();
                if ticks > 0 {
                    level.last_tick = level.last_tick + Duration::milliseconds(ticks * tick_ms);
                    let start = level.current_slot;
                    // visit every slot stepped through; capped at one full
                    // rotation, after which all slots have been seen once
                    let steps = ticks.min(size as i64) as usize;
                    for step in 1..=steps {
                        let slot = (start + step) % size;
                        drained.extend(level.slots[slot].drain().map(|(_, task)| task));
                    }
                    level.current_slot = (start + (ticks % size as i64) as usize) % size;
                }
                drained
            };

            for task in drained {
                self.index.remove(&task.id);
                if level_idx == 0 {
                    if task.next_run <= now {
                        due.push(task);
                    } else {
                        // slotted early by a catch-up cascade; re-file it
                        self.place(task, now, Some(0));
                    }
                } else {
                    self.place(task, now, Some(level_idx - 1));
                }
            }

            if level_idx == 0 {
                // sub-tick drift: the current slot may already hold due
                // tasks even when no full tick elapsed
                let current = self.levels[0].current_slot;
                let ready: Vec<String> = self.levels[0].slots[current]
                    .values()
                    .filter(|task| task.next_run <= now)
                    .map(|task| task.id.clone())
                    .collect();
                for id in ready {
                    if let Some(task) = self.levels[0].slots[current].remove(&id) {
                        self.index.remove(&id);
                        due.push(task);
                    }
                }
            }
        }

        due
    }
}

/// Hierarchical timing-wheel storage backend
pub struct DynamicTimingWheel {
    inner: Mutex<WheelInner>,
}

impl DynamicTimingWheel {
    /// Create a wheel with the default 1-second base tick
    pub fn new() -> Self {
        Self::with_base_tick(DEFAULT_BASE_TICK)
    }

    /// Create a wheel with a custom base tick duration
    pub fn with_base_tick(base_tick: StdDuration) -> Self {
        Self::new_at(base_tick, Utc::now())
    }

    fn new_at(base_tick: StdDuration, now: DateTime<Utc>) -> Self {
        let tick = Duration::from_std(base_tick).unwrap_or_else(|_| Duration::seconds(1));
        let tick = if tick <= Duration::zero() {
            Duration::seconds(1)
        } else {
            tick
        };
        Self {
            inner: Mutex::new(WheelInner {
                levels: vec![Level::new(tick, DEFAULT_WHEEL_SIZE, now)],
                index: HashMap::new(),
                wheel_size: DEFAULT_WHEEL_SIZE,
            }),
        }
    }

    /// Number of levels currently allocated
    pub async fn level_count(&self) -> usize {
        self.inner.lock().await.levels.len()
    }

    #[cfg(test)]
    async fn add_at(&self, task: Task, now: DateTime<Utc>) {
        self.inner.lock().await.place(task, now, None);
    }
}

impl Default for DynamicTimingWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStorage for DynamicTimingWheel {
    async fn exists(&self, id: &str) -> bool {
        self.inner.lock().await.index.contains_key(id)
    }

    async fn add(&self, task: Task) {
        self.inner.lock().await.place(task, Utc::now(), None);
    }

    async fn remove(&self, id: &str) -> bool {
        self.inner.lock().await.remove(id)
    }

    async fn tick(&self, now: DateTime<Utc>) -> Vec<Task> {
        self.inner.lock().await.tick(now)
    }

    async fn list(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner
            .levels
            .iter()
            .flat_map(|level| level.slots.iter())
            .flat_map(|slot| slot.values().cloned())
            .collect()
    }
}
