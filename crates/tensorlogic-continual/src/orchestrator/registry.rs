//! Shared table of task records, cancel flags and worker handles.

use crate::config::{TrainingConfig, TrainingType};
use crate::orchestrator::task::TrainingTask;
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use scirs2_core::random::{Rng, SeedableRng, StdRng};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

/// Random suffix attempts before falling back to a counter.
const RANDOM_SUFFIX_ATTEMPTS: usize = 32;

/// A task record plus its cooperative cancellation flag.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    /// The task record; status polling takes the read lock.
    pub record: Arc<RwLock<TrainingTask>>,
    /// Raised by `cancel`, checked by the training loop between epochs.
    pub cancel: Arc<AtomicBool>,
}

/// All tasks known to an orchestrator.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskHandle>>,
    workers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending task under a fresh id.
    pub fn insert(&self, training_type: TrainingType, config: TrainingConfig) -> TaskHandle {
        let mut tasks = self.tasks.write();
        let base = format!(
            "Task_{}_{}",
            training_type.as_str(),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let id = unique_id(&base, |candidate| tasks.contains_key(candidate));
        let handle = TaskHandle {
            record: Arc::new(RwLock::new(TrainingTask::new(
                id.clone(),
                training_type,
                config,
            ))),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        tasks.insert(id, handle.clone());
        handle
    }

    /// Look up a task.
    pub fn get(&self, id: &str) -> Option<TaskHandle> {
        self.tasks.read().get(id).cloned()
    }

    /// Every task, in no particular order.
    pub fn handles(&self) -> Vec<TaskHandle> {
        self.tasks.read().values().cloned().collect()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Whether the registry holds no task.
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Run `work` on a thread named after the task.
    ///
    /// The handle is tracked until the thread exits and removes its own
    /// entry. The map stays locked across spawn and insert.
    pub fn spawn_worker(
        &self,
        id: &str,
        work: impl FnOnce() + Send + 'static,
    ) -> io::Result<()> {
        let mut workers = self.workers.lock();
        let slots = Arc::clone(&self.workers);
        let key = id.to_string();
        let join = thread::Builder::new()
            .name(format!("train-{}", id))
            .spawn(move || {
                work();
                slots.lock().remove(&key);
            })?;
        workers.insert(id.to_string(), join);
        Ok(())
    }

    /// Stop tracking the worker of a task and hand back its handle.
    pub fn take_worker(&self, id: &str) -> Option<JoinHandle<()>> {
        self.workers.lock().remove(id)
    }

    /// Number of worker threads still tracked.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

/// `base`, or `base` with a `_{100..=999}` suffix, or a counter suffix.
fn unique_id(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..RANDOM_SUFFIX_ATTEMPTS {
        let candidate = format!("{}_{}", base, rng.gen_range(100..1000));
        if !taken(&candidate) {
            return candidate;
        }
    }

    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
