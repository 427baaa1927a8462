//! Builders to construct schedulers and task queues from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::{RuntimeConfig, SchedulerConfig, SchedulerKind};
use crate::core::{
    BoundedPool, CooperativeLoop, ImmediateScheduler, Scheduler, SchedulerError, SerialQueue,
    TaskQueue,
};

/// Build one scheduler from its configuration.
///
/// A cooperative loop built this way can only be fed, not driven; use
/// [`build_runtime`] and [`SchedulerRuntime::cooperative`] to drive it.
///
/// # Errors
///
/// `InvalidConfig` if validation fails, `Backend` if threads cannot be spawned.
pub fn build_scheduler(cfg: &SchedulerConfig) -> Result<Arc<dyn Scheduler>, SchedulerError> {
    build_entry(cfg).map(|(scheduler, _)| scheduler)
}

fn build_entry(
    cfg: &SchedulerConfig,
) -> Result<(Arc<dyn Scheduler>, Option<Arc<CooperativeLoop>>), SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;
    let built = match cfg.kind {
        SchedulerKind::Immediate => (
            Arc::new(ImmediateScheduler::new(cfg.label.clone())) as Arc<dyn Scheduler>,
            None,
        ),
        SchedulerKind::Serial => (
            Arc::new(SerialQueue::from_config(cfg)?) as Arc<dyn Scheduler>,
            None,
        ),
        SchedulerKind::Pool => (
            Arc::new(BoundedPool::from_config(cfg)?) as Arc<dyn Scheduler>,
            None,
        ),
        SchedulerKind::Cooperative => {
            let driver = Arc::new(CooperativeLoop::new(cfg.label.clone()));
            (Arc::clone(&driver) as Arc<dyn Scheduler>, Some(driver))
        }
    };
    Ok(built)
}

/// Schedulers and queues built from a [`RuntimeConfig`], addressed by name.
pub struct SchedulerRuntime {
    schedulers: HashMap<String, Arc<dyn Scheduler>>,
    loops: HashMap<String, Arc<CooperativeLoop>>,
    queues: HashMap<String, TaskQueue>,
}

impl SchedulerRuntime {
    /// Scheduler called `name`.
    #[must_use]
    pub fn scheduler(&self, name: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.get(name).cloned()
    }

    /// Cooperative loop called `name`, for driving it.
    #[must_use]
    pub fn cooperative(&self, name: &str) -> Option<Arc<CooperativeLoop>> {
        self.loops.get(name).cloned()
    }

    /// Task queue called `name`.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<TaskQueue> {
        self.queues.get(name).cloned()
    }

    /// Names of all schedulers.
    pub fn scheduler_names(&self) -> impl Iterator<Item = &str> {
        self.schedulers.keys().map(String::as_str)
    }

    /// Cancel every queued task, then shut every scheduler down.
    pub fn shutdown(&self) {
        for queue in self.queues.values() {
            queue.cancel_all();
        }
        for scheduler in self.schedulers.values() {
            scheduler.shutdown();
        }
    }
}

impl std::fmt::Debug for SchedulerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRuntime")
            .field("schedulers", &self.schedulers.keys().collect::<Vec<_>>())
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build every scheduler, then every queue wired to its named scheduler.
///
/// # Errors
///
/// `InvalidConfig` if the configuration does not validate; any backend error
/// from building a scheduler. Schedulers built before a failure are shut down.
pub fn build_runtime(cfg: &RuntimeConfig) -> Result<SchedulerRuntime, SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;

    let mut runtime = SchedulerRuntime {
        schedulers: HashMap::new(),
        loops: HashMap::new(),
        queues: HashMap::new(),
    };
    for (name, scheduler_cfg) in &cfg.schedulers {
        match build_entry(scheduler_cfg) {
            Ok((scheduler, driver)) => {
                runtime.schedulers.insert(name.clone(), scheduler);
                if let Some(driver) = driver {
                    runtime.loops.insert(name.clone(), driver);
                }
            }
            Err(err) => {
                runtime.shutdown();
                return Err(err);
            }
        }
    }

    for (name, queue_cfg) in &cfg.queues {
        let Some(scheduler) = runtime.scheduler(&queue_cfg.scheduler) else {
            runtime.shutdown();
            return Err(SchedulerError::InvalidConfig(format!(
                "queue `{name}` references unknown scheduler `{}`",
                queue_cfg.scheduler
            )));
        };
        let queue = TaskQueue::new(name.clone(), queue_cfg.max_concurrency, scheduler)?;
        runtime.queues.insert(name.clone(), queue);
    }

    info!(
        schedulers = runtime.schedulers.len(),
        queues = runtime.queues.len(),
        "runtime built"
    );
    Ok(runtime)
}
