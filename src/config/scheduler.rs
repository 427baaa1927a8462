//! Scheduler and task-queue configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Which scheduler backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Runs work synchronously on the caller's stack.
    Immediate,
    /// One dedicated worker thread, FIFO.
    Serial,
    /// N worker threads.
    Pool,
    /// Explicitly driven run loop.
    Cooperative,
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "serial" => Ok(Self::Serial),
            "pool" => Ok(Self::Pool),
            "cooperative" => Ok(Self::Cooperative),
            other => Err(format!("unknown scheduler kind `{other}`")),
        }
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

const fn default_max_queue_depth() -> usize {
    1024
}

const fn default_thread_stack_size() -> usize {
    2 * 1024 * 1024
}

/// Configuration for one scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Backend to build.
    pub kind: SchedulerKind,
    /// Name used in logs, thread names and errors.
    #[serde(default)]
    pub label: String,
    /// Worker threads for [`SchedulerKind::Pool`]; serial queues always use one.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of the dispatch channel.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Stack size of worker threads, in bytes.
    #[serde(default = "default_thread_stack_size")]
    pub thread_stack_size: usize,
    /// Minimum tolerance granted to delayed work, in milliseconds.
    #[serde(default)]
    pub default_tolerance_ms: u64,
}

impl SchedulerConfig {
    /// Defaults for `kind`, labelled after the kind.
    #[must_use]
    pub fn new(kind: SchedulerKind) -> Self {
        let label = match kind {
            SchedulerKind::Immediate => "immediate",
            SchedulerKind::Serial => "serial",
            SchedulerKind::Pool => "pool",
            SchedulerKind::Cooperative => "cooperative",
        };
        Self {
            kind,
            label: label.to_string(),
            worker_count: default_worker_count(),
            max_queue_depth: default_max_queue_depth(),
            thread_stack_size: default_thread_stack_size(),
            default_tolerance_ms: 0,
        }
    }

    /// Set the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the dispatch channel capacity.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the minimum tolerance for delayed work.
    #[must_use]
    pub const fn with_default_tolerance_ms(mut self, ms: u64) -> Self {
        self.default_tolerance_ms = ms;
        self
    }

    /// Minimum tolerance as a duration.
    #[must_use]
    pub const fn default_tolerance(&self) -> Duration {
        Duration::from_millis(self.default_tolerance_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.label.trim().is_empty() {
            return Err("label must not be empty".into());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }

    /// Load from `TICKWORK_*` environment variables, after reading a `.env`
    /// file if one exists.
    ///
    /// Recognised variables: `TICKWORK_KIND` (required), `TICKWORK_LABEL`,
    /// `TICKWORK_WORKER_COUNT`, `TICKWORK_MAX_QUEUE_DEPTH`,
    /// `TICKWORK_THREAD_STACK_SIZE`, `TICKWORK_DEFAULT_TOLERANCE_MS`.
    ///
    /// # Errors
    ///
    /// Fails on a missing kind, an unparsable number or invalid values.
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind_raw = lookup("TICKWORK_KIND").context("TICKWORK_KIND is not set")?;
        let kind: SchedulerKind = kind_raw
            .parse()
            .map_err(anyhow::Error::msg)
            .context("TICKWORK_KIND is invalid")?;

        let mut cfg = Self::new(kind);
        if let Some(label) = lookup("TICKWORK_LABEL") {
            cfg.label = label;
        }
        if let Some(raw) = lookup("TICKWORK_WORKER_COUNT") {
            cfg.worker_count = raw.parse().context("TICKWORK_WORKER_COUNT is not a number")?;
        }
        if let Some(raw) = lookup("TICKWORK_MAX_QUEUE_DEPTH") {
            cfg.max_queue_depth = raw.parse().context("TICKWORK_MAX_QUEUE_DEPTH is not a number")?;
        }
        if let Some(raw) = lookup("TICKWORK_THREAD_STACK_SIZE") {
            cfg.thread_stack_size = raw.parse().context("TICKWORK_THREAD_STACK_SIZE is not a number")?;
        }
        if let Some(raw) = lookup("TICKWORK_DEFAULT_TOLERANCE_MS") {
            cfg.default_tolerance_ms = raw
                .parse()
                .context("TICKWORK_DEFAULT_TOLERANCE_MS is not a number")?;
        }
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }
}

/// Configuration for one task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Maximum tasks executing at once.
    pub max_concurrency: usize,
    /// Name of the scheduler, in [`RuntimeConfig::schedulers`], that runs the
    /// task bodies.
    pub scheduler: String,
}

impl TaskQueueConfig {
    /// Queue running on `scheduler` with the given limit.
    #[must_use]
    pub fn new(max_concurrency: usize, scheduler: impl Into<String>) -> Self {
        Self {
            max_concurrency,
            scheduler: scheduler.into(),
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be greater than 0".into());
        }
        if self.scheduler.trim().is_empty() {
            return Err("scheduler must name a configured scheduler".into());
        }
        Ok(())
    }
}

/// Named schedulers and the task queues that run on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Scheduler name to configuration.
    #[serde(default)]
    pub schedulers: HashMap<String, SchedulerConfig>,
    /// Queue name to configuration.
    #[serde(default)]
    pub queues: HashMap<String, TaskQueueConfig>,
}

impl RuntimeConfig {
    /// Validate all entries and cross-references.
    ///
    /// # Errors
    ///
    /// Names the offending scheduler or queue.
    pub fn validate(&self) -> Result<(), String> {
        if self.schedulers.is_empty() {
            return Err("at least one scheduler must be defined".into());
        }
        for (name, scheduler) in &self.schedulers {
            scheduler
                .validate()
                .map_err(|e| format!("scheduler `{name}` invalid: {e}"))?;
        }
        for (name, queue) in &self.queues {
            queue
                .validate()
                .map_err(|e| format!("queue `{name}` invalid: {e}"))?;
            if !self.schedulers.contains_key(&queue.scheduler) {
                return Err(format!(
                    "queue `{name}` references unknown scheduler `{}`",
                    queue.scheduler
                ));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Scheduler entries without a label take their map key as label.
    ///
    /// # Errors
    ///
    /// Reports parse failures and validation errors.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let mut cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        for (name, scheduler) in &mut cfg.schedulers {
            if scheduler.label.is_empty() {
                scheduler.label.clone_from(name);
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lookup_reads_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TICKWORK_KIND", "pool"),
            ("TICKWORK_LABEL", "io"),
            ("TICKWORK_WORKER_COUNT", "3"),
            ("TICKWORK_DEFAULT_TOLERANCE_MS", "15"),
        ]
        .into_iter()
        .collect();
        let cfg = SchedulerConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(cfg.kind, SchedulerKind::Pool);
        assert_eq!(cfg.label, "io");
        assert_eq!(cfg.worker_count, 3);
        assert_eq!(cfg.default_tolerance(), Duration::from_millis(15));
    }

    #[test]
    fn test_from_lookup_requires_kind() {
        let err = SchedulerConfig::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains("TICKWORK_KIND"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let err = SchedulerConfig::from_lookup(|k| match k {
            "TICKWORK_KIND" => Some("serial".into()),
            "TICKWORK_MAX_QUEUE_DEPTH" => Some("lots".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("TICKWORK_MAX_QUEUE_DEPTH"));
    }
}
