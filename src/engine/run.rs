use std::collections::HashMap;
use std::fmt::Display;
use std::time::{Duration, Instant};

use crate::error::TaskError;
use crate::task::Status;

/// Timing of a single executed task.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Aggregate result of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every task finished.
    Success,
    /// Some task failed, but at least one requested task finished.
    Degraded,
    /// Nothing that was asked for could be built.
    Failed,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Degraded => "degraded",
            Outcome::Failed => "failed",
        })
    }
}

/// One pass over a set of requested tasks and their dependencies.
#[derive(Debug, Clone)]
pub struct Run {
    pub(crate) requested: Vec<String>,
    /// Every task taking part, in plan order.
    pub(crate) order: Vec<String>,
    pub(crate) statuses: HashMap<String, Status>,
    /// Executed tasks in completion order.
    pub(crate) log: Vec<String>,
    pub(crate) timings: HashMap<String, TaskExecution>,
    pub(crate) failures: Vec<TaskError>,
    pub(crate) elapsed: Duration,
}

impl Run {
    pub fn requested(&self) -> &[String] {
        &self.requested
    }

    /// Status of a task in this run, `None` if it did not take part.
    pub fn status(&self, name: &str) -> Option<Status> {
        self.statuses.get(name).copied()
    }

    /// Tasks with their final statuses, in plan order.
    pub fn statuses(&self) -> impl Iterator<Item = (&str, Status)> {
        self.order
            .iter()
            .map(|name| (name.as_str(), self.statuses[name]))
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn failures(&self) -> &[TaskError] {
        &self.failures
    }

    pub fn execution(&self, name: &str) -> Option<&TaskExecution> {
        self.timings.get(name)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn count(&self, status: Status) -> usize {
        self.statuses.values().filter(|&&s| s == status).count()
    }

    pub fn outcome(&self) -> Outcome {
        let broken = self
            .statuses
            .values()
            .any(|&s| matches!(s, Status::Failed | Status::Skipped));

        if !broken {
            return Outcome::Success;
        }

        let delivered = self
            .requested
            .iter()
            .any(|name| self.status(name) == Some(Status::Done));

        if delivered {
            Outcome::Degraded
        } else {
            Outcome::Failed
        }
    }
}
