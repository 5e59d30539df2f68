//! Collection and presentation of task failures.

use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::{Mutex, PoisonError};

use console::Style;

use crate::engine::{Outcome, Run};
use crate::error::TaskError;
use crate::task::Status;

const ANSI_TOOL: Style = Style::new().yellow().underlined();
const ANSI_ERROR: Style = Style::new().red();
const ANSI_DIM: Style = Style::new().dim();

/// Failures kept for [`ErrorReporter::failures`], older ones are dropped.
const MAX_RETAINED: usize = 256;

/// Records task failures and renders them for humans.
///
/// Reporting is infallible. A failure is only ever fatal to the task which
/// produced it and to that task's dependents within one run.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    failures: Mutex<VecDeque<TaskError>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records and logs a failure of `task`.
    pub fn report(&self, task: &str, error: &TaskError) {
        let tool = error.tool.as_deref().unwrap_or("task");

        match &error.location {
            Some(location) => tracing::error!(
                task,
                "{} {} {}",
                ANSI_TOOL.apply_to(format!("PLUGIN: {tool}")),
                ANSI_ERROR.apply_to(format!("ERROR: {}", error.message)),
                ANSI_DIM.apply_to(format!("at {location}")),
            ),
            None => tracing::error!(
                task,
                "{} {}",
                ANSI_TOOL.apply_to(format!("PLUGIN: {tool}")),
                ANSI_ERROR.apply_to(format!("ERROR: {}", error.message)),
            ),
        }

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if failures.len() == MAX_RETAINED {
            failures.pop_front();
        }
        failures.push_back(TaskError {
            task: task.to_string(),
            ..error.clone()
        });
    }

    /// Failures reported so far, oldest first. At most the latest
    /// 256 are kept.
    pub fn failures(&self) -> Vec<TaskError> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Takes every retained failure, leaving the reporter empty.
    pub fn drain(&self) -> Vec<TaskError> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Human readable report of all failures in `run`.
    pub fn summarize(&self, run: &Run) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{}: {} done, {} failed, {} skipped in {:.2?}",
            run.outcome(),
            run.count(Status::Done),
            run.count(Status::Failed),
            run.count(Status::Skipped),
            run.elapsed(),
        );

        if run.outcome() == Outcome::Success {
            return out;
        }

        for failure in run.failures() {
            let _ = write!(out, "\n  {}", failure.task);
            if let Some(tool) = &failure.tool {
                let _ = write!(out, " [{tool}]");
            }
            let _ = writeln!(out);

            if let Some(location) = &failure.location {
                let _ = writeln!(out, "    at {location}");
            }
            for line in failure.message.lines() {
                let _ = writeln!(out, "    {line}");
            }
        }

        let skipped: Vec<_> = run
            .statuses()
            .filter(|(_, status)| *status == Status::Skipped)
            .map(|(name, _)| name)
            .collect();

        if !skipped.is_empty() {
            let _ = writeln!(out, "\n  skipped: {}", skipped.join(", "));
        }

        out
    }
}
