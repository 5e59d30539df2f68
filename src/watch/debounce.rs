use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A task is released at the latest this many windows after its first
/// unreleased change, even if changes keep arriving.
const MAX_WAIT_WINDOWS: u32 = 4;

/// Trailing-edge debounce, kept separately for every task.
///
/// Each change for a task pushes its deadline to `now + window`. The task is
/// released once a deadline passes without another change, so a burst of
/// saves turns into a single request. A task that never goes quiet is still
/// released once `max_wait` has passed since its first change.
#[derive(Debug)]
pub struct Coalescer {
    window: Duration,
    max_wait: Duration,
    deadlines: HashMap<String, Deadline>,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    first: Instant,
    at: Instant,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self::with_max_wait(window, window * MAX_WAIT_WINDOWS)
    }

    pub fn with_max_wait(window: Duration, max_wait: Duration) -> Self {
        Self {
            window,
            max_wait: max_wait.max(window),
            deadlines: HashMap::new(),
        }
    }

    pub fn push(&mut self, task: impl Into<String>, now: Instant) {
        let task = task.into();
        let first = self
            .deadlines
            .get(&task)
            .map_or(now, |deadline| deadline.first);
        let at = (now + self.window).min(first + self.max_wait);

        self.deadlines.insert(task, Deadline { first, at });
    }

    /// Releases every task whose window has elapsed, earliest first.
    pub fn ready(&mut self, now: Instant) -> Vec<String> {
        let mut ready: Vec<_> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| deadline.at <= now)
            .map(|(task, deadline)| (deadline.at, task.clone()))
            .collect();

        ready.sort();

        for (_, task) in &ready {
            self.deadlines.remove(task);
        }

        ready.into_iter().map(|(_, task)| task).collect()
    }

    /// Releases everything, ignoring the windows.
    pub fn drain(&mut self) -> Vec<String> {
        let mut all: Vec<_> = self.deadlines.drain().map(|(t, d)| (d.at, t)).collect();
        all.sort();
        all.into_iter().map(|(_, task)| task).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().map(|deadline| deadline.at).min()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Serialises re-runs.
///
/// Only one batch is in flight at a time. Requests arriving meanwhile are
/// parked in a pending set which holds each task at most once, and become
/// the next batch when the current one finishes.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: Vec<String>,
    in_flight: bool,
}

impl RequestQueue {
    pub fn submit(&mut self, tasks: impl IntoIterator<Item = String>) {
        for task in tasks {
            if !self.pending.contains(&task) {
                self.pending.push(task);
            }
        }
    }

    /// Takes the next batch if nothing is running.
    pub fn begin(&mut self) -> Option<Vec<String>> {
        if self.in_flight || self.pending.is_empty() {
            return None;
        }

        self.in_flight = true;
        Some(std::mem::take(&mut self.pending))
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
