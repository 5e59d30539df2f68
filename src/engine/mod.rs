//! Execution of the task graph.
//!
//! The [`Runner`] owns a validated [`TaskRegistry`] and executes requested
//! tasks together with everything they depend on. Independent tasks run in
//! parallel on a dedicated rayon pool, while the calling thread acts as the
//! scheduler:
//!
//! 1. The closure of the requested tasks is computed and sorted
//!    topologically. Unknown tasks and cycles reject the run before any
//!    action is executed.
//! 2. Tasks with no pending dependencies are dispatched to the pool, in plan
//!    order.
//! 3. The scheduler waits for results on a channel. When a task finishes,
//!    the dependency counts of its dependents are decremented, and dependents
//!    whose count reaches zero are dispatched.
//! 4. A failed task poisons its dependents. They are marked as skipped when
//!    their turn comes, without executing, and poison their own dependents in
//!    turn. Everything else keeps running.

mod diagnostics;
mod run;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::mpsc::channel;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{ConfigError, RunnerError, TaskError};
use crate::registry::TaskRegistry;
use crate::report::ErrorReporter;
use crate::task::{Status, TaskContext};

pub use run::{Outcome, Run, TaskExecution};

/// Settings of a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Number of worker threads, `0` picks one per CPU.
    pub jobs: usize,
    /// Budget for a single external process invocation.
    pub timeout: Duration,
    /// Root of the output directory.
    pub output: Utf8PathBuf,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            jobs: 0,
            timeout: Duration::from_secs(120),
            output: Utf8PathBuf::from("build"),
        }
    }
}

/// Executes tasks from a [`TaskRegistry`].
pub struct Runner {
    registry: TaskRegistry,
    options: RunnerOptions,
    pool: rayon::ThreadPool,
    reporter: ErrorReporter,
    /// Last terminal status of every task which has run so far.
    ledger: Mutex<HashMap<NodeIndex, Status>>,
}

impl Runner {
    pub fn new(registry: TaskRegistry, options: RunnerOptions) -> Result<Self, RunnerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.jobs)
            .thread_name(|i| format!("kagari-task-{i}"))
            .build()?;

        Ok(Self {
            registry,
            options,
            pool,
            reporter: ErrorReporter::new(),
            ledger: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Runs `names` and all of their transitive dependencies, each exactly
    /// once.
    pub fn run<S: AsRef<str>>(&self, names: &[S]) -> Result<Run, ConfigError> {
        let roots = self.roots(names)?;
        let closure = self.registry.closure(&roots)?;
        let plan = self.registry.toposort(&closure)?;

        Ok(self.execute(plan, &roots))
    }

    /// Incremental run used by watch mode.
    ///
    /// Runs the `dirty` tasks and everything downstream of them. Upstream
    /// dependencies which finished successfully in an earlier run are taken
    /// as satisfied; the ones which did not are run again.
    pub fn rerun<S: AsRef<str>>(&self, dirty: &[S]) -> Result<Run, ConfigError> {
        let roots = self.roots(dirty)?;
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner).clone();

        let mut nodes = HashSet::new();
        for &root in &roots {
            let mut dfs = petgraph::visit::Dfs::new(&self.registry.graph, root);
            while let Some(index) = dfs.next(&self.registry.graph) {
                nodes.insert(index);
            }
        }

        let mut stack: Vec<_> = nodes.iter().copied().collect();
        while let Some(index) = stack.pop() {
            self.registry.check_dependencies(index)?;
            for dependency in self.registry.dependencies_of(index) {
                let satisfied = ledger.get(&dependency) == Some(&Status::Done);
                if !satisfied && nodes.insert(dependency) {
                    stack.push(dependency);
                }
            }
        }

        let plan = self.registry.toposort(&nodes)?;
        Ok(self.execute(plan, &roots))
    }

    fn roots<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<NodeIndex>, ConfigError> {
        names
            .iter()
            .map(|name| {
                self.registry
                    .index(name.as_ref())
                    .ok_or_else(|| ConfigError::UnknownTask(name.as_ref().to_string()))
            })
            .collect()
    }

    fn execute(&self, plan: Vec<NodeIndex>, requested: &[NodeIndex]) -> Run {
        let graph = &self.registry.graph;
        let started = Instant::now();

        let position: HashMap<NodeIndex, usize> =
            plan.iter().enumerate().map(|(pos, &index)| (index, pos)).collect();

        // Only dependencies which take part in this run are counted.
        let mut counts: HashMap<NodeIndex, usize> = plan
            .iter()
            .map(|&index| {
                let count = self
                    .registry
                    .dependencies_of(index)
                    .filter(|d| position.contains_key(d))
                    .count();
                (index, count)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| Reverse(position[index]))
            .collect();

        let mut statuses: HashMap<NodeIndex, Status> =
            plan.iter().map(|&index| (index, Status::Pending)).collect();
        let mut poisoned = HashSet::new();
        let mut log = Vec::new();
        let mut failures = Vec::new();
        let mut timings = HashMap::new();
        let mut remaining = plan.len();

        let root_span = tracing::span!(Level::INFO, "run");
        root_span.pb_set_length(plan.len() as u64);
        root_span.pb_set_style(&progress_style_run());
        root_span.pb_set_message("Running tasks...");
        let _enter = root_span.enter();

        let task_style = progress_style_task();

        self.pool.in_place_scope(|s| {
            let (result_sender, result_receiver) =
                channel::<(NodeIndex, Result<(), TaskError>, TaskExecution)>();

            let unlock = |index: NodeIndex,
                              failed: bool,
                              counts: &mut HashMap<NodeIndex, usize>,
                              poisoned: &mut HashSet<NodeIndex>,
                              ready: &mut BinaryHeap<Reverse<usize>>| {
                for dependent in self.registry.dependents(index) {
                    if let Some(count) = counts.get_mut(&dependent) {
                        if failed {
                            poisoned.insert(dependent);
                        }
                        *count -= 1;
                        if *count == 0 {
                            ready.push(Reverse(position[&dependent]));
                        }
                    }
                }
            };

            while remaining > 0 {
                while let Some(Reverse(pos)) = ready.pop() {
                    let index = plan[pos];
                    let task = graph[index].clone();

                    if poisoned.contains(&index) {
                        tracing::warn!(task = %task.name, "skipped, a dependency failed");
                        statuses.insert(index, Status::Skipped);
                        remaining -= 1;
                        root_span.pb_inc(1);
                        unlock(index, true, &mut counts, &mut poisoned, &mut ready);
                        continue;
                    }

                    statuses.insert(index, Status::Running);

                    let sender = result_sender.clone();
                    let task_style = task_style.clone();
                    let parent = root_span.clone();
                    let output = &self.options.output;
                    let timeout = self.options.timeout;
                    let reserved = self.registry.reserved_for(index);

                    s.spawn(move |_| {
                        let span = tracing::span!(parent: &parent, Level::INFO, "task", name = %task.name);
                        span.pb_set_style(&task_style);
                        span.pb_set_message(&format!("Running {}", task.name));
                        let _enter = span.enter();

                        let context = TaskContext {
                            name: &task.name,
                            output,
                            timeout,
                            span: span.clone(),
                            reserved: &reserved,
                        };

                        let start = Instant::now();

                        let result = match std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| (task.action)(&context)),
                        ) {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(err)) => Err(TaskError::from_anyhow(&task.name, &err)),
                            Err(panic) => Err(TaskError::panicked(&task.name, &*panic)),
                        };

                        let execution = TaskExecution {
                            start,
                            duration: start.elapsed(),
                        };

                        // The scheduler outlives every spawned task.
                        let _ = sender.send((index, result, execution));
                    });
                }

                if remaining == 0 {
                    break;
                }

                let Ok((index, result, execution)) = result_receiver.recv() else {
                    break;
                };

                let name = graph[index].name.clone();
                let failed = match result {
                    Ok(()) => {
                        tracing::info!(task = %name, "finished {}", crate::io::as_overhead(execution.start));
                        statuses.insert(index, Status::Done);
                        false
                    }
                    Err(err) => {
                        self.reporter.report(&name, &err);
                        failures.push(err);
                        statuses.insert(index, Status::Failed);
                        true
                    }
                };

                log.push(name.clone());
                timings.insert(name, execution);
                remaining -= 1;
                root_span.pb_inc(1);
                unlock(index, failed, &mut counts, &mut poisoned, &mut ready);
            }
        });

        {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            for (&index, &status) in &statuses {
                ledger.insert(index, status);
            }
        }

        let run = Run {
            requested: requested.iter().map(|&i| graph[i].name.clone()).collect(),
            order: plan.iter().map(|&i| graph[i].name.clone()).collect(),
            statuses: statuses
                .into_iter()
                .map(|(i, status)| (graph[i].name.clone(), status))
                .collect(),
            log,
            timings,
            failures,
            elapsed: started.elapsed(),
        };

        match run.outcome() {
            Outcome::Success => tracing::info!("run finished {}", crate::io::as_overhead(started)),
            outcome => tracing::warn!(%outcome, "run finished {}", crate::io::as_overhead(started)),
        }

        run
    }
}

fn progress_style_run() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn progress_style_task() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("  {spinner:.dim} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::task::{OutputScope, TaskResult};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: Log, name: &'static str) -> impl Fn(&TaskContext<'_>) -> TaskResult {
        move |_| {
            log.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn failing(log: Log, name: &'static str) -> impl Fn(&TaskContext<'_>) -> TaskResult {
        move |_| {
            log.lock().unwrap().push(name.to_string());
            anyhow::bail!("{name} failed")
        }
    }

    fn runner(registry: TaskRegistry, jobs: usize) -> Runner {
        let options = RunnerOptions {
            jobs,
            ..RunnerOptions::default()
        };
        Runner::new(registry, options).unwrap()
    }

    #[test]
    fn chain_runs_in_dependency_order() {
        let log = Log::default();
        let mut registry = TaskRegistry::new();
        registry.register("a", ["b"], recording(log.clone(), "a")).unwrap();
        registry.register("b", ["c"], recording(log.clone(), "b")).unwrap();
        registry.register("c", Vec::<String>::new(), recording(log.clone(), "c")).unwrap();

        let run = runner(registry, 4).run(&["a"]).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        assert_eq!(run.log(), ["c", "b", "a"]);
        assert_eq!(run.outcome(), Outcome::Success);
    }

    #[test]
    fn failure_skips_dependents_but_not_siblings() {
        let log = Log::default();
        let mut registry = TaskRegistry::new();
        registry.register("clean", Vec::<String>::new(), recording(log.clone(), "clean")).unwrap();
        registry.register("copy", Vec::<String>::new(), recording(log.clone(), "copy")).unwrap();
        registry.register("compile", ["clean"], failing(log.clone(), "compile")).unwrap();

        let runner = runner(registry, 2);
        let run = runner.run(&["compile", "copy"]).unwrap();

        assert_eq!(run.status("copy"), Some(Status::Done));
        assert_eq!(run.status("clean"), Some(Status::Done));
        assert_eq!(run.status("compile"), Some(Status::Failed));
        assert_eq!(run.outcome(), Outcome::Degraded);

        assert_eq!(run.failures().len(), 1);
        assert_eq!(run.failures()[0].task, "compile");
        assert_eq!(runner.reporter().failures().len(), 1);
    }

    #[test]
    fn dependents_of_failure_are_skipped_transitively() {
        let log = Log::default();
        let mut registry = TaskRegistry::new();
        registry.register("a", Vec::<String>::new(), failing(log.clone(), "a")).unwrap();
        registry.register("b", ["a"], recording(log.clone(), "b")).unwrap();
        registry.register("c", ["b"], recording(log.clone(), "c")).unwrap();
        registry.register("d", Vec::<String>::new(), recording(log.clone(), "d")).unwrap();

        let run = runner(registry, 1).run(&["c", "d"]).unwrap();

        assert_eq!(run.status("a"), Some(Status::Failed));
        assert_eq!(run.status("b"), Some(Status::Skipped));
        assert_eq!(run.status("c"), Some(Status::Skipped));
        assert_eq!(run.status("d"), Some(Status::Done));
        assert!(!log.lock().unwrap().contains(&"b".to_string()));
        assert!(!log.lock().unwrap().contains(&"c".to_string()));
        assert_eq!(run.outcome(), Outcome::Degraded);
    }

    #[test]
    fn only_requested_failure_is_failed_outcome() {
        let log = Log::default();
        let mut registry = TaskRegistry::new();
        registry.register("a", Vec::<String>::new(), failing(log.clone(), "a")).unwrap();
        registry.register("b", ["a"], recording(log.clone(), "b")).unwrap();

        let run = runner(registry, 1).run(&["b"]).unwrap();
        assert_eq!(run.outcome(), Outcome::Failed);
    }

    #[test]
    fn panicking_action_fails_the_task() {
        let mut registry = TaskRegistry::new();
        registry
            .register("boom", Vec::<String>::new(), |_| panic!("kaboom"))
            .unwrap();
        registry.register("ok", Vec::<String>::new(), |_| Ok(())).unwrap();

        let run = runner(registry, 2).run(&["boom", "ok"]).unwrap();
        assert_eq!(run.status("boom"), Some(Status::Failed));
        assert_eq!(run.status("ok"), Some(Status::Done));
        assert!(run.failures()[0].message.contains("kaboom"));
    }

    #[test]
    fn shared_dependency_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        let c = counter.clone();
        registry
            .register("base", Vec::<String>::new(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        registry.register("left", ["base"], |_| Ok(())).unwrap();
        registry.register("right", ["base"], |_| Ok(())).unwrap();
        registry.register("top", ["left", "right"], |_| Ok(())).unwrap();

        let run = runner(registry, 4).run(&["top", "left", "right"]).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(run.log().len(), 4);
    }

    #[test]
    fn task_starts_only_after_dependencies_are_terminal() {
        let log = Log::default();
        let mut registry = TaskRegistry::new();
        let l = log.clone();
        registry
            .register("slow", Vec::<String>::new(), move |_| {
                thread::sleep(Duration::from_millis(50));
                l.lock().unwrap().push("slow".into());
                Ok(())
            })
            .unwrap();
        registry.register("fast", Vec::<String>::new(), recording(log.clone(), "fast")).unwrap();
        registry.register("after", ["slow", "fast"], recording(log.clone(), "after")).unwrap();

        runner(registry, 4).run(&["after"]).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.last().map(String::as_str), Some("after"));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn single_worker_follows_plan_order() {
        let log = Log::default();
        let mut registry = TaskRegistry::new();
        for name in ["e", "d", "c", "b", "a"] {
            registry.register(name, Vec::<String>::new(), recording(log.clone(), name)).unwrap();
        }

        let runner = runner(registry, 1);
        let run = runner.run(&["a", "b", "c", "d", "e"]).unwrap();
        assert_eq!(run.log(), ["e", "d", "c", "b", "a"]);

        let run = runner.run(&["a", "b", "c", "d", "e"]).unwrap();
        assert_eq!(run.log(), ["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn cycle_runs_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        for (name, dep) in [("a", "b"), ("b", "a")] {
            let c = counter.clone();
            registry
                .register(name, [dep], move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        let err = runner(registry, 2).run(&["a"]).unwrap_err();
        assert!(matches!(err, ConfigError::CyclicDependency { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_task_is_rejected() {
        let runner = runner(TaskRegistry::new(), 1);
        assert_eq!(
            runner.run(&["nope"]).unwrap_err(),
            ConfigError::UnknownTask("nope".into())
        );
    }

    #[test]
    fn statuses_reset_between_runs() {
        let flaky = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        let f = flaky.clone();
        registry
            .register("flaky", Vec::<String>::new(), move |_| {
                if f.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first time fails");
                }
                Ok(())
            })
            .unwrap();

        let runner = runner(registry, 1);
        assert_eq!(runner.run(&["flaky"]).unwrap().outcome(), Outcome::Failed);
        assert_eq!(runner.run(&["flaky"]).unwrap().outcome(), Outcome::Success);
    }

    #[test]
    fn rerun_skips_satisfied_dependencies() {
        let log = Log::default();
        let mut registry = TaskRegistry::new();
        registry.register("clean", Vec::<String>::new(), recording(log.clone(), "clean")).unwrap();
        registry.register("lint", Vec::<String>::new(), recording(log.clone(), "lint")).unwrap();
        registry.register("scripts", ["clean", "lint"], recording(log.clone(), "scripts")).unwrap();
        registry.register("styles", ["clean"], recording(log.clone(), "styles")).unwrap();

        let runner = runner(registry, 1);
        runner.run(&["scripts", "styles"]).unwrap();
        log.lock().unwrap().clear();

        let run = runner.rerun(&["lint"]).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["lint", "scripts"]);
        assert_eq!(run.status("clean"), None);
        assert_eq!(run.outcome(), Outcome::Success);
    }

    #[test]
    fn rerun_retries_failed_dependencies() {
        let log = Log::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        let a = attempts.clone();
        let l = log.clone();
        registry
            .register("clean", Vec::<String>::new(), move |_| {
                l.lock().unwrap().push("clean".into());
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("locked");
                }
                Ok(())
            })
            .unwrap();
        registry.register("styles", ["clean"], recording(log.clone(), "styles")).unwrap();

        let runner = runner(registry, 1);
        let first = runner.run(&["styles"]).unwrap();
        assert_eq!(first.status("styles"), Some(Status::Skipped));
        log.lock().unwrap().clear();

        let run = runner.rerun(&["styles"]).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["clean", "styles"]);
        assert_eq!(run.outcome(), Outcome::Success);
    }

    #[test]
    fn context_carries_output_root() {
        let seen = Arc::new(Mutex::new(None));
        let mut registry = TaskRegistry::new();
        let s = seen.clone();
        registry
            .register("inspect", Vec::<String>::new(), move |ctx| {
                *s.lock().unwrap() = Some(ctx.output_path("css").to_string());
                Ok(())
            })
            .unwrap();

        let options = RunnerOptions {
            jobs: 1,
            output: "out".into(),
            ..RunnerOptions::default()
        };
        Runner::new(registry, options).unwrap().run(&["inspect"]).unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("out/css"));
    }

    #[test]
    fn context_carries_concurrent_trees() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskRegistry::new();
        registry
            .task("styles")
            .output(OutputScope::tree("css"))
            .run(|_| Ok(()))
            .unwrap();
        let s = seen.clone();
        registry
            .task("copy")
            .output(OutputScope::files(""))
            .run(move |ctx| {
                s.lock().unwrap().push(ctx.is_reserved("css/site.css"));
                s.lock().unwrap().push(ctx.is_reserved("index.html"));
                Ok(())
            })
            .unwrap();

        let options = RunnerOptions {
            jobs: 1,
            ..RunnerOptions::default()
        };
        Runner::new(registry, options).unwrap().run(&["copy"]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }
}
