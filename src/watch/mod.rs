//! Watch mode.
//!
//! A [`Watcher`] maps filesystem changes to task names through glob
//! bindings. Every glob is split into a static root, watched recursively with
//! `notify`, and an absolute pattern which changed paths are matched against.
//! Overlapping roots are collapsed so each directory is watched once.
//!
//! Changed files are hashed with `blake3` and compared with the last known
//! contents, so saving a file without editing it does not trigger anything.
//!
//! Task names leave the watcher through a channel, where the
//! [`event_loop`] debounces them per task and hands them to the runner one
//! batch at a time.

mod debounce;

pub use debounce::{Coalescer, RequestQueue};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};

use crate::engine::{Run, Runner};
use crate::error::{ConfigError, WatchError};

/// Settle interval of the underlying filesystem debouncer. Task level
/// debouncing happens in the [`Coalescer`].
const SETTLE: Duration = Duration::from_millis(50);

/// How often the event loop looks at finished runs while idle.
const TICK: Duration = Duration::from_millis(50);

/// A glob which re-runs a task when a matching file changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBinding {
    pub pattern: String,
    pub task: String,
}

#[derive(Debug, Clone)]
struct Binding {
    matcher: Pattern,
    task: String,
}

/// Maps filesystem changes to tasks.
pub struct Watcher {
    bindings: Vec<WatchBinding>,
    matchers: Vec<Binding>,
    roots: HashSet<Utf8PathBuf>,
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            matchers: Vec::new(),
            roots: HashSet::new(),
            debouncer: None,
        }
    }

    /// Re-runs `task` whenever a file matching `pattern` changes. The static
    /// part of the pattern must exist.
    pub fn bind(&mut self, pattern: &str, task: &str) -> Result<(), WatchError> {
        let (root, matcher) = resolve_watch_path(pattern)?;

        self.roots.insert(root);
        self.matchers.push(Binding {
            matcher,
            task: task.to_string(),
        });
        self.bindings.push(WatchBinding {
            pattern: pattern.to_string(),
            task: task.to_string(),
        });

        Ok(())
    }

    pub fn bindings(&self) -> &[WatchBinding] {
        &self.bindings
    }

    /// Tasks bound to an absolute path, each at most once.
    pub fn tasks_for(&self, path: &Utf8Path) -> Vec<String> {
        match_tasks(&self.matchers, path)
    }

    /// Starts watching. Names of tasks whose inputs changed are sent through
    /// `sender`, once per change.
    pub fn start(&mut self, sender: Sender<String>) -> Result<(), WatchError> {
        if self.debouncer.is_some() {
            return Ok(());
        }

        let matchers = self.matchers.clone();
        let mut filter = ChangeFilter::default();
        for binding in &matchers {
            filter.seed(binding.matcher.as_str());
        }

        let mut debouncer = new_debouncer(SETTLE, None, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(errors) => {
                    for error in errors {
                        tracing::error!("watch error: {error}");
                    }
                    return;
                }
            };

            let mut dirty = Vec::new();
            for event in &events {
                let removed = match event.kind {
                    EventKind::Access(_) => continue,
                    EventKind::Remove(_) => true,
                    _ => false,
                };

                for path in &event.paths {
                    let Some(path) = Utf8Path::from_path(path) else {
                        tracing::debug!("ignoring non UTF-8 path {}", path.display());
                        continue;
                    };

                    let tasks = match_tasks(&matchers, path);
                    if tasks.is_empty() || !filter.changed(path, removed) {
                        continue;
                    }

                    tracing::debug!("{} changed", path);
                    for task in tasks {
                        if !dirty.contains(&task) {
                            dirty.push(task);
                        }
                    }
                }
            }

            for task in dirty {
                // The receiving side went away, nothing left to notify.
                if sender.send(task).is_err() {
                    return;
                }
            }
        })?;

        for root in collapse_watch_paths(self.roots.clone()) {
            tracing::info!("watching {}", root);
            debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
        }

        self.debouncer = Some(debouncer);
        Ok(())
    }

    /// Drops the filesystem subscription. Calling it again does nothing.
    pub fn stop(&mut self) {
        if self.debouncer.take().is_some() {
            tracing::info!("stopped watching");
        }
    }

    pub fn is_running(&self) -> bool {
        self.debouncer.is_some()
    }
}

fn match_tasks(bindings: &[Binding], path: &Utf8Path) -> Vec<String> {
    let mut tasks = Vec::new();
    for binding in bindings {
        if binding.matcher.matches_path(path.as_std_path()) && !tasks.contains(&binding.task) {
            tasks.push(binding.task.clone());
        }
    }
    tasks
}

/// Remembers file contents by hash to tell real edits from touches.
#[derive(Debug, Default)]
pub(crate) struct ChangeFilter {
    hashes: HashMap<Utf8PathBuf, blake3::Hash>,
}

impl ChangeFilter {
    /// Hashes every file currently matching `pattern`.
    pub(crate) fn seed(&mut self, pattern: &str) {
        let Ok(paths) = glob::glob(pattern) else {
            return;
        };

        for path in paths.flatten() {
            if let Ok(path) = Utf8PathBuf::try_from(path)
                && let Ok(data) = fs::read(&path)
            {
                self.hashes.insert(path, blake3::hash(&data));
            }
        }
    }

    /// Whether `path` differs from what was last seen. Removals always
    /// count as changes, as do files which cannot be read.
    pub(crate) fn changed(&mut self, path: &Utf8Path, removed: bool) -> bool {
        if removed {
            self.hashes.remove(path);
            return true;
        }

        match fs::read(path) {
            Ok(data) => {
                let hash = blake3::hash(&data);
                self.hashes.insert(path.to_owned(), hash) != Some(hash)
            }
            Err(_) => true,
        }
    }
}

/// Debounces task names from `events` and re-runs them on `runner`, one
/// batch at a time, calling `on_run` after every batch.
///
/// Runs execute on a separate thread, so changes keep being collected while
/// a build is in progress. When `events` disconnects, requests still waiting
/// out their window are flushed and the function returns once the last run
/// has finished.
pub fn event_loop<F>(runner: &Runner, events: Receiver<String>, window: Duration, mut on_run: F)
where
    F: FnMut(&Run),
{
    let mut coalescer = Coalescer::new(window);
    let mut queue = RequestQueue::default();
    let mut open = true;

    thread::scope(|s| {
        let (job_tx, job_rx) = mpsc::channel::<Vec<String>>();
        let (done_tx, done_rx) = mpsc::channel::<Result<Run, ConfigError>>();

        s.spawn(move || {
            for batch in job_rx {
                let result = runner.rerun(&batch);
                if done_tx.send(result).is_err() {
                    break;
                }
            }
        });

        let mut settle = |result: Result<Run, ConfigError>, queue: &mut RequestQueue| {
            queue.finish();
            match result {
                Ok(run) => on_run(&run),
                Err(err) => tracing::error!("{err}"),
            }
        };

        loop {
            while let Ok(result) = done_rx.try_recv() {
                settle(result, &mut queue);
            }

            if open {
                let wait = coalescer
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                    .map_or(TICK, |wait| wait.min(TICK));

                match events.recv_timeout(wait) {
                    Ok(task) => coalescer.push(task, Instant::now()),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => open = false,
                }
            } else if let Ok(result) = done_rx.recv_timeout(TICK) {
                settle(result, &mut queue);
            }

            let ready = if open {
                coalescer.ready(Instant::now())
            } else {
                coalescer.drain()
            };
            queue.submit(ready);

            if let Some(batch) = queue.begin() {
                tracing::info!("change detected, re-running {}", batch.join(", "));
                if job_tx.send(batch).is_err() {
                    break;
                }
            }

            if !open && !queue.is_busy() && queue.is_empty() {
                break;
            }
        }

        drop(job_tx);
    });
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(glob_str: &str) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let path = Utf8Path::new(glob_str);

    // Split path into static root and dynamic suffix (containing wildcards)
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix_part: Utf8PathBuf = components.iter().skip(split_idx).collect();

    let root_part = if root_part.as_str().is_empty() {
        Utf8PathBuf::from(".")
    } else {
        root_part
    };

    // Canonicalize the static root (must exist on disk)
    let absolute_root = root_part
        .canonicalize_utf8()
        .map_err(|e| WatchError::Root(glob_str.to_string(), e))?;

    // The root is a literal path and may contain glob metacharacters of its
    // own, only the suffix below it is a pattern.
    let root_pattern = Pattern::escape(absolute_root.as_str());

    let (watch_root, pattern) = if !suffix_part.as_str().is_empty() {
        let pattern = format!("{root_pattern}/{suffix_part}");
        (absolute_root, pattern)
    } else if absolute_root.is_file() {
        // A concrete file is watched through its parent, so that atomic
        // writes (write to temp, rename over) are caught.
        let parent = absolute_root
            .parent()
            .unwrap_or(&absolute_root)
            .to_path_buf();
        (parent, root_pattern)
    } else {
        (absolute_root, root_pattern)
    };

    let matcher =
        Pattern::new(&pattern).map_err(|e| WatchError::Pattern(glob_str.to_string(), e))?;

    Ok((watch_root, matcher))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive. This function sorts the paths and filters
/// out any path that is a subdirectory of a previously accepted path.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::engine::RunnerOptions;
    use crate::registry::TaskRegistry;

    fn cwd() -> Utf8PathBuf {
        Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap()
    }

    #[test]
    fn test_concrete_file() {
        let (watch, pattern) = resolve_watch_path("Cargo.toml").expect("Should resolve");

        assert_eq!(watch.as_str(), cwd());
        assert!(pattern.matches_path(cwd().join("Cargo.toml").as_std_path()));
        assert!(!pattern.matches_path(cwd().join("Cargo.lock").as_std_path()));
    }

    #[test]
    fn test_concrete_directory() {
        let (watch, pattern) = resolve_watch_path("src").expect("Should resolve");

        assert_eq!(watch.as_str(), cwd().join("src"));
        assert!(pattern.matches_path(cwd().join("src").as_std_path()));
    }

    #[test]
    fn test_directory_wildcard() {
        let (watch, pattern) = resolve_watch_path("src/**/*.rs").expect("Should resolve");

        assert_eq!(watch.as_str(), cwd().join("src"));
        assert!(pattern.matches_path(cwd().join("src/watch/mod.rs").as_std_path()));
        assert!(!pattern.matches_path(cwd().join("Cargo.toml").as_std_path()));
    }

    #[test]
    fn test_missing_root() {
        let err = resolve_watch_path("no-such-dir/**/*.less").unwrap_err();
        assert!(matches!(err, WatchError::Root(..)));
    }

    #[test]
    fn test_collapse_watch_paths() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/a"));
        paths.insert(Utf8PathBuf::from("/a/b"));
        paths.insert(Utf8PathBuf::from("/a/b/c"));
        paths.insert(Utf8PathBuf::from("/b"));
        paths.insert(Utf8PathBuf::from("/c/d"));

        let collapsed = collapse_watch_paths(paths);

        // /a/b and /a/b/c are covered by /a.
        assert_eq!(
            collapsed,
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/b"),
                Utf8PathBuf::from("/c/d")
            ]
        );
    }

    #[test]
    fn test_collapse_watch_paths_similar_names() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/foo"));
        paths.insert(Utf8PathBuf::from("/foo-bar"));

        let collapsed = collapse_watch_paths(paths);

        // /foo-bar is not a subdirectory of /foo
        assert_eq!(
            collapsed,
            vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]
        );
    }

    #[test]
    fn one_path_many_bindings_one_request_per_task() {
        let mut watcher = Watcher::new();
        watcher.bind("src/**/*.rs", "lint").unwrap();
        watcher.bind("src/**/*.rs", "compile-scripts").unwrap();
        watcher.bind("src/watch/*.rs", "lint").unwrap();

        let tasks = watcher.tasks_for(&cwd().join("src/watch/mod.rs"));
        assert_eq!(tasks, vec!["lint", "compile-scripts"]);
        assert!(watcher.tasks_for(&cwd().join("Cargo.toml")).is_empty());
        assert_eq!(watcher.bindings().len(), 3);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut watcher = Watcher::new();
        watcher.stop();
        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[test]
    fn unchanged_contents_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let file = root.join("master.less");
        fs::write(&file, "a { color: red; }").unwrap();

        let mut filter = ChangeFilter::default();
        filter.seed(root.join("*.less").as_str());

        assert!(!filter.changed(&file, false));

        fs::write(&file, "a { color: blue; }").unwrap();
        assert!(filter.changed(&file, false));
        assert!(!filter.changed(&file, false));

        fs::remove_file(&file).unwrap();
        assert!(filter.changed(&file, true));
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn runner(log: &Log) -> Runner {
        let mut registry = TaskRegistry::new();
        for (name, deps) in [("clean", vec![]), ("compile-styles", vec!["clean"])] {
            let log = log.clone();
            registry
                .register(name, deps, move |ctx| {
                    log.lock().unwrap().push(ctx.name.to_string());
                    Ok(())
                })
                .unwrap();
        }

        let options = RunnerOptions {
            jobs: 1,
            ..RunnerOptions::default()
        };
        Runner::new(registry, options).unwrap()
    }

    #[test]
    fn burst_of_changes_runs_once() {
        let log = Log::default();
        let runner = runner(&log);
        runner.run(&["compile-styles"]).unwrap();
        log.lock().unwrap().clear();

        let (tx, rx) = mpsc::channel();
        for _ in 0..5 {
            tx.send("compile-styles".to_string()).unwrap();
        }
        drop(tx);

        let mut runs = 0;
        event_loop(&runner, rx, Duration::from_millis(20), |_| runs += 1);

        assert_eq!(runs, 1);
        assert_eq!(*log.lock().unwrap(), vec!["compile-styles"]);
    }

    #[test]
    fn spaced_changes_run_separately() {
        let log = Log::default();
        let runner = runner(&log);
        runner.run(&["compile-styles"]).unwrap();
        log.lock().unwrap().clear();

        let (tx, rx) = mpsc::channel();
        let sender = thread::spawn(move || {
            for _ in 0..2 {
                tx.send("compile-styles".to_string()).unwrap();
                thread::sleep(Duration::from_millis(300));
            }
        });

        let mut runs = 0;
        event_loop(&runner, rx, Duration::from_millis(20), |run| {
            assert_eq!(run.requested(), ["compile-styles"]);
            runs += 1;
        });
        sender.join().unwrap();

        assert_eq!(runs, 2);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn rejected_batch_does_not_end_the_loop() {
        let log = Log::default();
        let runner = runner(&log);

        let (tx, rx) = mpsc::channel();
        let sender = thread::spawn(move || {
            tx.send("no-such-task".to_string()).unwrap();
            thread::sleep(Duration::from_millis(300));
            tx.send("clean".to_string()).unwrap();
        });

        let mut runs = 0;
        event_loop(&runner, rx, Duration::from_millis(10), |_| runs += 1);
        sender.join().unwrap();

        // The valid request re-runs `clean` and its dependent.
        assert_eq!(runs, 1);
        assert_eq!(*log.lock().unwrap(), vec!["clean", "compile-styles"]);
    }
}
