//! Tasks are the nodes of the build graph.
//!
//! A [`Task`] is a named unit of work with an ordered list of dependencies
//! declared by name. The action itself is a plain closure returning
//! `anyhow::Result<()>`, so userland code can use `?` on any error type;
//! failures from external tools are recognised through
//! [`ToolError`](crate::ToolError) when they surface in the error chain.

use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::Span;

/// Result returned by a task action.
pub type TaskResult = anyhow::Result<()>;

/// Type-erased task action.
pub(crate) type Action = Arc<dyn Fn(&TaskContext<'_>) -> TaskResult + Send + Sync>;

/// State of a task within a single run.
///
/// `Skipped` is reached only by propagation from a failed dependency, never
/// directly from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed | Status::Skipped)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Done => "done",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        })
    }
}

/// The part of the output root a task is allowed to write to.
///
/// Paths are relative to the output root; the empty path is the root itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputScope {
    /// The task owns the whole subtree and may delete it.
    Tree(Utf8PathBuf),
    /// The task only writes individual files somewhere below the path, and
    /// never inside a subtree another concurrent task holds as a `Tree`
    /// (see [`TaskContext::is_reserved`]).
    Files(Utf8PathBuf),
}

impl OutputScope {
    pub fn tree(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Tree(path.into())
    }

    pub fn files(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Files(path.into())
    }

    pub fn path(&self) -> &Utf8Path {
        match self {
            Self::Tree(path) | Self::Files(path) => path,
        }
    }

    /// Whether two tasks holding these scopes could interfere if they ran at
    /// the same time.
    pub fn overlaps(&self, other: &OutputScope) -> bool {
        match (self, other) {
            (Self::Tree(a), Self::Tree(b)) => a.starts_with(b) || b.starts_with(a),
            (Self::Tree(tree), Self::Files(files)) | (Self::Files(files), Self::Tree(tree)) => {
                files.starts_with(tree)
            }
            (Self::Files(_), Self::Files(_)) => false,
        }
    }
}

impl Display for OutputScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, path) = match self {
            Self::Tree(path) => ("tree", path),
            Self::Files(path) => ("files", path),
        };

        if path.as_str().is_empty() {
            write!(f, "{kind} <root>")
        } else {
            write!(f, "{kind} {path}")
        }
    }
}

/// A registered unit of build work.
#[derive(Clone)]
pub struct Task {
    pub(crate) name: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) scopes: Vec<OutputScope>,
    pub(crate) action: Action,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn scopes(&self) -> &[OutputScope] {
        &self.scopes
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Data available to a task action while it runs.
pub struct TaskContext<'a> {
    /// Name of the running task.
    pub name: &'a str,
    /// Root of the output directory.
    pub output: &'a Utf8Path,
    /// How long an external process may run before it is killed.
    pub timeout: Duration,
    /// Span of this task, progress bars attach here.
    pub span: Span,
    /// Subtrees owned by tasks which may run at the same time as this one,
    /// relative to the output root.
    pub reserved: &'a [Utf8PathBuf],
}

impl TaskContext<'_> {
    /// Path inside the output root.
    pub fn output_path(&self, rel: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.output.join(rel)
    }

    /// Whether `rel` falls inside a subtree owned by a concurrent task.
    pub fn is_reserved(&self, rel: impl AsRef<Utf8Path>) -> bool {
        is_reserved(self.reserved, rel.as_ref())
    }
}

pub(crate) fn is_reserved(reserved: &[Utf8PathBuf], rel: &Utf8Path) -> bool {
    reserved.iter().any(|tree| rel.starts_with(tree))
}
