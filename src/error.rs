use std::borrow::Cow;
use std::fmt::Display;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::task::OutputScope;

/// Errors raised while assembling the task graph. All of them are fatal to
/// startup: no task action runs while any of them is outstanding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Task '{task}' depends on '{dependency}', which is not registered")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task graph: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Tasks '{first}' ({first_scope}) and '{second}' ({second_scope}) claim overlapping output")]
    ScopeConflict {
        first: String,
        first_scope: OutputScope,
        second: String,
        second_scope: OutputScope,
    },
}

/// Errors raised while reading `kagari.toml`.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, toml::de::Error),
}

/// A position inside a source file reported by an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: Utf8PathBuf,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Location {
    pub fn new(file: impl Into<Utf8PathBuf>, line: Option<u32>, column: Option<u32>) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        Ok(())
    }
}

/// Failure of an external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Couldn't start '{tool}'.\n{source}")]
    Spawn {
        tool: Cow<'static, str>,
        source: std::io::Error,
    },

    #[error("{message}")]
    Failed {
        tool: Cow<'static, str>,
        message: String,
        location: Option<Location>,
    },

    #[error("'{tool}' did not finish within {}s and was killed", .after.as_secs())]
    Timeout {
        tool: Cow<'static, str>,
        after: Duration,
    },

    #[error("I/O error while running '{tool}'.\n{source}")]
    Io {
        tool: Cow<'static, str>,
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn failed(tool: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.into(),
            location: None,
        }
    }

    pub fn tool(&self) -> &str {
        match self {
            Self::Spawn { tool, .. }
            | Self::Failed { tool, .. }
            | Self::Timeout { tool, .. }
            | Self::Io { tool, .. } => tool,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Failed { location, .. } => location.as_ref(),
            _ => None,
        }
    }
}

/// A task action failure, caught at the task boundary. Never fatal to the
/// process, only to the failed task and its dependents within one run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Task '{task}': {message}")]
pub struct TaskError {
    pub task: String,
    /// Identifier of the external tool which produced the failure, if any.
    pub tool: Option<String>,
    pub message: String,
    pub location: Option<Location>,
}

impl TaskError {
    /// Extracts tool and location from a [`ToolError`] anywhere in the chain.
    pub fn from_anyhow(task: impl Into<String>, err: &anyhow::Error) -> Self {
        let tool = err.chain().find_map(|e| e.downcast_ref::<ToolError>());

        Self {
            task: task.into(),
            tool: tool.map(|t| t.tool().to_string()),
            message: format!("{err:#}"),
            location: tool.and_then(ToolError::location).cloned(),
        }
    }

    pub fn panicked(task: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("Task panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("Task panicked: {s}")
        } else {
            String::from("Task panicked with unknown payload")
        };

        Self {
            task: task.into(),
            tool: None,
            message,
            location: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Couldn't start the task pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum ClearError {
    #[error("Failed to empty the output directory.\n{0}")]
    Remove(std::io::Error),

    #[error("Failed to create the output directory.\n{0}")]
    Create(std::io::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Couldn't compile watch pattern '{0}'.\n{1}")]
    Pattern(String, glob::PatternError),

    #[error("Couldn't resolve watch root of '{0}'.\n{1}")]
    Root(String, std::io::Error),

    #[error("Task '{0}' is not registered")]
    UnknownTask(String),
}

#[cfg(feature = "server")]
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to build runtime")]
    Runtime(#[source] std::io::Error),

    #[error("Couldn't bind {0}.\n{1}")]
    Bind(std::net::SocketAddr, std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Everything that can stop one of the long running entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[cfg(feature = "live")]
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[cfg(feature = "server")]
    #[error(transparent)]
    Serve(#[from] ServeError),
}
