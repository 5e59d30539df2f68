#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
mod engine;
mod error;
mod io;
pub mod pipeline;
mod registry;
mod report;
#[cfg(feature = "server")]
pub mod serve;
mod task;
pub mod tools;
#[cfg(feature = "live")]
pub mod watch;

pub use crate::config::Config;
pub use crate::engine::{Outcome, Run, Runner, RunnerOptions, TaskExecution};
pub use crate::error::*;
pub use crate::pipeline::Pipeline;
pub use crate::registry::{TaskDef, TaskRegistry};
pub use crate::report::ErrorReporter;
pub use crate::task::{OutputScope, Status, Task, TaskContext, TaskResult};
