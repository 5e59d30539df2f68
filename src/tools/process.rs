use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::ToolError;

const POLL: Duration = Duration::from_millis(10);

/// Captured result of an external process which ran to completion.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Last few meaningful lines of stderr, or the exit status when the tool
    /// printed nothing.
    pub fn failure_message(&self) -> String {
        let lines: Vec<_> = self
            .stderr
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .collect();

        if lines.is_empty() {
            return format!("exited with {}", self.status);
        }

        lines[lines.len().saturating_sub(8)..].join("\n")
    }
}

/// Runs `command` to completion, feeding it `stdin` if given.
///
/// Both output pipes are drained on their own threads so that a chatty tool
/// can never block on a full pipe. If the process is still alive after
/// `timeout` it is killed and [`ToolError::Timeout`] is returned.
///
/// A non-zero exit status is not an error at this level, tools differ in
/// what they print on failure and the caller knows how to read it.
pub fn run(
    tool: impl Into<Cow<'static, str>>,
    mut command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ToolOutput, ToolError> {
    let tool = tool.into();

    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::debug!(tool = %tool, "spawning {:?}", command);

    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.clone(),
        source,
    })?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(data), Some(mut pipe)) => Some(thread::spawn(move || pipe.write_all(&data))),
        _ => None,
    };
    let stdout = child.stdout.take().map(|pipe| thread::spawn(move || drain(pipe)));
    let stderr = child.stderr.take().map(|pipe| thread::spawn(move || drain(pipe)));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(tool = %tool, "killed after {:.2?}", timeout);
                return Err(ToolError::Timeout {
                    tool,
                    after: timeout,
                });
            }
            Ok(None) => thread::sleep(POLL),
            Err(source) => return Err(ToolError::Io { tool, source }),
        }
    };

    if let Some(writer) = writer {
        match writer.join() {
            Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
                return Err(ToolError::Io { tool, source: e });
            }
            _ => {}
        }
    }

    let stdout = collect(stdout).map_err(|source| ToolError::Io {
        tool: tool.clone(),
        source,
    })?;
    let stderr = collect(stderr).map_err(|source| ToolError::Io {
        tool: tool.clone(),
        source,
    })?;

    Ok(ToolOutput {
        status,
        stdout,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn drain(mut pipe: impl Read) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    pipe.read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn collect(handle: Option<JoinHandle<io::Result<Vec<u8>>>>) -> io::Result<Vec<u8>> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| io::Error::other("pipe reader panicked"))?,
        None => Ok(Vec::new()),
    }
}
