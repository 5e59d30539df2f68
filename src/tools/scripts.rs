//! Script bundling through `esbuild`.
//!
//! **Note:** this requires the `esbuild` binary to be available in the system
//! PATH.

use std::fs;
use std::process::Command;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Scripts;
use crate::error::{Location, ToolError};
use crate::tools::process;

/// Bundles, transpiles and minifies the script entry into `output`.
pub fn compile(scripts: &Scripts, output: &Utf8Path, timeout: Duration) -> Result<(), ToolError> {
    let mut command = Command::new(&scripts.esbuild);
    command
        .arg(scripts.entry.as_str())
        .arg("--bundle")
        .arg(format!("--target={}", scripts.target))
        .arg(format!("--outfile={output}"))
        .arg("--log-level=error")
        .arg("--color=false");

    if scripts.minify {
        command.arg("--minify");
    }
    if scripts.source_map {
        command.arg("--sourcemap");
    }

    let result = process::run(scripts.esbuild.clone(), command, None, timeout)?;
    check(&scripts.esbuild, &result)
}

/// Concatenates the vendor libraries in order and minifies the result into
/// `output`. The bundle goes through `esbuild` on stdin, so the libraries are
/// not rewritten as modules.
pub fn bundle_libraries(
    scripts: &Scripts,
    output: &Utf8Path,
    timeout: Duration,
) -> Result<(), ToolError> {
    let source = concat(&scripts.libraries).map_err(|source| ToolError::Io {
        tool: "concat".into(),
        source,
    })?;

    let data = if scripts.minify {
        let mut command = Command::new(&scripts.esbuild);
        command
            .arg("--minify")
            .arg("--loader=js")
            .arg(format!("--target={}", scripts.target))
            .arg("--log-level=error")
            .arg("--color=false");

        let result = process::run(scripts.esbuild.clone(), command, Some(source), timeout)?;
        check(&scripts.esbuild, &result)?;
        result.stdout
    } else {
        source
    };

    crate::io::write_file(output, data).map_err(|source| ToolError::Io {
        tool: "concat".into(),
        source,
    })
}

fn concat(files: &[Utf8PathBuf]) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    for file in files {
        let data = fs::read(file)
            .map_err(|e| std::io::Error::new(e.kind(), format!("{file}: {e}")))?;
        buffer.extend_from_slice(&data);
        // Guard against libraries which omit the trailing semicolon.
        buffer.extend_from_slice(b"\n;\n");
    }
    Ok(buffer)
}

fn check(tool: &str, result: &process::ToolOutput) -> Result<(), ToolError> {
    if result.success() {
        return Ok(());
    }

    let (message, location) = parse_esbuild(&result.stderr);
    Err(ToolError::Failed {
        tool: tool.to_string().into(),
        message: message.unwrap_or_else(|| result.failure_message()),
        location,
    })
}

/// Reads the first error out of an esbuild report:
///
/// ```text
/// ✘ [ERROR] Expected ";" but found "}"
///
///     src/js/app.js:3:5:
///       3 │   foo(
///         ╵      ^
/// ```
pub fn parse_esbuild(stderr: &str) -> (Option<String>, Option<Location>) {
    let mut message = None;
    let mut location = None;

    for line in stderr.lines() {
        let trimmed = line.trim();

        if message.is_none() {
            let head = ["✘ [ERROR] ", "X [ERROR] ", "[ERROR] ", "error: "]
                .iter()
                .find_map(|prefix| trimmed.strip_prefix(prefix));
            if let Some(head) = head {
                message = Some(head.trim().to_string());
                continue;
            }
        }

        if message.is_some() && location.is_none() {
            location = parse_position(trimmed);
            if location.is_some() {
                break;
            }
        }
    }

    (message, location)
}

/// `FILE:LINE:COL:`
fn parse_position(text: &str) -> Option<Location> {
    let text = text.strip_suffix(':')?;
    let mut parts = text.rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    let file = parts.next().filter(|f| !f.is_empty())?;
    Some(Location::new(file, Some(line), Some(column)))
}
