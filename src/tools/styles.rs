//! Stylesheet compilation.
//!
//! The default compiler is `lessc`, run as an external process. With the
//! `grass` feature SCSS entry points can be compiled in process instead.
//! The compiled file is then vendor prefixed in place by `postcss` with
//! `autoprefixer`, unless that step is disabled.

use std::process::Command;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{Autoprefix, StyleCompiler, Styles};
use crate::error::{Location, ToolError};
use crate::tools::process;

/// Compiles the stylesheet entry into `out_dir`, returning the path of the
/// written CSS file.
pub fn compile(
    styles: &Styles,
    out_dir: &Utf8Path,
    timeout: Duration,
) -> Result<Utf8PathBuf, ToolError> {
    let stem = styles.entry.file_stem().unwrap_or("styles");
    let output = out_dir.join(stem).with_extension("css");

    match styles.compiler {
        StyleCompiler::Lessc => compile_lessc(styles, &output, timeout)?,
        #[cfg(feature = "grass")]
        StyleCompiler::Grass => compile_grass(styles, &output)?,
        #[cfg(not(feature = "grass"))]
        StyleCompiler::Grass => {
            return Err(ToolError::failed(
                "grass",
                "kagari was built without the `grass` feature",
            ));
        }
    }

    if styles.autoprefix.enabled {
        autoprefix(&styles.autoprefix, &output, styles.source_map, timeout)?;
    }

    Ok(output)
}

/// Adds vendor prefixes to `css`, rewriting it in place.
pub fn autoprefix(
    prefix: &Autoprefix,
    css: &Utf8Path,
    source_map: bool,
    timeout: Duration,
) -> Result<(), ToolError> {
    let tool = prefix.postcss.clone();
    let result = process::run(
        tool.clone(),
        autoprefix_command(prefix, css, source_map),
        None,
        timeout,
    )?;

    if result.success() {
        tracing::debug!("prefixed {} for {}", css, prefix.browsers.join(", "));
        return Ok(());
    }

    Err(match parse_postcss(&result.stderr) {
        Some((message, location)) => ToolError::Failed {
            tool: tool.into(),
            message,
            location: Some(location),
        },
        None => ToolError::failed(tool, result.failure_message()),
    })
}

fn autoprefix_command(prefix: &Autoprefix, css: &Utf8Path, source_map: bool) -> Command {
    let mut command = Command::new(&prefix.postcss);
    command
        .arg(css.as_str())
        .args(["--use", "autoprefixer", "--replace"])
        .arg(if source_map { "--map" } else { "--no-map" })
        .env("BROWSERSLIST", prefix.browsers.join(", "));
    command
}

/// Reads `CssSyntaxError: FILE:L:C: MESSAGE` reports of the PostCSS CLI.
pub fn parse_postcss(stderr: &str) -> Option<(String, Location)> {
    stderr.lines().find_map(|line| {
        let (_, rest) = line.split_once("CssSyntaxError: ")?;
        let (position, message) = rest.split_once(": ")?;

        let mut parts = position.rsplitn(3, ':');
        let column = parts.next()?.parse().ok()?;
        let line = parts.next()?.parse().ok()?;
        let file = parts.next().filter(|f| !f.is_empty())?;

        Some((
            message.trim().to_string(),
            Location::new(file, Some(line), Some(column)),
        ))
    })
}

fn compile_lessc(styles: &Styles, output: &Utf8Path, timeout: Duration) -> Result<(), ToolError> {
    let tool = styles.lessc.clone();

    if let Some(dir) = output.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ToolError::Io {
            tool: tool.clone().into(),
            source,
        })?;
    }

    let mut command = Command::new(&styles.lessc);
    if styles.minify {
        command.arg("--compress");
    }
    if styles.source_map {
        command.arg("--source-map");
    }
    command
        .args(&styles.args)
        .arg(styles.entry.as_str())
        .arg(output.as_str());

    let result = process::run(tool.clone(), command, None, timeout)?;

    if result.success() {
        return Ok(());
    }

    Err(match parse_lessc(&result.stderr) {
        Some((message, location)) => ToolError::Failed {
            tool: tool.into(),
            message,
            location: Some(location),
        },
        None => ToolError::failed(tool, result.failure_message()),
    })
}

/// Picks the message and position out of a `lessc` error report, which reads
/// `ParseError: Unrecognised input in FILE on line L, column C:`.
pub fn parse_lessc(stderr: &str) -> Option<(String, Location)> {
    for line in stderr.lines() {
        let Some((head, tail)) = line.rsplit_once(" on line ") else {
            continue;
        };
        let Some((message, file)) = head.rsplit_once(" in ") else {
            continue;
        };

        let tail = tail.trim().trim_end_matches(':');
        let (line, column) = match tail.split_once(", column ") {
            Some((line, column)) => (line.trim().parse().ok(), column.trim().parse().ok()),
            None => (tail.parse().ok(), None),
        };

        return Some((
            message.trim().to_string(),
            Location::new(file.trim(), line, column),
        ));
    }

    None
}

#[cfg(feature = "grass")]
fn compile_grass(styles: &Styles, output: &Utf8Path) -> Result<(), ToolError> {
    let mut options = grass::Options::default();
    if styles.minify {
        options = options.style(grass::OutputStyle::Compressed);
    }
    if styles.source_map {
        tracing::debug!("grass does not emit source maps, skipping");
    }

    let css = grass::from_path(&styles.entry, &options).map_err(|err| {
        let message = err.to_string();
        ToolError::Failed {
            tool: "grass".into(),
            location: parse_grass(&message),
            message,
        }
    })?;

    crate::io::write_file(output, css).map_err(|source| ToolError::Io {
        tool: "grass".into(),
        source,
    })
}

/// Grass ends its reports with a trace line such as
/// `  styles/main.scss 3:9  root stylesheet`.
#[cfg(any(feature = "grass", test))]
fn parse_grass(message: &str) -> Option<Location> {
    message.lines().rev().find_map(|line| {
        let mut parts = line.split_whitespace();
        let file = parts.next()?;
        let (line, column) = parts.next()?.split_once(':')?;
        Some(Location::new(
            file,
            Some(line.parse().ok()?),
            Some(column.parse().ok()?),
        ))
    })
}
