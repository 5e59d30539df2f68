use std::fmt::Display;
use std::process::Command;
use std::time::Duration;

use camino::Utf8PathBuf;
use console::Style;

use crate::error::{Location, ToolError};
use crate::tools::process;

const ANSI_PASS: Style = Style::new().green();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One problem reported by the linter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    pub location: Location,
    pub rule: Option<String>,
}

impl Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)?;
        if let Some(rule) = &self.rule {
            write!(f, " ({rule})")?;
        }
        Ok(())
    }
}

/// Runs `eslint` over `sources` and logs every finding.
///
/// Findings never fail the call on their own; the caller decides whether
/// errors are fatal. Only a linter which could not run at all is reported as
/// a [`ToolError`].
pub fn run(
    eslint: &str,
    sources: &[Utf8PathBuf],
    timeout: Duration,
) -> Result<Vec<Finding>, ToolError> {
    let mut command = Command::new(eslint);
    command
        .arg("--format")
        .arg("compact")
        .arg("--no-color")
        .args(sources.iter().map(|s| s.as_str()));

    let result = process::run(eslint.to_string(), command, None, timeout)?;

    // 0: clean, 1: problems found, anything else: the linter itself failed
    if !matches!(result.status.code(), Some(0 | 1)) {
        return Err(ToolError::failed(eslint.to_string(), result.failure_message()));
    }

    let stdout = String::from_utf8_lossy(&result.stdout);
    let findings = parse_compact(&stdout);

    for finding in &findings {
        match finding.severity {
            Severity::Error => tracing::error!(tool = eslint, "{finding}"),
            Severity::Warning => tracing::warn!(tool = eslint, "{finding}"),
        }
    }

    if findings.is_empty() {
        tracing::info!("{}", ANSI_PASS.apply_to("eslint passed, no problems found"));
    }

    Ok(findings)
}

/// Parses `eslint --format compact` output:
///
/// ```text
/// /site/src/js/app.js: line 3, col 5, Error - 'x' is not defined. (no-undef)
/// ```
pub fn parse_compact(output: &str) -> Vec<Finding> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Finding> {
    let (file, rest) = line.split_once(": line ")?;
    let (line_no, rest) = rest.split_once(", col ")?;
    let (column, rest) = rest.split_once(", ")?;
    let (severity, text) = rest.split_once(" - ")?;

    let severity = match severity.trim() {
        "Error" => Severity::Error,
        "Warning" => Severity::Warning,
        _ => return None,
    };

    let (message, rule) = match text.strip_suffix(')').and_then(|t| t.rsplit_once(" (")) {
        Some((message, rule)) if !rule.contains(' ') => (message, Some(rule.to_string())),
        _ => (text, None),
    };

    Some(Finding {
        severity,
        message: message.trim().to_string(),
        location: Location::new(
            file.trim(),
            line_no.trim().parse().ok(),
            column.trim().parse().ok(),
        ),
        rule,
    })
}

/// The failure raised when lint errors are configured to be fatal.
pub fn deny(eslint: &str, findings: &[Finding]) -> Result<(), ToolError> {
    let mut errors = findings.iter().filter(|f| f.severity == Severity::Error);

    let Some(first) = errors.next() else {
        return Ok(());
    };

    let count = 1 + errors.count();
    Err(ToolError::Failed {
        tool: eslint.to_string().into(),
        message: format!("{count} lint error(s), first: {}", first.message),
        location: Some(first.location.clone()),
    })
}
