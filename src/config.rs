//! Project configuration, read from `kagari.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) describes
//! the conventional layout: sources in `src/`, output in `build/`, LESS entry
//! at `src/LESS/master.less`, script entry at `src/js/app.js`, jQuery bundled
//! as a vendor library, and HTML, images and fonts mirrored as static assets.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::engine::RunnerOptions;
use crate::error::ConfigFileError;

/// Name of the configuration file looked up by default.
pub const CONFIG_FILE: &str = "kagari.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: Paths,
    pub styles: Styles,
    pub scripts: Scripts,
    pub lint: Lint,
    /// Static asset groups mirrored into the output directory.
    #[serde(rename = "static")]
    pub assets: Assets,
    pub watch: Watch,
    pub serve: Serve,
    pub runner: Runner,
}

impl Config {
    /// Reads a configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigFileError> {
        let text =
            fs::read_to_string(path).map_err(|e| ConfigFileError::Read(path.to_owned(), e))?;
        Self::parse(path, &text)
    }

    /// Reads a configuration file, falling back to defaults when it does not
    /// exist.
    pub fn load_or_default(path: &Utf8Path) -> Result<Self, ConfigFileError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("{} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn parse(path: &Utf8Path, text: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(text).map_err(|e| ConfigFileError::Parse(path.to_owned(), e))
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            jobs: self.runner.jobs,
            timeout: Duration::from_secs(self.runner.timeout_secs),
            output: self.paths.output.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    /// Root of the output directory, owned by the `clean` task.
    pub output: Utf8PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            output: "build".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleCompiler {
    /// The `lessc` command line compiler.
    Lessc,
    /// In-process SCSS compilation through `grass`.
    Grass,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Styles {
    /// Stylesheet entry point.
    pub entry: Utf8PathBuf,
    /// Globs which trigger recompilation in watch mode.
    pub watch: Vec<String>,
    pub compiler: StyleCompiler,
    /// Executable used when `compiler = "lessc"`.
    pub lessc: String,
    pub minify: bool,
    pub source_map: bool,
    /// Extra arguments handed to the compiler, e.g. plugins.
    pub args: Vec<String>,
    pub autoprefix: Autoprefix,
}

impl Default for Styles {
    fn default() -> Self {
        Self {
            entry: "src/LESS/master.less".into(),
            watch: vec!["src/LESS/**/*.less".into()],
            compiler: StyleCompiler::Lessc,
            lessc: "lessc".into(),
            minify: true,
            source_map: true,
            args: Vec::new(),
            autoprefix: Autoprefix::default(),
        }
    }
}

/// Vendor prefixing of the compiled stylesheet through `postcss` with the
/// `autoprefixer` plugin.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Autoprefix {
    pub enabled: bool,
    /// Executable of the PostCSS command line.
    pub postcss: String,
    /// Browserslist queries the prefixes are generated for.
    pub browsers: Vec<String>,
}

impl Default for Autoprefix {
    fn default() -> Self {
        Self {
            enabled: true,
            postcss: "postcss".into(),
            browsers: vec!["last 2 versions".into(), "> 1%".into(), "ie 10".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scripts {
    /// Script entry point.
    pub entry: Utf8PathBuf,
    /// Globs which trigger linting and recompilation in watch mode.
    pub watch: Vec<String>,
    /// Language level of the emitted code.
    pub target: String,
    pub minify: bool,
    pub source_map: bool,
    /// Vendor scripts concatenated into `js/libraries.js`.
    pub libraries: Vec<Utf8PathBuf>,
    pub esbuild: String,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            entry: "src/js/app.js".into(),
            watch: vec!["src/**/*.js".into()],
            target: "es2015".into(),
            minify: true,
            source_map: true,
            libraries: vec!["node_modules/jquery/dist/jquery.js".into()],
            esbuild: "esbuild".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Lint {
    pub enabled: bool,
    /// Fail the lint task when the linter reports errors. The failure never
    /// blocks compilation.
    pub deny_errors: bool,
    pub eslint: String,
    /// Files handed to the linter; the script entry when empty.
    pub sources: Vec<Utf8PathBuf>,
}

impl Default for Lint {
    fn default() -> Self {
        Self {
            enabled: true,
            deny_errors: false,
            eslint: "eslint".into(),
            sources: Vec::new(),
        }
    }
}

/// A set of files copied verbatim from `base` to `dest` under the output
/// root, preserving their paths relative to `base`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetGroup {
    pub name: String,
    pub base: Utf8PathBuf,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub dest: Utf8PathBuf,
}

impl AssetGroup {
    /// Globs of this group relative to the working directory.
    pub fn globs(&self) -> impl Iterator<Item = String> + '_ {
        self.patterns
            .iter()
            .map(|pattern| self.base.join(pattern).into_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Assets(pub Vec<AssetGroup>);

impl Default for Assets {
    fn default() -> Self {
        Self(vec![
            AssetGroup {
                name: "html".into(),
                base: "src".into(),
                patterns: vec!["**/*.html".into()],
                dest: "".into(),
            },
            AssetGroup {
                name: "img".into(),
                base: "src/img".into(),
                patterns: vec!["**/*".into()],
                dest: "img".into(),
            },
            AssetGroup {
                name: "fonts".into(),
                base: "src/fonts".into(),
                patterns: vec!["*".into()],
                dest: "fonts".into(),
            },
        ])
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Watch {
    /// Quiet period after the last change before a task is re-run.
    pub debounce_ms: u64,
}

impl Default for Watch {
    fn default() -> Self {
        Self { debounce_ms: 200 }
    }
}

impl Watch {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Serve {
    pub host: std::net::IpAddr,
    pub port: u16,
    /// Port of the live-reload websocket.
    pub reload_port: u16,
}

impl Default for Serve {
    fn default() -> Self {
        Self {
            host: std::net::IpAddr::from([127, 0, 0, 1]),
            port: 3000,
            reload_port: 35729,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Runner {
    /// Worker threads, `0` for one per CPU.
    pub jobs: usize,
    /// Seconds an external tool may run before it is killed.
    pub timeout_secs: u64,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            jobs: 0,
            timeout_secs: 120,
        }
    }
}
