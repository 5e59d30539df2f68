//! The standard build of a static web project and its entry points.
//!
//! ```text
//! clean ─┬─ copy-static        html, images, fonts
//!        ├─ compile-styles     css/
//!        ├─ bundle-libraries   js/libraries.js
//!        └─ compile-scripts    js/app.js
//! lint                         independent, never blocks compilation
//! ```

use std::fs;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;

use crate::config::Config;
use crate::engine::{Outcome, Run, Runner};
use crate::error::{ConfigError, PipelineError};
use crate::registry::TaskRegistry;
use crate::task::OutputScope;
use crate::tools::{copy, lint, scripts, styles};

pub const CLEAN: &str = "clean";
pub const COPY_STATIC: &str = "copy-static";
pub const COMPILE_STYLES: &str = "compile-styles";
pub const LINT: &str = "lint";
pub const BUNDLE_LIBRARIES: &str = "bundle-libraries";
pub const COMPILE_SCRIPTS: &str = "compile-scripts";

/// Tasks run by `build`, also known as `default`.
pub const DEFAULT_TASKS: [&str; 6] = [
    CLEAN,
    COPY_STATIC,
    LINT,
    BUNDLE_LIBRARIES,
    COMPILE_SCRIPTS,
    COMPILE_STYLES,
];

/// Registers the standard tasks for `config`.
pub fn standard_registry(config: &Config) -> Result<TaskRegistry, ConfigError> {
    let config = Arc::new(config.clone());
    let mut registry = TaskRegistry::new();

    registry
        .task(CLEAN)
        .output(OutputScope::tree(""))
        .run(|ctx| {
            crate::io::clear_dist(ctx.output)?;
            Ok(())
        })?;

    let mut copy_static = registry.task(COPY_STATIC).depends_on([CLEAN]);
    for group in &config.assets.0 {
        copy_static = copy_static.output(OutputScope::files(group.dest.clone()));
    }

    let c = config.clone();
    copy_static.run(move |ctx| {
        let mut total = 0;
        for group in &c.assets.0 {
            total += copy::copy_group(group, ctx.output, ctx.reserved)
                .with_context(|| format!("copying {} assets", group.name))?;
        }
        tracing::info!("copied {total} static files");
        Ok(())
    })?;

    let c = config.clone();
    registry
        .task(COMPILE_STYLES)
        .depends_on([CLEAN])
        .output(OutputScope::tree("css"))
        .run(move |ctx| {
            let dir = ctx.output_path("css");
            if dir.exists() {
                fs::remove_dir_all(&dir).with_context(|| format!("clearing {dir}"))?;
            }

            let css = styles::compile(&c.styles, &dir, ctx.timeout)?;
            tracing::info!("compiled {}", css);
            Ok(())
        })?;

    let c = config.clone();
    registry.task(LINT).run(move |ctx| {
        if !c.lint.enabled {
            tracing::debug!("linting disabled");
            return Ok(());
        }

        let sources = if c.lint.sources.is_empty() {
            std::slice::from_ref(&c.scripts.entry)
        } else {
            c.lint.sources.as_slice()
        };

        let findings = lint::run(&c.lint.eslint, sources, ctx.timeout)?;
        if c.lint.deny_errors {
            lint::deny(&c.lint.eslint, &findings)?;
        }
        Ok(())
    })?;

    let c = config.clone();
    registry
        .task(BUNDLE_LIBRARIES)
        .depends_on([CLEAN])
        .output(OutputScope::files("js"))
        .run(move |ctx| {
            if c.scripts.libraries.is_empty() {
                tracing::debug!("no libraries configured");
                return Ok(());
            }

            let out = ctx.output_path("js/libraries.js");
            scripts::bundle_libraries(&c.scripts, &out, ctx.timeout)?;
            tracing::info!("bundled {} libraries into {}", c.scripts.libraries.len(), out);
            Ok(())
        })?;

    let c = config;
    registry
        .task(COMPILE_SCRIPTS)
        .depends_on([CLEAN])
        .output(OutputScope::files("js"))
        .run(move |ctx| {
            let out = ctx.output_path("js/app.js");
            scripts::compile(&c.scripts, &out, ctx.timeout)?;
            tracing::info!("compiled {}", out);
            Ok(())
        })?;

    registry.validate()?;
    Ok(registry)
}

/// Entry points of a project build.
pub struct Pipeline {
    config: Config,
    runner: Runner,
}

impl Pipeline {
    /// Registers and validates the standard tasks. Nothing runs yet.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let registry = standard_registry(&config)?;
        let runner = Runner::new(registry, config.runner_options())?;

        Ok(Self { config, runner })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn registry(&self) -> &TaskRegistry {
        self.runner.registry()
    }

    pub fn output(&self) -> &Utf8Path {
        &self.config.paths.output
    }

    /// Runs the named tasks and logs a summary.
    pub fn run<S: AsRef<str>>(&self, names: &[S]) -> Result<Run, ConfigError> {
        let run = self.runner.run(names)?;
        self.log_summary(&run);
        Ok(run)
    }

    /// The full build: clean, static assets, lint, scripts and styles.
    pub fn build(&self) -> Result<Run, ConfigError> {
        self.run(&DEFAULT_TASKS)
    }

    fn log_summary(&self, run: &Run) {
        let summary = self.runner.reporter().summarize(run);
        let summary = summary.trim_end();

        match run.outcome() {
            Outcome::Success => tracing::info!("{summary}"),
            _ => tracing::warn!("{summary}"),
        }
    }
}

#[cfg(feature = "live")]
mod live {
    use std::sync::mpsc;

    use super::*;
    use crate::error::WatchError;
    use crate::watch::{self, Watcher};

    impl Pipeline {
        /// A watcher with the standard bindings. Globs whose static root does
        /// not exist are skipped with a warning.
        pub fn watcher(&self) -> Result<Watcher, WatchError> {
            let mut bindings = Vec::new();
            for pattern in &self.config.styles.watch {
                bindings.push((pattern.clone(), COMPILE_STYLES));
            }
            for pattern in &self.config.scripts.watch {
                bindings.push((pattern.clone(), LINT));
                bindings.push((pattern.clone(), COMPILE_SCRIPTS));
            }
            for group in &self.config.assets.0 {
                for pattern in group.globs() {
                    bindings.push((pattern, COPY_STATIC));
                }
            }

            let mut watcher = Watcher::new();
            for (pattern, task) in bindings {
                if !self.registry().contains(task) {
                    return Err(WatchError::UnknownTask(task.to_string()));
                }

                match watcher.bind(&pattern, task) {
                    Ok(()) => {}
                    Err(WatchError::Root(pattern, e)) => {
                        tracing::warn!("not watching {pattern}: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }

            Ok(watcher)
        }

        /// Builds once, then re-runs affected tasks on every change until
        /// the process is interrupted. Task failures are reported and never
        /// end the loop.
        pub fn watch(&self, serve: bool) -> Result<(), PipelineError> {
            tracing::info!("running initial build...");
            self.build()?;

            #[cfg(feature = "server")]
            let _server = if serve {
                Some(crate::serve::DevServer::start(
                    &self.config.serve,
                    &self.config.paths.output,
                )?)
            } else {
                None
            };

            if serve && !cfg!(feature = "server") {
                tracing::warn!("kagari was built without the `server` feature, not serving");
            }

            let mut watcher = self.watcher()?;
            let (tx, rx) = mpsc::channel();
            watcher.start(tx)?;

            tracing::info!("initial build completed, now watching for changes...");
            watch::event_loop(&self.runner, rx, self.config.watch.debounce(), |run| {
                self.log_summary(run);
                // Each re-run is summarized on its own.
                self.runner.reporter().drain();
            });

            watcher.stop();
            Ok(())
        }
    }
}

#[cfg(feature = "server")]
impl Pipeline {
    /// Serves the output directory with live reload until interrupted.
    pub fn serve(&self) -> Result<(), PipelineError> {
        let server = crate::serve::DevServer::start(&self.config.serve, &self.config.paths.output)?;
        server.wait()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    use crate::config::{AssetGroup, Assets};
    use crate::task::Status;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    /// A project under `root` whose external tools do not exist.
    fn project(root: &Utf8PathBuf) -> Config {
        let src = root.join("src");
        crate::io::write_file(&src.join("index.html"), "<body>home</body>").unwrap();
        crate::io::write_file(&src.join("about/index.html"), "<body>about</body>").unwrap();
        crate::io::write_file(&src.join("LESS/master.less"), "a { color: red; }").unwrap();
        crate::io::write_file(&src.join("js/app.js"), "console.log(1)").unwrap();

        let mut config = Config::default();
        config.paths.output = root.join("build");
        config.runner.jobs = 2;
        config.styles.entry = src.join("LESS/master.less");
        config.styles.watch = vec![src.join("LESS/**/*.less").into_string()];
        config.styles.lessc = "kagari-missing-lessc".into();
        config.scripts.entry = src.join("js/app.js");
        config.scripts.watch = vec![src.join("**/*.js").into_string()];
        config.scripts.esbuild = "kagari-missing-esbuild".into();
        config.scripts.libraries = vec![root.join("node_modules/jquery/dist/jquery.js")];
        config.lint.eslint = "kagari-missing-eslint".into();
        config.assets = Assets(vec![AssetGroup {
            name: "html".into(),
            base: src.clone(),
            patterns: vec!["**/*.html".into()],
            dest: "".into(),
        }]);
        config
    }

    #[test]
    fn standard_graph_shape() {
        let registry = standard_registry(&Config::default()).unwrap();

        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec![
                CLEAN,
                COPY_STATIC,
                COMPILE_STYLES,
                LINT,
                BUNDLE_LIBRARIES,
                COMPILE_SCRIPTS
            ]
        );
        assert!(registry.resolve(LINT).unwrap().dependencies().is_empty());
        assert_eq!(registry.resolve(COMPILE_SCRIPTS).unwrap().dependencies(), [CLEAN]);
        assert_eq!(
            registry.resolve(COMPILE_STYLES).unwrap().scopes(),
            [OutputScope::tree("css")]
        );
        assert_eq!(
            registry.resolve(COPY_STATIC).unwrap().scopes(),
            [
                OutputScope::files(""),
                OutputScope::files("img"),
                OutputScope::files("fonts")
            ]
        );

        let plan = registry.plan(&DEFAULT_TASKS).unwrap();
        assert_eq!(plan[0], CLEAN);
        assert_eq!(plan.len(), 6);
    }

    #[test]
    fn failing_tools_degrade_the_build() {
        let (_guard, root) = tempdir();
        let pipeline = Pipeline::new(project(&root)).unwrap();

        let stale = root.join("build/old.txt");
        crate::io::write_file(&stale, "stale").unwrap();

        let run = pipeline.build().unwrap();

        assert_eq!(run.outcome(), Outcome::Degraded);
        assert_eq!(run.status(CLEAN), Some(Status::Done));
        assert_eq!(run.status(COPY_STATIC), Some(Status::Done));
        assert_eq!(run.status(COMPILE_STYLES), Some(Status::Failed));
        assert_eq!(run.status(COMPILE_SCRIPTS), Some(Status::Failed));
        assert_eq!(run.status(BUNDLE_LIBRARIES), Some(Status::Failed));
        assert_eq!(run.status(LINT), Some(Status::Failed));
        assert_eq!(run.count(Status::Skipped), 0);

        assert!(!stale.exists());
        assert!(root.join("build/index.html").is_file());
        assert!(root.join("build/about/index.html").is_file());

        let styles = run.failures().iter().find(|f| f.task == COMPILE_STYLES).unwrap();
        assert_eq!(styles.tool.as_deref(), Some("kagari-missing-lessc"));
    }

    #[test]
    fn single_task_runs_with_its_dependencies() {
        let (_guard, root) = tempdir();
        let pipeline = Pipeline::new(project(&root)).unwrap();

        let run = pipeline.run(&[COPY_STATIC]).unwrap();
        assert_eq!(run.outcome(), Outcome::Success);
        assert_eq!(run.log(), [CLEAN, COPY_STATIC]);
    }

    #[test]
    fn static_group_inside_styles_output_is_rejected() {
        let mut config = Config::default();
        config.assets = Assets(vec![AssetGroup {
            name: "themes".into(),
            base: "src/themes".into(),
            patterns: vec!["*.css".into()],
            dest: "css".into(),
        }]);

        let err = standard_registry(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ScopeConflict { ref first, ref second, .. }
                if first == COPY_STATIC && second == COMPILE_STYLES
        ));
    }

    #[test]
    fn static_copy_stays_out_of_the_styles_tree() {
        let (_guard, root) = tempdir();
        let config = project(&root);
        crate::io::write_file(&root.join("src/css/demo.html"), "<body>demo</body>").unwrap();

        let pipeline = Pipeline::new(config).unwrap();
        let run = pipeline.run(&[COPY_STATIC]).unwrap();

        assert_eq!(run.status(COPY_STATIC), Some(Status::Done));
        assert!(root.join("build/index.html").is_file());
        assert!(!root.join("build/css/demo.html").exists());
    }

    #[test]
    fn lint_can_be_disabled() {
        let (_guard, root) = tempdir();
        let mut config = project(&root);
        config.lint.enabled = false;

        let pipeline = Pipeline::new(config).unwrap();
        let run = pipeline.run(&[LINT]).unwrap();
        assert_eq!(run.status(LINT), Some(Status::Done));
    }

    #[test]
    fn unknown_task_is_rejected_before_anything_runs() {
        let (_guard, root) = tempdir();
        let pipeline = Pipeline::new(project(&root)).unwrap();

        let err = pipeline.run(&[CLEAN, "deploy"]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownTask("deploy".into()));
        assert!(!root.join("build").exists());
    }

    #[cfg(feature = "grass")]
    #[test]
    fn styles_compile_in_process() {
        use crate::config::StyleCompiler;

        let (_guard, root) = tempdir();
        let mut config = project(&root);
        crate::io::write_file(&root.join("src/styles/main.scss"), "$c: red;\nb { color: $c; }")
            .unwrap();
        config.styles.entry = root.join("src/styles/main.scss");
        config.styles.compiler = StyleCompiler::Grass;
        config.styles.autoprefix.enabled = false;

        let pipeline = Pipeline::new(config).unwrap();
        let run = pipeline.run(&[COMPILE_STYLES]).unwrap();

        assert_eq!(run.outcome(), Outcome::Success);
        assert!(root.join("build/css/main.css").is_file());
    }

    #[cfg(feature = "live")]
    #[test]
    fn watcher_binds_inputs_to_tasks() {
        let (_guard, root) = tempdir();
        let mut config = project(&root);
        config.assets.0.push(AssetGroup {
            name: "fonts".into(),
            base: root.join("src/fonts"),
            patterns: vec!["*".into()],
            dest: "fonts".into(),
        });

        let pipeline = Pipeline::new(config).unwrap();
        let watcher = pipeline.watcher().unwrap();

        let tasks: Vec<_> = watcher.bindings().iter().map(|b| b.task.as_str()).collect();
        // The fonts directory does not exist and is skipped.
        assert_eq!(
            tasks,
            vec![COMPILE_STYLES, LINT, COMPILE_SCRIPTS, COPY_STATIC]
        );

        let root = root.canonicalize_utf8().unwrap();
        assert_eq!(
            watcher.tasks_for(&root.join("src/js/app.js")),
            vec![LINT, COMPILE_SCRIPTS]
        );
        assert_eq!(
            watcher.tasks_for(&root.join("src/LESS/master.less")),
            vec![COMPILE_STYLES]
        );
    }
}
