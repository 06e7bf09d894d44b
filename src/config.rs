//! Configuration parsing for assetflow.toml
//!
//! Handles loading and validating the build definition, and turning it into
//! runnable tasks. [`RunContext`] carries the per-process settings (root,
//! error policy, debug flag, preview port) that every task body reads.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::FingerprintStrategy;
use crate::error::{AssetflowError, Result};
use crate::pattern::PatternSet;
use crate::pipeline::{Pipeline, Stage};
use crate::policy::ErrorPolicy;
use crate::script::ScriptTransform;
use crate::task::{CommandBody, PipelineBody, ServeBody, Task, TaskBody, WatchBody};
use crate::transform::{CommandTransform, CopyTransform};
use crate::watch::{WatchBinding, Watcher};

/// Default config file names to search for
pub const CONFIG_FILES: &[&str] = &["assetflow.toml", "Assetflow.toml"];

/// Preview port when neither `PORT` nor `settings.port` is set
pub const DEFAULT_PORT: u16 = 8000;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Global environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Named pattern sets
    #[serde(default)]
    pub patterns: BTreeMap<String, PatternConfig>,

    /// Task definitions
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,
}

/// Global settings for assetflow behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Task run when none is named on the command line
    #[serde(default = "default_task")]
    pub default: String,

    /// Quiet window before a batch of file changes is acted on
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// How cached stages detect changed inputs
    #[serde(default)]
    pub fingerprint: FingerprintStrategy,

    /// Run commands through the platform shell by default
    #[serde(default)]
    pub shell: bool,

    /// Preview port, overridden by the `PORT` environment variable
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default: default_task(),
            debounce_ms: default_debounce(),
            fingerprint: FingerprintStrategy::default(),
            shell: false,
            port: default_port(),
        }
    }
}

fn default_task() -> String {
    "default".to_string()
}

fn default_debounce() -> u64 {
    200
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Include/exclude glob lists
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PatternConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A pattern set given by name, as a bare include list, or inline
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PatternRef {
    Named(String),
    List(Vec<String>),
    Inline(PatternConfig),
}

/// Configuration for a single task
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Human-readable description
    #[serde(default)]
    pub desc: Option<String>,

    /// Tasks that must complete before this one
    #[serde(default)]
    pub depends: Vec<String>,

    /// Task-specific environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Use shell to execute commands
    #[serde(default)]
    pub shell: Option<bool>,

    /// Input files for `transforms`
    #[serde(default)]
    pub patterns: Option<PatternRef>,

    /// Per-file stages, in order
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,

    /// Commands to run once, in order
    #[serde(default)]
    pub run: Vec<String>,

    /// Pattern sets to watch and the tasks they re-run
    #[serde(default)]
    pub watch: Vec<WatchConfig>,

    /// External preview server
    #[serde(default)]
    pub serve: Option<ServeConfig>,
}

/// What kind of body a task config describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Pipeline,
    Command,
    Watch,
    Serve,
    Group,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pipeline => "pipeline",
            Self::Command => "command",
            Self::Watch => "watch",
            Self::Serve => "serve",
            Self::Group => "group",
        };
        f.write_str(s)
    }
}

impl TaskConfig {
    fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds = Vec::new();
        if !self.transforms.is_empty() {
            kinds.push(TaskKind::Pipeline);
        }
        if !self.run.is_empty() {
            kinds.push(TaskKind::Command);
        }
        if !self.watch.is_empty() {
            kinds.push(TaskKind::Watch);
        }
        if self.serve.is_some() {
            kinds.push(TaskKind::Serve);
        }
        kinds
    }

    pub fn kind(&self) -> TaskKind {
        self.kinds().first().copied().unwrap_or(TaskKind::Group)
    }
}

/// One per-file stage
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    /// Label used in failure reports
    #[serde(default)]
    pub name: Option<String>,

    /// Command template run once per file
    #[serde(default)]
    pub run: Option<String>,

    /// Output path template for `run`
    #[serde(default)]
    pub output: Option<String>,

    /// Destination directory to copy files into
    #[serde(default)]
    pub copy: Option<PathBuf>,

    /// Prefix stripped from paths when copying
    #[serde(default)]
    pub base: Option<String>,

    /// Inline Rhai script
    #[serde(default)]
    pub script: Option<String>,

    /// Skip files unchanged since this stage last processed them
    #[serde(default)]
    pub cache: bool,

    /// Only run when `--debug` is given
    #[serde(default)]
    pub debug_only: bool,

    #[serde(default)]
    pub shell: Option<bool>,
}

impl TransformConfig {
    fn default_name(&self) -> &'static str {
        if self.copy.is_some() {
            "dest"
        } else if self.script.is_some() {
            "script"
        } else {
            "run"
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    pub patterns: PatternRef,
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServeConfig {
    /// Command template; `{port}`, `{proxy_port}` and `{ui_port}` are filled in
    pub run: String,

    /// Wait before starting, so initial builds can settle
    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub shell: Option<bool>,
}

impl Config {
    /// Load configuration from the specified path or search upwards from `cwd`
    pub fn load(path: Option<&Path>, cwd: &Path) -> Result<(Self, PathBuf)> {
        let config_path = match path {
            Some(p) => {
                let p = cwd.join(p);
                if p.exists() {
                    p
                } else {
                    return Err(AssetflowError::ConfigNotFound { searched: vec![p] });
                }
            }
            None => Self::find_config(cwd)?,
        };

        let content = std::fs::read_to_string(&config_path)?;
        let config = Self::parse(&content, &config_path)?;
        Ok((config, config_path))
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| AssetflowError::ConfigParse {
            source: e,
            path: path.to_path_buf(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Search for config file starting from `start` and walking up
    fn find_config(start: &Path) -> Result<PathBuf> {
        let mut current = start.to_path_buf();
        let mut searched = Vec::new();

        loop {
            for name in CONFIG_FILES {
                let candidate = current.join(name);
                searched.push(candidate.clone());
                if candidate.exists() {
                    return Ok(candidate);
                }
            }

            if !current.pop() {
                break;
            }
        }

        Err(AssetflowError::ConfigNotFound { searched })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, task) in &self.tasks {
            let invalid = |reason: &str| AssetflowError::InvalidTask {
                task: name.clone(),
                reason: reason.to_string(),
            };

            if task.depends.contains(name) {
                return Err(invalid("Task cannot depend on itself"));
            }

            let kinds = task.kinds();
            if kinds.len() > 1 {
                return Err(invalid(
                    "Task can have only one of 'transforms', 'run', 'watch' or 'serve'",
                ));
            }

            match task.kind() {
                TaskKind::Group if task.depends.is_empty() => {
                    return Err(if task.patterns.is_some() {
                        invalid("'patterns' needs at least one entry in 'transforms'")
                    } else {
                        invalid("Task must have 'transforms', 'run', 'watch', 'serve' or 'depends'")
                    });
                }
                TaskKind::Pipeline => {
                    let patterns = task
                        .patterns
                        .as_ref()
                        .ok_or_else(|| invalid("'transforms' requires 'patterns'"))?;
                    self.check_pattern_ref(name, patterns)?;

                    for (i, t) in task.transforms.iter().enumerate() {
                        self.check_transform(name, i, t)?;
                    }
                }
                TaskKind::Watch => {
                    for binding in &task.watch {
                        self.check_pattern_ref(name, &binding.patterns)?;
                        if binding.tasks.is_empty() {
                            return Err(invalid("watch binding has no tasks"));
                        }
                        if let Some(unknown) = binding.tasks.iter().find(|t| !self.tasks.contains_key(*t)) {
                            return Err(invalid(&format!("watch binding names unknown task '{unknown}'")));
                        }
                        if let Some(long) = binding.tasks.iter().find_map(|t| self.long_running_in_plan(t)) {
                            return Err(invalid(&format!(
                                "watch binding would start long-running task '{long}' again on every change"
                            )));
                        }
                    }
                }
                _ if task.patterns.is_some() => {
                    return Err(invalid("'patterns' is only used with 'transforms'"));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// First watch or serve task in the plan of `name`, `name` included
    fn long_running_in_plan<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        let mut stack = vec![name];
        let mut seen = HashSet::new();

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(task) = self.tasks.get(current) else {
                continue;
            };
            if matches!(task.kind(), TaskKind::Watch | TaskKind::Serve) {
                return Some(current);
            }
            stack.extend(task.depends.iter().map(String::as_str));
        }

        None
    }

    fn check_pattern_ref(&self, task: &str, patterns: &PatternRef) -> Result<()> {
        match patterns {
            PatternRef::Named(set) if !self.patterns.contains_key(set) => Err(AssetflowError::InvalidTask {
                task: task.to_string(),
                reason: format!("unknown pattern set '{set}'"),
            }),
            _ => Ok(()),
        }
    }

    fn check_transform(&self, task: &str, index: usize, t: &TransformConfig) -> Result<()> {
        let invalid = |reason: &str| AssetflowError::InvalidTask {
            task: task.to_string(),
            reason: format!("transform #{}: {reason}", index + 1),
        };

        let bodies = [t.run.is_some(), t.copy.is_some(), t.script.is_some()]
            .iter()
            .filter(|b| **b)
            .count();
        if bodies != 1 {
            return Err(invalid("needs exactly one of 'run', 'copy' or 'script'"));
        }
        if t.output.is_some() && t.run.is_none() {
            return Err(invalid("'output' only applies to 'run'"));
        }
        if t.base.is_some() && t.copy.is_none() {
            return Err(invalid("'base' only applies to 'copy'"));
        }
        Ok(())
    }

    /// Compile a pattern reference
    pub fn pattern_set(&self, patterns: &PatternRef) -> Result<PatternSet> {
        match patterns {
            PatternRef::Named(name) => {
                let set = self.patterns.get(name).ok_or_else(|| AssetflowError::InvalidPattern {
                    pattern: name.clone(),
                    reason: "no such pattern set".to_string(),
                })?;
                PatternSet::new(&set.include, &set.exclude)
            }
            PatternRef::List(include) => PatternSet::new(include, Vec::<String>::new()),
            PatternRef::Inline(set) => PatternSet::new(&set.include, &set.exclude),
        }
    }

    /// Get a task by name
    pub fn get_task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.get(name)
    }

    /// List all task names, sorted
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(|s| s.as_str()).collect()
    }

    /// Merge environment variables for a task (global + task-specific)
    pub fn task_env(&self, task: &TaskConfig) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.extend(task.env.clone());
        env
    }

    /// Turn a task definition into a runnable task
    pub fn build_task(&self, name: &str, ctx: &RunContext) -> Result<Task> {
        let tc = self.tasks.get(name).ok_or_else(|| AssetflowError::TaskNotFound {
            name: name.to_string(),
            available: self.task_names().iter().map(|s| s.to_string()).collect(),
        })?;

        let env = self.task_env(tc);
        let shell = tc.shell.unwrap_or(self.settings.shell);

        let body = match tc.kind() {
            TaskKind::Group => TaskBody::Group,
            TaskKind::Command => TaskBody::OneShot(Arc::new(CommandBody::new(tc.run.clone(), env, shell))),
            TaskKind::Pipeline => {
                let patterns = tc.patterns.as_ref().ok_or_else(|| AssetflowError::InvalidTask {
                    task: name.to_string(),
                    reason: "'transforms' requires 'patterns'".to_string(),
                })?;
                let stages = tc
                    .transforms
                    .iter()
                    .map(|t| self.build_stage(name, t, shell, ctx))
                    .collect::<Result<Vec<_>>>()?;
                let pipeline = Pipeline::new(self.pattern_set(patterns)?, stages);
                TaskBody::OneShot(Arc::new(PipelineBody::new(pipeline, env)))
            }
            TaskKind::Watch => {
                let bindings = tc
                    .watch
                    .iter()
                    .map(|w| Ok(WatchBinding::new(self.pattern_set(&w.patterns)?, w.tasks.clone())))
                    .collect::<Result<Vec<_>>>()?;
                let watcher = Watcher::new(&ctx.root, bindings, ctx.debounce);
                TaskBody::LongRunning(Arc::new(WatchBody::new(watcher)))
            }
            TaskKind::Serve => {
                let serve = tc.serve.as_ref().ok_or_else(|| AssetflowError::InvalidTask {
                    task: name.to_string(),
                    reason: "missing 'serve'".to_string(),
                })?;
                TaskBody::LongRunning(Arc::new(ServeBody::new(
                    serve.run.clone(),
                    Duration::from_millis(serve.delay_ms),
                    env,
                    serve.shell.unwrap_or(shell),
                )))
            }
        };

        let mut task = Task::new(name, body).depends_on(tc.depends.iter().cloned());
        if let Some(desc) = &tc.desc {
            task = task.with_description(desc.clone());
        }
        Ok(task)
    }

    fn build_stage(&self, task: &str, t: &TransformConfig, shell: bool, ctx: &RunContext) -> Result<Stage> {
        let name = t.name.clone().unwrap_or_else(|| t.default_name().to_string());

        let stage = if let Some(run) = &t.run {
            Stage::new(CommandTransform::new(
                name,
                run.clone(),
                t.output.clone(),
                t.shell.unwrap_or(shell),
            ))
        } else if let Some(dest) = &t.copy {
            Stage::new(CopyTransform::new(name, dest.clone(), t.base.clone()))
        } else if let Some(source) = &t.script {
            let transform = ScriptTransform::new(name, source).map_err(|e| AssetflowError::InvalidTask {
                task: task.to_string(),
                reason: e.to_string(),
            })?;
            Stage::new(transform)
        } else {
            return Err(AssetflowError::InvalidTask {
                task: task.to_string(),
                reason: "transform needs one of 'run', 'copy' or 'script'".to_string(),
            });
        };

        let stage = if t.cache { stage.cached(ctx.fingerprint) } else { stage };
        Ok(stage.debug_only(t.debug_only))
    }
}

/// Settings fixed for the lifetime of one process
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Project root; pattern sets and commands resolve against it
    pub root: PathBuf,
    pub policy: ErrorPolicy,
    /// Enables debug-only stages and `ASSETFLOW_DEBUG` for commands
    pub debug: bool,
    pub port: u16,
    pub debounce: Duration,
    pub fingerprint: FingerprintStrategy,
    /// Print the plan instead of running it
    pub dry_run: bool,
    /// Suppress per-task output
    pub quiet: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            policy: ErrorPolicy::default(),
            debug: false,
            port: DEFAULT_PORT,
            debounce: Duration::from_millis(default_debounce()),
            fingerprint: FingerprintStrategy::default(),
            dry_run: false,
            quiet: false,
        }
    }
}

impl RunContext {
    /// Build from settings and environment variables (`PORT`, strict-mode
    /// switches). Command-line flags are applied on top by the caller.
    pub fn from_env<I, K, V>(root: impl Into<PathBuf>, settings: &Settings, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: Vec<(K, V)> = vars.into_iter().collect();
        let policy = ErrorPolicy::from_env(vars.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));

        let port = match vars.iter().find(|(k, _)| k.as_ref() == "PORT") {
            Some((_, v)) => v.as_ref().parse().unwrap_or_else(|_| {
                tracing::warn!("ignoring invalid PORT value '{}'", v.as_ref());
                settings.port
            }),
            None => settings.port,
        };

        Self {
            root: root.into(),
            policy,
            port,
            debounce: Duration::from_millis(settings.debounce_ms),
            fingerprint: settings.fingerprint,
            ..Default::default()
        }
    }
}

/// Environment entries that are valid UTF-8; anything else is skipped
pub fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter().filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
        (Ok(key), Ok(value)) => Some((key, value)),
        (key, _) => {
            tracing::debug!(var = ?key, "skipping non UTF-8 environment variable");
            None
        }
    })
}

/// Starter build definition written by `assetflow init`
pub const CONFIG_TEMPLATE: &str = r#"# assetflow build definition

[settings]
default = "default"
debounce_ms = 200
fingerprint = "mtime-size"

[env]
NODE_ENV = "development"

[patterns.images]
include = ["private/img/**/*.{png,jpg,jpeg,gif,svg}"]

[patterns.js]
include = ["private/js/**/*.js", "tests/**/*.js"]
exclude = ["**/*.min.js", "tests/coverage/**"]

[patterns.sass]
include = ["private/sass/**/*.{scss,sass}"]
exclude = ["**/_*.{scss,sass}"]

[tasks.bower]
desc = "Install front-end dependencies"
run = ["bower install"]

[tasks.sass]
desc = "Compile stylesheets"
patterns = "sass"

[[tasks.sass.transforms]]
name = "sass"
run = "sassc --style compressed {input} {output}"
output = "static/css/{stem}.css"

[[tasks.sass.transforms]]
name = "sourcemaps"
debug_only = true
run = "sassc --sourcemap=auto {root}/private/sass/{stem}.scss {input}"

[tasks.images]
desc = "Copy and optimise images"
patterns = "images"

[[tasks.images.transforms]]
copy = "static/img"
base = "private/img"
cache = true

[[tasks.images.transforms]]
name = "imagemin"
run = "imagemin {input} --out-dir={dir}"
cache = true

[tasks.lint]
desc = "Lint JavaScript sources"
patterns = "js"

[[tasks.lint.transforms]]
name = "eslint"
run = "eslint {input}"
cache = true

[tasks.icons]
desc = "Build the icon font"
run = ["icon-font-generator private/icons/*.svg -o static/fonts -n iconfont --csspath private/sass/layout/_iconography.scss"]

[tasks.docs]
desc = "Generate API documentation"
run = ["jsdoc -r private/js -d static/docs"]

[tasks.preprocess]
desc = "Build every static asset"
depends = ["sass", "images", "docs"]

[tasks."tests:unit"]
run = ["karma start tests/karma.conf.js --single-run"]

[tasks."tests:webdriver"]
desc = "Update the WebDriver binaries"
run = ["webdriver-manager update"]

[tasks."tests:integration"]
depends = ["tests:webdriver"]
run = ["protractor tests/protractor.conf.js"]

[tasks."tests:lint"]
depends = ["lint"]

[tasks.tests]
desc = "Run every test suite"
depends = ["tests:unit", "tests:integration", "tests:lint"]

[tasks."tests:watch"]
desc = "Keep the unit test runner open"
depends = ["tests:lint"]
serve = { run = "karma start tests/karma.conf.js" }

[tasks.watch]
desc = "Rebuild on change"
watch = [
  { patterns = "sass", tasks = ["sass"] },
  { patterns = "js", tasks = ["lint"] },
  { patterns = "images", tasks = ["images"] },
]

[tasks.browser]
desc = "Live-reloading preview"
serve = { run = "browser-sync start --proxy 0.0.0.0:{port} --port {proxy_port} --ui-port {ui_port} --files static", delay_ms = 1000 }

[tasks.default]
desc = "Build, lint and keep watching"
depends = ["bower", "sass", "lint", "watch"]

[tasks.dev]
desc = "Default build plus preview server"
depends = ["default", "browser"]
"#;
