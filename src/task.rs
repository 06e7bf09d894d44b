//! Tasks and their bodies
//!
//! A task body is either one-shot (awaited to completion before the next task
//! in the plan starts) or long-running (started, then left to run alongside
//! everything else until the process exits). Tasks without a body only group
//! their dependencies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::command::CommandSpec;
use crate::config::RunContext;
use crate::error::{AssetflowError, Result};
use crate::executor::Executor;
use crate::pipeline::Pipeline;
use crate::transform::TransformContext;
use crate::watch::{FsEventSource, Watcher, EVENT_BUFFER};

/// How the executor treats a task body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Awaited before dependents run
    OneShot,
    /// Started and considered done immediately; runs until process exit
    LongRunning,
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneShot => write!(f, "one-shot"),
            Self::LongRunning => write!(f, "long-running"),
        }
    }
}

/// Handed to a body when it is invoked
#[derive(Clone)]
pub struct TaskContext {
    pub name: String,
    pub executor: Executor,
}

impl TaskContext {
    pub fn run_context(&self) -> &RunContext {
        self.executor.context()
    }
}

/// What a one-shot body accomplished
#[derive(Debug, Default, Clone)]
pub struct TaskOutcome {
    pub files: usize,
    pub cached: usize,
    pub failures: Vec<String>,
    /// Captured output worth showing the user
    pub output: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A body that runs to completion
pub trait OneShotBody: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>>;

    /// One-line summary for plans and listings
    fn describe(&self) -> String;
}

/// A body that keeps running until the process exits
pub trait LongRunningBody: Send + Sync {
    fn start(&self, ctx: TaskContext) -> BoxFuture<'static, Result<()>>;

    fn describe(&self) -> String;
}

#[derive(Clone)]
pub enum TaskBody {
    /// Only aggregates dependencies
    Group,
    OneShot(Arc<dyn OneShotBody>),
    LongRunning(Arc<dyn LongRunningBody>),
}

impl TaskBody {
    pub fn describe(&self) -> String {
        match self {
            Self::Group => "group".to_string(),
            Self::OneShot(body) => body.describe(),
            Self::LongRunning(body) => body.describe(),
        }
    }
}

/// A named unit of build work
#[derive(Clone)]
pub struct Task {
    name: String,
    description: Option<String>,
    dependencies: Vec<String>,
    body: TaskBody,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, body: TaskBody) -> Self {
        Self {
            name: name.into(),
            description: None,
            dependencies: Vec::new(),
            body,
        }
    }

    /// A task with no body of its own
    pub fn group<I, S>(name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, TaskBody::Group).depends_on(dependencies)
    }

    /// A one-shot task backed by an async closure
    pub fn one_shot<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(name, TaskBody::OneShot(Arc::new(FnBody(f))))
    }

    /// A long-running task backed by an async closure
    pub fn long_running<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(name, TaskBody::LongRunning(Arc::new(FnBody(f))))
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn body(&self) -> &TaskBody {
        &self.body
    }

    pub fn mode(&self) -> TaskMode {
        match self.body {
            TaskBody::LongRunning(_) => TaskMode::LongRunning,
            TaskBody::Group | TaskBody::OneShot(_) => TaskMode::OneShot,
        }
    }
}

struct FnBody<F>(F);

impl<F, Fut> OneShotBody for FnBody<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn invoke<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        let fut = (self.0)(ctx.clone());
        Box::pin(async move {
            fut.await?;
            Ok(TaskOutcome::default())
        })
    }

    fn describe(&self) -> String {
        "closure".to_string()
    }
}

impl<F, Fut> LongRunningBody for FnBody<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn start(&self, ctx: TaskContext) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.0)(ctx))
    }

    fn describe(&self) -> String {
        "closure".to_string()
    }
}

/// Streams a pattern set through transform stages
pub struct PipelineBody {
    pipeline: Pipeline,
    env: HashMap<String, String>,
}

impl PipelineBody {
    pub fn new(pipeline: Pipeline, env: HashMap<String, String>) -> Self {
        Self { pipeline, env }
    }
}

impl OneShotBody for PipelineBody {
    fn invoke<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(async move {
            let run = ctx.run_context();
            let tctx = TransformContext {
                root: &run.root,
                task: &ctx.name,
                env: &self.env,
                debug: run.debug,
            };

            let report = self.pipeline.process(&tctx, run.policy).await?;
            Ok(TaskOutcome {
                files: report.files,
                cached: report.cached,
                failures: report.failures.iter().map(ToString::to_string).collect(),
                output: None,
            })
        })
    }

    fn describe(&self) -> String {
        format!("pipeline over {}", self.pipeline.patterns().includes().join(", "))
    }
}

/// Runs a list of commands in order, stopping at the first failure
pub struct CommandBody {
    commands: Vec<String>,
    env: HashMap<String, String>,
    shell: bool,
}

impl CommandBody {
    pub fn new(commands: Vec<String>, env: HashMap<String, String>, shell: bool) -> Self {
        Self { commands, env, shell }
    }
}

impl OneShotBody for CommandBody {
    fn invoke<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(async move {
            let run = ctx.run_context();
            let root = run.root.to_string_lossy().to_string();
            let vars = [("root", root)];
            let mut output = String::new();

            for command in &self.commands {
                let spec = CommandSpec {
                    template: command,
                    vars: &vars,
                    env: &self.env,
                    cwd: &run.root,
                    shell: self.shell,
                };
                let result = spec.output(&ctx.name).await?;
                output.push_str(&result.stdout);
            }

            Ok(TaskOutcome {
                output: (!output.trim().is_empty()).then_some(output),
                ..Default::default()
            })
        })
    }

    fn describe(&self) -> String {
        self.commands.join(" && ")
    }
}

/// Watches bound pattern sets and re-runs tasks on change
pub struct WatchBody {
    watcher: Arc<Watcher>,
}

impl WatchBody {
    pub fn new(watcher: Watcher) -> Self {
        Self {
            watcher: Arc::new(watcher),
        }
    }
}

impl LongRunningBody for WatchBody {
    fn start(&self, ctx: TaskContext) -> BoxFuture<'static, Result<()>> {
        let watcher = Arc::clone(&self.watcher);
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let _source = FsEventSource::spawn(watcher.root(), tx)?;
            watcher.run(rx, &ctx.executor).await
        })
    }

    fn describe(&self) -> String {
        let tasks: Vec<&str> = self
            .watcher
            .bindings()
            .iter()
            .flat_map(|b| b.tasks().iter().map(String::as_str))
            .collect();
        format!("watch -> {}", tasks.join(", "))
    }
}

/// Starts the external preview / live-reload server
#[derive(Debug, Clone)]
pub struct ServeBody {
    command: String,
    delay: Duration,
    env: HashMap<String, String>,
    shell: bool,
}

impl ServeBody {
    pub fn new(command: String, delay: Duration, env: HashMap<String, String>, shell: bool) -> Self {
        Self {
            command,
            delay,
            env,
            shell,
        }
    }
}

impl LongRunningBody for ServeBody {
    fn start(&self, ctx: TaskContext) -> BoxFuture<'static, Result<()>> {
        let serve = self.clone();
        Box::pin(async move {
            if !serve.delay.is_zero() {
                tokio::time::sleep(serve.delay).await;
            }

            let run = ctx.run_context();
            let port = run.port;
            let vars = [
                ("port", port.to_string()),
                ("proxy_port", port.saturating_add(1).to_string()),
                ("ui_port", port.saturating_add(2).to_string()),
                ("root", run.root.to_string_lossy().to_string()),
            ];
            let mut env = serve.env.clone();
            env.insert("PORT".to_string(), port.to_string());

            let spec = CommandSpec {
                template: &serve.command,
                vars: &vars,
                env: &env,
                cwd: &run.root,
                shell: serve.shell,
            };

            let mut child = spec.spawn()?;
            tracing::info!(task = %ctx.name, port, "preview server started: {}", spec.display());

            let status = child.wait().await?;
            if status.success() {
                return Ok(());
            }

            run.policy.on_failure(&AssetflowError::TaskFailed {
                task: ctx.name.clone(),
                message: format!("preview server exited with {status}"),
                stderr: None,
            })
        })
    }

    fn describe(&self) -> String {
        format!("serve: {}", self.command)
    }
}
