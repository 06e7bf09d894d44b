//! Task execution engine
//!
//! Runs a resolved plan in order. One-shot bodies are awaited before the next
//! task starts; long-running bodies are spawned onto the runtime and count as
//! done once started. Each task runs at most once per `run` call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::style;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

use crate::config::RunContext;
use crate::error::{AssetflowError, Result};
use crate::graph::TaskGraph;
use crate::task::{TaskBody, TaskContext, TaskMode, TaskOutcome};
use crate::watch::Dispatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// A prerequisite failed, so the body never ran
    Skipped,
    /// A long-running body was spawned
    Started,
}

/// Result of executing a single task
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
    pub duration: Duration,
    pub files: usize,
    pub cached: usize,
    pub failures: Vec<String>,
    pub output: Option<String>,
}

impl TaskResult {
    fn new(name: &str, status: TaskStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            duration: Duration::ZERO,
            files: 0,
            cached: 0,
            failures: Vec::new(),
            output: None,
        }
    }

    fn from_outcome(name: &str, outcome: TaskOutcome, duration: Duration) -> Self {
        let status = if outcome.succeeded() {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };

        Self {
            name: name.to_string(),
            status,
            duration,
            files: outcome.files,
            cached: outcome.cached,
            failures: outcome.failures,
            output: outcome.output,
        }
    }
}

/// A spawned long-running body
#[derive(Debug)]
pub struct BackgroundTask {
    pub name: String,
    handle: JoinHandle<Result<()>>,
}

/// Everything one `run` call did
#[derive(Debug, Default)]
pub struct RunReport {
    pub results: Vec<TaskResult>,
    pub background: Vec<BackgroundTask>,
}

impl RunReport {
    pub fn status(&self, task: &str) -> Option<TaskStatus> {
        self.results.iter().find(|r| r.name == task).map(|r| r.status)
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .count()
    }

    pub fn succeeded(&self) -> bool {
        self.failed() == 0
    }

    pub fn has_background(&self) -> bool {
        !self.background.is_empty()
    }

    /// Wait for every long-running body; the first error ends the wait.
    pub async fn wait(self) -> Result<()> {
        let mut pending: FuturesUnordered<_> = self
            .background
            .into_iter()
            .map(|bg| async move { (bg.name, bg.handle.await) })
            .collect();

        while let Some((name, joined)) = pending.next().await {
            match joined {
                Ok(Ok(())) => tracing::debug!(task = %name, "long-running task finished"),
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(AssetflowError::Aborted {
                        reason: format!("task '{name}' stopped unexpectedly: {e}"),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Runs tasks from a shared graph under one run context
#[derive(Clone)]
pub struct Executor {
    graph: Arc<TaskGraph>,
    ctx: Arc<RunContext>,
}

impl Executor {
    pub fn new(graph: Arc<TaskGraph>, ctx: Arc<RunContext>) -> Self {
        Self { graph, ctx }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run `name` after its prerequisites.
    ///
    /// Configuration errors and strict-mode aborts end the run with `Err`.
    /// In lenient mode failures are recorded, dependents of a failed task
    /// are skipped and unrelated tasks still run.
    pub async fn run(&self, name: &str) -> Result<RunReport> {
        let order = self.graph.resolve(name)?;

        if self.ctx.dry_run {
            self.print_plan(name, &order);
            return Ok(RunReport::default());
        }

        let mut report = RunReport::default();
        let mut failed: HashSet<&str> = HashSet::new();

        for task_name in &order {
            let Some(task) = self.graph.get_task(task_name) else {
                continue;
            };

            if let Some(dep) = task.dependencies().iter().find(|d| failed.contains(d.as_str())) {
                tracing::warn!(task = %task_name, dependency = %dep, "skipped: prerequisite failed");
                failed.insert(task_name);
                let result = TaskResult::new(task_name, TaskStatus::Skipped);
                self.print_task_result(&result);
                report.results.push(result);
                continue;
            }

            let tctx = TaskContext {
                name: task_name.clone(),
                executor: self.clone(),
            };

            let result = match task.body() {
                TaskBody::Group => TaskResult::new(task_name, TaskStatus::Succeeded),
                TaskBody::LongRunning(body) => {
                    tracing::debug!(task = %task_name, "starting long-running task");
                    report.background.push(BackgroundTask {
                        name: task_name.clone(),
                        handle: tokio::spawn(body.start(tctx)),
                    });
                    TaskResult::new(task_name, TaskStatus::Started)
                }
                TaskBody::OneShot(body) => {
                    let spinner = self.spinner(task_name);
                    let start = Instant::now();
                    let outcome = body.invoke(&tctx).await;
                    spinner.finish_and_clear();

                    match outcome {
                        Ok(outcome) => TaskResult::from_outcome(task_name, outcome, start.elapsed()),
                        Err(e) if e.is_configuration() || matches!(e, AssetflowError::Aborted { .. }) => {
                            let mut result = TaskResult::new(task_name, TaskStatus::Failed);
                            result.duration = start.elapsed();
                            self.print_task_result(&result);
                            return Err(e);
                        }
                        Err(e) => {
                            self.ctx.policy.on_failure(&e)?;
                            let mut result = TaskResult::new(task_name, TaskStatus::Failed);
                            result.duration = start.elapsed();
                            result.failures.push(e.to_string());
                            result
                        }
                    }
                }
            };

            if result.status == TaskStatus::Failed {
                failed.insert(task_name);
            }
            self.print_task_result(&result);
            report.results.push(result);
        }

        self.print_summary(&report);
        Ok(report)
    }

    fn spinner(&self, task: &str) -> ProgressBar {
        if self.ctx.quiet {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Running {task}"));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Print dry-run execution plan
    fn print_plan(&self, target: &str, order: &[String]) {
        println!(
            "{} {}",
            style("Execution plan (dry run):").bold().cyan(),
            style(target).bold()
        );
        println!();

        for (i, name) in order.iter().enumerate() {
            let Some(task) = self.graph.get_task(name) else {
                continue;
            };
            let mode = match task.mode() {
                TaskMode::LongRunning => style(" (long-running)").yellow(),
                TaskMode::OneShot => style(""),
            };
            println!("{} {}{}", style(format!("{}.", i + 1)).dim(), style(name).bold(), mode);
            if !matches!(task.body(), TaskBody::Group) {
                println!("    {} {}", style("→").dim(), task.body().describe());
            }
        }
    }

    /// Print result of a single task
    fn print_task_result(&self, result: &TaskResult) {
        if self.ctx.quiet {
            return;
        }

        let status = match result.status {
            TaskStatus::Succeeded => style("✓").green(),
            TaskStatus::Failed => style("✗").red(),
            TaskStatus::Skipped => style("-").yellow(),
            TaskStatus::Started => style("▶").cyan(),
        };

        let mut detail = match result.status {
            TaskStatus::Skipped => "skipped".to_string(),
            TaskStatus::Started => "started".to_string(),
            _ => format!("{:.2}s", result.duration.as_secs_f64()),
        };
        if result.files > 0 {
            detail.push_str(&format!(", {} files", result.files));
        }
        if result.cached > 0 {
            detail.push_str(&format!(", {} cached", result.cached));
        }

        println!(
            "{} {} {} {}",
            style(format!("[{}]", chrono::Local::now().format("%H:%M:%S"))).dim(),
            status,
            style(&result.name).bold(),
            style(detail).dim()
        );

        if let Some(output) = &result.output {
            for line in output.lines() {
                println!("  {line}");
            }
        }
        for failure in &result.failures {
            eprintln!("  {}", style(failure).red());
        }
    }

    /// Print execution summary
    fn print_summary(&self, report: &RunReport) {
        if self.ctx.quiet || report.results.len() < 2 {
            return;
        }

        let total: Duration = report.results.iter().map(|r| r.duration).sum();
        let count = |status| report.results.iter().filter(|r| r.status == status).count();
        let succeeded = count(TaskStatus::Succeeded);
        let failed = count(TaskStatus::Failed);
        let skipped = count(TaskStatus::Skipped);
        let started = count(TaskStatus::Started);

        println!();
        if failed == 0 {
            println!(
                "{} {} tasks completed in {:.2}s{}",
                style("✓").green().bold(),
                succeeded,
                total.as_secs_f64(),
                if started > 0 {
                    format!(" ({started} running)")
                } else {
                    String::new()
                }
            );
        } else {
            println!(
                "{} {} succeeded, {} failed, {} skipped in {:.2}s",
                style("✗").red().bold(),
                succeeded,
                failed,
                skipped,
                total.as_secs_f64()
            );
        }
    }
}

impl Dispatch for Executor {
    fn dispatch<'a>(&'a self, task: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let report = self.run(task).await?;
            if !report.succeeded() {
                tracing::warn!(task, failed = report.failed(), "rebuild finished with failures");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::policy::ErrorPolicy;
    use crate::task::Task;

    fn counting(name: &str, calls: &Arc<AtomicUsize>) -> Task {
        let calls = Arc::clone(calls);
        Task::one_shot(name, move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn failing(name: &str) -> Task {
        Task::one_shot(name, |ctx| async move {
            Err(AssetflowError::TaskFailed {
                task: ctx.name,
                message: "exited with code 2".to_string(),
                stderr: None,
            })
        })
    }

    fn executor(tasks: Vec<Task>, policy: ErrorPolicy) -> Executor {
        let mut graph = TaskGraph::new();
        for task in tasks {
            graph.register(task).unwrap();
        }
        let ctx = RunContext {
            policy,
            quiet: true,
            ..Default::default()
        };
        Executor::new(Arc::new(graph), Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_shared_prerequisite_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(
            vec![
                counting("bower", &calls),
                Task::group("sass", ["bower"]),
                Task::group("lint", ["bower"]),
                Task::group("default", ["bower", "sass", "lint"]),
            ],
            ErrorPolicy::Lenient,
        );

        let report = exec.run("default").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.results.len(), 4);

        // memoised per invocation, not globally
        exec.run("default").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_strict_stops_before_later_tasks() {
        let later = Arc::new(AtomicUsize::new(0));
        let exec = executor(
            vec![
                failing("sass"),
                counting("images", &later),
                Task::group("preprocess", ["sass", "images"]),
            ],
            ErrorPolicy::Strict,
        );

        let result = exec.run("preprocess").await;
        assert!(matches!(result, Err(AssetflowError::Aborted { .. })));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lenient_continues_and_skips_dependents() {
        let images = Arc::new(AtomicUsize::new(0));
        let docs = Arc::new(AtomicUsize::new(0));
        let exec = executor(
            vec![
                failing("sass"),
                counting("images", &images),
                counting("docs", &docs).depends_on(["sass"]),
                Task::group("preprocess", ["sass", "images", "docs"]),
            ],
            ErrorPolicy::Lenient,
        );

        let report = exec.run("preprocess").await.unwrap();
        assert_eq!(images.load(Ordering::SeqCst), 1);
        assert_eq!(docs.load(Ordering::SeqCst), 0);
        assert_eq!(report.status("sass"), Some(TaskStatus::Failed));
        assert_eq!(report.status("images"), Some(TaskStatus::Succeeded));
        assert_eq!(report.status("docs"), Some(TaskStatus::Skipped));
        assert_eq!(report.status("preprocess"), Some(TaskStatus::Skipped));
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn test_long_running_does_not_block_siblings() {
        let after = Arc::new(AtomicUsize::new(0));
        let exec = executor(
            vec![
                Task::long_running("watch", |_| async {
                    futures::future::pending::<()>().await;
                    Ok(())
                }),
                counting("serve", &after),
                Task::group("default", ["watch", "serve"]),
            ],
            ErrorPolicy::Lenient,
        );

        let report = tokio::time::timeout(Duration::from_secs(5), exec.run("default"))
            .await
            .expect("long-running task blocked the run")
            .unwrap();

        assert_eq!(report.status("watch"), Some(TaskStatus::Started));
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert!(report.has_background());
    }

    #[tokio::test]
    async fn test_background_error_surfaces_from_wait() {
        let exec = executor(
            vec![Task::long_running("serve", |ctx| async move {
                Err(AssetflowError::TaskFailed {
                    task: ctx.name,
                    message: "port in use".to_string(),
                    stderr: None,
                })
            })],
            ErrorPolicy::Lenient,
        );

        let report = exec.run("serve").await.unwrap();
        assert!(report.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new();
        graph.register(counting("sass", &calls)).unwrap();
        let ctx = RunContext {
            dry_run: true,
            quiet: true,
            ..Default::default()
        };

        let report = Executor::new(Arc::new(graph), Arc::new(ctx))
            .run("sass")
            .await
            .unwrap();
        assert!(report.results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_configuration_error() {
        let exec = executor(vec![Task::group("default", Vec::<String>::new())], ErrorPolicy::Lenient);
        let err = exec.run("deploy").await.unwrap_err();
        assert!(err.is_configuration());
    }
}
