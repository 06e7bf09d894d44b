//! assetflow - front-end asset build orchestrator
//!
//! Runs named tasks from `assetflow.toml`: file pipelines, commands,
//! watchers and a preview server, in dependency order.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

mod cli;

use assetflow::config::{utf8_vars, PatternRef, CONFIG_FILES, CONFIG_TEMPLATE};
use assetflow::executor::RunReport;
use assetflow::pattern::relative_str;
use assetflow::{AssetflowError, Config, ErrorPolicy, Executor, Result, RunContext, TaskGraph};
use cli::{Cli, Commands, EffectiveCommand, GraphFormat, ListFormat};

#[tokio::main]
async fn main() -> ExitCode {
    // Set up panic handler for nice error messages
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    // Handle --no-color
    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let fallback = if verbose {
        "assetflow=debug"
    } else if quiet {
        "error"
    } else {
        "assetflow=info"
    };

    let filter = ["ASSETFLOW_LOG", "RUST_LOG"]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let cwd = match &cli.cwd {
        Some(dir) => std::env::current_dir()?.join(dir),
        None => std::env::current_dir()?,
    };

    match cli.effective_command() {
        EffectiveCommand::Subcommand(cmd) => run_command(cmd, &cli, &cwd).await,
        EffectiveCommand::RunTask(task) => run_tasks(&[task.to_string()], false, &cli, &cwd).await,
        EffectiveCommand::RunDefault => run_tasks(&[], false, &cli, &cwd).await,
    }
}

async fn run_command(cmd: &Commands, cli: &Cli, cwd: &Path) -> Result<()> {
    match cmd {
        Commands::Run { tasks, dry_run } => run_tasks(tasks, *dry_run, cli, cwd).await,

        Commands::List { format, deps } => {
            let (config, _, ctx) = load(cli, cwd)?;
            let graph = TaskGraph::from_config(&config, &ctx)?;
            print_task_list(&graph, format.clone(), *deps);
            Ok(())
        }

        Commands::Graph { task, format } => {
            let (config, _, ctx) = load(cli, cwd)?;
            let graph = TaskGraph::from_config(&config, &ctx)?;
            print_graph(&graph, task.as_deref(), format.clone())
        }

        Commands::Files { pattern_set } => {
            let (config, _, ctx) = load(cli, cwd)?;
            let patterns = config.pattern_set(&PatternRef::Named(pattern_set.clone()))?;
            for file in patterns.files(&ctx.root) {
                let shown = relative_str(&ctx.root, &file).unwrap_or_else(|| file.display().to_string());
                println!("{shown}");
            }
            Ok(())
        }

        Commands::Init { force } => init_config(cwd, *force),

        Commands::Check => {
            let (config, path, ctx) = load(cli, cwd)?;
            let graph = TaskGraph::from_config(&config, &ctx)?;

            println!(
                "{} {} is valid ({} tasks)",
                style("✓").green(),
                path.display(),
                graph.len()
            );
            Ok(())
        }
    }
}

/// Load configuration and build the run context from settings, environment
/// and command-line flags
fn load(cli: &Cli, cwd: &Path) -> Result<(Config, PathBuf, RunContext)> {
    let (config, path) = Config::load(cli.config.as_deref(), cwd)?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf());

    let mut ctx = RunContext::from_env(root, &config.settings, utf8_vars(std::env::vars_os()));
    ctx.debug = cli.debug;
    ctx.quiet = cli.quiet;
    if cli.strict {
        ctx.policy = ErrorPolicy::Strict;
    } else if cli.lenient {
        ctx.policy = ErrorPolicy::Lenient;
    }

    tracing::debug!(config = %path.display(), policy = %ctx.policy, port = ctx.port, "loaded configuration");
    Ok((config, path, ctx))
}

async fn run_tasks(tasks: &[String], dry_run: bool, cli: &Cli, cwd: &Path) -> Result<()> {
    let (config, _, mut ctx) = load(cli, cwd)?;
    ctx.dry_run = dry_run;

    let tasks = if tasks.is_empty() {
        vec![config.settings.default.clone()]
    } else {
        tasks.to_vec()
    };

    let graph = Arc::new(TaskGraph::from_config(&config, &ctx)?);
    let executor = Executor::new(graph, Arc::new(ctx));

    let mut running = RunReport::default();
    for task in &tasks {
        let report = executor.run(task).await?;
        running.background.extend(report.background);
    }

    if !running.has_background() {
        return Ok(());
    }

    if !cli.quiet {
        let names: Vec<&str> = running.background.iter().map(|bg| bg.name.as_str()).collect();
        println!(
            "{} {} running, press Ctrl-C to stop",
            style("▶").cyan(),
            names.join(", ")
        );
    }

    tokio::select! {
        result = running.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
    }
}

fn print_task_list(graph: &TaskGraph, format: ListFormat, show_deps: bool) {
    let mut names: Vec<_> = graph.task_names().collect();
    names.sort();

    match format {
        ListFormat::Table => {
            println!("{}", style("Available tasks:").bold());
            println!();

            let max_name_len = names.iter().map(|n| n.len()).max().unwrap_or(0);

            for name in names {
                let Some(task) = graph.get_task(name) else {
                    continue;
                };

                print!(
                    "  {}{}  {}",
                    style(name).cyan().bold(),
                    " ".repeat(max_name_len - name.len()),
                    style(task.description().unwrap_or("")).dim()
                );

                if task.mode() == assetflow::TaskMode::LongRunning {
                    print!(" {}", style("(long-running)").yellow());
                }

                if show_deps && !task.dependencies().is_empty() {
                    print!(
                        " {}",
                        style(format!("[deps: {}]", task.dependencies().join(", ")))
                            .yellow()
                            .dim()
                    );
                }

                println!();
            }
        }

        ListFormat::Json => {
            let mut tasks = serde_json::Map::new();
            for name in names {
                let Some(task) = graph.get_task(name) else {
                    continue;
                };
                let mut obj = serde_json::Map::new();
                if let Some(desc) = task.description() {
                    obj.insert("description".to_string(), serde_json::json!(desc));
                }
                obj.insert("mode".to_string(), serde_json::json!(task.mode().to_string()));
                if show_deps {
                    obj.insert("depends".to_string(), serde_json::json!(task.dependencies()));
                }
                tasks.insert(name.to_string(), serde_json::Value::Object(obj));
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&tasks).unwrap_or_default()
            );
        }

        ListFormat::Plain => {
            for name in names {
                println!("{name}");
            }
        }
    }
}

fn print_graph(graph: &TaskGraph, task: Option<&str>, format: GraphFormat) -> Result<()> {
    let names: Vec<String> = match task {
        Some(name) => graph.resolve(name)?,
        None => graph
            .all_tasks_ordered()?
            .into_iter()
            .map(|t| t.name().to_string())
            .collect(),
    };

    match format {
        GraphFormat::Text => {
            println!("{}", style("Task dependency graph:").bold());
            println!();

            for name in &names {
                let deps = graph.dependencies(name).unwrap_or_default();

                if deps.is_empty() {
                    println!("  {}", style(name).cyan().bold());
                } else {
                    println!(
                        "  {} {} {}",
                        style(name).cyan().bold(),
                        style("←").dim(),
                        deps.join(", ")
                    );
                }
            }
        }

        GraphFormat::Dot => {
            println!("digraph assetflow {{");
            println!("  rankdir=LR;");
            println!("  node [shape=box];");

            for name in &names {
                if let Some(task) = graph.get_task(name) {
                    if task.mode() == assetflow::TaskMode::LongRunning {
                        println!("  \"{name}\" [style=dashed];");
                    }
                }
                for dep in graph.dependencies(name).unwrap_or_default() {
                    println!("  \"{dep}\" -> \"{name}\";");
                }
            }

            println!("}}");
        }

        GraphFormat::Json => {
            let mut nodes = Vec::new();
            let mut edges = Vec::new();

            for name in &names {
                let Some(task) = graph.get_task(name) else {
                    continue;
                };
                nodes.push(serde_json::json!({
                    "id": name,
                    "description": task.description(),
                    "mode": task.mode().to_string(),
                }));

                for dep in task.dependencies() {
                    edges.push(serde_json::json!({
                        "from": dep,
                        "to": name,
                    }));
                }
            }

            let output = serde_json::json!({
                "nodes": nodes,
                "edges": edges,
            });

            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_default()
            );
        }
    }

    Ok(())
}

fn init_config(cwd: &Path, force: bool) -> Result<()> {
    let path = cwd.join(CONFIG_FILES[0]);

    if path.exists() && !force {
        return Err(AssetflowError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists (use --force to overwrite)", path.display()),
        )));
    }

    std::fs::write(&path, CONFIG_TEMPLATE)?;

    println!(
        "{} Created {}",
        style("✓").green(),
        style(path.display()).bold()
    );

    Ok(())
}
