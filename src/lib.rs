//! assetflow - a front-end asset build orchestrator
//!
//! This crate provides both a CLI tool and a library for running asset
//! builds described as a graph of named tasks.
//!
//! # Features
//!
//! - **Task graph** - named tasks with prerequisites, resolved depth-first
//! - **File pipelines** - pattern sets streamed through per-file transforms
//! - **Per-stage caching** - unchanged inputs are skipped on rebuilds
//! - **Watch mode** - debounced file watching re-runs bound tasks
//! - **Preview server** - long-running tasks run alongside the build
//! - **Strict / lenient errors** - abort in CI, keep going while developing
//!
//! # Example
//!
//! ```toml
//! # assetflow.toml
//!
//! [patterns.sass]
//! include = ["private/sass/**/*.scss"]
//!
//! [tasks.sass]
//! desc = "Compile stylesheets"
//! patterns = "sass"
//! transforms = [{ run = "sassc {input} {output}", output = "static/css/{stem}.css" }]
//!
//! [tasks.watch]
//! watch = [{ patterns = "sass", tasks = ["sass"] }]
//!
//! [tasks.default]
//! depends = ["sass", "watch"]
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use assetflow::{Task, TaskGraph, RunContext};
//!
//! #[tokio::main]
//! async fn main() -> assetflow::Result<()> {
//!     let mut graph = TaskGraph::new();
//!     graph.register(Task::one_shot("bower", |_| async { Ok(()) }))?;
//!     graph.register(Task::group("default", ["bower"]))?;
//!
//!     let graph = Arc::new(graph);
//!     graph.run("default", Arc::new(RunContext::default())).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod pattern;
pub mod pipeline;
pub mod policy;
pub mod script;
pub mod task;
pub mod transform;
pub mod watch;

// Re-export main types
pub use cache::{Cache, FingerprintStrategy};
pub use config::{Config, RunContext};
pub use error::{AssetflowError, Result};
pub use executor::{Executor, RunReport, TaskResult, TaskStatus};
pub use graph::TaskGraph;
pub use pattern::PatternSet;
pub use pipeline::{Pipeline, Stage};
pub use policy::ErrorPolicy;
pub use task::{Task, TaskBody, TaskMode};
pub use transform::{Transform, TransformContext, TransformFailure};
pub use watch::{ChangeEvent, ChangeKind, WatchBinding, Watcher};
