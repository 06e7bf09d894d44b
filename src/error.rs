//! Error types for assetflow
//!
//! Uses `miette` for pretty error reporting with help text.
//!
//! Errors fall into two classes. Configuration errors (a broken build
//! definition) always abort, whatever the error policy says. Everything
//! a task reports while processing input is subject to [`ErrorPolicy`].
//!
//! [`ErrorPolicy`]: crate::policy::ErrorPolicy

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for assetflow operations
#[derive(Error, Diagnostic, Debug)]
pub enum AssetflowError {
    #[error("Configuration file not found")]
    #[diagnostic(
        code(assetflow::config::not_found),
        help("Create an assetflow.toml in your project root (`assetflow init`), or pass --config")
    )]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse configuration {}", path.display())]
    #[diagnostic(code(assetflow::config::parse))]
    ConfigParse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("Invalid task '{task}': {reason}")]
    #[diagnostic(code(assetflow::config::invalid_task))]
    InvalidTask { task: String, reason: String },

    #[error("Task '{name}' is already registered")]
    #[diagnostic(
        code(assetflow::task::duplicate),
        help("Task names must be unique across the build definition")
    )]
    DuplicateTask { name: String },

    #[error("Circular dependency detected: {cycle}")]
    #[diagnostic(
        code(assetflow::task::cycle),
        help("Check the 'depends' field in your task definitions")
    )]
    CyclicDependency { cycle: String },

    #[error("Task '{task}' depends on '{dependency}', which is not registered")]
    #[diagnostic(
        code(assetflow::task::unresolved),
        help("Run `assetflow list` to see available tasks")
    )]
    DependencyUnresolved { task: String, dependency: String },

    #[error("Task '{name}' not found")]
    #[diagnostic(
        code(assetflow::task::not_found),
        help("Run `assetflow list` to see available tasks")
    )]
    TaskNotFound { name: String, available: Vec<String> },

    #[error("Invalid pattern '{pattern}': {reason}")]
    #[diagnostic(code(assetflow::pattern::invalid))]
    InvalidPattern { pattern: String, reason: String },

    #[error("{0}")]
    #[diagnostic(code(assetflow::transform::failed))]
    Transform(crate::transform::TransformFailure),

    #[error("Task '{task}' failed: {message}")]
    #[diagnostic(code(assetflow::exec::failed))]
    TaskFailed {
        task: String,
        message: String,
        #[help]
        stderr: Option<String>,
    },

    #[error("Build aborted (strict mode): {reason}")]
    #[diagnostic(
        code(assetflow::policy::aborted),
        help("Unset CI / ASSETFLOW_STRICT / EXIT_ON_ERRORS or pass --lenient to keep going after failures")
    )]
    Aborted { reason: String },

    #[error("Command not found: {command}")]
    #[diagnostic(
        code(assetflow::exec::command_not_found),
        help("Ensure the command is installed and in your PATH")
    )]
    CommandNotFound { command: String },

    #[error("Script error: {message}")]
    #[diagnostic(code(assetflow::script::failed))]
    Script { message: String },

    #[error("I/O error: {0}")]
    #[diagnostic(code(assetflow::io))]
    Io(#[from] std::io::Error),

    #[error("Watch error")]
    #[diagnostic(code(assetflow::watch))]
    Watch {
        #[source]
        source: notify::Error,
    },
}

impl AssetflowError {
    /// Whether this error comes from a broken build definition.
    ///
    /// Configuration errors abort regardless of the error policy.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::ConfigParse { .. }
                | Self::InvalidTask { .. }
                | Self::DuplicateTask { .. }
                | Self::CyclicDependency { .. }
                | Self::DependencyUnresolved { .. }
                | Self::TaskNotFound { .. }
                | Self::InvalidPattern { .. }
        )
    }
}

/// Result type alias for assetflow operations
pub type Result<T> = std::result::Result<T, AssetflowError>;
