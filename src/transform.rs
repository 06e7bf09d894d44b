//! Per-file processing stages
//!
//! A [`Transform`] takes one file and either hands back the files the next
//! stage should see or reports a per-file failure. Built-in stages shell out
//! to external processors ([`CommandTransform`]), copy files into an output
//! directory ([`CopyTransform`]), or evaluate a Rhai script
//! ([`ScriptTransform`](crate::script::ScriptTransform)).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;

use crate::command::{render, CommandSpec};
use crate::error::{AssetflowError, Result};
use crate::pattern::relative_str;

/// A single file that failed a processing step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFailure {
    pub task: String,
    pub transform: String,
    pub path: Option<PathBuf>,
    pub message: String,
}

impl TransformFailure {
    pub fn new(ctx: &TransformContext<'_>, transform: &str, path: &Path, error: &AssetflowError) -> Self {
        let path = relative_str(ctx.root, path)
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf());

        Self {
            task: ctx.task.to_string(),
            transform: transform.to_string(),
            path: Some(path),
            message: describe(error),
        }
    }
}

impl fmt::Display for TransformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.task, self.transform)?;
        if let Some(path) = &self.path {
            write!(f, " {}", path.display())?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Render an error together with any captured process diagnostics
fn describe(error: &AssetflowError) -> String {
    match error {
        AssetflowError::TaskFailed {
            message,
            stderr: Some(stderr),
            ..
        } => format!("{message}\n{stderr}"),
        AssetflowError::TaskFailed { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// What a stage needs to know about the run it is part of
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub root: &'a Path,
    pub task: &'a str,
    pub env: &'a HashMap<String, String>,
    pub debug: bool,
}

impl TransformContext<'_> {
    /// Placeholder values describing `file`
    pub fn file_vars(&self, file: &Path) -> Vec<(&'static str, String)> {
        let rel = relative_str(self.root, file).unwrap_or_else(|| file.to_string_lossy().to_string());
        let rel_path = Path::new(&rel);
        let lossy = |s: Option<&std::ffi::OsStr>| {
            s.map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
        };

        vec![
            ("input", self.root.join(&rel).to_string_lossy().to_string()),
            ("rel", rel.clone()),
            (
                "dir",
                rel_path
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ),
            ("name", lossy(rel_path.file_name())),
            ("stem", lossy(rel_path.file_stem())),
            ("ext", lossy(rel_path.extension())),
            ("root", self.root.to_string_lossy().to_string()),
        ]
    }
}

/// A pluggable per-file processing step
pub trait Transform: Send + Sync {
    /// Label used in failure reports
    fn name(&self) -> &str;

    /// Process `file`, returning the files downstream stages should see.
    ///
    /// Returning `vec![file]` passes the input through unchanged (checks,
    /// linters). An empty vector ends the stream for this file.
    fn apply<'a>(
        &'a self,
        file: &'a Path,
        ctx: &'a TransformContext<'a>,
    ) -> BoxFuture<'a, Result<Vec<PathBuf>>>;
}

/// Runs an external processor once per file
#[derive(Debug, Clone)]
pub struct CommandTransform {
    name: String,
    template: String,
    output: Option<String>,
    shell: bool,
}

impl CommandTransform {
    /// `template` may use `{input}`, `{rel}`, `{dir}`, `{name}`, `{stem}`,
    /// `{ext}`, `{root}` and, when `output` is set, `{output}`.
    pub fn new(name: impl Into<String>, template: impl Into<String>, output: Option<String>, shell: bool) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            output,
            shell,
        }
    }
}

impl Transform for CommandTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(
        &'a self,
        file: &'a Path,
        ctx: &'a TransformContext<'a>,
    ) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        Box::pin(async move {
            let mut vars = ctx.file_vars(file);

            let output = match &self.output {
                Some(template) => {
                    let out = ctx.root.join(render(template, &vars));
                    if let Some(parent) = out.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    vars.push(("output", out.to_string_lossy().to_string()));
                    Some(out)
                }
                None => None,
            };

            let mut env = ctx.env.clone();
            if ctx.debug {
                env.insert("ASSETFLOW_DEBUG".to_string(), "1".to_string());
            }

            let spec = CommandSpec {
                template: &self.template,
                vars: &vars,
                env: &env,
                cwd: ctx.root,
                shell: self.shell,
            };
            let result = spec.output(ctx.task).await?;
            if !result.stdout.trim().is_empty() {
                tracing::debug!(task = ctx.task, transform = %self.name, "{}", result.stdout.trim());
            }

            match output {
                Some(out) if !out.exists() => Err(AssetflowError::TaskFailed {
                    task: ctx.task.to_string(),
                    message: format!("`{}` did not produce {}", spec.display(), out.display()),
                    stderr: None,
                }),
                Some(out) => Ok(vec![out]),
                None => Ok(vec![file.to_path_buf()]),
            }
        })
    }
}

/// Copies each file below a destination directory
///
/// The root-relative path is kept, minus an optional `base` prefix, so
/// `static/img/logo.png` with base `static/img` and dest `dist/img` lands
/// at `dist/img/logo.png`.
#[derive(Debug, Clone)]
pub struct CopyTransform {
    name: String,
    dest: PathBuf,
    base: Option<String>,
}

impl CopyTransform {
    pub fn new(name: impl Into<String>, dest: impl Into<PathBuf>, base: Option<String>) -> Self {
        Self {
            name: name.into(),
            dest: dest.into(),
            base: base.map(|b| b.trim_end_matches('/').to_string()),
        }
    }

    fn target(&self, root: &Path, file: &Path) -> PathBuf {
        let rel = relative_str(root, file).unwrap_or_else(|| file.to_string_lossy().to_string());
        let rel = match &self.base {
            Some(base) => rel
                .strip_prefix(base.as_str())
                .map(|r| r.trim_start_matches('/').to_string())
                .unwrap_or(rel),
            None => rel,
        };
        root.join(&self.dest).join(rel)
    }
}

impl Transform for CopyTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(
        &'a self,
        file: &'a Path,
        ctx: &'a TransformContext<'a>,
    ) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        Box::pin(async move {
            let source = ctx.root.join(file);
            let target = self.target(ctx.root, file);

            if target != source {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&source, &target).await?;
            }

            Ok(vec![target])
        })
    }
}
