//! External process invocation
//!
//! Transforms, command tasks and the preview server all hand work to
//! external programs. Templates are split into arguments before
//! placeholders are substituted, so a path containing spaces stays a single
//! argument.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{AssetflowError, Result};

/// A command template plus everything needed to launch it
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
    pub template: &'a str,
    pub vars: &'a [(&'a str, String)],
    pub env: &'a HashMap<String, String>,
    pub cwd: &'a Path,
    pub shell: bool,
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl<'a> CommandSpec<'a> {
    /// The command line after substitution, for display
    pub fn display(&self) -> String {
        expand(&render(self.template, self.vars), self.env).into_owned()
    }

    fn build(&self) -> Result<Command> {
        let mut command = if self.shell {
            let shell = if cfg!(windows) { "cmd" } else { "sh" };
            let flag = if cfg!(windows) { "/C" } else { "-c" };
            let mut c = Command::new(shell);
            c.arg(flag).arg(self.display());
            c
        } else {
            let parts: Vec<String> = parse_command(self.template)
                .iter()
                .map(|part| expand(&render(part, self.vars), self.env).into_owned())
                .collect();

            let program = parts.first().ok_or_else(|| AssetflowError::CommandNotFound {
                command: self.template.to_string(),
            })?;
            let program = resolve_program(program)?;

            let mut c = Command::new(program);
            c.args(&parts[1..]);
            c
        };

        command.current_dir(self.cwd).envs(self.env);
        Ok(command)
    }

    /// Run to completion, capturing output.
    ///
    /// A non-zero exit becomes [`AssetflowError::TaskFailed`] carrying the
    /// command's diagnostics.
    pub async fn output(&self, task: &str) -> Result<CommandOutput> {
        let mut command = self.build()?;
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(task, command = %self.display(), "running");
        let output = command.output().await.map_err(|e| self.spawn_error(e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let diagnostics = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(AssetflowError::TaskFailed {
                task: task.to_string(),
                message: match output.status.code() {
                    Some(code) => format!("`{}` exited with code {}", self.display(), code),
                    None => format!("`{}` was terminated by a signal", self.display()),
                },
                stderr: (!diagnostics.is_empty()).then(|| diagnostics.to_string()),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    /// Start with inherited stdio and return the running child.
    ///
    /// The child is killed when its handle is dropped.
    pub fn spawn(&self) -> Result<Child> {
        let mut command = self.build()?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        command.spawn().map_err(|e| self.spawn_error(e))
    }

    fn spawn_error(&self, error: std::io::Error) -> AssetflowError {
        if error.kind() == std::io::ErrorKind::NotFound {
            AssetflowError::CommandNotFound {
                command: self.display(),
            }
        } else {
            AssetflowError::Io(error)
        }
    }
}

/// Substitute `{key}` placeholders
pub fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

/// Expand `$VAR` / `${VAR}` from the task environment, then the process
/// environment. Unknown variables are left untouched.
pub fn expand<'s>(input: &'s str, env: &HashMap<String, String>) -> Cow<'s, str> {
    shellexpand::env_with_context_no_errors(input, |var| {
        env.get(var).cloned().or_else(|| std::env::var(var).ok())
    })
}

fn resolve_program(program: &str) -> Result<String> {
    if program.contains('/') || program.contains('\\') {
        return Ok(program.to_string());
    }

    which::which(program)
        .map(|p| p.to_string_lossy().to_string())
        .map_err(|_| AssetflowError::CommandNotFound {
            command: program.to_string(),
        })
}

/// Split a command line into arguments, honouring single and double quotes
pub fn parse_command(cmd: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';

    for c in cmd.chars() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
            }
            c if c == quote_char && in_quotes => {
                in_quotes = false;
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => {
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }

    parts
}
