//! Rhai script stages
//!
//! A script stage runs once per file with the file's placeholders in scope
//! (`file`, `rel`, `dir`, `name`, `stem`, `ext`, `root`) plus `debug` and
//! `env`. What the script evaluates to decides what flows downstream:
//!
//! - `()` or `true`: the input passes through
//! - `false`: the file is dropped from the stream
//! - a path string, or an array of them: those files (root-relative or
//!   absolute) replace the input
//!
//! `throw "message"` reports a per-file failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};

use crate::error::{AssetflowError, Result};
use crate::pattern::relative_str;
use crate::transform::{Transform, TransformContext};

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Sandboxed Rhai engine with the file and path helpers registered
#[derive(Debug, Clone, Default)]
pub struct ScriptEngine;

impl ScriptEngine {
    pub fn new() -> Self {
        Self
    }

    fn create_engine(task: &str, root: &Path) -> Engine {
        let mut engine = Engine::new();

        engine.set_max_expr_depths(64, 64);
        engine.set_max_operations(100_000);
        engine.set_max_modules(10);
        engine.set_max_string_size(1024 * 1024);

        let task = task.to_string();
        engine.on_print(move |s| tracing::info!(task = %task, "{s}"));

        register_helpers(&mut engine, root);
        engine
    }

    /// Compile a script once for repeated per-file evaluation
    pub fn compile(&self, script: &str) -> Result<AST> {
        Engine::new()
            .compile(script)
            .map_err(|e| AssetflowError::Script {
                message: e.to_string(),
            })
    }

    /// Evaluate `ast` with `vars` and `env` in scope. Relative paths given to
    /// the helpers resolve against `root`.
    pub fn eval(
        &self,
        task: &str,
        root: &Path,
        ast: &AST,
        vars: &[(&str, String)],
        debug: bool,
        env: &HashMap<String, String>,
    ) -> ScriptResult<Dynamic> {
        let mut scope = Scope::new();
        for (key, value) in vars {
            let key = if *key == "input" { "file" } else { *key };
            scope.push(key.to_string(), value.clone());
        }
        scope.push("debug", debug);

        let env_map: rhai::Map = env
            .iter()
            .map(|(k, v)| (k.clone().into(), Dynamic::from(v.clone())))
            .collect();
        scope.push("env", env_map);

        Self::create_engine(task, root).eval_ast_with_scope::<Dynamic>(&mut scope, ast)
    }
}

/// A transform stage backed by a compiled Rhai script
#[derive(Debug, Clone)]
pub struct ScriptTransform {
    name: String,
    ast: AST,
}

impl ScriptTransform {
    pub fn new(name: impl Into<String>, source: &str) -> Result<Self> {
        let name = name.into();
        let ast = ScriptEngine::new()
            .compile(source)
            .map_err(|e| AssetflowError::Script {
                message: format!("stage '{name}': {e}"),
            })?;
        Ok(Self { name, ast })
    }
}

impl Transform for ScriptTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(
        &'a self,
        file: &'a Path,
        ctx: &'a TransformContext<'a>,
    ) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        Box::pin(async move {
            let ast = self.ast.clone();
            let vars = ctx.file_vars(file);
            let env = ctx.env.clone();
            let task = ctx.task.to_string();
            let root = ctx.root.to_path_buf();
            let debug = ctx.debug;

            let value = tokio::task::spawn_blocking(move || {
                ScriptEngine::new().eval(&task, &root, &ast, &vars, debug, &env)
            })
            .await
            .map_err(|e| AssetflowError::Script {
                message: e.to_string(),
            })?
            .map_err(|e| AssetflowError::Script {
                message: script_message(&e),
            })?;

            interpret(value, file, ctx.root)
        })
    }
}

fn script_message(error: &EvalAltResult) -> String {
    match error {
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    }
}

fn interpret(value: Dynamic, file: &Path, root: &Path) -> Result<Vec<PathBuf>> {
    if value.is_unit() {
        return Ok(vec![file.to_path_buf()]);
    }
    if let Some(keep) = value.clone().try_cast::<bool>() {
        return Ok(if keep { vec![file.to_path_buf()] } else { Vec::new() });
    }
    if let Some(path) = value.clone().try_cast::<String>() {
        return Ok(vec![root.join(path)]);
    }
    if let Some(paths) = value.clone().try_cast::<rhai::Array>() {
        return paths
            .into_iter()
            .map(|p| {
                p.into_string().map(|p| root.join(p)).map_err(|ty| AssetflowError::Script {
                    message: format!("expected an array of paths, found {ty}"),
                })
            })
            .collect();
    }

    Err(AssetflowError::Script {
        message: format!(
            "script must evaluate to (), a bool, a path or an array of paths, not {}",
            value.type_name()
        ),
    })
}

fn io_err(action: &str, path: &str, e: std::io::Error) -> Box<EvalAltResult> {
    format!("cannot {action} '{path}': {e}").into()
}

fn register_helpers(engine: &mut Engine, root: &Path) {
    let at = {
        let root = root.to_path_buf();
        move |path: &str| root.join(path)
    };

    let resolve = at.clone();
    engine.register_fn("read_file", move |path: &str| -> ScriptResult<String> {
        std::fs::read_to_string(resolve(path)).map_err(|e| io_err("read", path, e))
    });

    let resolve = at.clone();
    engine.register_fn("write_file", move |path: &str, content: &str| -> ScriptResult<()> {
        let target = resolve(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err("create", path, e))?;
        }
        std::fs::write(target, content).map_err(|e| io_err("write", path, e))
    });

    let resolve = at.clone();
    engine.register_fn("file_exists", move |path: &str| resolve(path).exists());

    let resolve = at.clone();
    engine.register_fn("mkdir", move |path: &str| -> ScriptResult<()> {
        std::fs::create_dir_all(resolve(path)).map_err(|e| io_err("create", path, e))
    });

    engine.register_fn("join_path", |a: &str, b: &str| {
        Path::new(a).join(b).to_string_lossy().to_string()
    });

    let resolve = at.clone();
    engine.register_fn("file_size", move |path: &str| -> ScriptResult<i64> {
        std::fs::metadata(resolve(path))
            .map(|m| m.len() as i64)
            .map_err(|e| io_err("stat", path, e))
    });

    let cwd = root.to_path_buf();
    engine.register_fn("exec", move |cmd: &str| -> ScriptResult<String> {
        let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
        match std::process::Command::new(shell).args([flag, cmd]).current_dir(&cwd).output() {
            Ok(o) if o.status.success() => Ok(String::from_utf8_lossy(&o.stdout).to_string()),
            Ok(o) => Err(format!("`{cmd}` failed: {}", String::from_utf8_lossy(&o.stderr).trim()).into()),
            Err(e) => Err(format!("cannot run `{cmd}`: {e}").into()),
        }
    });

    let base = root.to_path_buf();
    engine.register_fn("glob", move |pattern: &str| -> ScriptResult<rhai::Array> {
        let full = base.join(pattern).to_string_lossy().to_string();
        let paths = glob::glob(&full).map_err(|e| format!("invalid glob '{pattern}': {e}"))?;
        Ok(paths
            .filter_map(|p| p.ok())
            .map(|p| relative_str(&base, &p).unwrap_or_else(|| p.to_string_lossy().to_string()))
            .map(Dynamic::from)
            .collect())
    });

    engine.register_fn("parse_json", |s: &str| -> ScriptResult<Dynamic> {
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))?;
        Ok(json_to_dynamic(value))
    });

    engine.register_fn("to_json", |value: Dynamic| -> ScriptResult<String> {
        let json = dynamic_to_json(value)?;
        serde_json::to_string_pretty(&json).map_err(|e| format!("cannot serialize: {e}").into())
    });
}

fn json_to_dynamic(value: serde_json::Value) -> Dynamic {
    use serde_json::Value;

    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => n.as_f64().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
        },
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            Dynamic::from(arr.into_iter().map(json_to_dynamic).collect::<rhai::Array>())
        }
        Value::Object(obj) => Dynamic::from(
            obj.into_iter()
                .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                .collect::<rhai::Map>(),
        ),
    }
}

fn dynamic_to_json(value: Dynamic) -> ScriptResult<serde_json::Value> {
    use serde_json::Value;

    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Ok(Value::Bool(b));
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if let Some(s) = value.clone().try_cast::<String>() {
        return Ok(Value::String(s));
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        return arr
            .into_iter()
            .map(dynamic_to_json)
            .collect::<ScriptResult<Vec<_>>>()
            .map(Value::Array);
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        return map
            .into_iter()
            .map(|(k, v)| dynamic_to_json(v).map(|v| (k.to_string(), v)))
            .collect::<ScriptResult<serde_json::Map<_, _>>>()
            .map(Value::Object);
    }

    Err(format!("cannot convert {} to JSON", value.type_name()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(source: &str, root: &Path, file: &Path, debug: bool) -> Result<Vec<PathBuf>> {
        let env = HashMap::new();
        let ctx = TransformContext {
            root,
            task: "docs",
            env: &env,
            debug,
        };
        ScriptTransform::new("script", source)?.apply(file, &ctx).await
    }

    #[tokio::test]
    async fn test_unit_passes_through() {
        let root = Path::new("/project");
        let file = Path::new("/project/static/js/app.js");
        let out = run(r#"print(rel);"#, root, file, false).await.unwrap();
        assert_eq!(out, vec![file.to_path_buf()]);
    }

    #[tokio::test]
    async fn test_bool_filters() {
        let root = Path::new("/project");
        let file = Path::new("/project/static/js/app.min.js");
        let out = run(r#"!name.ends_with(".min.js")"#, root, file, false).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_returns_paths() {
        let root = Path::new("/project");
        let file = Path::new("/project/private/sass/main.scss");
        let out = run(r#"if debug { ["a.css", "a.css.map"] } else { `css/${stem}.css` }"#, root, file, false)
            .await
            .unwrap();
        assert_eq!(out, vec![PathBuf::from("/project/css/main.css")]);

        let out = run(r#"if debug { ["a.css", "a.css.map"] } else { "x" }"#, root, file, true)
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_throw_reports_message() {
        let root = Path::new("/project");
        let file = Path::new("/project/static/js/app.js");
        let err = run(r#"throw "missing semicolon";"#, root, file, false).await.unwrap_err();
        match err {
            AssetflowError::Script { message } => assert_eq!(message, "missing semicolon"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helpers_resolve_against_root() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("static/js")).unwrap();
        std::fs::write(root.join("static/js/app.js"), "var a = 1;").unwrap();

        let script = r#"
            if !file_exists(rel) { throw `not found: ${rel}`; }
            let found = glob("static/js/*.js");
            if found.len() != 1 || found[0] != rel { throw `glob saw ${found}`; }
            exec("test -f static/js/app.js");
            write_file(`build/${stem}.txt`, read_file(rel));
            `build/${stem}.txt`
        "#;
        let out = run(script, root, &root.join("static/js/app.js"), false).await.unwrap();

        assert_eq!(out, vec![root.join("build/app.txt")]);
        assert_eq!(std::fs::read_to_string(root.join("build/app.txt")).unwrap(), "var a = 1;");
    }

    #[test]
    fn test_compile_error() {
        assert!(matches!(
            ScriptTransform::new("broken", "let = ;"),
            Err(AssetflowError::Script { .. })
        ));
    }

    #[test]
    fn test_json_helpers() {
        let engine = ScriptEngine::new();
        let ast = engine
            .compile(r#"let v = parse_json(`{"a": [1, 2]}`); to_json(v.a)"#)
            .unwrap();
        let value = engine
            .eval("docs", Path::new("."), &ast, &[], false, &HashMap::new())
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&value.into_string().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!([1, 2]));
    }
}
