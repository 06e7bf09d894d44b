use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn assetflow(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("assetflow").unwrap();
    cmd.arg("--cwd")
        .arg(dir)
        .arg("--no-color")
        .env_remove("CI")
        .env_remove("EXIT_ON_ERRORS")
        .env_remove("ASSETFLOW_STRICT")
        .env_remove("PORT");
    cmd
}

fn project(config: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("assetflow.toml"), config).unwrap();
    temp
}

const FAILING: &str = r#"
[tasks.broken]
run = ["false"]

[tasks.images]
run = ["touch images.done"]

[tasks.docs]
depends = ["broken"]
run = ["touch docs.done"]

[tasks.preprocess]
depends = ["broken", "images", "docs"]
"#;

#[test]
fn check_reports_valid_config() {
    let temp = project("[tasks.sass]\nrun = [\"true\"]\n\n[tasks.default]\ndepends = [\"sass\"]\n");

    assetflow(temp.path())
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid (2 tasks)"));
}

#[test]
fn check_rejects_cycle() {
    let temp = project("[tasks.a]\ndepends = [\"b\"]\n\n[tasks.b]\ndepends = [\"a\"]\n");

    assetflow(temp.path())
        .arg("check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Circular dependency"));
}

#[test]
fn check_rejects_unresolved_dependency() {
    let temp = project("[tasks.default]\ndepends = [\"bower\"]\n");

    assetflow(temp.path())
        .arg("check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("bower"));
}

#[test]
fn missing_config_fails() {
    let temp = tempfile::tempdir().unwrap();

    assetflow(temp.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration file not found"));
}

#[test]
fn list_plain_is_sorted() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .args(["list", "--format", "plain"])
        .assert()
        .success()
        .stdout("broken\ndocs\nimages\npreprocess\n");
}

#[test]
fn list_json_includes_mode_and_deps() {
    let temp = project("[tasks.watch]\nwatch = [{ patterns = [\"*.scss\"], tasks = [\"sass\"] }]\n\n[tasks.sass]\nrun = [\"true\"]\n");

    let output = assetflow(temp.path())
        .args(["list", "--format", "json", "--deps"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["watch"]["mode"], "long-running");
    assert_eq!(json["sass"]["mode"], "one-shot");
}

#[test]
fn graph_dot_lists_edges() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .args(["graph", "preprocess", "--format", "dot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"broken\" -> \"docs\";"))
        .stdout(predicate::str::contains("\"images\" -> \"preprocess\";"));
}

#[test]
fn files_lists_matches() {
    let temp = project("[patterns.css]\ninclude = [\"src/**/*.css\"]\nexclude = [\"src/**/*.min.css\"]\n\n[tasks.a]\nrun = [\"true\"]\n");
    std::fs::create_dir_all(temp.path().join("src/vendor")).unwrap();
    std::fs::write(temp.path().join("src/site.css"), "").unwrap();
    std::fs::write(temp.path().join("src/vendor/lib.min.css"), "").unwrap();

    assetflow(temp.path())
        .args(["files", "css"])
        .assert()
        .success()
        .stdout("src/site.css\n");
}

#[cfg(unix)]
#[test]
fn lenient_run_exits_zero_and_skips_dependents() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .args(["run", "preprocess"])
        .assert()
        .success();

    assert!(temp.path().join("images.done").exists());
    assert!(!temp.path().join("docs.done").exists());
}

#[cfg(unix)]
#[test]
fn strict_flag_exits_one() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .args(["--strict", "run", "preprocess"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("strict mode"));

    assert!(!temp.path().join("images.done").exists());
}

#[cfg(unix)]
#[test]
fn ci_env_selects_strict() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .env("CI", "true")
        .args(["run", "preprocess"])
        .assert()
        .code(1);
}

#[cfg(unix)]
#[test]
fn lenient_flag_overrides_ci() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .env("CI", "1")
        .args(["--lenient", "run", "preprocess"])
        .assert()
        .success();
}

#[cfg(unix)]
#[test]
fn default_task_runs_without_arguments() {
    let temp = project("[settings]\ndefault = \"build\"\n\n[tasks.build]\nrun = [\"touch built\"]\n");

    assetflow(temp.path()).assert().success();
    assert!(temp.path().join("built").exists());
}

#[test]
fn dry_run_prints_plan_only() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .args(["run", "preprocess", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Execution plan (dry run)"))
        .stdout(predicate::str::contains("touch images.done"));

    assert!(!temp.path().join("images.done").exists());
}

#[test]
fn unknown_task_fails() {
    let temp = project(FAILING);

    assetflow(temp.path())
        .args(["run", "deploy"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("'deploy' not found"));
}

#[test]
fn init_writes_template_once() {
    let temp = tempfile::tempdir().unwrap();

    assetflow(temp.path()).arg("init").assert().success();
    assert!(temp.path().join("assetflow.toml").exists());

    assetflow(temp.path()).arg("init").assert().failure();
    assetflow(temp.path()).args(["init", "--force"]).assert().success();

    assetflow(temp.path())
        .arg("check")
        .assert()
        .success();
}

#[cfg(unix)]
#[test]
fn non_utf8_environment_does_not_crash() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let temp = project("[tasks.a]\nrun = [\"true\"]\n");

    assetflow(temp.path())
        .env("LATIN1", OsStr::from_bytes(b"caf\xe9"))
        .arg("check")
        .assert()
        .success();
}
