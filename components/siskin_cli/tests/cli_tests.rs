//! Process-level tests for the `siskin` binary.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

fn siskin() -> Command {
    Command::cargo_bin("siskin").expect("binary builds")
}

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(source.as_bytes()).expect("write script");
    file
}

#[test]
fn runs_a_script_file() {
    let file = script("System.print(1 + 2 * 3)\n");
    siskin()
        .arg(file.path())
        .assert()
        .success()
        .stdout("7\n");
}

#[test]
fn eval_runs_inline_code() {
    siskin()
        .args(["-e", "System.print(\"hello\")"])
        .assert()
        .success()
        .stdout("hello\n");
}

#[test]
fn compile_error_exits_65() {
    let file = script("var = nope\n");
    siskin()
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn runtime_error_exits_70() {
    let file = script("Fiber.abort(\"kaboom\")\n");
    siskin()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("kaboom"));
}

#[test]
fn missing_file_reports_io_error() {
    siskin()
        .arg("does-not-exist.skn")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn version_flag_prints_version() {
    siskin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("siskin "));
    siskin()
        .arg("-v")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("siskin "));
}

#[test]
fn print_bytecode_shows_listing() {
    let file = script("System.print(1)\n");
    siskin()
        .args(["--print-bytecode"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("== (script)"));
}

#[test]
fn stack_trace_names_the_module() {
    let file = script(
        "class A {\n  construct new() {}\n  boom { Fiber.abort(\"pow\") }\n}\nA.new().boom\n",
    );
    siskin()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("pow"))
        .stderr(predicate::str::contains("main"));
}
