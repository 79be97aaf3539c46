use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;

fn run_gbs(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_gbs");
    Command::new(exe)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run gbs")
}

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(&path, text).expect("write file");
    path
}

fn stderr(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

const PASSING: &str = "!data\n\
sources:\n  ok.c:\n    main: true\n    content: |\n      int main(void) { return 0; }\n\
--- !logic builds and runs\n\
c = Compilation()\n\
c.compile()\n\
assert c.run().retcode == 0\n";

const FAILING: &str = "!data\n\
sources:\n  bad.c:\n    main: true\n    content: |\n      int main(void) { return 1; }\n\
--- !logic exits cleanly\n\
c = Compilation()\n\
c.compile()\n\
c.run()\n";

#[test]
fn all_passing_exits_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "a.test", PASSING);
    write(dir.path(), "b.test", PASSING);
    // not a testcase
    write(dir.path(), "notes.txt", "!bogus\n");

    let out = run_gbs(&["-t", dir.path().to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(0), "stderr={}", stderr(&out));
    let err = stderr(&out);
    assert!(err.contains("Testcase:"), "{err}");
    assert!(err.contains("... Subtest: builds and runs"), "{err}");
    assert!(!err.contains("notes.txt"), "{err}");
}

#[test]
fn failures_are_listed_and_exit_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "a_pass.test", PASSING);
    let bad = write(dir.path(), "b_fail.test", FAILING);

    let out = run_gbs(&["--testcases", dir.path().to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("Failed Testcases:"), "{err}");
    assert!(err.contains(&format!(" - {}", bad.display())), "{err}");
    assert!(err.contains("testcase failed:"), "{err}");
}

#[test]
fn skips_exit_one_with_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write(
        dir.path(),
        "skip.test",
        "--- !logic\nskip('tool missing')\n--- !logic\nskip('tool missing')\n",
    );
    let out = run_gbs(&["-t", path.to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("2 test(s) were skipped."), "{}", stderr(&out));
}

#[test]
fn broken_testcase_exits_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write(dir.path(), "broken.test", "!nonsense\n");
    let out = run_gbs(&["-t", path.to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("unknown"), "{}", stderr(&out));
}

#[test]
fn report_out_writes_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "cases/a.test", PASSING);
    write(dir.path(), "cases/b.test", FAILING);
    let report = dir.path().join("out/report.json");

    let out = run_gbs(&[
        "-t",
        dir.path().join("cases").to_str().expect("utf-8 path"),
        "--report-out",
        report.to_str().expect("utf-8 path"),
    ]);
    assert_eq!(out.status.code(), Some(1));

    let v: Value =
        serde_json::from_slice(&std::fs::read(&report).expect("read report")).expect("parse report");
    assert_eq!(v["schema_version"], "gbs.test.report@0.1.0");
    assert_eq!(v["summary"]["passed"], 1);
    assert_eq!(v["summary"]["failed"], 1);
    let statuses: Vec<&str> = v["tests"]
        .as_array()
        .expect("tests array")
        .iter()
        .map(|t| t["status"].as_str().expect("status"))
        .collect();
    assert_eq!(statuses, vec!["pass", "fail"]);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn divide_by_zero_scenario() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = "!data\n\
sources:\n  div.c:\n    main: true\n    content: |\n      int main(void) { volatile int zero = 0; volatile int x = 1 / zero; return x; }\n\
--- !logic crashes with a signal\n\
c = Compilation()\n\
c.compile(flags=['-O0'])\n\
c.run(must_fail=true, retcode='< 0')\n";
    let path = write(dir.path(), "div.test", script);
    let out = run_gbs(&["-t", path.to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(0), "stderr={}", stderr(&out));

    let normal = script.replace("1 / zero", "1 + zero");
    let path = write(dir.path(), "div.test", &normal);
    let out = run_gbs(&["-t", path.to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(1), "stderr={}", stderr(&out));
}
