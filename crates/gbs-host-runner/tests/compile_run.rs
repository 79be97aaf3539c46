use std::collections::BTreeMap;
use std::time::Duration;

use gbs_host_runner::{
    CheckError, CmpOp, Compilation, HostConfig, RetcodeCheck, RunOptions, SourceFile, Wrapper,
};

fn config() -> HostConfig {
    HostConfig::from_env()
}

fn main_source(content: &str) -> BTreeMap<String, SourceFile> {
    BTreeMap::from([(
        "a.c".to_string(),
        SourceFile {
            main: true,
            content: Some(content.to_string()),
        },
    )])
}

fn build(content: &str, wrapper: Wrapper) -> Compilation {
    let mut c = Compilation::new(main_source(content), wrapper, None).expect("new compilation");
    c.compile(&[], &BTreeMap::new(), &config())
        .expect("compile ok");
    c
}

fn after_main(text: &str) -> Wrapper {
    Wrapper {
        before_main: None,
        after_main: Some(text.to_string()),
    }
}

const STUDENT: &str = "#include <stdio.h>\nint main(void) { puts(\"student\"); return 0; }\n";

const AFTER_WITH_FLAG: &str = r#"
int main(void) {
    studentMain();
    printf("{{{FINISHED}}}\n");
    return 0;
}
"#;

const AFTER_WITHOUT_PRINT: &str = r#"
int main(void) {
    studentMain();
    return 0;
}
"#;

#[test]
fn no_entry_module_fails_fast() {
    let sources = BTreeMap::from([(
        "a.c".to_string(),
        SourceFile {
            main: false,
            content: Some("int main(void){return 0;}".to_string()),
        },
    )]);
    let err = Compilation::new(sources, Wrapper::default(), None).unwrap_err();
    match err {
        CheckError::Defect(e) => assert!(e.to_string().contains("main: true"), "{e}"),
        other => panic!("expected defect, got {other:?}"),
    }
}

#[test]
fn two_entry_modules_are_rejected() {
    let mut sources = main_source("int main(void){return 0;}");
    sources.insert(
        "b.c".to_string(),
        SourceFile {
            main: true,
            content: Some(String::new()),
        },
    );
    let err = Compilation::new(sources, Wrapper::default(), None).unwrap_err();
    assert!(matches!(err, CheckError::Defect(_)), "{err:?}");
}

#[test]
fn missing_source_file_is_a_defect() {
    let sources = BTreeMap::from([(
        "definitely/not/here.c".to_string(),
        SourceFile {
            main: true,
            content: None,
        },
    )]);
    let err = Compilation::new(sources, Wrapper::default(), None).unwrap_err();
    assert!(err.to_string().contains("does not exist"), "{err}");
}

#[test]
fn sentinel_printed_by_after_main_passes() {
    let c = build(STUDENT, after_main(AFTER_WITH_FLAG));
    let out = c.run(&RunOptions::default(), &config()).expect("run ok");
    assert_eq!(out.retcode, 0);
    assert!(out.stdout.contains("student"), "stdout={}", out.stdout);
    assert!(out.stdout.contains(c.flag()), "stdout={}", out.stdout);
}

#[test]
fn missing_sentinel_means_not_run_until_the_end() {
    let after = "#include <stdlib.h>\n\
                 int main(void) { studentMain(); exit(0); printf(\"{{{FINISHED}}}\\n\"); }\n";
    let c = build(STUDENT, after_main(&format!("#include <stdio.h>\n{after}")));
    let err = c.run(&RunOptions::default(), &config()).unwrap_err();
    match err {
        CheckError::Hard { message } => {
            assert!(message.contains("not run until the end"), "{message}")
        }
        other => panic!("expected hard failure, got {other:?}"),
    }
}

#[test]
fn after_main_without_placeholder_needs_no_sentinel() {
    let c = build(STUDENT, after_main(AFTER_WITHOUT_PRINT));
    let out = c.run(&RunOptions::default(), &config()).expect("run ok");
    assert!(!out.stdout.contains(c.flag()));
}

#[test]
fn sentinel_in_input_must_be_echoed() {
    let echo = "#include <stdio.h>\n\
                int main(void) { char b[64]; if (fgets(b, sizeof b, stdin)) fputs(b, stdout); return 0; }\n";
    let c = build(echo, Wrapper::default());
    let opts = RunOptions {
        input: Some("{{{FINISHED}}}\n".to_string()),
        ..RunOptions::default()
    };
    let out = c.run(&opts, &config()).expect("run ok");
    assert_eq!(out.stdout.trim(), c.flag());

    let silent = build("int main(void) { return 0; }\n", Wrapper::default());
    let err = silent.run(&opts, &config()).unwrap_err();
    assert!(err.to_string().contains("not run until the end"), "{err}");
}

#[test]
fn unexpected_nonzero_exit_fails() {
    let c = build("int main(void) { return 3; }\n", Wrapper::default());
    let err = c.run(&RunOptions::default(), &config()).unwrap_err();
    assert!(err.to_string().contains("exitcode=3"), "{err}");
}

#[test]
fn must_fail_follows_retcode_predicate() {
    let c = build("int main(void) { return 3; }\n", Wrapper::default());
    let pass = RunOptions {
        must_fail: true,
        retcode_expected: RetcodeCheck::Cmp(CmpOp::Eq, 3),
        ..RunOptions::default()
    };
    assert_eq!(c.run(&pass, &config()).expect("run ok").retcode, 3);

    let wrong = RunOptions {
        must_fail: true,
        retcode_expected: RetcodeCheck::Cmp(CmpOp::Eq, 4),
        ..RunOptions::default()
    };
    let err = c.run(&wrong, &config()).unwrap_err();
    assert!(err.to_string().contains("did not fail while it should"), "{err}");
}

#[test]
fn must_fail_rejects_clean_exit_unless_predicate_accepts_zero() {
    let c = build("int main(void) { return 0; }\n", Wrapper::default());
    let opts = RunOptions {
        must_fail: true,
        ..RunOptions::default()
    };
    let err = c.run(&opts, &config()).unwrap_err();
    assert!(err.to_string().contains("did not fail while it should"), "{err}");

    let any = RunOptions {
        must_fail: true,
        retcode_expected: RetcodeCheck::Any,
        ..RunOptions::default()
    };
    c.run(&any, &config()).expect("zero accepted by predicate");
}

#[test]
fn fault_signal_is_negative_retcode() {
    let src = "#include <signal.h>\nint main(void) { raise(SIGSEGV); return 0; }\n";
    let c = build(src, Wrapper::default());
    let opts = RunOptions {
        must_fail: true,
        retcode_expected: RetcodeCheck::Signaled,
        ..RunOptions::default()
    };
    let out = c.run(&opts, &config()).expect("signal accepted");
    assert!(out.retcode < 0, "retcode={}", out.retcode);
    assert!(out.stderr.contains("<<Killed by Signal 'SIGSEGV'>>"), "{}", out.stderr);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn divide_by_zero_passes_only_when_killed_by_signal() {
    let crash = "int main(void) { volatile int zero = 0; volatile int x = 1 / zero; return x; }\n";
    let opts = RunOptions {
        must_fail: true,
        retcode_expected: "< 0".parse().expect("predicate"),
        ..RunOptions::default()
    };
    build(crash, Wrapper::default())
        .run(&opts, &config())
        .expect("SIGFPE accepted");

    let normal = build("int main(void) { return 1; }\n", Wrapper::default());
    let err = normal.run(&opts, &config()).unwrap_err();
    assert!(matches!(err, CheckError::Hard { .. }), "{err:?}");
}

#[test]
fn timeout_reports_partial_output() {
    let src = "#include <stdio.h>\n\
               int main(void) { puts(\"started\"); fflush(stdout); for (;;) {} }\n";
    let c = build(src, Wrapper::default());
    let opts = RunOptions {
        timeout: Some(Duration::from_millis(500)),
        ..RunOptions::default()
    };
    match c.run(&opts, &config()).unwrap_err() {
        CheckError::Timeout { stdout, .. } => assert!(stdout.contains("started"), "{stdout}"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn timeout_also_stops_forked_descendants() {
    let src = "#include <stdio.h>\n#include <unistd.h>\n\
               int main(void) {\n\
                   puts(\"started\"); fflush(stdout);\n\
                   if (fork() == 0) { sleep(20); return 0; }\n\
                   for (;;) {}\n\
               }\n";
    let c = build(src, Wrapper::default());
    let opts = RunOptions {
        timeout: Some(Duration::from_secs(1)),
        ..RunOptions::default()
    };
    let started = std::time::Instant::now();
    let err = c.run(&opts, &config()).unwrap_err();
    let took = started.elapsed();
    assert!(took < Duration::from_secs(10), "run blocked {took:?} past a 1s timeout");
    match err {
        CheckError::Timeout { stdout, .. } => assert!(stdout.contains("started"), "{stdout}"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn background_child_does_not_outlive_a_clean_exit() {
    let src = "#include <stdio.h>\n#include <unistd.h>\n\
               int main(void) {\n\
                   puts(\"parent done\"); fflush(stdout);\n\
                   if (fork() == 0) { sleep(20); return 0; }\n\
                   return 0;\n\
               }\n";
    let c = build(src, Wrapper::default());
    let opts = RunOptions {
        timeout: Some(Duration::from_secs(5)),
        ..RunOptions::default()
    };
    let started = std::time::Instant::now();
    let out = c.run(&opts, &config()).expect("run ok");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(out.stdout.trim(), "parent done");
}

#[test]
fn compile_errors_are_hard_failures() {
    let mut c = Compilation::new(
        main_source("int main(void) { return undeclared; }\n"),
        Wrapper::default(),
        None,
    )
    .expect("new");
    let err = c.compile(&[], &BTreeMap::new(), &config()).unwrap_err();
    assert!(matches!(err, CheckError::Hard { ref message } if message == "Compilation Failed"));

    let err = c.run(&RunOptions::default(), &config()).unwrap_err();
    assert!(matches!(err, CheckError::Defect(_)), "{err:?}");
}

#[test]
fn remap_and_before_main_wrap_entry_module() {
    let student = "int helper(void) { return 7; }\nint main(void) { return helper(); }\n";
    let wrapper = Wrapper {
        before_main: Some("#include <stdio.h>\n".to_string()),
        after_main: Some(
            "int helper(void) { return 1; }\n\
             int main(void) { printf(\"%d %d\\n\", studentMain(), student_helper()); return 0; }\n"
                .to_string(),
        ),
    };
    let mut c = Compilation::new(main_source(student), wrapper, None).expect("new");
    let remap = BTreeMap::from([("helper".to_string(), "student_helper".to_string())]);
    c.compile(&["-Wall".to_string()], &remap, &config())
        .expect("compile ok");
    let out = c.run(&RunOptions::default(), &config()).expect("run ok");
    assert_eq!(out.stdout.trim(), "7 7");
}

#[test]
fn multiple_translation_units_and_headers() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("util.h"), "int twice(int);\n").expect("write header");
    std::fs::write(
        dir.path().join("util.c"),
        "#include \"util.h\"\nint twice(int x) { return 2 * x; }\n",
    )
    .expect("write util.c");

    let mut sources = main_source(
        "#include <stdio.h>\n#include \"util.h\"\nint main(void) { printf(\"%d\\n\", twice(21)); return 0; }\n",
    );
    sources.insert("util.c".to_string(), SourceFile::default());
    sources.insert("util.h".to_string(), SourceFile::default());

    let mut c = Compilation::new(sources, Wrapper::default(), Some(dir.path())).expect("new");
    c.compile(&[], &BTreeMap::new(), &config())
        .expect("compile ok");
    let out = c.run(&RunOptions::default(), &config()).expect("run ok");
    assert_eq!(out.stdout.trim(), "42");
}

#[test]
fn arguments_and_stdin_reach_the_program() {
    let src = "#include <stdio.h>\n\
               int main(int argc, char **argv) { int n = 0; scanf(\"%d\", &n); printf(\"%s %d\\n\", argv[argc - 1], n + 1); return 0; }\n";
    let c = build(src, Wrapper::default());
    let opts = RunOptions {
        args: vec!["first".to_string(), "last".to_string()],
        input: Some("41\n".to_string()),
        ..RunOptions::default()
    };
    let out = c.run(&opts, &config()).expect("run ok");
    assert_eq!(out.stdout.trim(), "last 42");
    assert_eq!(out.command.len(), 3);
}

#[test]
fn cleanup_is_idempotent() {
    let mut c = build("int main(void) { return 0; }\n", Wrapper::default());
    let dir = c.workdir().expect("workdir").to_path_buf();
    assert!(dir.is_dir());

    c.cleanup();
    assert!(c.is_cleaned());
    assert!(!dir.exists());
    assert!(c.executable().is_none());

    c.cleanup();
    assert!(c.is_cleaned());
}
