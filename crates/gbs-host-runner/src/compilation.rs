use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use anyhow::Context;
use gbs_contracts::{
    AFTER_MAIN_FILE, BEFORE_MAIN_FILE, FINISHED_PLACEHOLDER, STUDENT_MAIN_SYMBOL,
};
use log::{debug, error, info};
use regex::Regex;
use serde::Deserialize;

use crate::process::run_child;
use crate::{red, CheckError, HostConfig, RunOptions, RunOutput};

/// Declaration of one source file, as written in a test's `sources` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourceFile {
    /// Marks the entry module whose `main` may be wrapped.
    #[serde(default)]
    pub main: bool,
    /// Inline content; when absent the file is read from disk.
    #[serde(default)]
    pub content: Option<String>,
}

/// Instructor code spliced around the subject's entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wrapper {
    pub before_main: Option<String>,
    pub after_main: Option<String>,
}

impl Wrapper {
    fn is_attached(&self) -> bool {
        self.before_main.is_some() || self.after_main.is_some()
    }
}

#[derive(Debug)]
struct SourceEntry {
    name: String,
    path: Option<PathBuf>,
    decl: SourceFile,
}

/// One build-and-run session with its own working directory and sentinel.
#[derive(Debug)]
pub struct Compilation {
    sources: Vec<SourceEntry>,
    wrapper: Wrapper,
    workdir: Option<tempfile::TempDir>,
    flag: String,
    executable: Option<PathBuf>,
    /// `#undef` lines emitted ahead of `after_main` by the last compile.
    after_main_offset: usize,
}

impl Compilation {
    /// Validates the source declarations and reserves a working directory.
    ///
    /// Relative paths are tried as given, then under `base_dir`.
    pub fn new(
        sources: BTreeMap<String, SourceFile>,
        wrapper: Wrapper,
        base_dir: Option<&Path>,
    ) -> Result<Self, CheckError> {
        let entries = sources.values().filter(|s| s.main).count();
        if entries != 1 {
            return Err(CheckError::defect(format!(
                "exactly one source file must be attributed with 'main: true' (found {entries})"
            )));
        }

        let mut resolved = Vec::with_capacity(sources.len());
        for (name, decl) in sources {
            let path = if decl.content.is_some() {
                None
            } else {
                Some(resolve_source(&name, base_dir).ok_or_else(|| {
                    CheckError::defect(format!("File {name} does not exist"))
                })?)
            };
            resolved.push(SourceEntry { name, path, decl });
        }

        let workdir = tempfile::Builder::new()
            .prefix("gbs_test_")
            .tempdir()
            .context("create compilation working directory")?;

        Ok(Compilation {
            sources: resolved,
            wrapper,
            workdir: Some(workdir),
            flag: random_flag()?,
            executable: None,
            after_main_offset: 0,
        })
    }

    /// The sentinel that replaces `{{{FINISHED}}}` for this compilation.
    pub fn flag(&self) -> &str {
        &self.flag
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(|d| d.path())
    }

    pub fn wrapper(&self) -> &Wrapper {
        &self.wrapper
    }

    pub fn is_cleaned(&self) -> bool {
        self.workdir.is_none()
    }

    pub fn compile(
        &mut self,
        flags: &[String],
        remap: &BTreeMap<String, String>,
        config: &HostConfig,
    ) -> Result<(), CheckError> {
        let mut flags = flags.to_vec();
        flags.extend(config.cc_args.iter().cloned());

        let mut remap = remap.clone();
        if self.wrapper.after_main.is_some() {
            remap.insert("main".to_string(), STUDENT_MAIN_SYMBOL.to_string());
        }

        let dir = self
            .workdir()
            .ok_or_else(|| CheckError::defect("compile() after cleanup()"))?
            .to_path_buf();

        for entry in &self.sources {
            let content = match (&entry.decl.content, &entry.path) {
                (Some(inline), _) => inline.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)
                    .with_context(|| format!("read source: {}", path.display()))?,
                (None, None) => {
                    return Err(CheckError::defect(format!("no content for {}", entry.name)))
                }
            };
            let content = if entry.decl.main && (self.wrapper.is_attached() || !remap.is_empty())
            {
                self.entry_source(&entry.name, &content, &remap)
            } else {
                content
            };
            let dst = dir.join(base_name(&entry.name));
            std::fs::write(&dst, content)
                .with_context(|| format!("write source: {}", dst.display()))?;
        }

        debug!("Compile sources: {:?}", self.sources);
        let mut objects: Vec<PathBuf> = Vec::new();
        for entry in &self.sources {
            let name = base_name(&entry.name);
            if !name.ends_with(".c") {
                continue;
            }
            let obj = dir.join(format!("{name}.o"));
            let mut cmd = Command::new(&config.cc);
            cmd.args(&flags).arg("-c").arg("-o").arg(&obj).arg(dir.join(&name));
            invoke_toolchain(&mut cmd)?;
            objects.push(obj);
        }

        let exe = dir.join("main");
        debug!("Link objects: {objects:?}");
        let mut cmd = Command::new(&config.cc);
        cmd.args(&flags).args(&objects).arg("-o").arg(&exe);
        invoke_toolchain(&mut cmd)?;

        self.executable = Some(exe);
        self.after_main_offset = remap.len();
        Ok(())
    }

    /// Rewrites the entry module so compiler diagnostics still point at the
    /// original file while instructor code runs before and after it.
    fn entry_source(&self, name: &str, content: &str, remap: &BTreeMap<String, String>) -> String {
        let mut before = self.wrapper.before_main.clone().unwrap_or_default();
        let mut after = String::new();
        for (old, new) in remap {
            before.push_str(&format!("#define {old} {new}\n"));
            after.push_str(&format!("#undef {old}\n"));
        }
        if let Some(after_main) = &self.wrapper.after_main {
            after.push_str(after_main);
        }

        let mut out = String::new();
        out.push_str(&format!("#line 1 \"{BEFORE_MAIN_FILE}\"\n"));
        out.push_str(&before);
        out.push_str(&format!("#line 1 \"{}\"\n", c_string_escape(name)));
        out.push_str(content);
        out.push_str(&format!("\n#line 1 \"{AFTER_MAIN_FILE}\"\n"));
        out.push_str(&after.replace(FINISHED_PLACEHOLDER, &self.flag));
        out
    }

    pub fn run(&self, opts: &RunOptions, config: &HostConfig) -> Result<RunOutput, CheckError> {
        let exe = self
            .executable
            .as_ref()
            .ok_or_else(|| CheckError::defect("Compilation failed: run() without a built executable"))?;
        let input = opts
            .input
            .as_ref()
            .map(|s| s.replace(FINISHED_PLACEHOLDER, &self.flag));

        let mut argv: Vec<OsString> = opts.cmd_prefix.clone();
        argv.push(exe.as_os_str().to_os_string());
        argv.extend(opts.args.iter().map(OsString::from));
        let command: Vec<String> = argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let timeout = opts.timeout.unwrap_or(config.default_timeout);
        let out = run_child(
            &argv,
            input.as_deref().map(str::as_bytes),
            &opts.env,
            timeout,
            config.max_output_bytes,
        )?;

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&out.stderr).into_owned();

        if out.timed_out {
            return Err(CheckError::Timeout {
                message: format!(
                    "Command '{}' timed out after {} seconds",
                    command.join(" "),
                    timeout.as_secs_f64()
                ),
                stdout,
                stderr,
            });
        }

        let retcode = out.retcode;
        if let Some(sig) = out.signal {
            stderr.push_str(&format!(
                "<<Killed by Signal '{}'>>",
                crate::signal_name(sig)
            ));
        }
        debug!("Run: {command:?}, [retcode={retcode}]");

        let result = RunOutput {
            command,
            retcode,
            stdout,
            stderr,
        };

        let failure = if retcode != 0 && !opts.must_fail {
            Some(format!(
                "Program Run failed (exitcode={retcode}) unexpected: {:?} ",
                result.command
            ))
        } else if opts.must_fail && !opts.retcode_expected.accepts(retcode) {
            Some(format!(
                "Program Run did not fail while it should: ({retcode}, {:?})",
                result.command
            ))
        } else {
            None
        };
        if let Some(msg) = failure {
            self.log_run_failure(&msg, &result, input.as_deref());
            return Err(CheckError::hard(msg));
        }

        // A clean exit without the sentinel means the program left before the
        // instrumented tail ran.
        let wants_flag = self
            .wrapper
            .after_main
            .as_ref()
            .is_some_and(|a| a.contains(FINISHED_PLACEHOLDER))
            || opts
                .input
                .as_ref()
                .is_some_and(|i| i.contains(FINISHED_PLACEHOLDER));
        if wants_flag && !result.stdout.contains(&self.flag) {
            error!(
                "{}\nSTDOUT:\n{}\nSTDERR:\n{}",
                red("Testcase was not run until the end. Flag was not found."),
                result.stdout,
                red(&result.stderr)
            );
            if let Some(input) = &input {
                error!("STDIN:\n{input}\n");
            }
            return Err(CheckError::hard("Testcase was not run until the end"));
        }

        Ok(result)
    }

    fn log_run_failure(&self, msg: &str, result: &RunOutput, input: Option<&str>) {
        error!(
            "{}\nSTDOUT:\n{}\nSTDERR:\n{}",
            red(msg),
            result.stdout,
            red(&result.stderr)
        );
        if let Some(input) = input {
            error!("STDIN:\n{input}\n");
        }
        if let Some(text) = self.annotated_after_main(&result.stderr) {
            info!("\n{text}");
        }
    }

    /// `after_main` with the line a `<<after_main>>:N` diagnostic points at marked.
    pub fn annotated_after_main(&self, stderr: &str) -> Option<String> {
        static AFTER_MAIN_LINE: OnceLock<Regex> = OnceLock::new();

        let after_main = self.wrapper.after_main.as_ref()?;
        let re = AFTER_MAIN_LINE.get_or_init(|| {
            Regex::new(&format!("{}:([0-9]+)", regex::escape(AFTER_MAIN_FILE)))
                .expect("static regex")
        });
        let line: Option<usize> = re
            .captures(stderr)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        let mut lines: Vec<String> = after_main.split('\n').map(str::to_string).collect();
        if let Some(idx) = line.and_then(|l| l.checked_sub(1 + self.after_main_offset)) {
            if let Some(l) = lines.get_mut(idx) {
                l.push_str(&format!("  // {}", red("<- ERROR")));
            }
        }
        Some(lines.join("\n"))
    }

    /// Logs `after_main` with the `Marker <marker>` line highlighted and
    /// returns the hard failure to raise.
    pub fn fail_marker(&self, marker: &str, message: &str) -> CheckError {
        let Some(after_main) = &self.wrapper.after_main else {
            return CheckError::hard(message);
        };
        let needle = format!("Marker {marker}");
        let lines: Vec<String> = after_main
            .split('\n')
            .filter_map(|line| {
                if line.contains(&needle) {
                    Some(format!("// --> {}", red("Error is around here")))
                } else if line.contains("Marker") {
                    None
                } else {
                    Some(line.to_string())
                }
            })
            .collect();
        error!("{}\n{}", red(message), lines.join("\n"));
        CheckError::hard(message)
    }

    /// Removes the working directory. Safe to call more than once.
    pub fn cleanup(&mut self) {
        let Some(dir) = self.workdir.take() else {
            return;
        };
        self.executable = None;
        let path = dir.path().to_path_buf();
        if let Err(err) = dir.close() {
            log::warn!("failed to remove {}: {err}", path.display());
        }
    }
}

fn invoke_toolchain(cmd: &mut Command) -> Result<(), CheckError> {
    debug!("{cmd:?}");
    let out = match cmd.output() {
        Ok(out) => out,
        Err(err) => {
            error!("Compilation failed: could not invoke {cmd:?}: {err}");
            return Err(CheckError::hard("Compilation Failed"));
        }
    };
    if !out.status.success() {
        error!(
            "Compilation failed: {cmd:?} (exit={})\n{}",
            out.status.code().unwrap_or(-1),
            red(&String::from_utf8_lossy(&out.stderr))
        );
        return Err(CheckError::hard("Compilation Failed"));
    }
    if !out.stderr.is_empty() {
        debug!("{}", String::from_utf8_lossy(&out.stderr));
    }
    Ok(())
}

fn resolve_source(name: &str, base_dir: Option<&Path>) -> Option<PathBuf> {
    let p = Path::new(name);
    if p.exists() {
        return Some(p.to_path_buf());
    }
    let cand = base_dir?.join(p);
    cand.exists().then_some(cand)
}

fn base_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn c_string_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn random_flag() -> anyhow::Result<String> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!("getrandom: {e}"))?;
    Ok((u32::from_le_bytes(buf) % 10_000_001).to_string())
}
