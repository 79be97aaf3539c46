//! Build-and-run engine for graded native submissions.
//!
//! A [`Compilation`] materializes the declared sources into a private working
//! directory, splices instructor fragments around the subject's entry point,
//! builds with the host C toolchain and runs the result under a wall-clock
//! timeout. Every check reports through [`CheckError`], whose variants map onto
//! the outcomes a test script distinguishes: hard failure, soft skip, timeout
//! and harness defect.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

mod compilation;
mod process;
mod retcode;
mod tools;

pub use compilation::{Compilation, SourceFile, Wrapper};
pub use process::{signal_name, ToolNotFound};
pub use retcode::{CmpOp, RetcodeCheck};
pub use tools::StraceOutput;

pub use gbs_trace::{CallId, CallRecord, Trace};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// Assertion, compile or run mismatch; aborts the current script.
    #[error("{message}")]
    Hard { message: String },
    /// A missing optional capability; recorded as a skip.
    #[error("{message}")]
    Skip { message: String },
    /// The subject outlived its wall-clock allowance.
    #[error("{message}")]
    Timeout {
        message: String,
        stdout: String,
        stderr: String,
    },
    /// A defect in the harness or the test file itself; never recovered.
    #[error(transparent)]
    Defect(#[from] anyhow::Error),
}

impl CheckError {
    pub fn hard(message: impl Into<String>) -> Self {
        CheckError::Hard {
            message: message.into(),
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        CheckError::Skip {
            message: message.into(),
        }
    }

    pub fn defect(message: impl Into<String>) -> Self {
        CheckError::Defect(anyhow::anyhow!(message.into()))
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub cc: OsString,
    /// Appended to every compile and link command.
    pub cc_args: Vec<String>,
    pub gdb: OsString,
    pub strace: OsString,
    pub trace_driver: PathBuf,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            cc: OsString::from("gcc"),
            cc_args: Vec::new(),
            gdb: OsString::from("gdb"),
            strace: OsString::from("strace"),
            trace_driver: resolve_sibling_or_path(gbs_contracts::DEFAULT_TRACE_DRIVER),
            default_timeout: Duration::from_secs(10),
            max_output_bytes: 4 * 1024 * 1024,
        }
    }
}

impl HostConfig {
    /// Defaults overlaid with `GBS_CC`, `GBS_CC_ARGS`, `GBS_GDB`, `GBS_STRACE`,
    /// `GBS_TRACE_DRIVER` and `GBS_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut cfg = HostConfig::default();
        if let Some(cc) = std::env::var_os("GBS_CC").filter(|v| !v.is_empty()) {
            cfg.cc = cc;
        }
        if let Ok(args) = std::env::var("GBS_CC_ARGS") {
            cfg.cc_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(gdb) = std::env::var_os("GBS_GDB").filter(|v| !v.is_empty()) {
            cfg.gdb = gdb;
        }
        if let Some(strace) = std::env::var_os("GBS_STRACE").filter(|v| !v.is_empty()) {
            cfg.strace = strace;
        }
        if let Some(driver) = std::env::var_os("GBS_TRACE_DRIVER").filter(|v| !v.is_empty()) {
            cfg.trace_driver = PathBuf::from(driver);
        }
        if let Some(secs) = std::env::var("GBS_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            cfg.default_timeout = Duration::from_secs(secs);
        }
        cfg
    }
}

fn resolve_sibling_or_path(name: &str) -> PathBuf {
    let Ok(exe) = std::env::current_exe() else {
        return PathBuf::from(name);
    };
    let Some(dir) = exe.parent() else {
        return PathBuf::from(name);
    };

    let mut candidates = vec![dir.join(name)];
    if dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == "deps")
    {
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(name));
        }
    }

    candidates
        .into_iter()
        .find(|c| c.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Availability {
    #[default]
    Unknown,
    Available,
    Missing,
}

/// Optional external tools, probed lazily. Once a tool is found missing every
/// later request for it is skipped without another launch attempt.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub strace: Availability,
    pub debugger: Availability,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub args: Vec<String>,
    pub cmd_prefix: Vec<OsString>,
    pub must_fail: bool,
    pub retcode_expected: RetcodeCheck,
    pub input: Option<String>,
    /// Falls back to [`HostConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// Extra variables for the child's environment.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub command: Vec<String>,
    pub retcode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Highlights unexpected-failure text on a terminal.
pub fn red(msg: &str) -> String {
    format!("\x1b[31;4m{msg}\x1b[0m")
}
