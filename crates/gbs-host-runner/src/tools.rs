use std::ffi::OsString;
use std::io::{BufRead, BufReader};

use anyhow::Context;
use gbs_contracts::{TRACE_FILE_ENV, TRACE_FUNCTIONS_ENV};
use gbs_trace::{parse_event_line, Trace};
use log::debug;

use crate::{
    Availability, Capabilities, CheckError, Compilation, HostConfig, RunOptions, RunOutput,
    ToolNotFound,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StraceOutput {
    pub run: RunOutput,
    /// Raw lines of the tracer's log.
    pub lines: Vec<String>,
}

/// Maps a launch failure of `tool` to a sticky skip; anything else passes through.
fn tool_missing(err: CheckError, tool: &OsString, state: &mut Availability) -> CheckError {
    match err {
        CheckError::Defect(e)
            if e
                .downcast_ref::<ToolNotFound>()
                .is_some_and(|t| OsString::from(&t.program) == *tool) =>
        {
            *state = Availability::Missing;
            CheckError::skip(format!(
                "{} is not installed. To run this test install it.",
                tool.to_string_lossy()
            ))
        }
        other => other,
    }
}

impl Compilation {
    /// Runs the program under the debugger driver and rebuilds the call tree
    /// of the requested functions.
    pub fn trace(
        &self,
        functions: &[String],
        opts: RunOptions,
        config: &HostConfig,
        caps: &mut Capabilities,
    ) -> Result<Trace, CheckError> {
        if caps.debugger == Availability::Missing {
            return Err(CheckError::skip(format!(
                "{} is not installed. Test skipped.",
                config.gdb.to_string_lossy()
            )));
        }
        if !config.trace_driver.is_file() {
            return Err(CheckError::hard(format!(
                "debugger trace driver not found: {}",
                config.trace_driver.display()
            )));
        }

        let log_file = tempfile::NamedTempFile::new().context("create trace log")?;
        debug!("trace log: {}", log_file.path().display());

        let mut opts = opts;
        opts.env.push((
            TRACE_FILE_ENV.to_string(),
            log_file.path().to_string_lossy().into_owned(),
        ));
        opts.env
            .push((TRACE_FUNCTIONS_ENV.to_string(), functions.join(",")));
        opts.cmd_prefix = vec![
            config.gdb.clone(),
            OsString::from("-nx"),
            OsString::from("-x"),
            config.trace_driver.clone().into_os_string(),
        ];

        self.run(&opts, config)
            .map_err(|e| tool_missing(e, &config.gdb, &mut caps.debugger))?;
        caps.debugger = Availability::Available;

        let reader = BufReader::new(log_file.reopen().context("reopen trace log")?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.context("read trace log")?;
            if line.trim().is_empty() {
                continue;
            }
            debug!("{line}");
            let ev = parse_event_line(&line)
                .map_err(|e| CheckError::hard(format!("bad trace record {line:?}: {e}")))?;
            events.push(ev);
        }
        Trace::from_events(events).map_err(|e| CheckError::hard(format!("inconsistent trace: {e}")))
    }

    /// Runs the program under the syscall tracer, optionally filtered to
    /// `syscalls` (a tracer filter expression such as `write,read`).
    pub fn strace(
        &self,
        syscalls: Option<&str>,
        opts: RunOptions,
        config: &HostConfig,
        caps: &mut Capabilities,
    ) -> Result<StraceOutput, CheckError> {
        if caps.strace == Availability::Missing {
            return Err(CheckError::skip(format!(
                "{} is not installed. Test skipped.",
                config.strace.to_string_lossy()
            )));
        }

        let log_file = tempfile::NamedTempFile::new().context("create strace log")?;
        let mut opts = opts;
        opts.cmd_prefix = vec![
            config.strace.clone(),
            OsString::from("-qqf"),
            OsString::from("-o"),
            log_file.path().as_os_str().to_os_string(),
        ];
        if let Some(filter) = syscalls.filter(|s| !s.is_empty()) {
            opts.cmd_prefix.push(OsString::from("-e"));
            opts.cmd_prefix.push(OsString::from(format!("trace={filter}")));
        }

        let run = self
            .run(&opts, config)
            .map_err(|e| tool_missing(e, &config.strace, &mut caps.strace))?;
        caps.strace = Availability::Available;

        let raw = std::fs::read(log_file.path()).context("read strace log")?;
        let lines = String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_string)
            .collect();
        Ok(StraceOutput { run, lines })
    }
}
