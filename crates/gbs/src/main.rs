use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gbs::logic::StepRunner;
use gbs::report::{GbsTestReport, InvocationInfo};
use gbs::session::Session;
use gbs_host_runner::HostConfig;

#[derive(Parser, Debug)]
#[command(name = "gbs")]
#[command(about = "Build, run and check native submissions against test scripts.", long_about = None)]
#[command(version)]
struct Cli {
    /// Testcase file, or a directory whose `*.test` files are run in order.
    #[arg(short = 't', long, value_name = "PATH", default_value = "tests")]
    testcases: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    /// C compiler used for compiling and linking (overrides `GBS_CC`).
    #[arg(long, value_name = "CC")]
    cc: Option<OsString>,

    /// Default wall-clock limit per program run (overrides `GBS_TIMEOUT_SECS`).
    #[arg(long, value_name = "N")]
    timeout_secs: Option<u64>,

    /// Debugger driver script used by `trace` (overrides `GBS_TRACE_DRIVER`).
    #[arg(long, value_name = "PATH")]
    trace_driver: Option<PathBuf>,

    /// Write a JSON report of the run to PATH.
    #[arg(long, value_name = "PATH")]
    report_out: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut config = HostConfig::from_env();
    if let Some(cc) = cli.cc {
        config.cc = cc;
    }
    if let Some(secs) = cli.timeout_secs {
        config.default_timeout = Duration::from_secs(secs);
    }
    if let Some(driver) = cli.trace_driver {
        config.trace_driver = driver;
    }

    let testcases = gbs::discover_testcases(&cli.testcases)?;
    let mut report = GbsTestReport::new(InvocationInfo {
        argv: std::env::args().collect(),
        cwd: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        started_at_unix_ms: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        testcases: cli.testcases.display().to_string(),
    });

    let mut session = Session::new(config);
    let mut runner = StepRunner::new();
    gbs::run_testcases(&testcases, &mut session, &mut runner, &mut report)?;

    let exit_code = report.exit_code();
    if let Some(out_path) = &cli.report_out {
        let json = serde_json::to_string(&report)? + "\n";
        if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create report dir: {}", parent.display()))?;
        }
        std::fs::write(out_path, json.as_bytes())
            .with_context(|| format!("write report: {}", out_path.display()))?;
        eprintln!(
            "gbs: passed={} failed={} skipped={} (exit={})",
            report.summary.passed, report.summary.failed, report.summary.skipped, exit_code
        );
    }

    if let Some(msg) = report.exit_message() {
        if report.summary.failed > 0 {
            eprintln!();
        }
        eprintln!("{msg}");
    }
    Ok(std::process::ExitCode::from(exit_code))
}
