//! Grading harness for native submissions.
//!
//! Test scripts (`*.test`) declare sources, instructor code and checks in
//! blocks; [`script::TestScript`] executes them against a shared
//! [`session::Session`] that owns every compilation made along the way.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;

pub mod env;
pub mod logic;
pub mod report;
pub mod script;
pub mod session;

use report::GbsTestReport;
use script::{LogicRunner, TestScript};
use session::Session;

/// A single file is taken as is; a directory contributes its `*.test` files
/// (not recursive), sorted by name.
pub fn discover_testcases(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut out = Vec::new();
    for entry in
        std::fs::read_dir(path).with_context(|| format!("read dir: {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("read dir: {}", path.display()))?;
        let p = entry.path();
        if p.is_file()
            && p.extension().and_then(|e| e.to_str()) == Some(gbs_contracts::TEST_FILE_EXTENSION)
        {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

/// Runs every script in order and records the outcomes into `report`.
///
/// A defect in any script aborts the run; compilations made so far are
/// released either way.
pub fn run_testcases(
    testcases: &[PathBuf],
    session: &mut Session,
    runner: &mut dyn LogicRunner,
    report: &mut GbsTestReport,
) -> Result<()> {
    let started = Instant::now();
    let result = run_each(testcases, session, runner, report);
    let released = session.cleanup_all();
    log::debug!("released {released} working directories");
    report.summary.duration_ms = started.elapsed().as_millis() as u64;
    result
}

fn run_each(
    testcases: &[PathBuf],
    session: &mut Session,
    runner: &mut dyn LogicRunner,
    report: &mut GbsTestReport,
) -> Result<()> {
    for path in testcases {
        info!("Testcase: {}", path.display());
        let t0 = Instant::now();
        let script = TestScript::run_file(path, session, runner)?;
        report.push(
            path,
            script.failed(),
            script.skipped(),
            t0.elapsed().as_millis() as u64,
        );
    }
    Ok(())
}
