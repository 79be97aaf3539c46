use std::path::Path;

use gbs_contracts::GBS_TEST_REPORT_SCHEMA_VERSION;

#[derive(Debug, Clone, serde::Serialize)]
pub struct GbsTestReport {
    pub schema_version: &'static str,
    pub tool: ToolInfo,
    pub invocation: InvocationInfo,
    pub summary: Summary,
    pub tests: Vec<TestCaseResult>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolInfo {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InvocationInfo {
    pub argv: Vec<String>,
    pub cwd: String,
    pub started_at_unix_ms: u64,
    pub testcases: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Summary {
    pub passed: u64,
    pub failed: u64,
    /// Scripts that finished with at least one skipped block.
    pub skipped: u64,
    /// Skipped logic blocks across all scripts.
    pub skipped_blocks: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TestCaseResult {
    pub id: String,
    pub status: Status,
    pub skipped_blocks: u32,
    pub duration_ms: u64,
}

impl GbsTestReport {
    pub fn new(invocation: InvocationInfo) -> Self {
        GbsTestReport {
            schema_version: GBS_TEST_REPORT_SCHEMA_VERSION,
            tool: ToolInfo {
                name: "gbs",
                version: env!("CARGO_PKG_VERSION"),
            },
            invocation,
            summary: Summary::default(),
            tests: Vec::new(),
        }
    }

    pub fn push(&mut self, path: &Path, failed: bool, skipped_blocks: u32, duration_ms: u64) {
        let status = if failed {
            self.summary.failed += 1;
            Status::Fail
        } else if skipped_blocks > 0 {
            self.summary.skipped += 1;
            Status::Skip
        } else {
            self.summary.passed += 1;
            Status::Pass
        };
        self.summary.skipped_blocks += u64::from(skipped_blocks);
        self.tests.push(TestCaseResult {
            id: path.display().to_string(),
            status,
            skipped_blocks,
            duration_ms,
        });
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.tests
            .iter()
            .filter(|t| t.status == Status::Fail)
            .map(|t| t.id.as_str())
    }

    /// 0 when every script passed cleanly, 1 on any failure or skip.
    pub fn exit_code(&self) -> u8 {
        if self.summary.failed > 0 || self.summary.skipped_blocks > 0 {
            1
        } else {
            0
        }
    }

    /// Text printed when the run does not exit cleanly, `None` otherwise.
    pub fn exit_message(&self) -> Option<String> {
        if self.summary.failed > 0 {
            let mut msg = String::from("Failed Testcases: ");
            for id in self.failed_ids() {
                msg.push_str("\n - ");
                msg.push_str(id);
            }
            return Some(msg);
        }
        if self.summary.skipped_blocks > 0 {
            return Some(format!(
                "{} test(s) were skipped.",
                self.summary.skipped_blocks
            ));
        }
        None
    }
}
