//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for strings that cross a
//! process or file boundary: the report schema, the completion-sentinel
//! placeholder, the debugger-driver handoff variables, and the pseudo file
//! names spliced into `#line` directives.

pub const GBS_TEST_REPORT_SCHEMA_VERSION: &str = "gbs.test.report@0.1.0";

/// Placeholder in `after_main` fragments and stdin that is replaced by the
/// per-compilation sentinel token.
pub const FINISHED_PLACEHOLDER: &str = "{{{FINISHED}}}";

/// Name the subject's `main` is renamed to when an `after_main` fragment is attached.
pub const STUDENT_MAIN_SYMBOL: &str = "studentMain";

pub const BEFORE_MAIN_FILE: &str = "<<before_main>>";
pub const AFTER_MAIN_FILE: &str = "<<after_main>>";

pub const TRACE_FILE_ENV: &str = "TRACE_FILE";
pub const TRACE_FUNCTIONS_ENV: &str = "TRACE_FUNCTIONS";

pub const DEFAULT_TRACE_DRIVER: &str = "gdb_trace.py";
pub const TEST_FILE_EXTENSION: &str = "test";
