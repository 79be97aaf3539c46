//! The step language used in `logic` blocks.
//!
//! A logic body is a sequence of statements, one per line:
//!
//! ```text
//! c = Compilation(after_main=after)
//! c.compile(flags=["-O0"])
//! out = c.run(must_fail=true, retcode="< 0")
//! assert "Killed by Signal" in out.stderr, "expected a crash"
//! ```
//!
//! Names resolve against the script's shared environment, so every binding
//! made here is visible to later blocks.

mod eval;
mod lexer;
mod parser;

use anyhow::anyhow;
use gbs_host_runner::CheckError;

use crate::script::{Block, LogicContext, LogicRunner};

pub use parser::{parse_program, Arg, BinOp, Expr, ParseError, Stmt, StmtKind};

/// Runs logic blocks as step-language programs.
#[derive(Debug, Default)]
pub struct StepRunner;

impl StepRunner {
    pub fn new() -> Self {
        StepRunner
    }
}

impl LogicRunner for StepRunner {
    fn run_logic(&mut self, cx: &mut LogicContext<'_>, block: &Block) -> Result<(), CheckError> {
        let stmts = parse_program(&block.body)
            .map_err(|e| CheckError::Defect(anyhow!("invalid logic block: {e}")))?;
        eval::exec(cx, &stmts)
    }
}
