use std::fmt;
use std::str::FromStr;

/// Predicate over the observed exit code of a `must_fail` run.
///
/// Negative codes mean the process was killed by that signal.
#[derive(Clone, Copy, Default)]
pub enum RetcodeCheck {
    #[default]
    NonZero,
    Signaled,
    Any,
    Cmp(CmpOp, i32),
    Custom(fn(i32) -> bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

impl RetcodeCheck {
    pub fn accepts(&self, retcode: i32) -> bool {
        match *self {
            RetcodeCheck::NonZero => retcode != 0,
            RetcodeCheck::Signaled => retcode < 0,
            RetcodeCheck::Any => true,
            RetcodeCheck::Cmp(op, n) => match op {
                CmpOp::Eq => retcode == n,
                CmpOp::Ne => retcode != n,
                CmpOp::Lt => retcode < n,
                CmpOp::Le => retcode <= n,
                CmpOp::Gt => retcode > n,
                CmpOp::Ge => retcode >= n,
            },
            RetcodeCheck::Custom(f) => f(retcode),
        }
    }
}

impl fmt::Debug for RetcodeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetcodeCheck::NonZero => f.write_str("retcode != 0"),
            RetcodeCheck::Signaled => f.write_str("retcode < 0 (signal)"),
            RetcodeCheck::Any => f.write_str("any retcode"),
            RetcodeCheck::Cmp(op, n) => write!(f, "retcode {} {n}", op.as_str()),
            RetcodeCheck::Custom(_) => f.write_str("custom retcode predicate"),
        }
    }
}

impl From<i32> for RetcodeCheck {
    fn from(n: i32) -> Self {
        RetcodeCheck::Cmp(CmpOp::Eq, n)
    }
}

impl FromStr for RetcodeCheck {
    type Err = String;

    /// Accepts `nonzero`, `signal`, `any`, a bare integer, or `<op> <int>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "nonzero" => return Ok(RetcodeCheck::NonZero),
            "signal" | "signaled" => return Ok(RetcodeCheck::Signaled),
            "any" => return Ok(RetcodeCheck::Any),
            _ => {}
        }
        let ops = [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ];
        let (op, rest) = ops
            .iter()
            .find_map(|(tok, op)| s.strip_prefix(tok).map(|rest| (*op, rest)))
            .unwrap_or((CmpOp::Eq, s));
        let n: i32 = rest
            .trim()
            .parse()
            .map_err(|_| format!("invalid retcode predicate: {s:?}"))?;
        Ok(RetcodeCheck::Cmp(op, n))
    }
}
