use std::collections::BTreeMap;
use std::ffi::OsString;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context as _;
use gbs_host_runner::{CheckError, Compilation, RetcodeCheck, RunOptions, SourceFile, Trace, Wrapper};
use log::info;
use serde_json::{json, Map, Value as Json};

use super::parser::{Arg, BinOp, Expr, Stmt, StmtKind};
use crate::env::Value;
use crate::script::LogicContext;
use crate::session::CompilationId;

const BUILTINS: &[&str] = &["len", "str", "print", "fail", "skip"];

pub(super) fn exec(cx: &mut LogicContext<'_>, stmts: &[Stmt]) -> Result<(), CheckError> {
    let mut ev = Evaluator { cx };
    for stmt in stmts {
        ev.stmt(stmt)?;
    }
    Ok(())
}

fn defect(msg: impl Into<String>) -> CheckError {
    CheckError::defect(msg)
}

struct Evaluator<'c, 'a> {
    cx: &'c mut LogicContext<'a>,
}

impl Evaluator<'_, '_> {
    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CheckError> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Assign(name, expr) => {
                let v = self.eval(expr).map_err(|e| at_line(e, line))?;
                self.cx.env.set(name.clone(), v);
            }
            StmtKind::Assert(cond, msg) => {
                let ok = truthy(&self.eval(cond).map_err(|e| at_line(e, line))?);
                if !ok {
                    let message = match msg {
                        Some(m) => display(&self.eval(m).map_err(|e| at_line(e, line))?),
                        None => format!("Assertion failed (line {line})"),
                    };
                    return Err(CheckError::hard(message));
                }
            }
            StmtKind::Expr(expr) => {
                self.eval(expr).map_err(|e| at_line(e, line))?;
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, CheckError> {
        Ok(match expr {
            Expr::Int(n) => json!(n).into(),
            Expr::Str(s) => json!(s).into(),
            Expr::Bool(b) => json!(b).into(),
            Expr::None => Json::Null.into(),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(into_data(self.eval(item)?, "list element")?);
                }
                Json::Array(out).into()
            }
            Expr::Map(entries) => {
                let mut out = Map::new();
                for (k, v) in entries {
                    let key = match into_data(self.eval(k)?, "map key")? {
                        Json::String(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(key, into_data(self.eval(v)?, "map value")?);
                }
                Json::Object(out).into()
            }
            Expr::Name(name) => self
                .cx
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| defect(format!("name {name:?} is not defined")))?,
            Expr::Attr(obj, attr) => {
                let obj = self.eval(obj)?;
                self.attribute(&obj, attr)?
            }
            Expr::Index(obj, idx) => {
                let obj = self.eval(obj)?;
                let idx = self.eval(idx)?;
                index(&obj, &idx)?
            }
            Expr::Call(func, args) => self.call(func, args)?,
            Expr::Not(e) => json!(!truthy(&self.eval(e)?)).into(),
            Expr::Neg(e) => match self.eval(e)? {
                Value::Data(Json::Number(n)) => match n.as_i64().and_then(i64::checked_neg) {
                    Some(i) => json!(i).into(),
                    None => json!(-n.as_f64().unwrap_or_default()).into(),
                },
                other => return Err(defect(format!("cannot negate {}", other.kind()))),
            },
            Expr::Cmp(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                json!(compare(*op, &lhs, &rhs)?).into()
            }
            Expr::And(lhs, rhs) => {
                let l = self.eval(lhs)?;
                if truthy(&l) {
                    self.eval(rhs)?
                } else {
                    l
                }
            }
            Expr::Or(lhs, rhs) => {
                let l = self.eval(lhs)?;
                if truthy(&l) {
                    l
                } else {
                    self.eval(rhs)?
                }
            }
        })
    }

    fn attribute(&self, obj: &Value, attr: &str) -> Result<Value, CheckError> {
        match obj {
            Value::Data(Json::Object(map)) => map
                .get(attr)
                .cloned()
                .map(Value::Data)
                .ok_or_else(|| defect(format!("map has no key {attr:?}"))),
            Value::Compilation(id) => {
                let c = self.cx.session.get(*id)?;
                Ok(match attr {
                    "flag" => json!(c.flag()),
                    "executable" => path_value(c.executable()),
                    "workdir" => path_value(c.workdir()),
                    _ => return Err(defect(format!("compilation has no attribute {attr:?}"))),
                }
                .into())
            }
            Value::Trace(trace) => match attr {
                "roots" => records(trace.roots()),
                _ => Err(defect(format!("trace has no attribute {attr:?}"))),
            },
            other => Err(defect(format!("{} has no attribute {attr:?}", other.kind()))),
        }
    }

    fn call(&mut self, func: &Expr, args: &[Arg]) -> Result<Value, CheckError> {
        if let Expr::Attr(recv, method) = func {
            let recv = self.eval(recv)?;
            let args = self.args(method, args)?;
            return match recv {
                Value::Compilation(id) => self.compilation_method(id, method, args),
                Value::Trace(trace) => trace_method(&trace, method, args),
                other => Err(defect(format!("{} has no method {method:?}", other.kind()))),
            };
        }

        if let Expr::Name(name) = func {
            if BUILTINS.contains(&name.as_str()) && self.cx.env.get(name).is_none() {
                let args = self.args(name, args)?;
                return builtin(name, args);
            }
        }

        match self.eval(func)? {
            Value::CompilationFactory => {
                let args = self.args("Compilation", args)?;
                self.new_compilation(args)
            }
            other => Err(defect(format!("{} is not callable", other.kind()))),
        }
    }

    fn args(&mut self, func: &str, args: &[Arg]) -> Result<CallArgs, CheckError> {
        let mut out = CallArgs {
            func: func.to_string(),
            positional: Vec::new(),
            named: BTreeMap::new(),
        };
        for arg in args {
            let v = self.eval(&arg.value)?;
            match &arg.name {
                Some(name) => {
                    if out.named.insert(name.clone(), v).is_some() {
                        return Err(defect(format!("{func}(): repeated argument {name:?}")));
                    }
                }
                None => out.positional.push(Some(v)),
            }
        }
        Ok(out)
    }

    fn new_compilation(&mut self, mut args: CallArgs) -> Result<Value, CheckError> {
        let after_main = opt_string(args.take(Some(0), &["after_main"])?, "after_main")?;
        let before_main = opt_string(args.take(Some(1), &["before_main"])?, "before_main")?;
        let sources = match args.take(Some(2), &["sources", "source_files"])? {
            Some(v) => into_data(v, "sources")?,
            None => self
                .cx
                .env
                .data("sources")
                .cloned()
                .ok_or_else(|| defect("Invalid Testcase: No sources given"))?,
        };
        args.finish()?;

        let sources: BTreeMap<String, SourceFile> = serde_json::from_value(sources)
            .context("sources must map file names to {main, content}")?;
        let compilation = Compilation::new(
            sources,
            Wrapper {
                before_main,
                after_main,
            },
            Some(self.cx.script_dir),
        )?;
        Ok(Value::Compilation(self.cx.session.register(compilation)))
    }

    fn compilation_method(
        &mut self,
        id: CompilationId,
        method: &str,
        mut args: CallArgs,
    ) -> Result<Value, CheckError> {
        match method {
            "compile" => {
                let mut flags = string_list(args.take(Some(0), &["flags"])?, "flags")?;
                let remap = string_map(args.take(Some(1), &["remap"])?, "remap")?;
                args.finish()?;
                if let Some(cflags) = self.cx.env.data("cflags") {
                    flags.extend(string_list(Some(Value::Data(cflags.clone())), "cflags")?);
                }
                self.cx.session.compile(id, &flags, &remap)?;
                Ok(Json::Null.into())
            }
            "run" => {
                let opts = run_options(&mut args, 0)?;
                args.finish()?;
                let out = self.cx.session.run(id, &opts)?;
                Ok(json!({
                    "stdout": out.stdout,
                    "stderr": out.stderr,
                    "retcode": out.retcode,
                    "command": out.command,
                })
                .into())
            }
            "trace" => {
                let functions = names(args.take(Some(0), &["functions"])?, "functions")?;
                let opts = run_options(&mut args, 1)?;
                args.finish()?;
                let trace = self.cx.session.trace(id, &functions, opts)?;
                Ok(Value::Trace(Rc::new(trace)))
            }
            "strace" => {
                let syscalls = opt_string(args.take(Some(0), &["syscalls"])?, "syscalls")?;
                let opts = run_options(&mut args, 1)?;
                args.finish()?;
                let out = self.cx.session.strace(id, syscalls.as_deref(), opts)?;
                Ok(json!({
                    "stdout": out.run.stdout,
                    "stderr": out.run.stderr,
                    "retcode": out.run.retcode,
                    "lines": out.lines,
                })
                .into())
            }
            "fail_marker" => {
                let marker = display(&args.required(0, "marker")?);
                let msg = display(&args.required(1, "msg")?);
                args.finish()?;
                Err(self.cx.session.get(id)?.fail_marker(&marker, &msg))
            }
            "cleanup" => {
                args.finish()?;
                self.cx.session.cleanup(id)?;
                Ok(Json::Null.into())
            }
            _ => Err(defect(format!("compilation has no method {method:?}"))),
        }
    }
}

fn at_line(err: CheckError, line: usize) -> CheckError {
    match err {
        CheckError::Defect(e) => CheckError::Defect(e.context(format!("line {line}"))),
        other => other,
    }
}

struct CallArgs {
    func: String,
    positional: Vec<Option<Value>>,
    named: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Takes the argument at `pos` or under any of `names`; `pos: None` makes
    /// it keyword-only.
    fn take(&mut self, pos: Option<usize>, names: &[&str]) -> Result<Option<Value>, CheckError> {
        let by_name = names.iter().find_map(|n| self.named.remove(*n));
        let by_pos = pos.and_then(|p| self.positional.get_mut(p)).and_then(Option::take);
        match (by_pos, by_name) {
            (Some(_), Some(_)) => Err(defect(format!(
                "{}(): argument {:?} given twice",
                self.func, names[0]
            ))),
            (v, None) | (None, v) => Ok(v),
        }
    }

    fn required(&mut self, pos: usize, name: &str) -> Result<Value, CheckError> {
        self.take(Some(pos), &[name])?
            .ok_or_else(|| defect(format!("{}(): missing argument {name:?}", self.func)))
    }

    fn finish(self) -> Result<(), CheckError> {
        if self.positional.iter().any(Option::is_some) {
            return Err(defect(format!("{}(): too many positional arguments", self.func)));
        }
        if let Some(name) = self.named.keys().next() {
            return Err(defect(format!("{}(): unexpected argument {name:?}", self.func)));
        }
        Ok(())
    }
}

/// Parses the shared run options; positional slots start at `first`.
fn run_options(args: &mut CallArgs, first: usize) -> Result<RunOptions, CheckError> {
    let mut opts = RunOptions {
        args: string_list(args.take(Some(first), &["args"])?, "args")?,
        cmd_prefix: string_list(args.take(Some(first + 1), &["cmd_prefix"])?, "cmd_prefix")?
            .into_iter()
            .map(OsString::from)
            .collect(),
        ..RunOptions::default()
    };
    if let Some(v) = args.take(Some(first + 2), &["must_fail"])? {
        opts.must_fail = truthy(&v);
    }
    if let Some(v) = args.take(Some(first + 3), &["retcode", "retcode_expected"])? {
        opts.retcode_expected = match into_data(v, "retcode")? {
            Json::Number(n) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(RetcodeCheck::from)
                .ok_or_else(|| defect(format!("retcode out of range: {n}")))?,
            Json::String(s) => s.parse::<RetcodeCheck>().map_err(defect)?,
            other => return Err(defect(format!("retcode must be an int or predicate, got {other}"))),
        };
    }
    opts.input = opt_string(args.take(Some(first + 4), &["input"])?, "input")?;
    if let Some(v) = args.take(Some(first + 5), &["timeout"])? {
        match into_data(v, "timeout")? {
            Json::Null => {}
            Json::Number(n) => {
                let secs = n.as_f64().filter(|s| *s > 0.0).ok_or_else(|| {
                    defect(format!("timeout must be a positive number of seconds, got {n}"))
                })?;
                opts.timeout = Some(Duration::from_secs_f64(secs));
            }
            other => return Err(defect(format!("timeout must be a number, got {other}"))),
        }
    }
    Ok(opts)
}

fn builtin(name: &str, mut args: CallArgs) -> Result<Value, CheckError> {
    let arg = args.required(0, "value")?;
    args.finish()?;
    match name {
        "len" => {
            let n = match &arg {
                Value::Data(Json::String(s)) => s.chars().count(),
                Value::Data(Json::Array(a)) => a.len(),
                Value::Data(Json::Object(m)) => m.len(),
                Value::Trace(t) => t.len(),
                other => return Err(defect(format!("len() of {}", other.kind()))),
            };
            Ok(json!(n).into())
        }
        "str" => Ok(json!(display(&arg)).into()),
        "print" => {
            info!("{}", display(&arg));
            Ok(Json::Null.into())
        }
        "fail" => Err(CheckError::hard(display(&arg))),
        "skip" => Err(CheckError::skip(display(&arg))),
        _ => Err(defect(format!("unknown builtin {name:?}"))),
    }
}

fn trace_method(trace: &Trace, method: &str, mut args: CallArgs) -> Result<Value, CheckError> {
    match method {
        "function_called" => {
            let names = names(Some(args.required(0, "name")?), "name")?;
            args.finish()?;
            records(trace.function_called(names).into_iter())
        }
        "get" => {
            let id = match into_data(args.required(0, "id")?, "id")? {
                Json::Number(n) => n.as_i64().ok_or_else(|| defect("call id must be an int"))?,
                other => return Err(defect(format!("call id must be an int, got {other}"))),
            };
            args.finish()?;
            match trace.get(id) {
                Some(r) => Ok(serde_json::to_value(r).context("serialize call record")?.into()),
                None => Ok(Json::Null.into()),
            }
        }
        _ => Err(defect(format!("trace has no method {method:?}"))),
    }
}

fn records<'t>(iter: impl Iterator<Item = &'t gbs_host_runner::CallRecord>) -> Result<Value, CheckError> {
    let mut out = Vec::new();
    for r in iter {
        out.push(serde_json::to_value(r).context("serialize call record")?);
    }
    Ok(Json::Array(out).into())
}

fn path_value(p: Option<&std::path::Path>) -> Json {
    p.map_or(Json::Null, |p| json!(p.to_string_lossy()))
}

fn into_data(v: Value, what: &str) -> Result<Json, CheckError> {
    match v {
        Value::Data(d) => Ok(d),
        other => Err(defect(format!("{what} must be plain data, got {}", other.kind()))),
    }
}

fn opt_string(v: Option<Value>, what: &str) -> Result<Option<String>, CheckError> {
    match v.map(|v| into_data(v, what)).transpose()? {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) => Ok(Some(s)),
        Some(other) => Err(defect(format!("{what} must be a string, got {other}"))),
    }
}

fn string_list(v: Option<Value>, what: &str) -> Result<Vec<String>, CheckError> {
    match v.map(|v| into_data(v, what)).transpose()? {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Json::String(s) => Ok(s),
                Json::Number(n) => Ok(n.to_string()),
                other => Err(defect(format!("{what} entries must be strings, got {other}"))),
            })
            .collect(),
        Some(other) => Err(defect(format!("{what} must be a list, got {other}"))),
    }
}

fn string_map(v: Option<Value>, what: &str) -> Result<BTreeMap<String, String>, CheckError> {
    match v.map(|v| into_data(v, what)).transpose()? {
        None | Some(Json::Null) => Ok(BTreeMap::new()),
        Some(Json::Object(map)) => map
            .into_iter()
            .map(|(k, v)| match v {
                Json::String(s) => Ok((k, s)),
                other => Err(defect(format!("{what} values must be strings, got {other}"))),
            })
            .collect(),
        Some(other) => Err(defect(format!("{what} must be a map, got {other}"))),
    }
}

/// A single function name or a list of them.
fn names(v: Option<Value>, what: &str) -> Result<Vec<String>, CheckError> {
    match v {
        Some(Value::Data(Json::String(s))) => Ok(vec![s]),
        other => string_list(other, what),
    }
}

pub(super) fn truthy(v: &Value) -> bool {
    match v {
        Value::Data(Json::Null) => false,
        Value::Data(Json::Bool(b)) => *b,
        Value::Data(Json::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Data(Json::String(s)) => !s.is_empty(),
        Value::Data(Json::Array(a)) => !a.is_empty(),
        Value::Data(Json::Object(m)) => !m.is_empty(),
        Value::Trace(t) => !t.is_empty(),
        Value::Compilation(_) | Value::CompilationFactory => true,
    }
}

pub(super) fn display(v: &Value) -> String {
    match v {
        Value::Data(Json::String(s)) => s.clone(),
        Value::Data(Json::Null) => "none".to_string(),
        Value::Data(d) => d.to_string(),
        Value::Compilation(id) => format!("<compilation {id:?}>"),
        Value::Trace(t) => format!("<trace of {} calls>", t.len()),
        Value::CompilationFactory => "<Compilation>".to_string(),
    }
}

fn index(obj: &Value, idx: &Value) -> Result<Value, CheckError> {
    let (Value::Data(obj), Value::Data(idx)) = (obj, idx) else {
        return Err(defect(format!("cannot index {} with {}", obj.kind(), idx.kind())));
    };
    match (obj, idx) {
        (Json::Array(items), Json::Number(n)) => {
            let i = n.as_i64().ok_or_else(|| defect(format!("bad list index {n}")))?;
            let len = items.len() as i64;
            let pos = if i < 0 { len + i } else { i };
            usize::try_from(pos)
                .ok()
                .and_then(|p| items.get(p))
                .cloned()
                .map(Value::Data)
                .ok_or_else(|| defect(format!("list index {i} out of range (len {len})")))
        }
        (Json::Object(map), Json::String(k)) => map
            .get(k)
            .cloned()
            .map(Value::Data)
            .ok_or_else(|| defect(format!("map has no key {k:?}"))),
        (Json::String(s), Json::Number(n)) => {
            let i = n.as_u64().ok_or_else(|| defect(format!("bad string index {n}")))?;
            let i = usize::try_from(i).map_err(|_| defect(format!("bad string index {n}")))?;
            s.chars()
                .nth(i)
                .map(|c| json!(c.to_string()).into())
                .ok_or_else(|| defect(format!("string index {i} out of range")))
        }
        (obj, idx) => Err(defect(format!("cannot index {obj} with {idx}"))),
    }
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> Result<bool, CheckError> {
    if let (Value::Compilation(a), Value::Compilation(b)) = (lhs, rhs) {
        return match op {
            BinOp::Eq => Ok(a == b),
            BinOp::Ne => Ok(a != b),
            _ => Err(defect("compilations only support == and !=")),
        };
    }
    let (Value::Data(l), Value::Data(r)) = (lhs, rhs) else {
        return match op {
            BinOp::Eq => Ok(false),
            BinOp::Ne => Ok(true),
            _ => Err(defect(format!("cannot compare {} with {}", lhs.kind(), rhs.kind()))),
        };
    };
    match op {
        BinOp::Eq => Ok(data_eq(l, r)),
        BinOp::Ne => Ok(!data_eq(l, r)),
        BinOp::In => contains(r, l),
        BinOp::NotIn => contains(r, l).map(|b| !b),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (l, r) {
                (Json::Number(a), Json::Number(b)) => match (a.as_i64(), b.as_i64()) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    _ => a
                        .as_f64()
                        .zip(b.as_f64())
                        .and_then(|(a, b)| a.partial_cmp(&b))
                        .ok_or_else(|| defect("incomparable numbers"))?,
                },
                (Json::String(a), Json::String(b)) => a.cmp(b),
                _ => return Err(defect(format!("cannot order {l} and {r}"))),
            };
            Ok(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            })
        }
    }
}

fn data_eq(l: &Json, r: &Json) -> bool {
    match (l, r) {
        (Json::Number(a), Json::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => l == r,
    }
}

fn contains(haystack: &Json, needle: &Json) -> Result<bool, CheckError> {
    match (haystack, needle) {
        (Json::String(h), Json::String(n)) => Ok(h.contains(n.as_str())),
        (Json::String(h), Json::Number(n)) => Ok(h.contains(&n.to_string())),
        (Json::Array(items), n) => Ok(items.iter().any(|i| data_eq(i, n))),
        (Json::Object(map), Json::String(k)) => Ok(map.contains_key(k)),
        _ => Err(defect(format!("cannot test membership of {needle} in {haystack}"))),
    }
}
