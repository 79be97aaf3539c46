//! Call-tree reconstruction from the debugger driver's flat event log.
//!
//! The driver reports one event per line: a `call` when a traced function is
//! entered and a `return` when it leaves. [`Trace::from_events`] folds that
//! stream into an arena of [`CallRecord`]s addressed by activation id, with
//! parent and child links stored as ids.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

mod literal;

pub use literal::parse_literal;

pub type CallId = i64;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("malformed literal at byte {offset}: {message}")]
    Literal { offset: usize, message: String },
    #[error("malformed trace event: {0}")]
    Event(String),
    #[error("return for unknown call id {0}")]
    UnknownCall(CallId),
    #[error("call id {0} reported twice")]
    DuplicateCall(CallId),
    #[error("call id {id} names unknown parent {parent}")]
    UnknownParent { id: CallId, parent: CallId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Call {
        parent: Option<CallId>,
        id: CallId,
        name: String,
        asm_name: String,
        args: Value,
    },
    Return {
        id: CallId,
        ret: Value,
    },
}

/// Parses one line of the driver's log.
///
/// Call records are `(tag, parent-or-None, id, name, asm_name, args)`; return
/// records are `(tag, id, name, value)` or `(tag, id, value)`.
pub fn parse_event_line(line: &str) -> Result<TraceEvent, TraceError> {
    let v = parse_literal(line.trim())?;
    let Value::Array(items) = v else {
        return Err(TraceError::Event(format!("expected a tuple, got {v}")));
    };
    let tag = items.first().and_then(Value::as_str).unwrap_or_default();
    match (tag, items.len()) {
        ("call", 6) => {
            let parent = match &items[1] {
                Value::Null => None,
                other => Some(call_id(other)?),
            };
            Ok(TraceEvent::Call {
                parent,
                id: call_id(&items[2])?,
                name: text(&items[3])?,
                asm_name: text(&items[4])?,
                args: items[5].clone(),
            })
        }
        ("return", 3) => Ok(TraceEvent::Return {
            id: call_id(&items[1])?,
            ret: items[2].clone(),
        }),
        ("return", 4) => Ok(TraceEvent::Return {
            id: call_id(&items[1])?,
            ret: items[3].clone(),
        }),
        _ => Err(TraceError::Event(format!(
            "unknown record {tag:?} with {} fields",
            items.len()
        ))),
    }
}

fn call_id(v: &Value) -> Result<CallId, TraceError> {
    v.as_i64()
        .ok_or_else(|| TraceError::Event(format!("call id is not an integer: {v}")))
}

fn text(v: &Value) -> Result<String, TraceError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(TraceError::Event(format!("expected a name, got {other}"))),
    }
}

/// One function activation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub id: CallId,
    pub name: String,
    pub asm_name: String,
    pub args: Value,
    /// Unset until the matching return event is seen.
    #[serde(rename = "return")]
    pub ret: Option<Value>,
    pub parent: Option<CallId>,
    /// Ascending id order, which is call order.
    pub children: Vec<CallId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    records: BTreeMap<CallId, CallRecord>,
}

impl Trace {
    pub fn from_events<I>(events: I) -> Result<Self, TraceError>
    where
        I: IntoIterator<Item = TraceEvent>,
    {
        let mut trace = Trace::default();
        for ev in events {
            trace.apply(ev)?;
        }
        Ok(trace)
    }

    pub fn apply(&mut self, event: TraceEvent) -> Result<(), TraceError> {
        match event {
            TraceEvent::Call {
                parent,
                id,
                name,
                asm_name,
                args,
            } => {
                if self.records.contains_key(&id) {
                    return Err(TraceError::DuplicateCall(id));
                }
                if let Some(parent) = parent {
                    let p = self
                        .records
                        .get_mut(&parent)
                        .ok_or(TraceError::UnknownParent { id, parent })?;
                    let at = p.children.partition_point(|c| *c < id);
                    p.children.insert(at, id);
                }
                self.records.insert(
                    id,
                    CallRecord {
                        id,
                        name,
                        asm_name,
                        args,
                        ret: None,
                        parent,
                        children: Vec::new(),
                    },
                );
            }
            TraceEvent::Return { id, ret } => {
                let rec = self
                    .records
                    .get_mut(&id)
                    .ok_or(TraceError::UnknownCall(id))?;
                rec.ret = Some(ret);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: CallId) -> Option<&CallRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &CallRecord> {
        self.records.values()
    }

    pub fn roots(&self) -> impl Iterator<Item = &CallRecord> {
        self.records.values().filter(|r| r.parent.is_none())
    }

    pub fn parent(&self, id: CallId) -> Option<&CallRecord> {
        self.records.get(&id)?.parent.and_then(|p| self.records.get(&p))
    }

    pub fn children(&self, id: CallId) -> impl Iterator<Item = &CallRecord> {
        self.records
            .get(&id)
            .map(|r| r.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|c| self.records.get(c))
    }

    /// Records whose function name is one of `names`, in call order.
    pub fn function_called<N: Into<NameSet>>(&self, names: N) -> Vec<&CallRecord> {
        let names = names.into();
        self.records
            .values()
            .filter(|r| names.0.contains(&r.name))
            .collect()
    }
}

/// One or more function names to look up in a [`Trace`].
#[derive(Debug, Clone, Default)]
pub struct NameSet(BTreeSet<String>);

impl From<&str> for NameSet {
    fn from(name: &str) -> Self {
        NameSet(BTreeSet::from([name.to_string()]))
    }
}

impl From<String> for NameSet {
    fn from(name: String) -> Self {
        NameSet(BTreeSet::from([name]))
    }
}

impl From<&[&str]> for NameSet {
    fn from(names: &[&str]) -> Self {
        NameSet(names.iter().map(|n| n.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for NameSet {
    fn from(names: [&str; N]) -> Self {
        NameSet(names.iter().map(|n| n.to_string()).collect())
    }
}

impl From<Vec<String>> for NameSet {
    fn from(names: Vec<String>) -> Self {
        NameSet(names.into_iter().collect())
    }
}
