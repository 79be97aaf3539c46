use std::collections::BTreeMap;
use std::rc::Rc;

use gbs_trace::Trace;

use crate::session::CompilationId;

/// A binding in a test script's shared environment.
#[derive(Debug, Clone)]
pub enum Value {
    /// Anything declared by data or rawsource blocks, and every plain value
    /// computed by logic.
    Data(serde_json::Value),
    Compilation(CompilationId),
    Trace(Rc<Trace>),
    /// The seeded `Compilation` binding; calling it builds a new compilation.
    CompilationFactory,
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Data(serde_json::Value::Null) => "none",
            Value::Data(serde_json::Value::Bool(_)) => "bool",
            Value::Data(serde_json::Value::Number(_)) => "number",
            Value::Data(serde_json::Value::String(_)) => "string",
            Value::Data(serde_json::Value::Array(_)) => "list",
            Value::Data(serde_json::Value::Object(_)) => "map",
            Value::Compilation(_) => "compilation",
            Value::Trace(_) => "trace",
            Value::CompilationFactory => "Compilation",
        }
    }

    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(v) => Some(v),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Data(v)
    }
}

#[derive(Debug, Clone)]
pub struct Environment {
    vars: BTreeMap<String, Value>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("Compilation".to_string(), Value::CompilationFactory);
        Environment { vars }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn data(&self, name: &str) -> Option<&serde_json::Value> {
        self.get(name).and_then(Value::as_data)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Merges a declarative mapping; later keys win.
    pub fn merge(&mut self, map: serde_json::Map<String, serde_json::Value>) {
        for (k, v) in map {
            self.vars.insert(k, Value::Data(v));
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}
