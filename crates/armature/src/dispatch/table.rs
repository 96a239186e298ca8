// Per-type method registry
//
// Dynamic dispatch without runtime reflection: each handler type declares a
// MethodTable once at startup, mapping method names and parameter shapes to
// typed callables. The invocation engine in dispatch/mod.rs resolves over
// this table.

use serde_json::Value;
use tracing::warn;

use crate::types::{Error, Result};

/// Runtime type descriptor of a message argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Array,
    Object,
}

/// Classify a JSON value into its argument kind.
pub fn kind_of(value: &Value) -> ArgKind {
    match value {
        Value::Null => ArgKind::Null,
        Value::Bool(_) => ArgKind::Bool,
        Value::Number(n) => {
            if n.is_f64() {
                ArgKind::Float
            } else {
                ArgKind::Int
            }
        }
        Value::String(_) => ArgKind::Str,
        Value::Array(_) => ArgKind::Array,
        Value::Object(_) => ArgKind::Object,
    }
}

/// `method(Int, Str)` - used in log lines and `MethodNotFound` reports.
pub fn signature_of(method: &str, kinds: &[ArgKind]) -> String {
    let params: Vec<String> = kinds.iter().map(|k| format!("{:?}", k)).collect();
    format!("{}({})", method, params.join(", "))
}

type MethodFn<H> = Box<dyn Fn(&mut H, &[Value]) -> Result<Value> + Send + Sync>;

/// One registered method: name, declared parameter kinds, callable.
pub struct MethodEntry<H> {
    pub name: String,
    pub params: Vec<ArgKind>,
    func: MethodFn<H>,
}

/// Ordered method registry for a handler type. Declaration order matters:
/// the arity-only fallback scan executes the first candidate it finds.
pub struct MethodTable<H> {
    entries: Vec<MethodEntry<H>>,
}

impl<H> MethodTable<H> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register a method. A second entry with an identical exact signature
    /// would be unreachable; it is kept out of the table and logged.
    pub fn register<F>(mut self, name: &str, params: &[ArgKind], func: F) -> Self
    where
        F: Fn(&mut H, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        if self.find_exact_signature(name, params).is_some() {
            warn!(
                "{}",
                Error::AmbiguousMatch { signature: signature_of(name, params) }
            );
            return self;
        }
        self.entries.push(MethodEntry {
            name: name.to_string(),
            params: params.to_vec(),
            func: Box::new(func),
        });
        self
    }

    /// Method names in declaration order, duplicates removed. This is the
    /// capability-query surface; it answers "what can this type do" without
    /// exposing the callables.
    pub fn method_names(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if !seen.contains(&entry.name.as_str()) {
                seen.push(entry.name.as_str());
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact resolution: name, arity, and per-position kind equality.
    pub fn find_exact(&self, name: &str, kinds: &[ArgKind]) -> Option<usize> {
        self.find_exact_signature(name, kinds)
    }

    fn find_exact_signature(&self, name: &str, kinds: &[ArgKind]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name && e.params == kinds)
    }

    /// Arity-only "upcast" fallback: same name, same parameter count, no
    /// kind check. First candidate in declaration order.
    pub fn find_compatible(&self, name: &str, arity: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name && e.params.len() == arity)
    }

    /// Execute the method in `slot`. A failure inside the callable is
    /// captured as `Error::Invocation`, never propagated as a panic or a
    /// crash of the caller's loop.
    pub fn invoke_slot(&self, slot: usize, handler: &mut H, args: &[Value]) -> Result<Value> {
        let entry = &self.entries[slot];
        (entry.func)(handler, args).map_err(|e| match e {
            already @ Error::Invocation { .. } => already,
            other => Error::Invocation {
                method: entry.name.clone(),
                reason: other.to_string(),
            },
        })
    }
}

impl<H> Default for MethodTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> std::fmt::Debug for MethodTable<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.method_names())
            .finish()
    }
}
