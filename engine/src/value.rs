//! The script value universe.
//!
//! Lists and records are shared by reference (`Arc` + `RwLock`): a record
//! handed to a spawned server handler observes writes made by other
//! requests. The locks are only ever held for synchronous access, never
//! across an await point.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use url::Url;

use tern_runtime::RtError;
use tern_types::{HttpHost, Pth};

use crate::ast::Node;
use crate::Verb;

pub type ObjectRef = Arc<RwLock<BTreeMap<String, Value>>>;
pub type ListRef = Arc<RwLock<Vec<Value>>>;

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Arc<Vec<u8>>),
    Path(Pth),
    Url(Url),
    Host(HttpHost),
    List(ListRef),
    Object(ObjectRef),
    Func(Arc<FuncValue>),
}

pub struct FuncValue {
    pub name: String,
    pub kind: FuncKind,
}

pub enum FuncKind {
    Native(Arc<dyn Verb>),
    Script { params: Vec<String>, body: Node },
}

impl Value {
    #[must_use]
    pub fn object(pairs: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::Object(Arc::new(RwLock::new(pairs.into_iter().collect())))
    }

    #[must_use]
    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::List(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    #[must_use]
    pub fn native(verb: Arc<dyn Verb>) -> Value {
        Value::Func(Arc::new(FuncValue {
            name: verb.name().to_string(),
            kind: FuncKind::Native(verb),
        }))
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Path(_) => "path",
            Value::Url(_) => "url",
            Value::Host(_) => "host",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Func(_) => "function",
        }
    }

    /// Member lookup on records; `None` for everything else.
    #[must_use]
    pub fn memb(&self, name: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.read().ok()?.get(name).cloned(),
            _ => None,
        }
    }

    /// Field names of a record, sorted; empty for non-records.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        match self {
            Value::Object(map) => map
                .read()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Scalars that may cross the subprocess boundary as argv.
    #[must_use]
    pub const fn is_simple_scalar(&self) -> bool {
        matches!(
            self,
            Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Str(_)
                | Value::Path(_)
                | Value::Url(_)
        )
    }

    /// Blank values are not echoed by the REPL.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::List(items) => items.read().map(|v| v.is_empty()).unwrap_or(false),
            _ => false,
        }
    }

    /// JSON projection used by the KV store and HTTP bodies.
    pub fn to_json(&self) -> Result<serde_json::Value, RtError> {
        Ok(match self {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Path(p) => serde_json::Value::String(p.as_str().to_string()),
            Value::Url(u) => serde_json::Value::String(u.to_string()),
            Value::Host(h) => serde_json::Value::String(h.to_string()),
            Value::List(items) => {
                let items = items
                    .read()
                    .map_err(|_| RtError::Eval("poisoned list lock".into()))?;
                serde_json::Value::Array(
                    items.iter().map(Value::to_json).collect::<Result<_, _>>()?,
                )
            }
            Value::Object(map) => {
                let map = map
                    .read()
                    .map_err(|_| RtError::Eval("poisoned object lock".into()))?;
                let mut out = serde_json::Map::new();
                for (k, v) in map.iter() {
                    out.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(out)
            }
            Value::Func(f) => {
                return Err(RtError::invalid_args(format!(
                    "function '{}' is not serializable",
                    f.name
                )));
            }
        })
    }

    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .unwrap_or_else(|| Value::Float(n.as_f64().unwrap_or(0.0))),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::list(items.iter().map(Value::from_json)),
            serde_json::Value::Object(map) => {
                Value::object(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))))
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Path(a), Value::Path(b)) => a == b,
            (Value::Url(a), Value::Url(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a == b,
            (Value::List(a), Value::List(b)) => match (a.read(), b.read()) {
                (Ok(a), Ok(b)) => *a == *b,
                _ => false,
            },
            (Value::Object(a), Value::Object(b)) => match (a.read(), b.read()) {
                (Ok(a), Ok(b)) => *a == *b,
                _ => false,
            },
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Path(p) => write!(f, "{p}"),
            Value::Url(u) => write!(f, "{u}"),
            Value::Host(h) => write!(f, "{h}"),
            Value::List(items) => {
                let Ok(items) = items.read() else {
                    return f.write_str("[..]");
                };
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Object(map) => {
                let Ok(map) = map.read() else {
                    return f.write_str("{..}");
                };
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Func(func) => write!(f, "<fn {}>", func.name),
        }
    }
}

impl fmt::Debug for FuncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}>", self.name)
    }
}
