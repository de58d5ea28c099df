//! Runtime value domain for the S-expression evaluator
//!
//! One enum covers both parsed syntax and runtime values, Lisp-style:
//! symbols and lists are data until evaluated. Nil is the empty list.

use crate::env::Env;
use serde_json::Value as Json;
use taskloom_core::TaskResult;

/// A first-class function value capturing its lexical environment.
#[derive(Clone)]
pub struct Closure {
    pub params: Vec<String>,
    pub body: Vec<Value>,
    pub env: Env,
}

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Symbol(String),
    List(Vec<Value>),
    Closure(Closure),
    Task(Box<TaskResult>),
}

impl Value {
    pub fn nil() -> Value {
        Value::List(Vec::new())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::List(items) if items.is_empty())
    }

    /// Truthy means: non-nil, non-false, non-zero, non-empty-string.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::List(items) => !items.is_empty(),
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Symbol(_) | Value::Closure(_) | Value::Task(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Closure(_) => "closure",
            Value::Task(_) => "task-result",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Convert to JSON for use as a task input or tool argument.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => Json::from(*f),
            Value::Bool(b) => Json::from(*b),
            Value::Str(s) => Json::from(s.clone()),
            Value::Symbol(s) => Json::from(s.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Closure(_) => Json::from("<closure>"),
            Value::Task(result) => serde_json::to_value(result.as_ref()).unwrap_or(Json::Null),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => {
                a.status == b.status && a.content == b.content
            }
            // Closures have no useful equality
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Symbol(s) => write!(f, "{}", s),
            Value::List(items) => {
                if items.is_empty() {
                    return write!(f, "nil");
                }
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Closure(c) => write!(f, "<closure/{}>", c.params.len()),
            Value::Task(result) => write!(f, "{}", result.content),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Task(result) => write!(f, "Task({:?}, {:?})", result.status, result.content),
            other => write!(f, "{}", other),
        }
    }
}
