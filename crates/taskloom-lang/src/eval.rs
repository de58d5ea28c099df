//! Recursive evaluator with special forms, primitives, and closures
//!
//! Dispatch order for a list form `(op args…)`: special forms first,
//! then primitives (arguments evaluated left-to-right), then `op` itself
//! is evaluated — a closure is applied, a string naming a registered
//! atomic task or direct tool is invoked through the host.

use crate::env::Env;
use crate::host::WorkflowHost;
use crate::parser::{self, ParseError};
use crate::value::{Closure, Value};
use async_recursion::async_recursion;
use serde_json::{Map, Value as Json};
use std::sync::Arc;
use taskloom_core::{
    ContextGenerationInput, ContextManagement, FailureReason, SubtaskRequest, TaskError, Template,
};
use tracing::debug;

const SPECIAL_FORMS: &[&str] = &[
    "quote",
    "if",
    "let",
    "bind",
    "progn",
    "lambda",
    "defatom",
    "loop",
    "get_context",
];

const PRIMITIVES: &[&str] = &[
    "list",
    "read_file",
    "write_file",
    "system:run_script",
    "+",
    "-",
    "*",
    "/",
    "=",
    "!=",
    "<",
    ">",
    "<=",
    ">=",
];

/// Reserved named arguments intercepted before a task invocation.
const ARG_FILES: &str = "files";
const ARG_CONTEXT: &str = "context";

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Task(TaskError),
}

type EvalResult = Result<Value, TaskError>;

pub struct Evaluator {
    host: Arc<dyn WorkflowHost>,
    globals: Env,
}

impl Evaluator {
    pub fn new(host: Arc<dyn WorkflowHost>) -> Self {
        Self {
            host,
            globals: Env::root(),
        }
    }

    pub fn globals(&self) -> &Env {
        &self.globals
    }

    /// Parse and evaluate a complete source string; top-level forms run in
    /// sequence in the global frame and the last value is returned.
    pub async fn eval_source(&self, source: &str) -> Result<Value, EvalError> {
        let forms = parser::parse(source)?;
        let mut last = Value::nil();
        for form in &forms {
            last = self
                .eval(form, &self.globals)
                .await
                .map_err(EvalError::Task)?;
        }
        Ok(last)
    }

    #[async_recursion]
    pub async fn eval(&self, expr: &Value, env: &Env) -> EvalResult {
        match expr {
            Value::Int(_)
            | Value::Float(_)
            | Value::Bool(_)
            | Value::Str(_)
            | Value::Closure(_)
            | Value::Task(_) => Ok(expr.clone()),

            Value::Symbol(name) => self.eval_symbol(name, env),

            Value::List(items) => {
                if items.is_empty() {
                    return Ok(Value::nil());
                }
                let (op, args) = items.split_first().unwrap();

                if let Some(name) = op.as_symbol() {
                    if SPECIAL_FORMS.contains(&name) {
                        return self.eval_special(name, args, env).await;
                    }
                    if PRIMITIVES.contains(&name) {
                        let mut evaluated = Vec::with_capacity(args.len());
                        for arg in args {
                            evaluated.push(self.eval(arg, env).await?);
                        }
                        return self.apply_primitive(name, evaluated, env).await;
                    }
                }

                match self.eval(op, env).await? {
                    Value::Closure(closure) => self.apply_closure(&closure, args, env).await,
                    Value::Str(name) | Value::Symbol(name) => {
                        if self.host.template_exists(&name) {
                            self.invoke_task(&name, args, env).await
                        } else if self.host.tool_exists(&name) {
                            self.invoke_tool(&name, args, env).await
                        } else {
                            Err(TaskError::failure(
                                FailureReason::UndefinedOperator,
                                format!("'{}' is not a task, tool, or function", name),
                            ))
                        }
                    }
                    other => Err(TaskError::failure(
                        FailureReason::UndefinedOperator,
                        format!("cannot apply a value of type {}", other.type_name()),
                    )),
                }
            }
        }
    }

    fn eval_symbol(&self, name: &str, env: &Env) -> EvalResult {
        if let Some(value) = env.lookup(name) {
            return Ok(value);
        }
        // An unbound symbol naming a task or tool evaluates to its name,
        // so `(echo "hi")` routes through invocation.
        if self.host.template_exists(name) || self.host.tool_exists(name) {
            return Ok(Value::Str(name.to_string()));
        }
        Err(TaskError::failure(
            FailureReason::UnboundSymbol,
            format!("unbound symbol '{}'", name),
        ))
    }

    async fn eval_special(&self, form: &str, args: &[Value], env: &Env) -> EvalResult {
        match form {
            "quote" => {
                expect_arity(form, args, 1, 1)?;
                Ok(args[0].clone())
            }

            "if" => {
                expect_arity(form, args, 2, 3)?;
                let condition = self.eval(&args[0], env).await?;
                if condition.is_truthy() {
                    self.eval(&args[1], env).await
                } else if let Some(else_branch) = args.get(2) {
                    self.eval(else_branch, env).await
                } else {
                    Ok(Value::nil())
                }
            }

            "let" => {
                if args.is_empty() {
                    return Err(arity_error(form, "(let ((name expr)…) body…)"));
                }
                let bindings = args[0].as_list().ok_or_else(|| {
                    arity_error(form, "first argument must be a binding list")
                })?;

                // Parallel let: every init expression sees the outer frame.
                let mut pairs = Vec::with_capacity(bindings.len());
                for binding in bindings {
                    let parts = binding
                        .as_list()
                        .filter(|p| p.len() == 2)
                        .ok_or_else(|| arity_error(form, "bindings must be (name expr) pairs"))?;
                    let name = parts[0]
                        .as_symbol()
                        .ok_or_else(|| arity_error(form, "binding names must be symbols"))?;
                    let value = self.eval(&parts[1], env).await?;
                    pairs.push((name.to_string(), value));
                }

                let frame = env.child();
                for (name, value) in pairs {
                    frame.define(name, value);
                }
                let mut last = Value::nil();
                for body in &args[1..] {
                    last = self.eval(body, &frame).await?;
                }
                Ok(last)
            }

            "bind" => {
                expect_arity(form, args, 2, 2)?;
                let name = args[0]
                    .as_symbol()
                    .ok_or_else(|| arity_error(form, "(bind name expr)"))?;
                let value = self.eval(&args[1], env).await?;
                env.define(name, value.clone());
                Ok(value)
            }

            "progn" => {
                let mut last = Value::nil();
                for arg in args {
                    last = self.eval(arg, env).await?;
                }
                Ok(last)
            }

            "lambda" => {
                if args.len() < 2 {
                    return Err(arity_error(form, "(lambda (params…) body…)"));
                }
                let param_list = args[0]
                    .as_list()
                    .ok_or_else(|| arity_error(form, "parameter list must be a list"))?;
                let mut params = Vec::with_capacity(param_list.len());
                for param in param_list {
                    let name = param
                        .as_symbol()
                        .ok_or_else(|| arity_error(form, "parameters must be symbols"))?;
                    params.push(name.to_string());
                }
                Ok(Value::Closure(Closure {
                    params,
                    body: args[1..].to_vec(),
                    env: env.clone(),
                }))
            }

            "defatom" => self.eval_defatom(args),

            "loop" => {
                expect_arity(form, args, 2, 2)?;
                let count = match self.eval(&args[0], env).await? {
                    Value::Int(n) if n >= 0 => n,
                    other => {
                        return Err(TaskError::failure(
                            FailureReason::InputValidationFailure,
                            format!("loop count must be a non-negative integer, got {:?}", other),
                        ))
                    }
                };
                let mut last = Value::nil();
                for _ in 0..count {
                    last = self.eval(&args[1], env).await?;
                }
                Ok(last)
            }

            "get_context" => self.eval_get_context(args, env).await,

            _ => unreachable!("unknown special form '{}'", form),
        }
    }

    async fn apply_primitive(&self, name: &str, args: Vec<Value>, _env: &Env) -> EvalResult {
        match name {
            "list" => Ok(Value::List(args)),

            "read_file" => {
                expect_arity(name, &args, 1, 1)?;
                let path = string_arg(name, &args[0])?;
                self.tool_content("read_file", serde_json::json!({ "path": path }))
                    .await
            }

            "write_file" => {
                expect_arity(name, &args, 2, 2)?;
                let path = string_arg(name, &args[0])?;
                let content = args[1].to_string();
                self.tool_content(
                    "write_file",
                    serde_json::json!({ "path": path, "content": content }),
                )
                .await
            }

            "system:run_script" => {
                expect_arity(name, &args, 1, 2)?;
                let script = string_arg(name, &args[0])?;
                let mut tool_args = serde_json::json!({ "script": script });
                if let Some(Value::Int(secs)) = args.get(1) {
                    tool_args["timeout_secs"] = Json::from(*secs);
                }
                self.tool_content("system:run_script", tool_args).await
            }

            "+" | "-" | "*" | "/" => numeric_fold(name, &args),

            "=" | "!=" | "<" | ">" | "<=" | ">=" => compare(name, &args),

            _ => unreachable!("unknown primitive '{}'", name),
        }
    }

    /// Run a direct tool and unwrap its content; a failed tool raises.
    async fn tool_content(&self, tool: &str, args: Json) -> EvalResult {
        let result = self.host.execute_tool(tool, args).await;
        if result.is_failed() {
            Err(result.notes.error.clone().unwrap_or_else(|| {
                TaskError::failure(FailureReason::UnexpectedError, result.content.clone())
            }))
        } else {
            Ok(Value::Str(result.content))
        }
    }

    async fn apply_closure(&self, closure: &Closure, args: &[Value], env: &Env) -> EvalResult {
        // Arguments evaluate in the calling environment; the new frame's
        // parent is the captured environment. This is the crux of lexical
        // scoping.
        if args.len() != closure.params.len() {
            return Err(TaskError::failure(
                FailureReason::ArityMismatch,
                format!(
                    "closure expects {} argument(s), got {}",
                    closure.params.len(),
                    args.len()
                ),
            ));
        }
        let mut evaluated = Vec::with_capacity(args.len());
        for arg in args {
            evaluated.push(self.eval(arg, env).await?);
        }

        let frame = closure.env.child();
        for (param, value) in closure.params.iter().zip(evaluated) {
            frame.define(param.clone(), value);
        }
        let mut last = Value::nil();
        for body in &closure.body {
            last = self.eval(body, &frame).await?;
        }
        Ok(last)
    }

    fn eval_defatom(&self, args: &[Value]) -> EvalResult {
        let invalid = |message: String| {
            TaskError::failure(FailureReason::InputValidationFailure, message)
        };

        let name = args
            .first()
            .and_then(Value::as_symbol)
            .ok_or_else(|| invalid("defatom: first argument must be the task name".into()))?;

        let mut template = Template::new(name, "");
        let mut saw_instructions = false;

        for clause in &args[1..] {
            let items = clause
                .as_list()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| invalid(format!("defatom {}: clauses must be lists", name)))?;
            let key = items[0]
                .as_symbol()
                .ok_or_else(|| invalid(format!("defatom {}: clause keys must be symbols", name)))?;

            match key {
                "params" => {
                    for param in &items[1..] {
                        match param {
                            Value::Symbol(p) => template.params.push(p.clone()),
                            Value::List(pair) if !pair.is_empty() => {
                                let p = pair[0].as_symbol().ok_or_else(|| {
                                    invalid(format!(
                                        "defatom {}: parameter names must be symbols",
                                        name
                                    ))
                                })?;
                                template.params.push(p.to_string());
                                if let Some(hint) = pair.get(1) {
                                    template
                                        .param_types
                                        .insert(p.to_string(), Json::from(hint.to_string()));
                                }
                            }
                            other => {
                                return Err(invalid(format!(
                                    "defatom {}: bad parameter declaration {:?}",
                                    name, other
                                )))
                            }
                        }
                    }
                }
                "instructions" => {
                    template.instructions = clause_text(items, name, key)?;
                    saw_instructions = true;
                }
                "system" => template.system = Some(clause_text(items, name, key)?),
                "description" => template.description = Some(clause_text(items, name, key)?),
                "subtype" => template.subtype = clause_text(items, name, key)?,
                "model" => template.model = Some(clause_text(items, name, key)?),
                other => {
                    return Err(invalid(format!(
                        "defatom {}: unknown clause '{}'",
                        name, other
                    )))
                }
            }
        }

        if !saw_instructions {
            return Err(invalid(format!(
                "defatom {}: an (instructions \"…\") clause is required",
                name
            )));
        }

        self.host
            .register_template(template)
            .map_err(|message| invalid(format!("defatom {}: {}", name, message)))?;
        debug!("defatom registered '{}'", name);
        Ok(Value::Symbol(name.to_string()))
    }

    async fn eval_get_context(&self, args: &[Value], env: &Env) -> EvalResult {
        let mut input = ContextGenerationInput::default();

        for pair in args {
            let items = pair
                .as_list()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| {
                    TaskError::failure(
                        FailureReason::InputValidationFailure,
                        "get_context arguments must be (key value) pairs",
                    )
                })?;
            let key = items[0].as_symbol().ok_or_else(|| {
                TaskError::failure(
                    FailureReason::InputValidationFailure,
                    "get_context keys must be symbols",
                )
            })?;
            let value = self.eval(&items[1], env).await?;

            match key {
                "query" => input.query = value.to_string(),
                "history" => input.history = Some(value.to_string()),
                "inputs" => {
                    if let Some(entries) = value.as_list() {
                        for (i, entry) in entries.iter().enumerate() {
                            input.inputs.insert(format!("input_{}", i), entry.to_json());
                        }
                    } else {
                        input.inputs.insert("input_0".to_string(), value.to_json());
                    }
                }
                "matching_strategy" => input.matching_strategy = Some(value.to_string()),
                other => {
                    return Err(TaskError::failure(
                        FailureReason::InputValidationFailure,
                        format!("get_context: unknown key '{}'", other),
                    ))
                }
            }
        }

        let matched = self.host.match_context(input).await;
        if let Some(error) = matched.error {
            return Err(TaskError::failure(
                FailureReason::ContextMatchingFailure,
                error,
            ));
        }
        Ok(Value::List(
            matched
                .matches
                .iter()
                .filter_map(|m| m.source_path.as_ref())
                .map(|p| Value::Str(p.display().to_string()))
                .collect(),
        ))
    }

    async fn invoke_task(&self, name: &str, args: &[Value], env: &Env) -> EvalResult {
        let params = self.host.template_params(name).unwrap_or_default();
        let mut request = SubtaskRequest::named(name);

        if self.all_named(args, Some(params.as_slice()), env) {
            for pair in args {
                // all_named established the pair shape
                let Some(items) = pair.as_list() else { continue };
                let Some(key) = items[0].as_symbol() else { continue };
                match key {
                    ARG_FILES => {
                        request.file_paths = Some(self.eval_files_arg(&items[1..], env).await?)
                    }
                    ARG_CONTEXT => {
                        request.context_management =
                            Some(self.eval_context_arg(&items[1..], env).await?)
                    }
                    _ => {
                        let value = self.eval(&items[1], env).await?;
                        request.inputs.insert(key.to_string(), value.to_json());
                    }
                }
            }
        } else {
            if args.len() > params.len() {
                return Err(TaskError::failure(
                    FailureReason::ArityMismatch,
                    format!(
                        "task '{}' declares {} parameter(s), got {} argument(s)",
                        name,
                        params.len(),
                        args.len()
                    ),
                ));
            }
            for (param, arg) in params.iter().zip(args) {
                let value = self.eval(arg, env).await?;
                request.inputs.insert(param.clone(), value.to_json());
            }
        }

        let result = self.host.execute_task(request).await;
        Ok(Value::Task(Box::new(result)))
    }

    async fn invoke_tool(&self, name: &str, args: &[Value], env: &Env) -> EvalResult {
        let mut tool_args = Map::new();
        for pair in args {
            let items = pair.as_list().filter(|p| p.len() == 2);
            let key = items.and_then(|p| p[0].as_symbol());
            match (items, key) {
                (Some(items), Some(key)) => {
                    let value = self.eval(&items[1], env).await?;
                    tool_args.insert(key.to_string(), value.to_json());
                }
                _ => {
                    return Err(TaskError::failure(
                        FailureReason::InputValidationFailure,
                        format!("tool '{}' arguments must be (key value) pairs", name),
                    ))
                }
            }
        }
        let result = self.host.execute_tool(name, Json::Object(tool_args)).await;
        Ok(Value::Task(Box::new(result)))
    }

    /// Named style applies when every argument is a pair keyed by a
    /// declared parameter or a reserved name.
    fn all_named(&self, args: &[Value], params: Option<&[String]>, env: &Env) -> bool {
        !args.is_empty()
            && args
                .iter()
                .all(|arg| self.looks_named(arg, params, env))
    }

    fn looks_named(&self, expr: &Value, params: Option<&[String]>, env: &Env) -> bool {
        let Some(items) = expr.as_list() else {
            return false;
        };
        if items.len() < 2 {
            return false;
        }
        let Some(head) = items[0].as_symbol() else {
            return false;
        };
        if head == ARG_FILES || head == ARG_CONTEXT {
            return true;
        }
        if items.len() != 2 {
            return false;
        }
        match params {
            Some(params) => params.iter().any(|p| p == head),
            None => !self.is_callable(head, env),
        }
    }

    fn is_callable(&self, name: &str, env: &Env) -> bool {
        SPECIAL_FORMS.contains(&name)
            || PRIMITIVES.contains(&name)
            || env.is_bound(name)
            || self.host.template_exists(name)
            || self.host.tool_exists(name)
    }

    async fn eval_files_arg(
        &self,
        exprs: &[Value],
        env: &Env,
    ) -> Result<Vec<std::path::PathBuf>, TaskError> {
        let mut paths = Vec::new();
        for expr in exprs {
            match self.eval(expr, env).await? {
                Value::Str(path) => paths.push(path.into()),
                Value::List(items) => {
                    for item in items {
                        match item {
                            Value::Str(path) => paths.push(path.into()),
                            other => return Err(bad_files_arg(&other)),
                        }
                    }
                }
                other => return Err(bad_files_arg(&other)),
            }
        }
        Ok(paths)
    }

    async fn eval_context_arg(
        &self,
        pairs: &[Value],
        env: &Env,
    ) -> Result<ContextManagement, TaskError> {
        let mut fields = Map::new();
        for pair in pairs {
            let items = pair.as_list().filter(|p| p.len() == 2).ok_or_else(|| {
                TaskError::failure(
                    FailureReason::InputValidationFailure,
                    "context argument entries must be (field value) pairs",
                )
            })?;
            let field = items[0].as_symbol().ok_or_else(|| {
                TaskError::failure(
                    FailureReason::InputValidationFailure,
                    "context field names must be symbols",
                )
            })?;
            let value = self.eval(&items[1], env).await?;
            let json = match value {
                Value::Bool(b) => Json::from(b),
                other => Json::from(other.to_string()),
            };
            fields.insert(field.to_string(), json);
        }
        serde_json::from_value(Json::Object(fields)).map_err(|e| {
            TaskError::failure(
                FailureReason::InputValidationFailure,
                format!("invalid context argument: {}", e),
            )
        })
    }
}

fn clause_text(items: &[Value], name: &str, key: &str) -> Result<String, TaskError> {
    match items.get(1) {
        Some(Value::Str(s)) if items.len() == 2 => Ok(s.clone()),
        Some(Value::Symbol(s)) if items.len() == 2 => Ok(s.clone()),
        _ => Err(TaskError::failure(
            FailureReason::InputValidationFailure,
            format!("defatom {}: ({} \"…\") takes one string", name, key),
        )),
    }
}

fn bad_files_arg(value: &Value) -> TaskError {
    TaskError::failure(
        FailureReason::InputValidationFailure,
        format!("files argument must be paths, got {}", value.type_name()),
    )
}

fn expect_arity(form: &str, args: &[Value], min: usize, max: usize) -> Result<(), TaskError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{}..{}", min, max)
        };
        return Err(TaskError::failure(
            FailureReason::ArityMismatch,
            format!(
                "'{}' expects {} argument(s), got {}",
                form,
                expected,
                args.len()
            ),
        ));
    }
    Ok(())
}

fn arity_error(form: &str, usage: &str) -> TaskError {
    TaskError::failure(
        FailureReason::ArityMismatch,
        format!("'{}': {}", form, usage),
    )
}

fn string_arg(name: &str, value: &Value) -> Result<String, TaskError> {
    value.as_str().map(String::from).ok_or_else(|| {
        TaskError::failure(
            FailureReason::InputValidationFailure,
            format!("'{}' expects a string, got {}", name, value.type_name()),
        )
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn all_ints(args: &[Value]) -> bool {
    args.iter().all(|a| matches!(a, Value::Int(_)))
}

fn numeric_fold(op: &str, args: &[Value]) -> EvalResult {
    let min_arity = if op == "+" || op == "*" { 0 } else { 1 };
    if args.len() < min_arity {
        return Err(arity_error(op, "too few arguments"));
    }
    for arg in args {
        if as_number(arg).is_none() {
            return Err(TaskError::failure(
                FailureReason::InputValidationFailure,
                format!("'{}' expects numbers, got {}", op, arg.type_name()),
            ));
        }
    }

    if all_ints(args) {
        let ints: Vec<i64> = args
            .iter()
            .map(|a| match a {
                Value::Int(n) => *n,
                _ => unreachable!(),
            })
            .collect();
        let result = match op {
            "+" => ints.iter().sum::<i64>(),
            "*" => ints.iter().product::<i64>(),
            "-" => match ints.split_first() {
                Some((first, [])) => -first,
                Some((first, rest)) => rest.iter().fold(*first, |acc, n| acc - n),
                None => unreachable!(),
            },
            "/" => {
                let (first, rest) = ints.split_first().unwrap();
                if rest.is_empty() {
                    return Err(arity_error(op, "expects at least 2 arguments"));
                }
                let mut acc = *first;
                for n in rest {
                    if *n == 0 {
                        return Err(TaskError::failure(
                            FailureReason::UnexpectedError,
                            "division by zero",
                        ));
                    }
                    acc /= n;
                }
                acc
            }
            _ => unreachable!(),
        };
        return Ok(Value::Int(result));
    }

    let floats: Vec<f64> = args.iter().map(|a| as_number(a).unwrap()).collect();
    let result = match op {
        "+" => floats.iter().sum::<f64>(),
        "*" => floats.iter().product::<f64>(),
        "-" => match floats.split_first() {
            Some((first, [])) => -first,
            Some((first, rest)) => rest.iter().fold(*first, |acc, f| acc - f),
            None => unreachable!(),
        },
        "/" => {
            let (first, rest) = floats.split_first().unwrap();
            if rest.is_empty() {
                return Err(arity_error(op, "expects at least 2 arguments"));
            }
            let mut acc = *first;
            for f in rest {
                if *f == 0.0 {
                    return Err(TaskError::failure(
                        FailureReason::UnexpectedError,
                        "division by zero",
                    ));
                }
                acc /= f;
            }
            acc
        }
        _ => unreachable!(),
    };
    Ok(Value::Float(result))
}

fn compare(op: &str, args: &[Value]) -> EvalResult {
    if args.len() != 2 {
        return Err(arity_error(op, "expects exactly 2 arguments"));
    }
    let (a, b) = (&args[0], &args[1]);

    match op {
        "=" => Ok(Value::Bool(a == b)),
        "!=" => Ok(Value::Bool(a != b)),
        _ => {
            let (x, y) = match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    return Err(TaskError::failure(
                        FailureReason::InputValidationFailure,
                        format!(
                            "'{}' expects numbers, got {} and {}",
                            op,
                            a.type_name(),
                            b.type_name()
                        ),
                    ))
                }
            };
            let result = match op {
                "<" => x < y,
                ">" => x > y,
                "<=" => x <= y,
                ">=" => x >= y,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
    }
}
