//! Expressions, conditions and scripts, evaluated by an embedded QuickJS
//! engine.
//!
//! ```text
//! $json.status == "ok" && $json.count > 3
//! contains($json.tags, "urgent")
//! $item.price * 2
//! {{ $trigger.user.email }}
//! ```
//!
//! Every expression is JavaScript. The globals are `$json` (merged input),
//! `$input` (ordered inputs), `$trigger` (the run's trigger payload),
//! `$node` (outputs of completed nodes by id) and, inside `filter` and
//! `loop`, `$item` and `$index`. A small helper library (`len`, `contains`,
//! `startsWith`, `endsWith`, `lower`, `upper`, `isEmpty`, `number`,
//! `string`) is preloaded.
//!
//! A [`Sandbox`] starts its runtime lazily, the first time something
//! actually needs evaluating, and shares one time budget across everything
//! it evaluates. The runtime also caps heap size and native stack depth, so
//! runaway or deeply nested scripts fail with an [`EvalError`] instead of
//! taking the process down.

use regex::Regex;
use rquickjs::{Context, Ctx, Exception, FromJs, Runtime};
use serde_json::{Map, Value as JsonValue};
use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static TEMPLATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(.*?)\s*\}\}").unwrap_or_else(|_| unreachable!("pattern is a literal"))
});

static RETURN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\breturn\b").unwrap_or_else(|_| unreachable!("pattern is a literal"))
});

const PRELUDE: &str = r#"
function len(v) {
  if (v == null) return 0;
  if (typeof v === "string" || Array.isArray(v)) return v.length;
  if (typeof v === "object") return Object.keys(v).length;
  return 0;
}
function contains(haystack, needle) {
  if (haystack == null) return false;
  if (typeof haystack === "string") return haystack.includes(String(needle));
  if (Array.isArray(haystack)) {
    const wanted = JSON.stringify(needle);
    return haystack.some((x) => x === needle || JSON.stringify(x) === wanted);
  }
  if (typeof haystack === "object") return Object.prototype.hasOwnProperty.call(haystack, needle);
  return false;
}
function startsWith(s, prefix) { return String(s ?? "").startsWith(String(prefix)); }
function endsWith(s, suffix) { return String(s ?? "").endsWith(String(suffix)); }
function lower(s) { return String(s ?? "").toLowerCase(); }
function upper(s) { return String(s ?? "").toUpperCase(); }
function isEmpty(v) { return v == null || len(v) === 0; }
function number(v) {
  const n = Number(v);
  if (Number.isNaN(n)) throw new TypeError("cannot convert " + JSON.stringify(v) + " to a number");
  return n;
}
function string(v) { return v == null ? "" : typeof v === "string" ? v : JSON.stringify(v); }
"#;

const COMPILED: &str = "globalThis.__flowforge_compiled";

/// A parse or evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    /// The offending expression source.
    pub expression: String,
    /// What went wrong.
    pub reason: String,
}

impl EvalError {
    fn new(expression: &str, reason: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot evaluate `{}`: {}", self.expression, self.reason)
    }
}

impl std::error::Error for EvalError {}

/// Resource caps for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    /// Wall-clock budget shared by everything one sandbox evaluates.
    pub time_budget: Duration,
    /// JavaScript heap limit in bytes.
    pub memory_limit: usize,
    /// Native stack the engine may use, in bytes.
    pub max_stack_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(1),
            memory_limit: 32 * 1024 * 1024,
            max_stack_size: 256 * 1024,
        }
    }
}

/// The values an expression can see.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    json: &'a JsonValue,
    input: &'a [JsonValue],
    trigger: &'a JsonValue,
    nodes: Option<&'a HashMap<String, JsonValue>>,
}

const NULL: JsonValue = JsonValue::Null;

impl<'a> Scope<'a> {
    /// Creates a scope where `$json` is `json` and everything else is empty.
    #[must_use]
    pub fn new(json: &'a JsonValue) -> Self {
        Self {
            json,
            input: &[],
            trigger: &NULL,
            nodes: None,
        }
    }

    /// Binds `$input`.
    #[must_use]
    pub fn with_inputs(mut self, input: &'a [JsonValue]) -> Self {
        self.input = input;
        self
    }

    /// Binds `$trigger`.
    #[must_use]
    pub fn with_trigger(mut self, trigger: &'a JsonValue) -> Self {
        self.trigger = trigger;
        self
    }

    /// Binds `$node`.
    #[must_use]
    pub fn with_nodes(mut self, nodes: &'a HashMap<String, JsonValue>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    fn bindings(&self) -> String {
        let nodes = self.nodes.map_or_else(
            || JsonValue::Object(Map::new()),
            |nodes| {
                JsonValue::Object(nodes.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            },
        );
        format!(
            "globalThis.$json = {};\nglobalThis.$input = {};\nglobalThis.$trigger = {};\nglobalThis.$node = {};\n",
            js_literal(self.json),
            js_literal(&JsonValue::Array(self.input.to_vec())),
            js_literal(self.trigger),
            js_literal(&nodes),
        )
    }
}

/// A JavaScript expression producing `value`.
///
/// Goes through `JSON.parse` so keys such as `__proto__` stay plain data.
fn js_literal(value: &JsonValue) -> String {
    format!("JSON.parse({})", JsonValue::String(value.to_string()))
}

fn strip_braces(source: &str) -> &str {
    let trimmed = source.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map_or(trimmed, str::trim)
}

/// Function body returning the value of expression `source`.
fn expression_body(source: &str) -> String {
    let source = strip_braces(source).trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    format!("return (\n{source}\n);")
}

struct JsEngine {
    context: Context,
    _runtime: Runtime,
    deadline: Instant,
    budget: Duration,
}

impl JsEngine {
    fn start(scope: &Scope<'_>, limits: &ScriptLimits) -> Result<Self, String> {
        let runtime = Runtime::new().map_err(|e| format!("cannot start script runtime: {e}"))?;
        runtime.set_memory_limit(limits.memory_limit);
        runtime.set_max_stack_size(limits.max_stack_size);
        let deadline = Instant::now() + limits.time_budget;
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));
        let context =
            Context::full(&runtime).map_err(|e| format!("cannot start script context: {e}"))?;

        let engine = Self {
            context,
            _runtime: runtime,
            deadline,
            budget: limits.time_budget,
        };
        engine.exec(&format!("{PRELUDE}\n{}", scope.bindings()))?;
        Ok(engine)
    }

    fn exec(&self, source: &str) -> Result<(), String> {
        self.context.with(|ctx| {
            ctx.eval::<(), _>(source)
                .map_err(|error| self.describe(&ctx, &error))
        })
    }

    /// Runs `source` and parses the JSON text it evaluates to.
    fn json(&self, source: &str) -> Result<JsonValue, String> {
        let text = self.context.with(|ctx| {
            ctx.eval::<String, _>(source)
                .map_err(|error| self.describe(&ctx, &error))
        })?;
        serde_json::from_str(&text).map_err(|e| format!("result is not JSON: {e}"))
    }

    /// Defines the function that [`Self::call_compiled`] runs.
    fn compile(&self, body: &str) -> Result<(), String> {
        self.exec(&format!("{COMPILED} = function () {{\n{body}\n}};"))
    }

    fn call_compiled(&self, prologue: &str) -> Result<JsonValue, String> {
        self.json(&format!(
            "{prologue}\nJSON.stringify({COMPILED}() ?? null) ?? \"null\""
        ))
    }

    fn describe(&self, ctx: &Ctx<'_>, error: &rquickjs::Error) -> String {
        if Instant::now() >= self.deadline {
            return format!(
                "script exceeded its time budget of {} ms",
                self.budget.as_millis()
            );
        }
        if !matches!(error, rquickjs::Error::Exception) {
            return error.to_string();
        }
        let thrown = ctx.catch();
        match Exception::from_js(ctx, thrown.clone()) {
            Ok(exception) => exception
                .message()
                .unwrap_or_else(|| "uncaught exception".to_string()),
            Err(_) => thrown
                .as_string()
                .and_then(|s| s.to_string().ok())
                .unwrap_or_else(|| "uncaught exception".to_string()),
        }
    }
}

/// Evaluates expressions against one [`Scope`].
///
/// Not `Send`: create it, use it and drop it without awaiting in between.
pub struct Sandbox<'a> {
    scope: Scope<'a>,
    limits: ScriptLimits,
    engine: OnceCell<JsEngine>,
}

impl<'a> Sandbox<'a> {
    #[must_use]
    pub fn new(scope: Scope<'a>, limits: ScriptLimits) -> Self {
        Self {
            scope,
            limits,
            engine: OnceCell::new(),
        }
    }

    fn engine(&self, source: &str) -> Result<&JsEngine, EvalError> {
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }
        let engine =
            JsEngine::start(&self.scope, &self.limits).map_err(|e| EvalError::new(source, e))?;
        Ok(self.engine.get_or_init(|| engine))
    }

    /// Evaluates one expression. Surrounding `{{ }}` are optional.
    ///
    /// # Errors
    ///
    /// Syntax errors, thrown exceptions, non-serializable results and an
    /// exhausted budget.
    pub fn evaluate(&self, source: &str) -> Result<JsonValue, EvalError> {
        let engine = self.engine(source)?;
        engine
            .compile(&expression_body(source))
            .and_then(|()| engine.call_compiled(""))
            .map_err(|reason| EvalError::new(source, reason))
    }

    /// Evaluates `source` and applies JavaScript truthiness.
    ///
    /// # Errors
    ///
    /// As [`Self::evaluate`].
    pub fn condition(&self, source: &str) -> Result<bool, EvalError> {
        let engine = self.engine(source)?;
        engine
            .compile(&condition_body(source))
            .and_then(|()| engine.call_compiled(""))
            .map(|value| value.as_bool().unwrap_or(false))
            .map_err(|reason| EvalError::new(source, reason))
    }

    /// Keeps the items for which `condition` holds.
    ///
    /// # Errors
    ///
    /// The first failing evaluation.
    pub fn filter_items(
        &self,
        condition: &str,
        items: Vec<JsonValue>,
    ) -> Result<Vec<JsonValue>, EvalError> {
        let mut kept = Vec::with_capacity(items.len());
        self.each_item(condition, &condition_body(condition), &items, |item, value| {
            if value.as_bool().unwrap_or(false) {
                kept.push(item.clone());
            }
        })?;
        Ok(kept)
    }

    /// Evaluates `expression` once per item.
    ///
    /// # Errors
    ///
    /// The first failing evaluation.
    pub fn map_items(
        &self,
        expression: &str,
        items: &[JsonValue],
    ) -> Result<Vec<JsonValue>, EvalError> {
        let mut mapped = Vec::with_capacity(items.len());
        self.each_item(expression, &expression_body(expression), items, |_, value| {
            mapped.push(value);
        })?;
        Ok(mapped)
    }

    fn each_item(
        &self,
        source: &str,
        body: &str,
        items: &[JsonValue],
        mut visit: impl FnMut(&JsonValue, JsonValue),
    ) -> Result<(), EvalError> {
        if items.is_empty() {
            return Ok(());
        }
        let engine = self.engine(source)?;
        let fail = |reason| EvalError::new(source, reason);
        engine.compile(body).map_err(fail)?;
        for (index, item) in items.iter().enumerate() {
            let prologue = format!(
                "globalThis.$item = {};\nglobalThis.$index = {index};",
                js_literal(item)
            );
            let value = engine.call_compiled(&prologue).map_err(fail)?;
            visit(item, value);
        }
        Ok(())
    }

    /// Runs a `code` node's script.
    ///
    /// Code containing `return` is a function body; anything else is a
    /// single expression.
    ///
    /// # Errors
    ///
    /// As [`Self::evaluate`].
    pub fn run_code(&self, code: &str) -> Result<JsonValue, EvalError> {
        if !RETURN_PATTERN.is_match(code) {
            return self.evaluate(code);
        }
        let engine = self.engine(code)?;
        engine
            .compile(code)
            .and_then(|()| engine.call_compiled(""))
            .map_err(|reason| EvalError::new(code, reason))
    }

    /// Replaces every `{{ expr }}` in `template` with the expression's value.
    ///
    /// Strings are inserted bare, `null` as nothing, other values as compact
    /// JSON. A template without placeholders never starts the engine.
    ///
    /// # Errors
    ///
    /// The first failing expression.
    pub fn render_template(&self, template: &str) -> Result<String, EvalError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in TEMPLATE_PATTERN.captures_iter(template) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            let value = self.evaluate(inner.as_str())?;
            out.push_str(&to_display_string(&value));
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Renders templates inside every string of a JSON value.
    ///
    /// A string that is exactly one `{{ expr }}` is replaced by the typed
    /// value of the expression rather than its string form.
    ///
    /// # Errors
    ///
    /// The first failing expression.
    pub fn resolve_value(&self, value: &JsonValue) -> Result<JsonValue, EvalError> {
        match value {
            JsonValue::String(s) => {
                if let Some(caps) = TEMPLATE_PATTERN.captures(s)
                    && caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len())
                    && let Some(inner) = caps.get(1)
                {
                    return self.evaluate(inner.as_str());
                }
                self.render_template(s).map(JsonValue::String)
            }
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            JsonValue::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
                .collect::<Result<Map<_, _>, EvalError>>()
                .map(JsonValue::Object),
            other => Ok(other.clone()),
        }
    }
}

fn condition_body(source: &str) -> String {
    let source = strip_braces(source).trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    format!("return Boolean(\n{source}\n);")
}

/// Combines predecessor outputs into the single `$json` value.
///
/// No inputs is `null`; one input is itself; several objects are merged
/// shallowly with later inputs winning; anything else becomes an array.
#[must_use]
pub fn merge_inputs(inputs: &[JsonValue]) -> JsonValue {
    match inputs {
        [] => JsonValue::Null,
        [single] => single.clone(),
        many if many.iter().all(JsonValue::is_object) => {
            let mut merged = Map::new();
            for input in many {
                if let JsonValue::Object(map) = input {
                    merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            JsonValue::Object(merged)
        }
        many => JsonValue::Array(many.to_vec()),
    }
}

/// Equality where numbers compare by value regardless of representation.
#[must_use]
pub fn loose_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (JsonValue::Array(x), JsonValue::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| loose_eq(l, r))
        }
        _ => a == b,
    }
}

/// Follows a dotted path (`a.b.0.c`) into a value.
#[must_use]
pub fn lookup_path<'v>(value: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn to_display_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
