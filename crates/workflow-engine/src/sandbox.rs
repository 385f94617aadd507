//! Sandboxed script evaluator.
//!
//! Runs untrusted node scripts through an embedded `rquickjs` runtime: a
//! pattern/global denylist rejects obviously dangerous scripts before
//! compilation, and explicit timeout/memory/call-stack bounds from
//! [`SandboxConfig`] keep a misbehaving script from blocking or exhausting
//! the host process.

use common::config::SandboxConfig;
use common::error::SandboxError;
use common::types::JsonValue;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Object, Runtime, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Substrings a script may not contain, checked before the engine ever sees it.
const FORBIDDEN_PATTERNS: &[&str] = &[
    "require(",
    "import(",
    "import ",
    "process.",
    "globalThis",
    "Function(",
    "new Function",
    "__proto__",
    "constructor.constructor",
    "WebAssembly",
];

/// Globals stripped from the context before the script runs, regardless of
/// whether `rquickjs`'s "full" feature set exposes them.
const FORBIDDEN_GLOBALS: &[&str] = &["eval", "Function", "require", "process", "WebAssembly"];

const MAX_INJECT_DEPTH: usize = 100;

/// Assembled once per script run and exposed to the script as `context`.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    pub trigger: JsonValue,
    pub steps: JsonValue,
    pub env: JsonValue,
    pub vars: JsonValue,
    pub input: JsonValue,
}

impl ScriptContext {
    fn to_json(&self) -> JsonValue {
        serde_json::json!({
            "trigger": self.trigger,
            "steps": self.steps,
            "env": self.env,
            "vars": self.vars,
            "input": self.input,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub value: JsonValue,
    pub console: Vec<String>,
}

/// Validates, compiles, and runs `script` against `context` under the
/// resource bounds in `config`. Blocking by construction (QuickJS is not
/// async); callers run this inside `tokio::task::spawn_blocking`.
pub fn run(
    script: &str,
    context: &ScriptContext,
    config: &SandboxConfig,
    timeout_ms: u64,
) -> Result<ScriptOutcome, SandboxError> {
    validate_script(script, config)?;

    let runtime = Runtime::new().map_err(|e| SandboxError::Compilation(e.to_string()))?;
    runtime.set_memory_limit((config.max_memory_mb * 1024 * 1024) as usize);
    runtime.set_max_stack_size(config.max_call_stack_size * 1024);

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_for_handler = interrupted.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || interrupted_for_handler.load(Ordering::Relaxed))));

    let timeout = Duration::from_millis(timeout_ms.min(config.max_timeout_ms));
    let watchdog_interrupted = interrupted.clone();
    let watchdog = std::thread::spawn(move || {
        std::thread::sleep(timeout);
        watchdog_interrupted.store(true, Ordering::Relaxed);
    });

    let js_context = Context::full(&runtime).map_err(|e| SandboxError::Compilation(e.to_string()))?;
    let console_buffer: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let outcome = js_context.with(|ctx| -> Result<ScriptOutcome, SandboxError> {
        strip_forbidden_globals(&ctx)?;
        install_console(&ctx, console_buffer.clone())?;
        inject_context(&ctx, context)?;

        let result: rquickjs::Result<Value> = ctx.eval(script);
        let value = result.catch(&ctx).map_err(|e| classify_js_error(&e.to_string()))?;
        let json = from_js_value(&ctx, &value, 0)?;
        Ok(ScriptOutcome { value: json, console: Vec::new() })
    });

    let timed_out = interrupted.load(Ordering::Relaxed);
    // The watchdog thread only ever sets the flag; it always exits promptly
    // once `timeout` elapses, so joining here never blocks meaningfully.
    let _ = watchdog.join();

    match outcome {
        Ok(mut ok) if timed_out => {
            ok.console = console_buffer.lock().unwrap().clone();
            Err(SandboxError::Timeout)
        }
        Ok(mut ok) => {
            ok.console = console_buffer.lock().unwrap().clone();
            Ok(ok)
        }
        Err(_) if timed_out => Err(SandboxError::Timeout),
        Err(e) => Err(e),
    }
}

fn validate_script(script: &str, config: &SandboxConfig) -> Result<(), SandboxError> {
    if script.trim().is_empty() {
        return Err(SandboxError::SandboxViolation("script is empty".to_string()));
    }
    if script.len() > config.max_script_length {
        return Err(SandboxError::ScriptTooLarge);
    }
    for pattern in FORBIDDEN_PATTERNS {
        if script.contains(pattern) {
            return Err(SandboxError::ForbiddenOperation(pattern.to_string()));
        }
    }
    Ok(())
}

fn strip_forbidden_globals(ctx: &Ctx<'_>) -> Result<(), SandboxError> {
    let globals = ctx.globals();
    for name in FORBIDDEN_GLOBALS {
        globals
            .set(*name, rquickjs::Undefined)
            .map_err(|e| SandboxError::SandboxViolation(format!("{name}: {e}")))?;
    }
    Ok(())
}

fn install_console(ctx: &Ctx<'_>, buffer: Arc<Mutex<Vec<String>>>) -> Result<(), SandboxError> {
    let console = Object::new(ctx.clone()).map_err(|e| SandboxError::Compilation(e.to_string()))?;
    for level in ["log", "info", "warn", "error", "debug", "trace"] {
        let buffer = buffer.clone();
        let level = level.to_string();
        let func = Function::new(ctx.clone(), move |msg: String| {
            buffer.lock().unwrap().push(format!("[{level}] {msg}"));
        })
        .map_err(|e| SandboxError::Compilation(e.to_string()))?;
        console.set(level.as_str(), func).map_err(|e| SandboxError::Compilation(e.to_string()))?;
    }
    ctx.globals()
        .set("console", console)
        .map_err(|e| SandboxError::Compilation(e.to_string()))
}

fn inject_context(ctx: &Ctx<'_>, context: &ScriptContext) -> Result<(), SandboxError> {
    let json = context.to_json();
    let value = to_js_value(ctx, &json, 0)?;
    ctx.globals()
        .set("context", value.clone())
        .map_err(|e| SandboxError::Extraction(e.to_string()))?;
    ctx.globals()
        .set("ctx", value)
        .map_err(|e| SandboxError::Extraction(e.to_string()))
}

fn to_js_value<'js>(ctx: &Ctx<'js>, value: &JsonValue, depth: usize) -> Result<Value<'js>, SandboxError> {
    if depth > MAX_INJECT_DEPTH {
        return Err(SandboxError::SandboxViolation("context exceeds max injection depth".to_string()));
    }
    match value {
        JsonValue::Null => Ok(Value::new_null(ctx.clone())),
        JsonValue::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        JsonValue::Number(n) => Ok(Value::new_number(ctx.clone(), n.as_f64().unwrap_or(0.0))),
        JsonValue::String(s) => {
            rquickjs::String::from_str(ctx.clone(), s)
                .map(|v| v.into_value())
                .map_err(|e| SandboxError::Extraction(e.to_string()))
        }
        JsonValue::Array(items) => {
            let arr = rquickjs::Array::new(ctx.clone()).map_err(|e| SandboxError::Extraction(e.to_string()))?;
            for (i, item) in items.iter().enumerate() {
                let js_item = to_js_value(ctx, item, depth + 1)?;
                arr.set(i, js_item).map_err(|e| SandboxError::Extraction(e.to_string()))?;
            }
            Ok(arr.into_value())
        }
        JsonValue::Object(map) => {
            let obj = Object::new(ctx.clone()).map_err(|e| SandboxError::Extraction(e.to_string()))?;
            for (key, item) in map.iter() {
                let js_item = to_js_value(ctx, item, depth + 1)?;
                obj.set(key.as_str(), js_item).map_err(|e| SandboxError::Extraction(e.to_string()))?;
            }
            Ok(obj.into_value())
        }
    }
}

fn from_js_value(ctx: &Ctx<'_>, value: &Value<'_>, depth: usize) -> Result<JsonValue, SandboxError> {
    if depth > MAX_INJECT_DEPTH {
        return Err(SandboxError::Extraction("result exceeds max extraction depth".to_string()));
    }
    if value.is_null() || value.is_undefined() {
        return Ok(JsonValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(JsonValue::Bool(b));
    }
    if let Some(n) = value.as_float() {
        return Ok(serde_json::Number::from_f64(n).map(JsonValue::Number).unwrap_or(JsonValue::Null));
    }
    if let Some(n) = value.as_int() {
        return Ok(JsonValue::Number(n.into()));
    }
    if let Some(s) = value.as_string() {
        let s = s.to_string().map_err(|e| SandboxError::Extraction(e.to_string()))?;
        return Ok(JsonValue::String(s));
    }
    if let Some(arr) = value.as_array() {
        let mut out = Vec::with_capacity(arr.len());
        for item in arr.iter::<Value>() {
            let item = item.map_err(|e| SandboxError::Extraction(e.to_string()))?;
            out.push(from_js_value(ctx, &item, depth + 1)?);
        }
        return Ok(JsonValue::Array(out));
    }
    if let Some(obj) = value.as_object() {
        let mut map = serde_json::Map::new();
        for key in obj.keys::<String>() {
            let key = key.map_err(|e| SandboxError::Extraction(e.to_string()))?;
            let item: Value = obj.get(key.as_str()).map_err(|e| SandboxError::Extraction(e.to_string()))?;
            map.insert(key, from_js_value(ctx, &item, depth + 1)?);
        }
        return Ok(JsonValue::Object(map));
    }
    Ok(JsonValue::Null)
}

fn classify_js_error(message: &str) -> SandboxError {
    let lower = message.to_lowercase();
    if lower.contains("stack") && lower.contains("overflow") {
        SandboxError::StackOverflow
    } else if lower.contains("out of memory") {
        SandboxError::MemoryLimitExceeded
    } else if lower.contains("interrupted") {
        SandboxError::Timeout
    } else {
        SandboxError::Execution(message.to_string())
    }
}
