use anyhow::{Context as AnyhowContext, Result};
use rquickjs::context::EvalOptions;
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};
use serde_json::Value as JsonValue;

/// JavaScript engine backed by QuickJS.
///
/// Owns one runtime/context pair and wires a minimal `console` that forwards
/// to Rust tracing. One engine exists per isolation context, plus throwaway
/// engines for isolated cross-origin loads.
pub struct ScriptEngine {
    runtime: Runtime,
    context: Context,
}

impl ScriptEngine {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self { runtime, context };
        engine.init_console()?;
        Ok(engine)
    }

    /// Evaluate a script and discard the result.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate a script and deserialize the result into `V`.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = Self::with_source_url(source, filename);
        // Sandboxed bodies rely on sloppy-mode scoping (`with`), so evaluation
        // must not force strict mode.
        let eval_result = self.context.with(|ctx| {
            let mut options = EvalOptions::default();
            options.global = true;
            options.strict = false;
            ctx.eval_with_options::<V, _>(script.clone(), options)
        });

        let value = match eval_result {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => {
                let message = self
                    .context
                    .with(|ctx| -> Result<Option<String>, JsError> {
                        Ok(capture_exception_message(&ctx))
                    })
                    .unwrap_or(None)
                    .unwrap_or_else(|| "QuickJS exception".to_string());
                Err(anyhow::anyhow!(message))
            }
            Err(err) => Err(anyhow::Error::from(err)),
        }?;

        // Promise continuations and other microtasks queued by the script
        // must settle before control returns to the host.
        self.drain_jobs()?;

        Ok(value)
    }

    /// Execute pending jobs (promise continuations, microtasks) until the
    /// queue is empty. Returns whether any job ran.
    pub fn drain_jobs(&self) -> Result<bool> {
        const MAX_JOBS: usize = 1000;
        let mut ran = 0usize;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    ran += 1;
                    if ran >= MAX_JOBS {
                        tracing::warn!(
                            target: "sandbox",
                            "stopped draining jobs after {} iterations",
                            MAX_JOBS
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_error) => {
                    tracing::error!(target: "sandbox", "job execution error: {:?}", job_error);
                    break;
                }
            }
        }

        Ok(ran > 0)
    }

    /// Access the underlying QuickJS context for advanced integrations.
    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(f).map_err(anyhow::Error::from)
    }

    /// Install a JSON value as a property of the engine's global object.
    pub fn set_global_json(&self, key: &str, value: &JsonValue) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        self.with_context(|ctx| {
            let parsed = ctx.json_parse(serialized.as_bytes())?;
            ctx.globals().set(key, parsed)
        })
    }

    /// Read a global property back as JSON. `undefined` maps to `None`.
    pub fn get_global_json(&self, key: &str) -> Result<Option<JsonValue>> {
        let serialized = self.with_context(|ctx| {
            let value: Value = ctx.globals().get(key)?;
            if value.is_undefined() {
                return Ok(None);
            }
            match ctx.json_stringify(value)? {
                Some(text) => Ok(Some(text.to_string()?)),
                None => Ok(None),
            }
        })?;
        match serialized {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn init_console(&self) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn = Function::new(ctx.clone(), log_from_js)?.with_name("__mosaic_log")?;
                global.set("__mosaic_log", log_fn)?;
                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
        let mut script = String::with_capacity(source.len() + filename.len() + 32);
        script.push_str(source);
        if !source.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("//# sourceURL=");
        script.push_str(filename);
        script.push('\n');
        script.into_bytes()
    }
}

fn log_from_js(message: String) -> rquickjs::Result<()> {
    tracing::info!(target = "sandbox", message = %message);
    Ok(())
}

fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            if let Ok(stack) = obj.get::<_, String>("stack") {
                return Some(format!("Error: {}\nStack: {}", message, stack));
            }
            return Some(format!("Error: {}", message));
        }
    }

    Some(format!("{:?}", exception))
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logImpl = (...args) => {
        try {
            const joined = args.map(stringify).join(' ');
            global.__mosaic_log(joined);
        } catch (err) {
            // Swallow logging errors; console must never throw.
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = logImpl;
    global.console.error = logImpl;
    global.console.warn = logImpl;
    global.console.info = logImpl;
    global.console.debug = logImpl;
})();
"#;
