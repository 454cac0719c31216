use std::rc::Rc;

use rquickjs::Function;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::error;

use crate::sandbox::engine::ScriptEngine;
use crate::sandbox::globals::VirtualGlobals;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// The body failed the brace-balance pre-check; nothing was executed.
    #[error("script body rejected by syntax guard: {0}")]
    SyntaxGuard(String),
    #[error("script execution failed: {0}")]
    Execution(String),
}

/// Run a script body against an isolation context.
///
/// The body sees exactly `window`, `document`, `location`, `history` and the
/// injected bindings; every other bare identifier resolves through the window
/// surrogate. Settles once the body's synchronous effects (including queued
/// microtasks) have completed.
pub fn run_in_sandbox(
    globals: &Rc<VirtualGlobals>,
    body: &str,
    bindings: &[(String, JsonValue)],
    filename: &str,
) -> Result<(), ScriptError> {
    check_brace_balance(body)?;

    let mut bound = serde_json::Map::new();
    let mut declarations = String::new();
    for (name, value) in bindings {
        bound.insert(name.clone(), value.clone());
        declarations.push_str(&format!("const {name} = __mosaic_bindings[{name:?}];\n"));
    }
    globals
        .engine()
        .set_global_json("__mosaic_bindings_data", &JsonValue::Object(bound))
        .map_err(|err| ScriptError::Execution(err.to_string()))?;

    let wrapped = format!(
        "(function(window, document, location, history, __mosaic_bindings) {{\n\
         with (window) {{\n{declarations}{body}\n}}\n\
         }})(__mosaic_env.window, __mosaic_env.document, __mosaic_env.location, \
         __mosaic_env.history, globalThis.__mosaic_bindings_data);"
    );

    globals
        .engine()
        .eval(&wrapped, filename)
        .map_err(|err| ScriptError::Execution(err.to_string()))
}

/// Reject script bodies whose braces do not balance. An unmatched closing
/// brace could prematurely close the wrapper scope and escape isolation, so
/// it fails before any evaluation. String literals, template literals
/// (including nested interpolations), comments, and regex literals are
/// skipped.
pub fn check_brace_balance(src: &str) -> Result<(), ScriptError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Code,
        Single,
        Double,
        Template,
    }

    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut stack: Vec<Mode> = vec![Mode::Code];
    let mut interp_depths: Vec<i64> = Vec::new();
    let mut depth: i64 = 0;
    // Last significant byte, used to tell regex literals from division.
    let mut last_code: u8 = 0;
    let mut i = 0usize;

    while i < len {
        let c = bytes[i];
        match *stack.last().expect("mode stack never empty") {
            Mode::Code => match c {
                b'{' => {
                    depth += 1;
                    last_code = c;
                }
                b'}' => {
                    if stack.len() > 1 && interp_depths.last() == Some(&depth) {
                        interp_depths.pop();
                        stack.pop();
                    } else {
                        depth -= 1;
                        if depth < 0 {
                            return Err(ScriptError::SyntaxGuard(
                                "unmatched closing brace".to_string(),
                            ));
                        }
                        last_code = c;
                    }
                }
                b'\'' => stack.push(Mode::Single),
                b'"' => stack.push(Mode::Double),
                b'`' => stack.push(Mode::Template),
                b'/' if i + 1 < len && bytes[i + 1] == b'/' => {
                    while i < len && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if i + 1 < len && bytes[i + 1] == b'*' => {
                    i += 2;
                    while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                        i += 1;
                    }
                    i += 1;
                }
                b'/' if regex_can_start(last_code) => {
                    i = skip_regex(bytes, i);
                    last_code = b'/';
                }
                _ => {
                    if !c.is_ascii_whitespace() {
                        last_code = c;
                    }
                }
            },
            Mode::Single => match c {
                b'\\' => i += 1,
                b'\'' | b'\n' => {
                    stack.pop();
                    last_code = c;
                }
                _ => {}
            },
            Mode::Double => match c {
                b'\\' => i += 1,
                b'"' | b'\n' => {
                    stack.pop();
                    last_code = c;
                }
                _ => {}
            },
            Mode::Template => match c {
                b'\\' => i += 1,
                b'`' => {
                    stack.pop();
                    last_code = c;
                }
                b'$' if i + 1 < len && bytes[i + 1] == b'{' => {
                    stack.push(Mode::Code);
                    interp_depths.push(depth);
                    i += 1;
                }
                _ => {}
            },
        }
        i += 1;
    }

    if depth != 0 {
        return Err(ScriptError::SyntaxGuard(format!(
            "unbalanced braces (depth {depth} at end of input)"
        )));
    }
    Ok(())
}

/// A `/` begins a regex (not division) when the previous significant byte
/// cannot end an expression.
fn regex_can_start(last_code: u8) -> bool {
    !matches!(last_code,
        b')' | b']' | b'}'
    ) && !last_code.is_ascii_alphanumeric()
        && last_code != b'_'
        && last_code != b'$'
        || last_code == 0
}

fn skip_regex(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    let mut in_class = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'[' => in_class = true,
            b']' => in_class = false,
            b'/' if !in_class => return i,
            b'\n' => return i,
            _ => {}
        }
        i += 1;
    }
    bytes.len().saturating_sub(1)
}

/// Install the host functions and proxy bootstrap that expose one isolation
/// context's surrogate graph inside its engine. Called once per context.
pub fn install_sandbox_bindings(
    engine: &ScriptEngine,
    globals: &Rc<VirtualGlobals>,
) -> anyhow::Result<()> {
    let window = Rc::clone(globals.window());
    let document = Rc::clone(globals.document());
    let history = Rc::clone(globals.history());
    let location = Rc::clone(globals.location());

    engine.with_context(|ctx| {
        let global = ctx.globals();

        {
            let window = Rc::clone(&window);
            let func = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<Option<String>> {
                Ok(window.get(&key).map(|value| value.to_string()))
            })?
            .with_name("__mosaic_window_get")?;
            global.set("__mosaic_window_get", func)?;
        }

        {
            let window = Rc::clone(&window);
            let func = Function::new(ctx.clone(), move |key: String, payload: String| -> rquickjs::Result<()> {
                match serde_json::from_str(&payload) {
                    Ok(value) => window.set(&key, value),
                    Err(err) => error!(target: "sandbox", %key, %err, "dropping unserializable window property"),
                }
                Ok(())
            })?
            .with_name("__mosaic_window_set")?;
            global.set("__mosaic_window_set", func)?;
        }

        {
            let window = Rc::clone(&window);
            let func = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<()> {
                window.delete(&key);
                Ok(())
            })?
            .with_name("__mosaic_window_delete")?;
            global.set("__mosaic_window_delete", func)?;
        }

        {
            let document = Rc::clone(&document);
            let func = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<Option<String>> {
                Ok(document.get(&key).map(|value| value.to_string()))
            })?
            .with_name("__mosaic_document_get")?;
            global.set("__mosaic_document_get", func)?;
        }

        {
            let document = Rc::clone(&document);
            let func = Function::new(ctx.clone(), move |key: String, payload: String| -> rquickjs::Result<()> {
                match serde_json::from_str(&payload) {
                    Ok(value) => document.set(&key, value),
                    Err(err) => error!(target: "sandbox", %key, %err, "dropping unserializable document property"),
                }
                Ok(())
            })?
            .with_name("__mosaic_document_set")?;
            global.set("__mosaic_document_set", func)?;
        }

        {
            let document = Rc::clone(&document);
            let func = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<()> {
                document.delete(&key);
                Ok(())
            })?
            .with_name("__mosaic_document_delete")?;
            global.set("__mosaic_document_delete", func)?;
        }

        {
            let location = Rc::clone(&location);
            let func = Function::new(ctx.clone(), move || -> rquickjs::Result<String> {
                Ok(serde_json::to_string(&location.info()).unwrap_or_else(|_| "{}".to_string()))
            })?
            .with_name("__mosaic_location_get")?;
            global.set("__mosaic_location_get", func)?;
        }

        {
            let history = Rc::clone(&history);
            let func = Function::new(
                ctx.clone(),
                move |method: String, arg: Option<String>| -> rquickjs::Result<Option<String>> {
                    match method.as_str() {
                        "pushState" => {
                            if let Some(url) = arg {
                                history.push_state(&url);
                            }
                        }
                        "replaceState" => {
                            if let Some(url) = arg {
                                history.replace_state(&url);
                            }
                        }
                        "back" => history.back(),
                        "forward" => history.forward(),
                        "go" => {
                            let delta = arg.and_then(|raw| raw.parse::<i64>().ok()).unwrap_or(0);
                            history.go(delta);
                        }
                        "length" => return Ok(Some(history.len().to_string())),
                        other => {
                            error!(target: "sandbox", method = %other, "unknown history call");
                        }
                    }
                    Ok(None)
                },
            )?
            .with_name("__mosaic_history_call")?;
            global.set("__mosaic_history_call", func)?;
        }

        ctx.eval::<(), _>(SANDBOX_BOOTSTRAP.as_bytes())
    })
}

/// JS side of the bridge: proxies whose traps call back into the Rust
/// surrogate graph. Property values cross the boundary as JSON.
const SANDBOX_BOOTSTRAP: &str = r#"
(() => {
    const parse = (raw) => raw == null ? undefined : JSON.parse(raw);
    const pack = (value) => {
        const payload = JSON.stringify(value);
        return payload === undefined ? 'null' : payload;
    };

    // Engine intrinsics stay reachable as bare identifiers inside the
    // sandbox wrapper; everything else routes through the window surrogate.
    const INTRINSICS = new Set([
        'globalThis', 'undefined', 'NaN', 'Infinity', 'arguments', 'eval',
        'Object', 'Function', 'Array', 'String', 'Number', 'Boolean',
        'Symbol', 'Math', 'JSON', 'Date', 'RegExp', 'Promise', 'Proxy',
        'Reflect', 'Map', 'Set', 'WeakMap', 'WeakSet', 'Error', 'TypeError',
        'RangeError', 'SyntaxError', 'ReferenceError', 'EvalError',
        'URIError', 'parseInt', 'parseFloat', 'isNaN', 'isFinite',
        'encodeURIComponent', 'decodeURIComponent', 'encodeURI', 'decodeURI',
        'console', 'Intl', 'BigInt', 'ArrayBuffer', 'Uint8Array',
        'Int8Array', 'Uint16Array', 'Int16Array', 'Uint32Array',
        'Int32Array', 'Float32Array', 'Float64Array', 'DataView',
    ]);

    const historyObject = {
        pushState(state, title, url) {
            if (url !== undefined && url !== null) {
                __mosaic_history_call('pushState', String(url));
            }
        },
        replaceState(state, title, url) {
            if (url !== undefined && url !== null) {
                __mosaic_history_call('replaceState', String(url));
            }
        },
        back() { __mosaic_history_call('back', null); },
        forward() { __mosaic_history_call('forward', null); },
        go(delta) { __mosaic_history_call('go', String(delta ?? 0)); },
        get length() { return Number(__mosaic_history_call('length', null)); },
    };

    const locationProxy = new Proxy({}, {
        get(target, key) {
            if (typeof key !== 'string') {
                return undefined;
            }
            const info = JSON.parse(__mosaic_location_get());
            return info[key];
        },
    });

    const documentProxy = new Proxy({}, {
        get(target, key) {
            if (typeof key !== 'string') {
                return undefined;
            }
            return parse(__mosaic_document_get(key));
        },
        set(target, key, value) {
            if (typeof key === 'string') {
                __mosaic_document_set(key, pack(value));
            }
            return true;
        },
        deleteProperty(target, key) {
            if (typeof key === 'string') {
                __mosaic_document_delete(key);
            }
            return true;
        },
    });

    const windowProxy = new Proxy({}, {
        get(target, key) {
            if (typeof key !== 'string') {
                return undefined;
            }
            if (key === 'window' || key === 'self' || key === 'top') {
                return windowProxy;
            }
            if (key === 'document') { return documentProxy; }
            if (key === 'location') { return locationProxy; }
            if (key === 'history') { return historyObject; }
            if (key === 'console') { return globalThis.console; }
            return parse(__mosaic_window_get(key));
        },
        set(target, key, value) {
            if (typeof key === 'string') {
                __mosaic_window_set(key, pack(value));
            }
            return true;
        },
        deleteProperty(target, key) {
            if (typeof key === 'string') {
                __mosaic_window_delete(key);
            }
            return true;
        },
        has(target, key) {
            if (typeof key !== 'string') {
                return false;
            }
            if (key.startsWith('__mosaic')) {
                return false;
            }
            if (INTRINSICS.has(key)) {
                return false;
            }
            return true;
        },
    });

    globalThis.__mosaic_env = {
        window: windowProxy,
        document: documentProxy,
        location: locationProxy,
        history: historyObject,
    };
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_bodies_pass() {
        check_brace_balance("function a() { return { b: 1 }; }").expect("balanced");
        check_brace_balance("const s = \"}\"; const t = '{';").expect("strings skipped");
        check_brace_balance("const t = `a ${ {b: 1}.b } c`;").expect("template interp");
        check_brace_balance("// }\n/* } */ const x = 1;").expect("comments skipped");
        check_brace_balance("const r = /}/g;").expect("regex skipped");
    }

    #[test]
    fn unmatched_closing_brace_is_rejected() {
        let err = check_brace_balance("}) ; hijack(); ((function(){").unwrap_err();
        assert!(matches!(err, ScriptError::SyntaxGuard(_)));
    }

    #[test]
    fn unterminated_block_is_rejected() {
        let err = check_brace_balance("function a() { if (x) {").unwrap_err();
        assert!(matches!(err, ScriptError::SyntaxGuard(_)));
    }
}
