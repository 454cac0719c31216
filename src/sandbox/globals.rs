use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::path::{host_location, resolve_path, LocationInfo};
use crate::sandbox::engine::ScriptEngine;
use crate::scope::Scope;

/// A flat property table standing in for one real global object.
#[derive(Default)]
pub struct GlobalTable {
    values: RefCell<HashMap<String, JsonValue>>,
}

impl GlobalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.values.borrow().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: JsonValue) {
        self.values.borrow_mut().insert(key.to_string(), value);
    }

    pub fn delete(&self, key: &str) {
        self.values.borrow_mut().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.borrow().contains_key(key)
    }

    pub fn clear(&self) {
        self.values.borrow_mut().clear();
    }
}

/// Layered lookup over a wrapped table: reads check the override map first,
/// then fall through to the wrapped target; writes and deletes follow the
/// same precedence.
pub struct LayeredObject {
    overrides: RefCell<HashMap<String, JsonValue>>,
    base: Rc<GlobalTable>,
}

impl LayeredObject {
    pub fn new(base: Rc<GlobalTable>, overrides: HashMap<String, JsonValue>) -> Self {
        Self {
            overrides: RefCell::new(overrides),
            base,
        }
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        if let Some(value) = self.overrides.borrow().get(key) {
            return Some(value.clone());
        }
        self.base.get(key)
    }

    pub fn set(&self, key: &str, value: JsonValue) {
        if self.overrides.borrow().contains_key(key) {
            self.overrides.borrow_mut().insert(key.to_string(), value);
        } else {
            self.base.set(key, value);
        }
    }

    pub fn delete(&self, key: &str) {
        if self.overrides.borrow_mut().remove(key).is_none() {
            self.base.delete(key);
        }
    }

    pub fn override_key(&self, key: &str, value: JsonValue) {
        self.overrides.borrow_mut().insert(key.to_string(), value);
    }

    pub fn clear_override(&self, key: &str) {
        self.overrides.borrow_mut().remove(key);
    }
}

/// Session-style navigation history: an entry stack plus a cursor.
pub struct HistoryStack {
    entries: Vec<String>,
    index: usize,
}

impl HistoryStack {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            entries: vec![href.into()],
            index: 0,
        }
    }

    pub fn current(&self) -> &str {
        &self.entries[self.index]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_state(&mut self, href: impl Into<String>) {
        self.entries.truncate(self.index + 1);
        self.entries.push(href.into());
        self.index += 1;
    }

    pub fn replace_state(&mut self, href: impl Into<String>) {
        self.entries[self.index] = href.into();
    }

    pub fn back(&mut self) {
        self.index = self.index.saturating_sub(1);
    }

    pub fn forward(&mut self) {
        if self.index + 1 < self.entries.len() {
            self.index += 1;
        }
    }

    pub fn go(&mut self, delta: i64) {
        let target = self.index as i64 + delta;
        if target >= 0 && (target as usize) < self.entries.len() {
            self.index = target as usize;
        }
    }
}

/// The real global object graph of the top-level environment: what sandbox
/// surrogates fall back to after backing-frame teardown, and what the inline
/// isolation mode writes through to.
pub struct HostGlobals {
    pub window: Rc<GlobalTable>,
    pub document: Rc<GlobalTable>,
    pub history: Rc<RefCell<HistoryStack>>,
}

impl HostGlobals {
    pub fn new(address: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            window: Rc::new(GlobalTable::new()),
            document: Rc::new(GlobalTable::new()),
            history: Rc::new(RefCell::new(HistoryStack::new(address))),
        })
    }

    pub fn href(&self) -> String {
        self.history.borrow().current().to_string()
    }
}

/// Hidden, detached execution frame backing one sandbox. Carries a fresh
/// global table (a neutral zero-content document, same-origin by
/// construction) and its own history seeded to the host's current address so
/// navigation stays isolated while relative-URL semantics keep working.
pub struct BackingFrame {
    pub globals: GlobalTable,
    pub history: RefCell<HistoryStack>,
}

impl BackingFrame {
    fn build(host_href: &str) -> Rc<Self> {
        Rc::new(Self {
            globals: GlobalTable::new(),
            history: RefCell::new(HistoryStack::new(host_href)),
        })
    }
}

/// Shared, replaceable handle to the live backing frame. All surrogates of
/// one sandbox hold the same slot, so teardown is observed everywhere at
/// once.
#[derive(Clone)]
pub struct FrameSlot(Rc<RefCell<Option<Rc<BackingFrame>>>>);

impl FrameSlot {
    fn empty() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    pub fn live(&self) -> Option<Rc<BackingFrame>> {
        self.0.borrow().clone()
    }

    fn replace(&self, frame: Option<Rc<BackingFrame>>) -> Option<Rc<BackingFrame>> {
        self.0.replace(frame)
    }
}

/// Window surrogate: an override layer on top of the backing frame while it
/// lives, on top of the real global object once it has been torn down.
/// In-flight references therefore keep resolving after teardown instead of
/// throwing, at the cost of momentarily exposing real-global state.
pub struct WindowSurrogate {
    overrides: RefCell<HashMap<String, JsonValue>>,
    frame: FrameSlot,
    host: Rc<GlobalTable>,
}

impl WindowSurrogate {
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        if let Some(value) = self.overrides.borrow().get(key) {
            return Some(value.clone());
        }
        match self.frame.live() {
            Some(frame) => frame.globals.get(key),
            None => self.host.get(key),
        }
    }

    pub fn set(&self, key: &str, value: JsonValue) {
        if self.overrides.borrow().contains_key(key) {
            self.overrides.borrow_mut().insert(key.to_string(), value);
            return;
        }
        match self.frame.live() {
            Some(frame) => frame.globals.set(key, value),
            None => self.host.set(key, value),
        }
    }

    pub fn delete(&self, key: &str) {
        if self.overrides.borrow_mut().remove(key).is_some() {
            return;
        }
        match self.frame.live() {
            Some(frame) => frame.globals.delete(key),
            None => self.host.delete(key),
        }
    }

    pub fn override_key(&self, key: &str, value: JsonValue) {
        self.overrides.borrow_mut().insert(key.to_string(), value);
    }
}

/// Document surrogate: supplied overrides (head/body/custom) win, everything
/// else delegates to the wrapped document table.
pub struct DocumentSurrogate {
    inner: LayeredObject,
}

impl DocumentSurrogate {
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.inner.get(key)
    }

    pub fn set(&self, key: &str, value: JsonValue) {
        self.inner.set(key, value);
    }

    pub fn delete(&self, key: &str) {
        self.inner.delete(key);
    }

    /// Mark the script element currently executing against this document.
    pub fn set_current_script(&self, descriptor: Option<JsonValue>) {
        match descriptor {
            Some(value) => self.inner.override_key("currentScript", value),
            None => self.inner.override_key("currentScript", JsonValue::Null),
        }
    }
}

/// History surrogate delegating to the backing frame's stack while live,
/// to the host's afterwards.
pub struct HistorySurrogate {
    frame: FrameSlot,
    host: Rc<RefCell<HistoryStack>>,
}

impl HistorySurrogate {
    fn with_stack<T>(&self, f: impl FnOnce(&mut HistoryStack) -> T) -> T {
        match self.frame.live() {
            Some(frame) => f(&mut frame.history.borrow_mut()),
            None => f(&mut self.host.borrow_mut()),
        }
    }

    pub fn current(&self) -> String {
        self.with_stack(|stack| stack.current().to_string())
    }

    pub fn len(&self) -> usize {
        self.with_stack(|stack| stack.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a new entry; relative targets resolve against the current one.
    pub fn push_state(&self, target: &str) {
        self.with_stack(|stack| {
            let next = resolve_path(stack.current(), target, None);
            stack.push_state(next);
        });
    }

    pub fn replace_state(&self, target: &str) {
        self.with_stack(|stack| {
            let next = resolve_path(stack.current(), target, None);
            stack.replace_state(next);
        });
    }

    pub fn back(&self) {
        self.with_stack(|stack| stack.back());
    }

    pub fn forward(&self) {
        self.with_stack(|stack| stack.forward());
    }

    pub fn go(&self, delta: i64) {
        self.with_stack(|stack| stack.go(delta));
    }
}

/// Location surrogate: read-side view over the same stacks the history
/// surrogate mutates.
pub struct LocationSurrogate {
    frame: FrameSlot,
    host: Rc<RefCell<HistoryStack>>,
}

impl LocationSurrogate {
    pub fn href(&self) -> String {
        match self.frame.live() {
            Some(frame) => frame.history.borrow().current().to_string(),
            None => self.host.borrow().current().to_string(),
        }
    }

    pub fn info(&self) -> LocationInfo {
        host_location(&self.href())
    }
}

/// Overrides seeded into a freshly created isolation context.
#[derive(Default)]
pub struct SandboxSeed {
    pub window_overrides: HashMap<String, JsonValue>,
    pub document_overrides: HashMap<String, JsonValue>,
}

/// The virtual global object graph one micro application's scripts execute
/// against.
pub struct VirtualGlobals {
    frame: FrameSlot,
    window: Rc<WindowSurrogate>,
    document: Rc<DocumentSurrogate>,
    history: Rc<HistorySurrogate>,
    location: Rc<LocationSurrogate>,
    engine: ScriptEngine,
    scope: RefCell<Option<Rc<Scope>>>,
    scope_tag: RefCell<Option<String>>,
    frame_address: String,
    destroyed: Cell<bool>,
    passthrough: bool,
}

impl VirtualGlobals {
    /// Build an isolation context with its own backing frame.
    pub async fn create(host: &Rc<HostGlobals>, seed: SandboxSeed) -> Result<Rc<Self>> {
        Self::assemble(host, seed, true).await
    }

    /// Build a passthrough context with no backing frame: every access goes
    /// straight to the real global object graph (the inline, namespaced-only
    /// isolation mode).
    pub async fn create_passthrough(host: &Rc<HostGlobals>, seed: SandboxSeed) -> Result<Rc<Self>> {
        Self::assemble(host, seed, false).await
    }

    async fn assemble(host: &Rc<HostGlobals>, seed: SandboxSeed, backed: bool) -> Result<Rc<Self>> {
        let frame = FrameSlot::empty();
        if backed {
            frame.replace(Some(BackingFrame::build(&host.href())));
        }

        let window = Rc::new(WindowSurrogate {
            overrides: RefCell::new(seed.window_overrides),
            frame: frame.clone(),
            host: Rc::clone(&host.window),
        });
        let document = Rc::new(DocumentSurrogate {
            inner: LayeredObject::new(Rc::clone(&host.document), seed.document_overrides),
        });
        let history = Rc::new(HistorySurrogate {
            frame: frame.clone(),
            host: Rc::clone(&host.history),
        });
        let location = Rc::new(LocationSurrogate {
            frame: frame.clone(),
            host: Rc::clone(&host.history),
        });

        let engine = ScriptEngine::new()?;
        let frame_address = format!("sandbox://{}", Uuid::new_v4());

        let globals = Rc::new(Self {
            frame,
            window,
            document,
            history,
            location,
            engine,
            scope: RefCell::new(None),
            scope_tag: RefCell::new(None),
            frame_address,
            destroyed: Cell::new(!backed),
            passthrough: !backed,
        });

        crate::sandbox::executor::install_sandbox_bindings(globals.engine(), &globals)?;
        debug!(target: "sandbox", address = %globals.frame_address, backed, "isolation context ready");
        Ok(globals)
    }

    pub fn window(&self) -> &Rc<WindowSurrogate> {
        &self.window
    }

    pub fn document(&self) -> &Rc<DocumentSurrogate> {
        &self.document
    }

    pub fn history(&self) -> &Rc<HistorySurrogate> {
        &self.history
    }

    pub fn location(&self) -> &Rc<LocationSurrogate> {
        &self.location
    }

    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    pub fn frame_address(&self) -> &str {
        &self.frame_address
    }

    pub fn set_scope(&self, scope: Rc<Scope>) {
        *self.scope.borrow_mut() = Some(scope);
    }

    pub fn scope(&self) -> Option<Rc<Scope>> {
        self.scope.borrow().clone()
    }

    pub fn set_scope_tag(&self, tag: impl Into<String>) {
        *self.scope_tag.borrow_mut() = Some(tag.into());
    }

    pub fn scope_tag(&self) -> Option<String> {
        self.scope_tag.borrow().clone()
    }

    /// Tear the backing frame down: wipe its content, detach it, and mark it
    /// destroyed. Surrogates keep the same identity and start resolving
    /// against the real global object graph.
    pub fn destroy_backing_frame(&self) {
        if let Some(frame) = self.frame.replace(None) {
            frame.globals.clear();
        }
        self.destroyed.set(true);
        debug!(target: "sandbox", address = %self.frame_address, "backing frame destroyed");
    }

    /// Build a fresh backing frame behind the same surrogate identity. Only
    /// meaningful after a teardown; a live frame is left untouched.
    pub async fn rebuild_backing_frame(&self, host: &Rc<HostGlobals>) -> Result<()> {
        if self.passthrough || !self.destroyed.get() {
            return Ok(());
        }
        self.frame.replace(Some(BackingFrame::build(&host.href())));
        self.destroyed.set(false);
        debug!(target: "sandbox", address = %self.frame_address, "backing frame rebuilt");
        Ok(())
    }

    pub fn is_frame_destroyed(&self) -> bool {
        self.destroyed.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn window_isolates_writes_from_host_while_frame_lives() {
        let host = HostGlobals::new("https://example.com/index.html");
        let sandbox = VirtualGlobals::create(&host, SandboxSeed::default())
            .await
            .expect("sandbox");

        sandbox.window().set("token", json!("inner"));
        assert_eq!(sandbox.window().get("token"), Some(json!("inner")));
        assert_eq!(host.window.get("token"), None);
    }

    #[tokio::test]
    async fn window_falls_back_to_host_after_teardown() {
        let host = HostGlobals::new("https://example.com/index.html");
        host.window.set("shared", json!(1));
        let sandbox = VirtualGlobals::create(&host, SandboxSeed::default())
            .await
            .expect("sandbox");

        sandbox.window().set("shared", json!(2));
        assert_eq!(sandbox.window().get("shared"), Some(json!(2)));

        sandbox.destroy_backing_frame();
        // Stale references now resolve against the real global object.
        assert_eq!(sandbox.window().get("shared"), Some(json!(1)));
        sandbox.window().set("late", json!(true));
        assert_eq!(host.window.get("late"), Some(json!(true)));
    }

    #[tokio::test]
    async fn rebuild_restores_isolation_behind_the_same_surrogates() {
        let host = HostGlobals::new("https://example.com/index.html");
        let sandbox = VirtualGlobals::create(&host, SandboxSeed::default())
            .await
            .expect("sandbox");

        sandbox.destroy_backing_frame();
        sandbox
            .rebuild_backing_frame(&host)
            .await
            .expect("rebuild");
        sandbox.window().set("again", json!("isolated"));
        assert_eq!(host.window.get("again"), None);
    }

    #[tokio::test]
    async fn history_is_seeded_with_host_address_and_stays_isolated() {
        let host = HostGlobals::new("https://example.com/app/index.html");
        let sandbox = VirtualGlobals::create(&host, SandboxSeed::default())
            .await
            .expect("sandbox");

        assert_eq!(
            sandbox.location().href(),
            "https://example.com/app/index.html"
        );
        sandbox.history().push_state("detail.html");
        assert_eq!(
            sandbox.location().href(),
            "https://example.com/app/detail.html"
        );
        // Host navigation state is untouched.
        assert_eq!(host.href(), "https://example.com/app/index.html");

        sandbox.history().back();
        assert_eq!(
            sandbox.location().href(),
            "https://example.com/app/index.html"
        );
    }

    #[test]
    fn layered_object_precedence() {
        let base = Rc::new(GlobalTable::new());
        base.set("a", json!(1));
        let mut overrides = HashMap::new();
        overrides.insert("b".to_string(), json!(2));
        let layered = LayeredObject::new(Rc::clone(&base), overrides);

        assert_eq!(layered.get("a"), Some(json!(1)));
        assert_eq!(layered.get("b"), Some(json!(2)));

        layered.set("b", json!(3));
        assert_eq!(layered.get("b"), Some(json!(3)));
        assert!(!base.contains("b"));

        layered.set("c", json!(4));
        assert!(base.contains("c"));

        layered.delete("b");
        assert_eq!(layered.get("b"), None);
    }
}
