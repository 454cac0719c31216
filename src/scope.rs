use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::app::MicroApp;

/// Reserved event carrying messages from an application up to its parent.
pub const EVENT_TO_PARENT: &str = "message:to-parent";
/// Reserved event carrying messages from a parent down to an application.
pub const EVENT_TO_CHILD: &str = "message:to-child";

pub type ScopeCallback = Rc<dyn Fn(&JsonValue)>;

/// Handle identifying one listener registration, for targeted removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Listener {
    event: String,
    id: ListenerId,
    callback: ScopeCallback,
}

/// One node of the application registry tree: a local event bus plus the
/// ordered list of directly registered applications. The parent link is
/// non-owning; ownership always flows root-to-leaf.
pub struct Scope {
    url: String,
    parent: RefCell<Weak<Scope>>,
    apps: RefCell<Vec<Rc<MicroApp>>>,
    listeners: RefCell<Vec<Listener>>,
    next_listener: Cell<u64>,
    destroyed: Cell<bool>,
}

impl Scope {
    pub fn new(url: impl Into<String>, parent: Option<&Rc<Scope>>) -> Rc<Scope> {
        Rc::new(Scope {
            url: url.into(),
            parent: RefCell::new(parent.map(Rc::downgrade).unwrap_or_default()),
            apps: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(0),
            destroyed: Cell::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn parent(&self) -> Option<Rc<Scope>> {
        self.parent.borrow().upgrade()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub(crate) fn add_app(&self, app: Rc<MicroApp>) {
        self.apps.borrow_mut().push(app);
    }

    pub(crate) fn remove_app(&self, app: &Rc<MicroApp>) {
        self.apps
            .borrow_mut()
            .retain(|candidate| !Rc::ptr_eq(candidate, app));
    }

    pub fn apps(&self) -> Vec<Rc<MicroApp>> {
        self.apps.borrow().clone()
    }

    pub fn find_app(&self, name: &str) -> Option<Rc<MicroApp>> {
        self.apps
            .borrow()
            .iter()
            .find(|app| app.name() == name)
            .cloned()
    }

    /// Register a listener; fires in registration order.
    pub fn on(&self, event: impl Into<String>, callback: ScopeCallback) -> ListenerId {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners.borrow_mut().push(Listener {
            event: event.into(),
            id,
            callback,
        });
        id
    }

    /// Remove one listener by id, or every listener for the event when no id
    /// is given.
    pub fn off(&self, event: &str, id: Option<ListenerId>) {
        self.listeners
            .borrow_mut()
            .retain(|listener| listener.event != event || id.is_some_and(|id| listener.id != id));
    }

    /// Fire all listeners registered for `event`, synchronously, in
    /// registration order. A destroyed scope never fires, even through a
    /// lingering reference.
    pub fn trigger(&self, event: &str, data: &JsonValue) {
        if self.destroyed.get() {
            return;
        }
        let matching: Vec<ScopeCallback> = self
            .listeners
            .borrow()
            .iter()
            .filter(|listener| listener.event == event)
            .map(|listener| Rc::clone(&listener.callback))
            .collect();
        for callback in matching {
            callback(data);
        }
    }

    /// Send a message to the parent application. Receivers subscribe through
    /// the parent's `watch`, so their callbacks live on this node and are
    /// discarded with it.
    pub fn emit(&self, data: &JsonValue) {
        self.trigger(EVENT_TO_PARENT, data);
    }

    /// Subscribe to upward messages from the named direct child.
    pub fn watch(&self, name: &str, callback: ScopeCallback) {
        if let Some(scope) = self.find_app(name).and_then(|app| app.scope()) {
            scope.on(EVENT_TO_PARENT, callback);
        }
    }

    /// Subscribe to upward messages from every currently registered child.
    pub fn watch_all(&self, callback: ScopeCallback) {
        for app in self.apps.borrow().iter() {
            if let Some(scope) = app.scope() {
                scope.on(EVENT_TO_PARENT, Rc::clone(&callback));
            }
        }
    }

    /// Send a message to one named direct child.
    pub fn send(&self, name: &str, data: &JsonValue) {
        if let Some(scope) = self.find_app(name).and_then(|app| app.scope()) {
            scope.trigger(EVENT_TO_CHILD, data);
        }
    }

    /// Send a message to every direct child.
    pub fn dispatch(&self, data: &JsonValue) {
        for app in self.apps.borrow().iter() {
            if let Some(scope) = app.scope() {
                scope.trigger(EVENT_TO_CHILD, data);
            }
        }
    }

    /// Receive downward messages addressed to this application.
    pub fn listen(&self, callback: ScopeCallback) -> ListenerId {
        self.on(EVENT_TO_CHILD, callback)
    }

    /// Deliver a message to every descendant, depth-first from the root of
    /// this scope's tree.
    pub fn broadcast(&self, data: &JsonValue) {
        fn descend(scope: &Scope, data: &JsonValue) {
            for app in scope.apps.borrow().iter() {
                if let Some(child) = app.scope() {
                    child.trigger(EVENT_TO_CHILD, data);
                    descend(&child, data);
                }
            }
        }

        let mut root = match self.parent() {
            Some(parent) => parent,
            None => {
                descend(self, data);
                return;
            }
        };
        while let Some(parent) = root.parent() {
            root = parent;
        }
        descend(&root, data);
    }

    /// Tear the node down: the listener list is discarded atomically so no
    /// callback registered here (including a parent's `watch` callbacks) can
    /// fire afterwards.
    pub(crate) fn destroy(&self) {
        debug!(target: "scope", url = %self.url, "destroying scope");
        self.destroyed.set(true);
        self.listeners.borrow_mut().clear();
        *self.parent.borrow_mut() = Weak::new();
    }
}
