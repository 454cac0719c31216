use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::transform::ParsedSource;

/// How a micro application's resources are kept apart from the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// A real origin-isolated frame; mounted by locator.
    Frame,
    /// A virtual global context backed by a hidden frame.
    ProxyVm,
    /// Namespaced into the host document, no execution isolation.
    Inline,
}

/// Parameters supplied on mount/update, typically by a router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountParams {
    pub uri: Option<String>,
    pub transition: Option<String>,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default)]
    pub extra: JsonValue,
}

pub const EVENT_MOUNT: &str = "mount";
pub const EVENT_UNMOUNT: &str = "unmount";
pub const EVENT_DESTROY: &str = "destroy";
pub const EVENT_URLCHANGE: &str = "urlchange";

pub type TargetCallback = Rc<dyn Fn(&JsonValue)>;

/// Lifecycle event bus of one mount target. Listeners fire synchronously in
/// registration order.
#[derive(Default)]
pub struct TargetEvents {
    listeners: RefCell<Vec<(String, u64, TargetCallback)>>,
    next: Cell<u64>,
}

impl TargetEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: impl Into<String>, callback: TargetCallback) -> u64 {
        let id = self.next.get();
        self.next.set(id + 1);
        self.listeners.borrow_mut().push((event.into(), id, callback));
        id
    }

    pub fn off(&self, event: &str, id: Option<u64>) {
        self.listeners
            .borrow_mut()
            .retain(|(name, lid, _)| name != event || id.is_some_and(|id| *lid != id));
    }

    pub fn emit(&self, event: &str, data: &JsonValue) {
        let matching: Vec<TargetCallback> = self
            .listeners
            .borrow()
            .iter()
            .filter(|(name, _, _)| name == event)
            .map(|(_, _, callback)| Rc::clone(callback))
            .collect();
        for callback in matching {
            callback(data);
        }
    }
}

/// The visual container abstraction the controller drives. Implementations
/// own all DOM construction; the controller only calls this contract and
/// reacts to the `mount`/`unmount`/`destroy`/`urlchange` events.
#[async_trait(?Send)]
pub trait MountTarget {
    fn events(&self) -> &TargetEvents;

    /// Whether the container has been torn down. Operations against a
    /// destroyed target are silently skipped, never errors.
    fn is_destroyed(&self) -> bool;

    /// Resolves once the container is attached and able to render.
    async fn ready(&self) -> Result<()>;

    /// Show placeholder markup while the source is still loading.
    fn wait(&self, placeholder: &str);

    /// Prepare the container for frame isolation.
    async fn create_frame(&self) -> Result<()>;

    /// Prepare the container for proxy-VM isolation.
    async fn create_vm(&self) -> Result<()>;

    /// Prepare the container for inline (namespaced-only) isolation.
    async fn create_box(&self) -> Result<()>;

    /// Render parsed resources (proxy-VM and inline modes).
    async fn mount_resources(&self, resources: Rc<ParsedSource>, params: &MountParams)
        -> Result<()>;

    /// Point the container at a locator (frame mode).
    async fn mount_locator(&self, locator: &str, params: &MountParams) -> Result<()>;

    /// Push new params without re-rendering resources.
    async fn update(&self, params: &MountParams) -> Result<()>;

    /// Detach the rendered content, possibly after an exit transition.
    async fn unmount(&self) -> Result<()>;

    /// Tag the container with the scope it renders, for scope resolution.
    fn set_scope_tag(&self, tag: &str);

    fn scope_tag(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_fire_in_order_and_off_removes() {
        let events = TargetEvents::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let first = {
            let seen = Rc::clone(&seen);
            events.on("mount", Rc::new(move |_| seen.borrow_mut().push(1)))
        };
        {
            let seen = Rc::clone(&seen);
            events.on("mount", Rc::new(move |_| seen.borrow_mut().push(2)));
        }

        events.emit("mount", &json!(null));
        events.off("mount", Some(first));
        events.emit("mount", &json!(null));
        assert_eq!(*seen.borrow(), vec![1, 2, 2]);
    }
}
