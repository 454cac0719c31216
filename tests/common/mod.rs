// Not every test binary uses every helper.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use mosaic::mount::{EVENT_MOUNT, EVENT_UNMOUNT};
use mosaic::{
    Environment, EnvironmentConfig, MountParams, MountTarget, ParsedSource, TargetEvents,
    Transport,
};

pub const HOST_ADDRESS: &str = "https://example.com/index.html";

/// In-memory transport with a hit log, standing in for the network.
pub struct MapTransport {
    entries: HashMap<String, String>,
    hits: RefCell<Vec<String>>,
}

impl MapTransport {
    pub fn new(entries: &[(&str, &str)]) -> Rc<Self> {
        Rc::new(Self {
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            hits: RefCell::new(Vec::new()),
        })
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.borrow().clone()
    }

    pub fn hit_count(&self, url: &str) -> usize {
        self.hits.borrow().iter().filter(|hit| *hit == url).count()
    }
}

#[async_trait(?Send)]
impl Transport for MapTransport {
    async fn fetch_text(&self, url: &str) -> Result<String, String> {
        self.hits.borrow_mut().push(url.to_string());
        self.entries
            .get(url)
            .cloned()
            .ok_or_else(|| format!("no entry for {url}"))
    }
}

/// Transport that blocks every fetch until the gate opens; for exercising
/// the not-yet-fetched paths (placeholders).
pub struct GatedTransport {
    inner: Rc<MapTransport>,
    gate: Rc<Notify>,
    open: Cell<bool>,
}

impl GatedTransport {
    pub fn new(inner: Rc<MapTransport>) -> Rc<Self> {
        Rc::new(Self {
            inner,
            gate: Rc::new(Notify::new()),
            open: Cell::new(false),
        })
    }

    pub fn open(&self) {
        self.open.set(true);
        self.gate.notify_waiters();
    }
}

#[async_trait(?Send)]
impl Transport for GatedTransport {
    async fn fetch_text(&self, url: &str) -> Result<String, String> {
        while !self.open.get() {
            let notified = self.gate.notified();
            if self.open.get() {
                break;
            }
            notified.await;
        }
        self.inner.fetch_text(url).await
    }
}

pub fn test_env(transport: Rc<dyn Transport>) -> Rc<Environment> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut config = EnvironmentConfig::new(HOST_ADDRESS);
    config.transport = Some(transport);
    Environment::new(config)
}

/// Scripted mount target recording every call the controller makes.
pub struct FakeTarget {
    events: TargetEvents,
    destroyed: Cell<bool>,
    scope_tag: RefCell<Option<String>>,
    pub created_with: RefCell<Vec<&'static str>>,
    pub mounted_resources: RefCell<Vec<Rc<ParsedSource>>>,
    pub mounted_locators: RefCell<Vec<(String, MountParams)>>,
    pub updates: RefCell<Vec<MountParams>>,
    pub placeholders: RefCell<Vec<String>>,
    pub unmount_count: Cell<usize>,
}

impl FakeTarget {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            events: TargetEvents::new(),
            destroyed: Cell::new(false),
            scope_tag: RefCell::new(None),
            created_with: RefCell::new(Vec::new()),
            mounted_resources: RefCell::new(Vec::new()),
            mounted_locators: RefCell::new(Vec::new()),
            updates: RefCell::new(Vec::new()),
            placeholders: RefCell::new(Vec::new()),
            unmount_count: Cell::new(0),
        })
    }

    /// Simulate the container being torn out of the document.
    pub fn destroy(&self) {
        self.destroyed.set(true);
        self.events.emit("destroy", &json!(null));
    }

    pub fn emit_urlchange(&self, data: serde_json::Value) {
        self.events.emit("urlchange", &data);
    }
}

#[async_trait(?Send)]
impl MountTarget for FakeTarget {
    fn events(&self) -> &TargetEvents {
        &self.events
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn wait(&self, placeholder: &str) {
        self.placeholders.borrow_mut().push(placeholder.to_string());
    }

    async fn create_frame(&self) -> Result<()> {
        self.created_with.borrow_mut().push("frame");
        Ok(())
    }

    async fn create_vm(&self) -> Result<()> {
        self.created_with.borrow_mut().push("vm");
        Ok(())
    }

    async fn create_box(&self) -> Result<()> {
        self.created_with.borrow_mut().push("box");
        Ok(())
    }

    async fn mount_resources(
        &self,
        resources: Rc<ParsedSource>,
        _params: &MountParams,
    ) -> Result<()> {
        self.mounted_resources.borrow_mut().push(resources);
        self.events.emit(EVENT_MOUNT, &json!(null));
        Ok(())
    }

    async fn mount_locator(&self, locator: &str, params: &MountParams) -> Result<()> {
        self.mounted_locators
            .borrow_mut()
            .push((locator.to_string(), params.clone()));
        self.events.emit(EVENT_MOUNT, &json!(null));
        Ok(())
    }

    async fn update(&self, params: &MountParams) -> Result<()> {
        self.updates.borrow_mut().push(params.clone());
        Ok(())
    }

    async fn unmount(&self) -> Result<()> {
        self.unmount_count.set(self.unmount_count.get() + 1);
        self.events.emit(EVENT_UNMOUNT, &json!(null));
        Ok(())
    }

    fn set_scope_tag(&self, tag: &str) {
        *self.scope_tag.borrow_mut() = Some(tag.to_string());
    }

    fn scope_tag(&self) -> Option<String> {
        self.scope_tag.borrow().clone()
    }
}
