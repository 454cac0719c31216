use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::path::is_internal_link;
use crate::sandbox::engine::ScriptEngine;
use crate::transform::ParsedSource;

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Network-level failure; recoverable where a fallback exists.
    #[error("fetch failed for {locator}: {message}")]
    Fetch { locator: String, message: String },
    /// The isolated cross-origin loader path failed; surfaces to consumers.
    #[error("isolated load failed for {locator}: {message}")]
    IsolatedLoad { locator: String, message: String },
}

/// Text retrieval seam. The default implementation speaks HTTP; tests swap
/// in an in-memory map.
#[async_trait(?Send)]
pub trait Transport {
    async fn fetch_text(&self, url: &str) -> Result<String, String>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Transport for HttpTransport {
    async fn fetch_text(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let response = response.error_for_status().map_err(|err| err.to_string())?;
        response.text().await.map_err(|err| err.to_string())
    }
}

/// View of a throwaway execution frame handed to isolated-loader hooks.
pub struct FrameHandle<'a> {
    engine: &'a ScriptEngine,
}

impl FrameHandle<'_> {
    pub fn set_global(&self, key: &str, value: &JsonValue) -> anyhow::Result<()> {
        self.engine.set_global_json(key, value)
    }

    pub fn get_global(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        self.engine.get_global_json(key)
    }

    pub fn eval(&self, source: &str, filename: &str) -> anyhow::Result<()> {
        self.engine.eval(source, filename)
    }
}

type EnvSetup = Box<dyn Fn(&FrameHandle<'_>)>;
type ExportsExtractor = Box<dyn Fn(&FrameHandle<'_>) -> anyhow::Result<JsonValue>>;

/// Opt-in mapping for cross-origin resources that must be loaded through an
/// isolated frame: which exact locators it covers, how to prepare the frame,
/// and how to pull the exports object back out.
pub struct IsolatedLoaderMap {
    locators: HashSet<String>,
    set_env: Option<EnvSetup>,
    extract: ExportsExtractor,
}

impl IsolatedLoaderMap {
    pub fn new(locators: impl IntoIterator<Item = String>, extract: ExportsExtractor) -> Self {
        Self {
            locators: locators.into_iter().collect(),
            set_env: None,
            extract,
        }
    }

    pub fn with_env_setup(mut self, setup: EnvSetup) -> Self {
        self.set_env = Some(setup);
        self
    }

    pub fn handles(&self, locator: &str) -> bool {
        self.locators.contains(locator)
    }
}

enum ReadyState {
    Idle,
    InFlight,
    Settled(Result<(), SourceError>),
}

/// One fetchable resource, shared by every consumer interested in the same
/// resolved locator. The ready signal fires exactly once; concurrent
/// awaiters share a single settlement.
pub struct Source {
    locator: String,
    origin: String,
    abs_root: Option<String>,
    transport: Rc<dyn Transport>,
    loaders: Option<Rc<IsolatedLoaderMap>>,
    text: RefCell<String>,
    fetched: Cell<bool>,
    exports: RefCell<Option<JsonValue>>,
    state: RefCell<ReadyState>,
    notify: Notify,
    parsed: RefCell<Option<Rc<ParsedSource>>>,
}

pub type SourceHandle = Rc<Source>;

/// Options accepted by `import_source`.
#[derive(Default)]
pub struct SourceOptions {
    /// Base for resolving the locator; defaults to the connected scope's url.
    pub base_url: Option<String>,
    /// Deployment-root override; defaults to the environment's.
    pub abs_root: Option<String>,
    /// Isolated loader mapping for cross-origin module loads.
    pub loaders: Option<Rc<IsolatedLoaderMap>>,
}

impl Source {
    pub(crate) fn new(
        locator: String,
        origin: String,
        abs_root: Option<String>,
        transport: Rc<dyn Transport>,
        loaders: Option<Rc<IsolatedLoaderMap>>,
    ) -> SourceHandle {
        Rc::new(Self {
            locator,
            origin,
            abs_root,
            transport,
            loaders,
            text: RefCell::new(String::new()),
            fetched: Cell::new(false),
            exports: RefCell::new(None),
            state: RefCell::new(ReadyState::Idle),
            notify: Notify::new(),
            parsed: RefCell::new(None),
        })
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn text(&self) -> String {
        self.text.borrow().clone()
    }

    /// Whether a network fetch has settled for this resource (true even on
    /// failure; never true for the cross-origin-without-loader path).
    pub fn fetched(&self) -> bool {
        self.fetched.get()
    }

    /// Exports object produced by the isolated loader path, if any.
    pub fn exports(&self) -> Option<JsonValue> {
        self.exports.borrow().clone()
    }

    pub fn abs_root(&self) -> Option<String> {
        self.abs_root.clone()
    }

    pub(crate) fn cached_parse(&self) -> Option<Rc<ParsedSource>> {
        self.parsed.borrow().clone()
    }

    pub(crate) fn store_parse(&self, parsed: Rc<ParsedSource>) {
        *self.parsed.borrow_mut() = Some(parsed);
    }

    /// Await the single-fire completion signal. The first awaiter drives the
    /// fetch; later (and concurrent) awaiters share the same settlement.
    pub async fn ready(&self) -> Result<(), SourceError> {
        loop {
            let notified = self.notify.notified();
            let drive = {
                let mut state = self.state.borrow_mut();
                match &*state {
                    ReadyState::Settled(outcome) => return outcome.clone(),
                    ReadyState::InFlight => false,
                    ReadyState::Idle => {
                        *state = ReadyState::InFlight;
                        true
                    }
                }
            };

            if drive {
                let outcome = self.perform_fetch().await;
                *self.state.borrow_mut() = ReadyState::Settled(outcome.clone());
                self.notify.notify_waiters();
                return outcome;
            }

            notified.await;
        }
    }

    async fn perform_fetch(&self) -> Result<(), SourceError> {
        if !is_internal_link(&self.locator, &self.origin) {
            if let Some(loaders) = self
                .loaders
                .as_ref()
                .filter(|loaders| loaders.handles(&self.locator))
                .cloned()
            {
                return self.isolated_load(&loaders).await;
            }
            // Cross-origin markup cannot be introspected safely; resolve
            // empty rather than half-load it.
            debug!(target: "source", locator = %self.locator, "cross-origin source resolves empty");
            return Ok(());
        }

        debug!(target: "source", locator = %self.locator, "fetching");
        let result = self.transport.fetch_text(&self.locator).await;
        self.fetched.set(true);
        match result {
            Ok(text) => {
                *self.text.borrow_mut() = text;
                Ok(())
            }
            Err(message) => {
                error!(target: "source", locator = %self.locator, %message, "fetch failed");
                Err(SourceError::Fetch {
                    locator: self.locator.clone(),
                    message,
                })
            }
        }
    }

    /// Load a cross-origin script through a throwaway frame: prepare the
    /// environment, evaluate the script, extract the exports object, tear
    /// the frame down.
    async fn isolated_load(&self, loaders: &IsolatedLoaderMap) -> Result<(), SourceError> {
        let fail = |message: String| SourceError::IsolatedLoad {
            locator: self.locator.clone(),
            message,
        };

        let text = self
            .transport
            .fetch_text(&self.locator)
            .await
            .map_err(&fail)?;

        let engine = ScriptEngine::new().map_err(|err| fail(err.to_string()))?;
        let frame = FrameHandle { engine: &engine };

        if let Some(setup) = loaders.set_env.as_ref() {
            setup(&frame);
        }

        frame
            .eval(&text, &self.locator)
            .map_err(|err| fail(err.to_string()))?;

        let exports = (loaders.extract)(&frame).map_err(|err| fail(err.to_string()))?;
        *self.exports.borrow_mut() = Some(exports);
        debug!(target: "source", locator = %self.locator, "isolated load complete");
        Ok(())
    }
}
