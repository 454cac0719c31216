use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use serde_json::{json, Value as JsonValue};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::css::CssRule;
use crate::env::Environment;
use crate::mount::{
    IsolationMode, MountParams, MountTarget, EVENT_DESTROY, EVENT_MOUNT, EVENT_UNMOUNT,
    EVENT_URLCHANGE,
};
use crate::sandbox::executor::run_in_sandbox;
use crate::sandbox::globals::{SandboxSeed, VirtualGlobals};
use crate::scope::{Scope, ScopeCallback};
use crate::source::SourceHandle;
use crate::transform::{parse_source, ScriptRecord, StyleRecord};

/// Cadence for re-checking a mount target that has not been registered yet
/// (the visual slot may attach after the application registers).
const FRAME_TICK: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Registered,
    Bootstrapping,
    Sandboxed,
    Loaded,
    Mounted,
    Updating,
    Unmounted,
    Destroyed,
}

/// Where an application's source comes from: a ready handle, or a factory
/// invoked at bootstrap time. The factory receives the parent scope
/// explicitly, so nested `import_source` calls resolve against it.
pub enum SourceProvider {
    Handle(SourceHandle),
    Factory(Box<dyn Fn(&Rc<Scope>) -> SourceHandle>),
}

/// Markup shown while the source is still fetching.
pub enum Placeholder {
    Markup(String),
    Factory(Box<dyn Fn() -> String>),
}

impl Placeholder {
    fn render(&self) -> String {
        match self {
            Placeholder::Markup(markup) => markup.clone(),
            Placeholder::Factory(factory) => factory(),
        }
    }
}

pub type LifecycleCallback = Rc<dyn Fn()>;
pub type HoistRules = Box<dyn Fn(&CssRule) -> Option<String>>;

pub struct AppConfig {
    pub name: String,
    pub mode: IsolationMode,
    pub source: SourceProvider,
    pub placeholder: Option<Placeholder>,
    pub inject_style: Option<String>,
    pub inject_script: Option<String>,
    /// Opt-in lifting of rules into the host document, rule by rule.
    pub hoist_css_rules: Option<HoistRules>,
    pub on_bootstrap: Option<LifecycleCallback>,
    pub on_load: Option<LifecycleCallback>,
    pub on_mount: Option<LifecycleCallback>,
    pub on_unmount: Option<LifecycleCallback>,
    pub on_destroy: Option<LifecycleCallback>,
    /// Receives the application's upward messages; registered on the
    /// application's own scope so it dies with it.
    pub on_message: Option<ScopeCallback>,
}

impl AppConfig {
    pub fn new(name: impl Into<String>, mode: IsolationMode, source: SourceProvider) -> Self {
        Self {
            name: name.into(),
            mode,
            source,
            placeholder: None,
            inject_style: None,
            inject_script: None,
            hoist_css_rules: None,
            on_bootstrap: None,
            on_load: None,
            on_mount: None,
            on_unmount: None,
            on_destroy: None,
            on_message: None,
        }
    }
}

/// Handle for one registered micro application, driving its lifecycle
/// against the mount-target contract.
pub struct MicroApp {
    name: String,
    mode: IsolationMode,
    weak_self: Weak<MicroApp>,
    env: Weak<Environment>,
    parent_scope: Weak<Scope>,
    scope: RefCell<Option<Rc<Scope>>>,
    source: RefCell<Option<SourceHandle>>,
    provider: RefCell<Option<SourceProvider>>,
    target: RefCell<Option<Rc<dyn MountTarget>>>,
    sandbox: RefCell<Option<Rc<VirtualGlobals>>>,
    mounted: RefCell<Option<MountParams>>,
    rendered: Cell<bool>,
    events_wired: Cell<bool>,
    state: Cell<AppState>,
    placeholder: Option<Placeholder>,
    inject_style: Option<String>,
    inject_script: Option<String>,
    hoist_css_rules: Option<HoistRules>,
    on_bootstrap: Option<LifecycleCallback>,
    on_load: Option<LifecycleCallback>,
    on_mount: Option<LifecycleCallback>,
    on_unmount: Option<LifecycleCallback>,
    on_destroy: Option<LifecycleCallback>,
    on_message: Option<ScopeCallback>,
}

/// Register a micro application under the currently connected scope. The
/// handle exists (and is addressable by its parent) before any resource
/// fetch begins; `bootstrap` starts the actual work.
pub fn register_micro_app(env: &Rc<Environment>, config: AppConfig) -> Rc<MicroApp> {
    let parent = env.connect_scope();
    let app = Rc::new_cyclic(|weak_self| MicroApp {
        name: config.name,
        mode: config.mode,
        weak_self: weak_self.clone(),
        env: Rc::downgrade(env),
        parent_scope: Rc::downgrade(&parent),
        scope: RefCell::new(None),
        source: RefCell::new(None),
        provider: RefCell::new(Some(config.source)),
        target: RefCell::new(None),
        sandbox: RefCell::new(None),
        mounted: RefCell::new(None),
        rendered: Cell::new(false),
        events_wired: Cell::new(false),
        state: Cell::new(AppState::Registered),
        placeholder: config.placeholder,
        inject_style: config.inject_style,
        inject_script: config.inject_script,
        hoist_css_rules: config.hoist_css_rules,
        on_bootstrap: config.on_bootstrap,
        on_load: config.on_load,
        on_mount: config.on_mount,
        on_unmount: config.on_unmount,
        on_destroy: config.on_destroy,
        on_message: config.on_message,
    });
    parent.add_app(Rc::clone(&app));
    debug!(target: "app", name = %app.name, "registered");
    app
}

impl MicroApp {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn state(&self) -> AppState {
        self.state.get()
    }

    pub fn scope(&self) -> Option<Rc<Scope>> {
        self.scope.borrow().clone()
    }

    pub fn source(&self) -> Option<SourceHandle> {
        self.source.borrow().clone()
    }

    pub fn sandbox(&self) -> Option<Rc<VirtualGlobals>> {
        self.sandbox.borrow().clone()
    }

    pub fn mounted_params(&self) -> Option<MountParams> {
        self.mounted.borrow().clone()
    }

    fn environment(&self) -> Result<Rc<Environment>> {
        self.env
            .upgrade()
            .ok_or_else(|| anyhow!("environment torn down"))
    }

    /// Bring the application up: resolve the source, create the scope node,
    /// wait for the mount target, build the isolation context, load
    /// resources, and mount if requested (or if a mount was recorded while
    /// the target was still missing).
    pub async fn bootstrap(&self, to_mount: bool) -> Result<()> {
        if self.state.get() != AppState::Registered {
            warn!(target: "app", name = %self.name, state = ?self.state.get(), "bootstrap skipped");
            return Ok(());
        }
        self.state.set(AppState::Bootstrapping);

        if let Some(callback) = &self.on_bootstrap {
            callback();
        }

        let env = self.environment()?;
        let parent = self
            .parent_scope
            .upgrade()
            .ok_or_else(|| anyhow!("parent scope gone before bootstrap"))?;

        let source = match self.provider.borrow_mut().take() {
            Some(SourceProvider::Handle(handle)) => handle,
            Some(SourceProvider::Factory(factory)) => {
                // Registration calls made inside the factory attach to this
                // application's parent.
                let _pin = env.pin_scope(Rc::clone(&parent));
                factory(&parent)
            }
            None => self
                .source
                .borrow()
                .clone()
                .ok_or_else(|| anyhow!("source provider already consumed"))?,
        };
        *self.source.borrow_mut() = Some(Rc::clone(&source));

        let scope = Scope::new(source.locator(), Some(&parent));
        *self.scope.borrow_mut() = Some(Rc::clone(&scope));

        // Attach the parent-side message listener on the application's own
        // bus, so it is discarded with the application.
        if let Some(on_message) = &self.on_message {
            parent.watch(&self.name, Rc::clone(on_message));
        }

        // The visual slot may not exist yet; keep polling at frame cadence.
        let target = loop {
            if let Some(target) = env.mount_target(&self.name) {
                break target;
            }
            sleep(FRAME_TICK).await;
        };

        self.attach_target(&env, &scope, &source, Rc::clone(&target))
            .await?;
        self.state.set(AppState::Sandboxed);

        source
            .ready()
            .await
            .with_context(|| format!("loading source for {}", self.name))?;
        if let Some(callback) = &self.on_load {
            callback();
        }
        self.state.set(AppState::Loaded);

        if to_mount || self.mounted.borrow().is_some() {
            let params = self.mounted.borrow().clone().unwrap_or_default();
            self.mount(params).await?;
        }

        Ok(())
    }

    async fn attach_target(
        &self,
        env: &Rc<Environment>,
        scope: &Rc<Scope>,
        source: &SourceHandle,
        target: Rc<dyn MountTarget>,
    ) -> Result<()> {
        *self.target.borrow_mut() = Some(Rc::clone(&target));
        self.wire_target_events(scope, &target);

        match self.mode {
            IsolationMode::Frame => {
                target.create_frame().await?;
            }
            IsolationMode::ProxyVm => {
                target.create_vm().await?;
                let sandbox =
                    VirtualGlobals::create(env.host_globals(), SandboxSeed::default()).await?;
                sandbox.set_scope(Rc::clone(scope));
                sandbox.set_scope_tag(source.locator());
                *self.sandbox.borrow_mut() = Some(sandbox);
            }
            IsolationMode::Inline => {
                target.create_box().await?;
                let sandbox =
                    VirtualGlobals::create_passthrough(env.host_globals(), SandboxSeed::default())
                        .await?;
                sandbox.set_scope(Rc::clone(scope));
                sandbox.set_scope_tag(source.locator());
                *self.sandbox.borrow_mut() = Some(sandbox);
            }
        }

        target.set_scope_tag(source.locator());
        Ok(())
    }

    fn wire_target_events(&self, scope: &Rc<Scope>, target: &Rc<dyn MountTarget>) {
        if self.events_wired.get() {
            return;
        }
        self.events_wired.set(true);

        let events = target.events();

        if let Some(on_mount) = self.on_mount.clone() {
            events.on(EVENT_MOUNT, Rc::new(move |_| on_mount()));
        }
        if let Some(on_unmount) = self.on_unmount.clone() {
            events.on(EVENT_UNMOUNT, Rc::new(move |_| on_unmount()));
        }
        if let Some(on_destroy) = self.on_destroy.clone() {
            events.on(EVENT_DESTROY, Rc::new(move |_| on_destroy()));
        }

        // Navigation changes inside the container surface on the
        // application's own bus.
        {
            let scope = Rc::clone(scope);
            events.on(
                EVENT_URLCHANGE,
                Rc::new(move |data: &JsonValue| {
                    scope.trigger(EVENT_URLCHANGE, data);
                }),
            );
        }

        {
            let app = self.weak_self.clone();
            events.on(
                EVENT_DESTROY,
                Rc::new(move |_| {
                    if let Some(app) = app.upgrade() {
                        app.teardown();
                    }
                }),
            );
        }
    }

    /// Mount (or re-mount) with the given params. Re-mounting an already
    /// rendered application routes to update semantics; inline scripts carry
    /// runtime state and never run twice.
    pub async fn mount(&self, params: MountParams) -> Result<()> {
        if self.rendered.get() && self.mounted.borrow().is_some() {
            return self.update(params).await;
        }

        *self.mounted.borrow_mut() = Some(params.clone());

        // The container may already be gone; mounting then is a no-op, not
        // an error.
        let Some(target) = self.target.borrow().clone() else {
            return Ok(());
        };
        if target.is_destroyed() {
            return Ok(());
        }

        let source = self
            .source
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("mount before bootstrap for {}", self.name))?;

        target.ready().await?;
        if let Some(placeholder) = &self.placeholder {
            if !source.fetched() {
                target.wait(&placeholder.render());
            }
        }
        source
            .ready()
            .await
            .with_context(|| format!("source for {} not ready at mount", self.name))?;

        match self.mode {
            IsolationMode::Frame => {
                target.mount_locator(source.locator(), &params).await?;
            }
            IsolationMode::ProxyVm | IsolationMode::Inline => {
                let env = self.environment()?;
                let resources = parse_source(
                    &env,
                    &source,
                    self.inject_style.as_deref(),
                    self.inject_script.as_deref(),
                )
                .await?;

                self.hoist_styles(&env, &resources.styles);
                target
                    .mount_resources(Rc::clone(&resources), &params)
                    .await?;

                if !self.rendered.get() {
                    self.run_scripts(&env, &resources.scripts)?;
                }
            }
        }

        self.rendered.set(true);
        self.state.set(AppState::Mounted);
        Ok(())
    }

    /// Push new params through the mounted container. No-op unless mounted
    /// and the container is still alive; never re-runs scripts.
    pub async fn update(&self, params: MountParams) -> Result<()> {
        if self.mounted.borrow().is_none() {
            return Ok(());
        }
        *self.mounted.borrow_mut() = Some(params.clone());

        let Some(target) = self.target.borrow().clone() else {
            return Ok(());
        };
        if target.is_destroyed() {
            return Ok(());
        }

        let source = self
            .source
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("update before bootstrap for {}", self.name))?;

        self.state.set(AppState::Updating);
        source.ready().await?;
        target.update(&params).await?;
        self.state.set(AppState::Mounted);
        Ok(())
    }

    /// Unmount the container (it may run an exit transition first), clear
    /// mounted state, and drop the application's hoisted style block.
    pub async fn unmount(&self) -> Result<()> {
        if let Some(target) = self.target.borrow().clone() {
            if !target.is_destroyed() {
                target.unmount().await?;
            }
        }
        *self.mounted.borrow_mut() = None;

        if let Ok(env) = self.environment() {
            env.remove_hoisted_style(&self.name);
        }

        self.state.set(AppState::Unmounted);
        Ok(())
    }

    /// React to the container's destruction: remove the handle from its
    /// parent, discard the scope (and with it every listener registered
    /// against this application), and tear the sandbox down.
    fn teardown(&self) {
        if self.state.get() == AppState::Destroyed {
            return;
        }
        self.state.set(AppState::Destroyed);
        debug!(target: "app", name = %self.name, "destroyed");

        if let Some(scope) = self.scope.borrow().clone() {
            scope.destroy();
        }
        if let (Some(parent), Some(this)) = (self.parent_scope.upgrade(), self.weak_self.upgrade())
        {
            parent.remove_app(&this);
        }
        if let Some(sandbox) = self.sandbox.borrow().clone() {
            sandbox.destroy_backing_frame();
        }
        *self.target.borrow_mut() = None;
        *self.mounted.borrow_mut() = None;
    }

    fn hoist_styles(&self, env: &Rc<Environment>, styles: &[StyleRecord]) {
        let Some(hoist) = &self.hoist_css_rules else {
            return;
        };

        let mut lifted = Vec::new();
        for style in styles {
            if let StyleRecord::Rules { rules, .. } = style {
                for rule in rules {
                    if let Some(text) = hoist(rule) {
                        lifted.push(text);
                    }
                }
            }
        }

        env.hoist_style(&self.name, lifted.join("\n"));
    }

    /// Execute the application's classic scripts against its isolation
    /// context, in document order. Runs at most once per rendered lifetime.
    fn run_scripts(&self, env: &Rc<Environment>, scripts: &[ScriptRecord]) -> Result<()> {
        let Some(sandbox) = self.sandbox.borrow().clone() else {
            return Ok(());
        };
        let scope = self.scope.borrow().clone();

        let _script_guard = scope.map(|scope| env.enter_script_scope(scope));

        for (index, script) in scripts.iter().enumerate() {
            let Some(body) = script.text_content.as_deref() else {
                // External reference left untouched; the mount target loads
                // it in its own way.
                continue;
            };
            if !script.is_classic() {
                continue;
            }

            let descriptor = json!({
                "attributes": &script.attributes,
                "src": &script.source_locator,
                "scopeTag": sandbox.scope_tag(),
            });
            sandbox.document().set_current_script(Some(descriptor));
            let filename = format!("{}-script-{}.js", self.name, index);
            let outcome = run_in_sandbox(&sandbox, body, &[], &filename);
            sandbox.document().set_current_script(None);

            outcome.with_context(|| format!("script {index} of {} failed", self.name))?;
        }

        Ok(())
    }
}
