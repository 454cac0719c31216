use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};
use url::Url;

use crate::mount::MountTarget;
use crate::path::{host_location, resolve_path, LocationInfo};
use crate::sandbox::globals::HostGlobals;
use crate::scope::Scope;
use crate::source::{HttpTransport, Source, SourceHandle, SourceOptions, Transport};

/// Construction parameters for a top-level environment.
pub struct EnvironmentConfig {
    /// Absolute address of the host page.
    pub address: String,
    /// Deployment-root prefix applied to absolute references.
    pub abs_root: Option<String>,
    /// Text retrieval; defaults to HTTP.
    pub transport: Option<Rc<dyn Transport>>,
}

impl EnvironmentConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            abs_root: None,
            transport: None,
        }
    }
}

/// Probe describing an isolated frame the current code may be executing in,
/// used as the third step of scope resolution.
#[derive(Clone)]
pub struct FrameProbe {
    /// The frame's own address.
    pub frame_address: String,
    /// Scope tag carried by the frame's container.
    pub scope_tag: Option<String>,
    /// Scope registered on the frame's host element.
    pub host_scope: Option<Rc<Scope>>,
}

/// One logical host page: the root of the scope tree, the source cache, the
/// real global object graph, and the registries external collaborators talk
/// to. Everything lives for exactly as long as this value.
pub struct Environment {
    address: String,
    origin: String,
    abs_root: Option<String>,
    transport: Rc<dyn Transport>,
    host_globals: Rc<HostGlobals>,
    root_scope: RefCell<Option<Rc<Scope>>>,
    sources: RefCell<Vec<SourceHandle>>,
    mount_targets: RefCell<HashMap<String, Rc<dyn MountTarget>>>,
    hoisted_styles: RefCell<HashMap<String, String>>,
    pinned_scopes: ScopeStack,
    script_scopes: ScopeStack,
    frame_probe: RefCell<Option<FrameProbe>>,
}

type ScopeStack = Rc<RefCell<Vec<Rc<Scope>>>>;

impl Environment {
    pub fn new(config: EnvironmentConfig) -> Rc<Self> {
        let origin = match Url::parse(&config.address) {
            Ok(url) => url.origin().ascii_serialization(),
            Err(err) => {
                warn!(target: "env", address = %config.address, %err, "host address is not an absolute URL");
                String::new()
            }
        };

        Rc::new(Self {
            origin,
            host_globals: HostGlobals::new(config.address.clone()),
            address: config.address,
            abs_root: config.abs_root,
            transport: config
                .transport
                .unwrap_or_else(|| Rc::new(HttpTransport::new())),
            root_scope: RefCell::new(None),
            sources: RefCell::new(Vec::new()),
            mount_targets: RefCell::new(HashMap::new()),
            hoisted_styles: RefCell::new(HashMap::new()),
            pinned_scopes: Rc::new(RefCell::new(Vec::new())),
            script_scopes: Rc::new(RefCell::new(Vec::new())),
            frame_probe: RefCell::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn abs_root(&self) -> Option<String> {
        self.abs_root.clone()
    }

    pub fn host_globals(&self) -> &Rc<HostGlobals> {
        &self.host_globals
    }

    pub fn host_location(&self) -> LocationInfo {
        host_location(&self.host_globals.href())
    }

    /// The root scope, created lazily exactly once per environment.
    pub fn root_scope(&self) -> Rc<Scope> {
        let mut slot = self.root_scope.borrow_mut();
        match &*slot {
            Some(scope) => Rc::clone(scope),
            None => {
                let path = Url::parse(&self.address)
                    .map(|url| url.path().to_string())
                    .unwrap_or_else(|_| self.address.clone());
                let scope = Scope::new(path, None);
                *slot = Some(Rc::clone(&scope));
                scope
            }
        }
    }

    /// Resolve the scope the currently executing code belongs to.
    ///
    /// Precedence: explicitly pinned registration context, then the scope of
    /// the executing script, then a matching isolated-frame probe, then the
    /// root scope. The silent root fallback is deliberate leniency: wiring
    /// gaps attach to the root rather than failing.
    pub fn connect_scope(&self) -> Rc<Scope> {
        if let Some(pinned) = self.pinned_scopes.borrow().last() {
            return Rc::clone(pinned);
        }
        if let Some(script) = self.script_scopes.borrow().last() {
            return Rc::clone(script);
        }
        if let Some(probe) = self.frame_probe.borrow().as_ref() {
            if probe.scope_tag.as_deref() == Some(probe.frame_address.as_str()) {
                if let Some(scope) = probe.host_scope.as_ref() {
                    return Rc::clone(scope);
                }
            }
        }
        self.root_scope()
    }

    /// Fetch-or-reuse a source by resolved locator. Repeated and concurrent
    /// calls for the same locator return the identical handle; the cache is
    /// append-only for the lifetime of the environment.
    pub fn import_source(&self, locator: &str, options: SourceOptions) -> SourceHandle {
        let scope = self.connect_scope();
        let base = options
            .base_url
            .unwrap_or_else(|| scope.url().to_string());
        let abs_root = options.abs_root.or_else(|| self.abs_root.clone());
        let resolved = resolve_path(&base, locator, abs_root.as_deref());

        if let Some(cached) = self
            .sources
            .borrow()
            .iter()
            .find(|source| source.locator() == resolved)
        {
            debug!(target: "source", locator = %resolved, "source cache hit");
            return Rc::clone(cached);
        }

        let source = Source::new(
            resolved,
            self.origin.clone(),
            abs_root,
            Rc::clone(&self.transport),
            options.loaders,
        );
        self.sources.borrow_mut().push(Rc::clone(&source));
        source
    }

    /// Register the visual container for a named application slot. Called by
    /// the custom-element wiring when the slot attaches.
    pub fn register_mount_target(&self, name: impl Into<String>, target: Rc<dyn MountTarget>) {
        self.mount_targets.borrow_mut().insert(name.into(), target);
    }

    pub fn unregister_mount_target(&self, name: &str) {
        self.mount_targets.borrow_mut().remove(name);
    }

    pub fn mount_target(&self, name: &str) -> Option<Rc<dyn MountTarget>> {
        self.mount_targets.borrow().get(name).cloned()
    }

    /// Replace the hoisted style block associated with an application name.
    pub fn hoist_style(&self, app_name: &str, css_text: String) {
        self.hoisted_styles
            .borrow_mut()
            .insert(app_name.to_string(), css_text);
    }

    pub fn remove_hoisted_style(&self, app_name: &str) {
        self.hoisted_styles.borrow_mut().remove(app_name);
    }

    pub fn hoisted_style(&self, app_name: &str) -> Option<String> {
        self.hoisted_styles.borrow().get(app_name).cloned()
    }

    /// Pin a scope as the registration context for the duration of the
    /// guard. Nested registration calls performed while the guard lives
    /// attach to this scope.
    pub fn pin_scope(&self, scope: Rc<Scope>) -> ScopeContextGuard {
        self.pinned_scopes.borrow_mut().push(scope);
        ScopeContextGuard {
            stack: Rc::clone(&self.pinned_scopes),
        }
    }

    /// Mark a scope as owning the currently executing script for the
    /// duration of the guard.
    pub fn enter_script_scope(&self, scope: Rc<Scope>) -> ScopeContextGuard {
        self.script_scopes.borrow_mut().push(scope);
        ScopeContextGuard {
            stack: Rc::clone(&self.script_scopes),
        }
    }

    pub fn set_frame_probe(&self, probe: Option<FrameProbe>) {
        *self.frame_probe.borrow_mut() = probe;
    }
}

/// RAII guard for a scope-resolution context entry; pops on drop so there is
/// no set/clear bracketing to get wrong.
pub struct ScopeContextGuard {
    stack: ScopeStack,
}

impl Drop for ScopeContextGuard {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}
