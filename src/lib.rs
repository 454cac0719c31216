//! Host multiple independently-sourced micro applications on one page-like
//! environment, each isolated behind a virtual global context, with
//! hierarchical message passing between them.

pub mod app;
pub mod css;
pub mod env;
pub mod mount;
pub mod path;
pub mod sandbox;
pub mod scope;
pub mod source;
pub mod transform;

use std::rc::Rc;

pub use app::{register_micro_app, AppConfig, AppState, MicroApp, Placeholder, SourceProvider};
pub use css::CssRule;
pub use env::{Environment, EnvironmentConfig, FrameProbe};
pub use mount::{IsolationMode, MountParams, MountTarget, TargetEvents};
pub use path::{host_location, resolve_path, LocationInfo};
pub use sandbox::{run_in_sandbox, ScriptError, VirtualGlobals};
pub use scope::Scope;
pub use source::{
    HttpTransport, IsolatedLoaderMap, SourceError, SourceHandle, SourceOptions, Transport,
};
pub use transform::{parse_source, ElementRecord, ParsedSource, ScriptRecord, StyleRecord};

/// Resolve the scope the calling code belongs to (the root scope when no
/// more specific context applies).
pub fn connect_scope(env: &Rc<Environment>) -> Rc<Scope> {
    env.connect_scope()
}

/// Fetch-or-reuse a source resource by locator, resolved against the
/// connected scope.
pub fn import_source(
    env: &Rc<Environment>,
    locator: &str,
    options: SourceOptions,
) -> SourceHandle {
    env.import_source(locator, options)
}
