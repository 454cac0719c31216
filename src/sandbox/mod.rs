pub mod engine;
pub mod executor;
pub mod globals;

pub use engine::ScriptEngine;
pub use executor::{check_brace_balance, run_in_sandbox, ScriptError};
pub use globals::{
    BackingFrame, DocumentSurrogate, GlobalTable, HistoryStack, HistorySurrogate, HostGlobals,
    LayeredObject, LocationSurrogate, SandboxSeed, VirtualGlobals, WindowSurrogate,
};
