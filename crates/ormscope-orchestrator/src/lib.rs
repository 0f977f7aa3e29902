#![forbid(unsafe_code)]

pub mod attribution;
pub mod bridge;
pub mod config;
pub mod interception;
pub mod introspect;
pub mod orchestrator;
pub mod playground;

pub use attribution::resolve;
pub use bridge::{InteractiveOutcome, SessionBridge};
pub use config::PlaygroundConfig;
pub use interception::{
    ActiveScript, InterceptingCursor, InterceptionContext, InterceptorRegistry, PhaseGuard,
};
pub use introspect::{ColumnInfo, Introspector, QueryOutcome};
pub use orchestrator::{format_script_error, DiscoveredModel, Orchestrator, RunOutcome};
pub use playground::{Playground, PlaygroundError};
