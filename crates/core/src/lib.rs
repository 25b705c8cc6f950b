//! dloop core: platform entities, error taxonomy and small entity helpers.

#![forbid(unsafe_code)]

pub mod artifacts;
pub mod entities;
pub mod error;
pub mod ontology;

pub use entities::{
    Bot, BotRef, Codebase, EntityOrRaw, ExecutionMode, Execution, Package, Project, Service,
    Trigger, TriggerResource,
};
pub use error::{DloopError, DloopResult};

pub type Json = serde_json::Value;
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Module name the platform assumes when a service does not name one.
pub const DEFAULT_MODULE_NAME: &str = "default_module";
/// Function a trigger or execution targets when none is given.
pub const DEFAULT_FUNCTION_NAME: &str = "run";
/// Service name used when a deploy request omits one.
pub const DEFAULT_SERVICE_NAME: &str = "default-service";

pub mod prelude {
    pub use super::{
        Bot, BotRef, DloopError, DloopResult, Execution, Json, JsonMap, Package, Project, Service,
        Trigger, TriggerResource,
    };
}
