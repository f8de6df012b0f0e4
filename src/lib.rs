pub mod actions;
pub mod behaviors;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod error;
pub mod runtime;

pub use error::{BpmnError, PvmError};
pub use runtime::builder::ProcessDefinitionBuilder;
pub use runtime::definition::ProcessDefinition;
pub use runtime::engine::Engine;
pub use runtime::instance::ProcessInstance;
