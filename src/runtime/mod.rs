pub(crate) mod agenda;
pub mod behavior;
pub mod builder;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod event;
pub mod execution;
pub mod instance;
pub mod job;
pub mod listener;
pub mod operations;
pub mod variables;
