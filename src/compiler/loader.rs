use std::fs;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};

use crate::compiler::core::Compiler;
use crate::dsl::ProcessModel;
use crate::runtime::definition::ProcessDefinition;

pub fn load_process_from_yaml(file_path: &str) -> Result<ProcessModel> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path))?;

    parse_process(&yaml_content).with_context(|| format!("Failed to deserialize YAML content from {}", file_path))
}

pub fn parse_process(yaml_content: &str) -> Result<ProcessModel> {
    let model: ProcessModel = serde_yaml::from_str(yaml_content)?;
    Ok(model)
}

/// Loads and compiles in one go.
pub fn load_definition(file_path: &str, compiler: &Compiler) -> Result<(ProcessModel, Arc<ProcessDefinition>)> {
    let model = load_process_from_yaml(file_path)?;
    let definition = compiler
        .compile(&model)
        .with_context(|| format!("Failed to compile process '{}'", model.id))?;
    Ok((model, definition))
}
