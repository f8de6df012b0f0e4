use std::collections::HashMap;

use serde_json::Value;

use crate::error::PvmError;
use crate::runtime::execution::ExecutionId;
use crate::runtime::instance::ProcessInstance;

/// Hierarchical variable lookup over the execution tree.
///
/// Reads walk from an execution up to the root. Writes go to the nearest
/// level that already binds the name, otherwise to the nearest scope
/// execution, so a name is never bound twice along one path by `set_variable`.
impl ProcessInstance {
    pub fn get_variable_of(&self, execution: ExecutionId, name: &str) -> Option<Value> {
        let mut current = Some(self.resolve(execution));
        while let Some(id) = current {
            let e = self.get(id)?;
            if let Some(v) = e.variables.get(name) {
                return Some(v.clone());
            }
            current = e.parent;
        }
        None
    }

    pub fn set_variable_of(&mut self, execution: ExecutionId, name: &str, value: Value) -> Result<(), PvmError> {
        self.set_variable(execution, name, value)
    }

    pub(crate) fn set_variable(&mut self, execution: ExecutionId, name: &str, value: Value) -> Result<(), PvmError> {
        let start = self.resolve(execution);
        self.exec(start)?;

        let mut current = Some(start);
        while let Some(id) = current {
            let e = self.exec_mut(id)?;
            if let Some(slot) = e.variables.get_mut(name) {
                *slot = value;
                return Ok(());
            }
            current = e.parent;
        }

        let scope = self.scope_execution(start);
        self.exec_mut(scope)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub(crate) fn set_variable_local(&mut self, execution: ExecutionId, name: &str, value: Value) -> Result<(), PvmError> {
        let id = self.resolve(execution);
        self.exec_mut(id)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub(crate) fn get_variable_local(&self, execution: ExecutionId, name: &str) -> Option<Value> {
        self.get(self.resolve(execution))
            .and_then(|e| e.variables.get(name).cloned())
    }

    pub(crate) fn remove_variable_local(&mut self, execution: ExecutionId, name: &str) -> Option<Value> {
        let id = self.resolve(execution);
        self.get_mut(id).and_then(|e| e.variables.remove(name))
    }

    /// Everything visible from `execution`; inner bindings shadow outer ones.
    pub fn get_variables_of(&self, execution: ExecutionId) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut current = Some(self.resolve(execution));
        while let Some(id) = current {
            let Some(e) = self.get(id) else { break };
            chain.push(id);
            current = e.parent;
        }
        let mut merged = HashMap::new();
        for id in chain.into_iter().rev() {
            if let Some(e) = self.get(id) {
                merged.extend(e.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        merged
    }

    // --- process level ---

    /// Variable of the process instance (root execution).
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.get_variable_of(self.root, name)
    }

    pub fn set_process_variable(&mut self, name: &str, value: Value) -> Result<(), PvmError> {
        let root = self.root;
        self.set_variable_local(root, name, value)
    }

    /// Sets a batch of process variables; usually done before `start`.
    pub fn set_variables(&mut self, variables: HashMap<String, Value>) -> Result<(), PvmError> {
        for (name, value) in variables {
            self.set_process_variable(&name, value)?;
        }
        Ok(())
    }

    /// Variables of the root execution.
    pub fn get_variables(&self) -> HashMap<String, Value> {
        self.get_variables_of(self.root)
    }
}
