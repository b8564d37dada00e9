//! Evaluation state: the global scope handed to the engine.

use std::collections::BTreeMap;

use tern_runtime::RtError;

use crate::value::Value;

/// Global scope mapping names to values (native verbs included).
///
/// Each top-level evaluation owns one `State`; `serve` builds a fresh one
/// per request and copies in the shared globals by reference.
#[derive(Debug, Default)]
pub struct State {
    globals: BTreeMap<String, Value>,
}

impl State {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Install a binding that must not already exist (command aliases).
    pub fn declare_unique(&mut self, name: &str, value: Value) -> Result<(), RtError> {
        if self.globals.contains_key(name) {
            return Err(RtError::invalid_args(format!(
                "global '{name}' is already defined"
            )));
        }
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    /// Sorted global names (the completer's identifier universe).
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.globals.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.globals.iter()
    }
}
