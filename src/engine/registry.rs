//! Task definitions by name.
//!
//! The registry is an explicit object handed to [`TaskSystem::init`]
//! (`crate::engine::TaskSystem`); nothing is process-global.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use super::handler::TaskDefinition;
use crate::error::{Error, Result};
use crate::model::validate_task_name;

#[derive(Debug, Default)]
pub struct TaskRegistry {
    definitions: RwLock<HashMap<String, Arc<TaskDefinition>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition. Names are unique.
    pub fn register(&self, definition: TaskDefinition) -> Result<Arc<TaskDefinition>> {
        validate_task_name(&definition.name)?;
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if definitions.contains_key(&definition.name) {
            return Err(Error::Validation(format!(
                "task {} is already registered",
                definition.name
            )));
        }
        let definition = Arc::new(definition);
        definitions.insert(definition.name.clone(), Arc::clone(&definition));
        info!(task = %definition.name, "task registered");
        Ok(definition)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Like [`get`](Self::get), but unknown names are an error.
    pub fn require(&self, name: &str) -> Result<Arc<TaskDefinition>> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(format!("no task registered as {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
