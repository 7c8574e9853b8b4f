//! HandlerRegistry - task_type → handler の対応表
//!
//! - 起動時に組み立てる（mutable）
//! - 以降は processor から読み取り専用で共有するのでロック不要

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::domain::TaskType;
use crate::ports::OutboxHandler;
use crate::typed::{Handler, Task, TypedHandler};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    DuplicateHandler(TaskType),

    #[error("task type must not be blank")]
    BlankTaskType,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own `task_type()`.
    pub fn register(&mut self, handler: Arc<dyn OutboxHandler>) -> Result<(), RegistryError> {
        let task_type = TaskType::new(handler.task_type());
        if task_type.is_blank() {
            return Err(RegistryError::BlankTaskType);
        }
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register_typed<T, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.register(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn OutboxHandler>> {
        self.handlers.get(task_type)
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered types, sorted.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}
