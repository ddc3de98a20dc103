//! Named engine factories.
//!
//! The host registers a factory per engine implementation; the pool creates
//! one engine instance per worker through it. Factories are shared across
//! worker spawns, so they are `Send + Sync`.

use crate::{CalcEngine, EngineError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Builds one engine instance per call.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn CalcEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn CalcEngine>, EngineError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn CalcEngine>, EngineError> {
        self()
    }
}

/// Factory registry keyed by engine name.
#[derive(Default)]
pub struct EngineRegistry {
    factories: RwLock<HashMap<String, Arc<dyn EngineFactory>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a factory under `name`.
    pub fn register(&self, name: &str, factory: Arc<dyn EngineFactory>) {
        self.factories
            .write()
            .unwrap()
            .insert(name.to_string(), factory);
    }

    /// Look up the factory registered under `name`.
    pub fn factory(&self, name: &str) -> Result<Arc<dyn EngineFactory>, EngineError> {
        self.factories
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Unknown {
                name: name.to_string(),
            })
    }

    /// Create an engine instance by registered name.
    pub fn create_engine(&self, name: &str) -> Result<Box<dyn CalcEngine>, EngineError> {
        self.factory(name)?.create()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}
