use crate::error::RuntimeError;
use crate::run::Run;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs addressable by name.
#[derive(Default)]
pub struct RunRegistry {
    runs: HashMap<String, Arc<dyn Run>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `run` under its own name, replacing any previous entry.
    pub fn register(&mut self, run: Arc<dyn Run>) {
        let name = run.name().to_string();
        if self.runs.insert(name.clone(), run).is_some() {
            warn!("Replaced run: {}", name);
        } else {
            info!("Registered run: {}", name);
        }
    }

    pub fn with(mut self, run: Arc<dyn Run>) -> Self {
        self.register(run);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Run>, RuntimeError> {
        self.runs
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownRun(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.runs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
