//! Name-keyed catalog of tools.

use super::{ToolDescriptor, ToolSpec};
use crate::error::{ReferatError, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Catalog of every tool the reasoning model may call.
///
/// Built once at startup; iteration follows registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one tool. Fails without modifying the registry on a name collision.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        if self.index.contains_key(&descriptor.name) {
            return Err(ReferatError::DuplicateToolName(descriptor.name));
        }
        debug!("Registered tool '{}' ({})", descriptor.name, descriptor.mode());
        self.index.insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(descriptor);
        Ok(())
    }

    /// Add a batch of tools, all or nothing.
    pub fn register_all(&mut self, descriptors: Vec<ToolDescriptor>) -> Result<usize> {
        let mut incoming = HashSet::new();
        for descriptor in &descriptors {
            if self.index.contains_key(&descriptor.name) || !incoming.insert(descriptor.name.as_str()) {
                return Err(ReferatError::DuplicateToolName(descriptor.name.clone()));
            }
        }

        let count = descriptors.len();
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(count)
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ReferatError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All tools in registration order.
    pub fn list_all(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Catalog as advertised to the reasoning model.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDescriptor::spec).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
