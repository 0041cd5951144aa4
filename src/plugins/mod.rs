//! Bundled activity plugins.
//!
//! These are deliberately thin: they keep their work product as a list of
//! bundle items and rely on the core for persistence and handoff.

pub mod brainstorm;
pub mod categorize;

use crate::bundle::{Bundle, Item};
use crate::plugin::{ActivityPlugin, PluginRegistry};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

pub use brainstorm::Brainstorm;
pub use categorize::Categorize;

pub fn register_builtin(registry: &mut PluginRegistry) {
    // Names are compile-time constants that satisfy the tool type pattern.
    let _ = registry.register(brainstorm::TOOL_TYPE, |config| {
        Ok(Arc::new(Brainstorm::from_config(config)) as Arc<dyn ActivityPlugin>)
    });
    let _ = registry.register(categorize::TOOL_TYPE, |config| {
        Ok(Arc::new(Categorize::from_config(config)?) as Arc<dyn ActivityPlugin>)
    });
}

fn autosave_from_config(config: &Value) -> Option<u64> {
    config.get("autosave_seconds").and_then(Value::as_u64)
}

/// Ordered item list shared by the bundled plugins.
#[derive(Debug, Default)]
pub(crate) struct ItemBoard {
    items: Mutex<Vec<Item>>,
}

impl ItemBoard {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<Item>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add items whose ids are not on the board yet. Returns how many were added.
    pub(crate) fn merge(&self, incoming: &[Item]) -> usize {
        let mut items = self.lock();
        let mut added = 0;
        for item in incoming {
            if !items.iter().any(|existing| existing.id == item.id) {
                items.push(item.clone());
                added += 1;
            }
        }
        added
    }

    pub(crate) fn to_vec(&self) -> Vec<Item> {
        self.lock().clone()
    }

    pub(crate) fn to_bundle(&self) -> Bundle {
        Bundle::new(self.to_vec(), Default::default())
    }
}
