//! The contract every activity behavior module implements, and the registry
//! that resolves a `tool_type` into a plugin instance.

use crate::bundle::{Bundle, BundleStore, Item};
use crate::error::OrchestratorError;
use crate::model::BundleKind;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

static TOOL_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").expect("valid tool type pattern"));

pub fn is_valid_tool_type(tool_type: &str) -> bool {
    TOOL_TYPE_RE.is_match(tool_type)
}

/// Bundle access handed to a plugin for one activity.
///
/// `finalize_output_bundle` only stages the output; the state machine
/// persists it after `close` returns successfully, so a failing close never
/// leaves a partial output behind.
pub struct ActivityContext {
    meeting_id: String,
    activity_id: String,
    tool_type: String,
    store: Arc<dyn BundleStore>,
    staged_output: Mutex<Option<Bundle>>,
}

impl fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityContext")
            .field("meeting_id", &self.meeting_id)
            .field("activity_id", &self.activity_id)
            .field("tool_type", &self.tool_type)
            .finish_non_exhaustive()
    }
}

impl ActivityContext {
    pub fn new(
        meeting_id: impl Into<String>,
        activity_id: impl Into<String>,
        tool_type: impl Into<String>,
        store: Arc<dyn BundleStore>,
    ) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            activity_id: activity_id.into(),
            tool_type: tool_type.into(),
            store,
            staged_output: Mutex::new(None),
        }
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn tool_type(&self) -> &str {
        &self.tool_type
    }

    /// The activity's input bundle, or an empty one if none was seeded.
    pub async fn load_input_bundle(&self) -> Result<Bundle> {
        Ok(self
            .store
            .load(&self.meeting_id, &self.activity_id, BundleKind::Input)
            .await?
            .unwrap_or_default())
    }

    /// The last persisted draft, if any. Plugins decide whether to trust it.
    pub async fn load_draft_bundle(&self) -> Result<Option<Bundle>> {
        self.store
            .load(&self.meeting_id, &self.activity_id, BundleKind::Draft)
            .await
    }

    pub async fn save_draft_bundle(&self, items: Vec<Item>, metadata: Map<String, Value>) -> Result<()> {
        self.store_draft(&Bundle::new(items, metadata)).await
    }

    pub(crate) async fn store_draft(&self, bundle: &Bundle) -> Result<()> {
        bundle.validate()?;
        self.store
            .save_draft(&self.meeting_id, &self.activity_id, bundle)
            .await
    }

    /// Stage the output bundle for this close. May be called once per close.
    pub fn finalize_output_bundle(&self, items: Vec<Item>, metadata: Map<String, Value>) -> Result<()> {
        let bundle = Bundle::new(items, metadata);
        bundle.validate()?;
        let mut staged = self
            .staged_output
            .lock()
            .map_err(|_| anyhow!("output staging lock poisoned"))?;
        if staged.is_some() {
            return Err(anyhow!(
                "output bundle for {} already finalized",
                self.activity_id
            ));
        }
        *staged = Some(bundle);
        Ok(())
    }

    pub(crate) fn take_staged_output(&self) -> Option<Bundle> {
        self.staged_output.lock().ok().and_then(|mut s| s.take())
    }
}

#[async_trait]
pub trait ActivityPlugin: Send + Sync {
    fn tool_type(&self) -> &str;

    /// Preferred autosave period; the scheduler clamps it to its bounds.
    fn autosave_seconds(&self) -> Option<u64> {
        None
    }

    async fn open(&self, ctx: &ActivityContext, input: &Bundle) -> Result<()>;

    /// Current work product for autosave. `None` opts out of autosave.
    async fn snapshot(&self, _ctx: &ActivityContext) -> Result<Option<Bundle>> {
        Ok(None)
    }

    /// Must call `ctx.finalize_output_bundle` before returning `Ok`.
    async fn close(&self, ctx: &ActivityContext) -> Result<()>;

    /// Tool-specific interaction forwarded from participants.
    async fn handle_action(&self, _ctx: &ActivityContext, _action: Value) -> Result<Value> {
        Err(anyhow!("{} does not accept actions", self.tool_type()))
    }
}

pub type PluginFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn ActivityPlugin>> + Send + Sync + 'static>;

/// Lookup table from `tool_type` to a factory producing one plugin instance
/// per agenda activity.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("tool_types", &self.tool_types())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bundled plugins.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::plugins::register_builtin(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, tool_type: &str, factory: F) -> Result<(), OrchestratorError>
    where
        F: Fn(&Value) -> Result<Arc<dyn ActivityPlugin>> + Send + Sync + 'static,
    {
        if !is_valid_tool_type(tool_type) {
            return Err(OrchestratorError::InvalidToolType(tool_type.to_string()));
        }
        self.factories
            .insert(tool_type.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, tool_type: &str) -> bool {
        self.factories.contains_key(tool_type)
    }

    pub fn tool_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn create(
        &self,
        tool_type: &str,
        config: &Value,
    ) -> Result<Arc<dyn ActivityPlugin>, OrchestratorError> {
        if !is_valid_tool_type(tool_type) {
            return Err(OrchestratorError::InvalidToolType(tool_type.to_string()));
        }
        let factory = self
            .factories
            .get(tool_type)
            .ok_or_else(|| OrchestratorError::UnknownTool(tool_type.to_string()))?;
        (factory.as_ref())(config).map_err(OrchestratorError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::MemoryBundleStore;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl ActivityPlugin for Noop {
        fn tool_type(&self) -> &str {
            "noop"
        }
        async fn open(&self, _ctx: &ActivityContext, _input: &Bundle) -> Result<()> {
            Ok(())
        }
        async fn close(&self, ctx: &ActivityContext) -> Result<()> {
            ctx.finalize_output_bundle(vec![], Map::new())
        }
    }

    #[test]
    fn tool_type_names() {
        assert!(is_valid_tool_type("brainstorm"));
        assert!(is_valid_tool_type("multi_vote-2"));
        assert!(!is_valid_tool_type("Brainstorm"));
        assert!(!is_valid_tool_type("2vote"));
        assert!(!is_valid_tool_type(""));
    }

    #[test]
    fn registry_resolves_registered_tools() {
        let mut registry = PluginRegistry::new();
        registry
            .register("noop", |_cfg| Ok(Arc::new(Noop) as Arc<dyn ActivityPlugin>))
            .unwrap();
        assert!(registry.register("Bad Name", |_cfg| Ok(Arc::new(Noop) as Arc<dyn ActivityPlugin>)).is_err());
        assert_eq!(registry.create("noop", &json!({})).unwrap().tool_type(), "noop");
        assert!(matches!(
            registry.create("voting", &json!({})),
            Err(OrchestratorError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn output_can_be_staged_once() {
        let ctx = ActivityContext::new("m", "a", "noop", Arc::new(MemoryBundleStore::new()));
        ctx.finalize_output_bundle(vec![Item::new("1", "x")], Map::new())
            .unwrap();
        assert!(ctx.finalize_output_bundle(vec![], Map::new()).is_err());
        let staged = ctx.take_staged_output().unwrap();
        assert_eq!(staged.items.len(), 1);
        assert!(ctx.take_staged_output().is_none());
        assert!(ctx.load_input_bundle().await.unwrap().items.is_empty());
    }
}
