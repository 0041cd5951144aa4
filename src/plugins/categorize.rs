//! Sort seeded items into named buckets.
//!
//! The chosen bucket is recorded in each item's `categorize` metadata block,
//! which is what the `bucket_rollup` transfer profile groups on.

use super::{autosave_from_config, ItemBoard};
use crate::bundle::{Bundle, Item};
use crate::plugin::{ActivityContext, ActivityPlugin};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Mutex;

pub const TOOL_TYPE: &str = "categorize";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Action {
    AddBucket { name: String },
    Assign { item_id: String, bucket: String },
    List,
}

#[derive(Debug)]
pub struct Categorize {
    autosave_seconds: Option<u64>,
    buckets: Mutex<Vec<String>>,
    board: ItemBoard,
}

impl Categorize {
    pub fn from_config(config: &Value) -> Result<Self> {
        let buckets: Vec<String> = match config.get("buckets") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value(v.clone()).context("buckets must be a list of names")?,
        };
        Ok(Self {
            autosave_seconds: autosave_from_config(config),
            buckets: Mutex::new(buckets),
            board: ItemBoard::default(),
        })
    }

    fn bucket_names(&self) -> Vec<String> {
        self.buckets
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    fn assign(&self, item_id: &str, bucket: &str) -> Result<()> {
        if !self.bucket_names().iter().any(|b| b == bucket) {
            return Err(anyhow!("unknown bucket {}", bucket));
        }
        let mut items = self.board.lock();
        let item: &mut Item = items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| anyhow!("no item with id {}", item_id))?;
        let block = item
            .metadata
            .entry(TOOL_TYPE)
            .or_insert_with(|| json!({}));
        match block.as_object_mut() {
            Some(obj) => {
                obj.insert("bucket".into(), json!(bucket));
                Ok(())
            }
            None => Err(anyhow!("item {} has a non-object {} block", item_id, TOOL_TYPE)),
        }
    }
}

#[async_trait]
impl ActivityPlugin for Categorize {
    fn tool_type(&self) -> &str {
        TOOL_TYPE
    }

    fn autosave_seconds(&self) -> Option<u64> {
        self.autosave_seconds
    }

    async fn open(&self, ctx: &ActivityContext, input: &Bundle) -> Result<()> {
        if let Some(draft) = ctx.load_draft_bundle().await? {
            self.board.merge(&draft.items);
            if let Some(names) = draft
                .metadata
                .get(TOOL_TYPE)
                .and_then(|b| b.get("buckets"))
                .and_then(|b| serde_json::from_value::<Vec<String>>(b.clone()).ok())
            {
                if let Ok(mut buckets) = self.buckets.lock() {
                    for name in names {
                        if !buckets.contains(&name) {
                            buckets.push(name);
                        }
                    }
                }
            }
        }
        self.board.merge(&input.items);
        Ok(())
    }

    async fn snapshot(&self, _ctx: &ActivityContext) -> Result<Option<Bundle>> {
        let mut bundle = self.board.to_bundle();
        bundle
            .metadata
            .insert(TOOL_TYPE.into(), json!({ "buckets": self.bucket_names() }));
        Ok(Some(bundle))
    }

    async fn close(&self, ctx: &ActivityContext) -> Result<()> {
        let mut metadata = Map::new();
        metadata.insert(TOOL_TYPE.into(), json!({ "buckets": self.bucket_names() }));
        ctx.finalize_output_bundle(self.board.to_vec(), metadata)
    }

    async fn handle_action(&self, _ctx: &ActivityContext, action: Value) -> Result<Value> {
        match serde_json::from_value::<Action>(action)? {
            Action::AddBucket { name } => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(anyhow!("bucket name must be non-empty"));
                }
                let mut buckets = self
                    .buckets
                    .lock()
                    .map_err(|_| anyhow!("bucket list lock poisoned"))?;
                if !buckets.contains(&name) {
                    buckets.push(name);
                }
                Ok(json!({ "buckets": buckets.clone() }))
            }
            Action::Assign { item_id, bucket } => {
                self.assign(&item_id, &bucket)?;
                Ok(json!({ "item_id": item_id, "bucket": bucket }))
            }
            Action::List => Ok(json!({
                "buckets": self.bucket_names(),
                "items": self.board.to_vec(),
            })),
        }
    }
}
