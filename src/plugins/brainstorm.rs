//! Free-form idea collection with threaded comments.

use super::{autosave_from_config, ItemBoard};
use crate::bundle::{Bundle, Item};
use crate::plugin::{ActivityContext, ActivityPlugin};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

pub const TOOL_TYPE: &str = "brainstorm";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Action {
    AddIdea {
        content: Value,
        #[serde(default)]
        author: Option<String>,
    },
    AddComment {
        parent_id: String,
        content: Value,
        #[serde(default)]
        author: Option<String>,
    },
    List,
}

#[derive(Debug)]
pub struct Brainstorm {
    autosave_seconds: Option<u64>,
    allow_comments: bool,
    board: ItemBoard,
}

impl Brainstorm {
    pub fn from_config(config: &Value) -> Self {
        Self {
            autosave_seconds: autosave_from_config(config),
            allow_comments: config
                .get("allow_comments")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            board: ItemBoard::default(),
        }
    }

    fn add(&self, parent_id: Option<String>, content: Value, author: Option<String>) -> Result<String> {
        let mut items = self.board.lock();
        if let Some(parent) = parent_id.as_deref() {
            if !items.iter().any(|i| i.id == parent) {
                return Err(anyhow!("no idea with id {}", parent));
            }
        }
        let prefix = if parent_id.is_some() { "comment" } else { "idea" };
        let mut n = items.len() + 1;
        while items.iter().any(|i| i.id == format!("{}-{}", prefix, n)) {
            n += 1;
        }
        let mut item = Item::new(format!("{}-{}", prefix, n), content);
        item.metadata.insert(
            TOOL_TYPE.into(),
            json!({ "kind": prefix, "author": author }),
        );
        item.parent_id = parent_id;
        let id = item.id.clone();
        items.push(item);
        Ok(id)
    }
}

#[async_trait]
impl ActivityPlugin for Brainstorm {
    fn tool_type(&self) -> &str {
        TOOL_TYPE
    }

    fn autosave_seconds(&self) -> Option<u64> {
        self.autosave_seconds
    }

    async fn open(&self, ctx: &ActivityContext, input: &Bundle) -> Result<()> {
        // A draft left by a previous run holds everything the input had plus
        // whatever was added before the interruption.
        let recovered = match ctx.load_draft_bundle().await? {
            Some(draft) => self.board.merge(&draft.items),
            None => 0,
        };
        let seeded = self.board.merge(&input.items);
        info!(
            activity_id = ctx.activity_id(),
            recovered, seeded, "brainstorm opened"
        );
        Ok(())
    }

    async fn snapshot(&self, _ctx: &ActivityContext) -> Result<Option<Bundle>> {
        Ok(Some(self.board.to_bundle()))
    }

    async fn close(&self, ctx: &ActivityContext) -> Result<()> {
        let items = self.board.to_vec();
        let comments = items.iter().filter(|i| i.parent_id.is_some()).count();
        let mut metadata = Map::new();
        metadata.insert(
            TOOL_TYPE.into(),
            json!({ "idea_count": items.len() - comments, "comment_count": comments }),
        );
        ctx.finalize_output_bundle(items, metadata)
    }

    async fn handle_action(&self, _ctx: &ActivityContext, action: Value) -> Result<Value> {
        match serde_json::from_value::<Action>(action)? {
            Action::AddIdea { content, author } => {
                let id = self.add(None, content, author)?;
                Ok(json!({ "item_id": id }))
            }
            Action::AddComment {
                parent_id,
                content,
                author,
            } => {
                if !self.allow_comments {
                    return Err(anyhow!("comments are disabled for this activity"));
                }
                let id = self.add(Some(parent_id), content, author)?;
                Ok(json!({ "item_id": id }))
            }
            Action::List => Ok(json!({ "items": self.board.to_vec() })),
        }
    }
}
