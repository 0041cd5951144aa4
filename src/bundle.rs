//! Bundle payloads and the stores that persist them.
//!
//! A bundle is the `{items, metadata}` payload exchanged between the core and
//! an activity plugin. Stores key bundles by `(meeting_id, activity_id, kind)`:
//! `input` is insert-if-absent, `draft` is overwritten, and every `output` is
//! an immutable revision.

use crate::db::{self, Pool};
use crate::model::{Activity, BundleKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::error;

/// Pointer from a derived item back to the item it was copied from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemSource {
    pub activity_id: String,
    pub original_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub source: Option<ItemSource>,
}

impl Item {
    pub fn new(id: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            parent_id: None,
            metadata: Map::new(),
            source: None,
        }
    }

    /// Record `activity_id` as the origin unless the item already has one.
    pub fn stamp_source(&mut self, activity_id: &str) {
        if self.source.is_none() {
            self.source = Some(ItemSource {
                activity_id: activity_id.to_string(),
                original_id: self.id.clone(),
            });
        }
    }

    /// Merge metadata blocks and source from `reference` that this item is
    /// missing. Existing values always win; nothing is removed.
    pub fn absorb_provenance(&mut self, reference: &Item) {
        merge_missing(&mut self.metadata, &reference.metadata);
        if self.source.is_none() {
            self.source = reference.source.clone();
        }
    }
}

/// Recursively copy keys from `from` that are absent in `into`.
pub fn merge_missing(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        match (into.get_mut(key), value) {
            (None, _) => {
                into.insert(key.clone(), value.clone());
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_missing(existing, incoming);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Bundle {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Bundle {
    pub fn new(items: Vec<Item>, metadata: Map<String, Value>) -> Self {
        Self { items, metadata }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a plugin-provided value, rejecting anything that isn't bundle-shaped.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(anyhow!("bundle must be a JSON object"));
        }
        let bundle: Bundle = serde_json::from_value(value).context("malformed bundle")?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Item ids must be unique within a bundle.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.id.trim().is_empty() {
                return Err(anyhow!("bundle item with empty id"));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(anyhow!("duplicate item id {} in bundle", item.id));
            }
        }
        Ok(())
    }

    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize bundle")
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).context("stored bundle is malformed")
    }
}

/// Durable bundle persistence. No business logic lives behind this trait.
///
/// Agenda rows always live in the SQLite `pool`. The two `*_activity`
/// methods pair a bundle write with a row write; a store that cannot share a
/// transaction with the pool undoes its bundle write when the row write fails.
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Latest bundle of `kind`; for outputs this is the newest revision.
    async fn load(&self, meeting_id: &str, activity_id: &str, kind: BundleKind)
        -> Result<Option<Bundle>>;

    /// Write the input bundle unless one exists. Returns whether it was written.
    async fn insert_input(&self, meeting_id: &str, activity_id: &str, bundle: &Bundle)
        -> Result<bool>;

    async fn save_draft(&self, meeting_id: &str, activity_id: &str, bundle: &Bundle) -> Result<()>;

    /// Append an immutable output revision and return its number.
    async fn append_output(&self, meeting_id: &str, activity_id: &str, bundle: &Bundle)
        -> Result<i64>;

    /// Remove the newest bundle of `kind`.
    async fn discard_latest(&self, meeting_id: &str, activity_id: &str, kind: BundleKind)
        -> Result<()>;

    /// Append the closing output and persist `activity` (already marked
    /// completed). Either both land or neither does.
    async fn complete_activity(&self, pool: &Pool, activity: &Activity, output: &Bundle) -> Result<i64> {
        let (meeting_id, activity_id) = (&activity.meeting_id, &activity.activity_id);
        let revision = self.append_output(meeting_id, activity_id, output).await?;
        if let Err(err) = db::update_activity(pool, activity).await {
            undo(self, meeting_id, activity_id, BundleKind::Output).await;
            return Err(err);
        }
        Ok(revision)
    }

    /// Write the input bundle, the agenda row and the idempotency key of a
    /// transfer target. Either all land or none does.
    async fn insert_seeded_activity(
        &self,
        pool: &Pool,
        activity: &Activity,
        input: &Bundle,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let (meeting_id, activity_id) = (&activity.meeting_id, &activity.activity_id);
        let inserted = self.insert_input(meeting_id, activity_id, input).await?;
        if let Err(err) = db::insert_activity_with_key(pool, activity, idempotency_key).await {
            if inserted {
                undo(self, meeting_id, activity_id, BundleKind::Input).await;
            }
            return Err(err);
        }
        Ok(())
    }
}

async fn undo<S: BundleStore + ?Sized>(store: &S, meeting_id: &str, activity_id: &str, kind: BundleKind) {
    if let Err(err) = store.discard_latest(meeting_id, activity_id, kind).await {
        error!(?err, meeting_id, activity_id, kind = kind.as_str(), "failed to roll back bundle write");
    }
}

#[derive(Debug, Clone)]
pub struct SqliteBundleStore {
    pool: Pool,
}

impl SqliteBundleStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BundleStore for SqliteBundleStore {
    async fn load(
        &self,
        meeting_id: &str,
        activity_id: &str,
        kind: BundleKind,
    ) -> Result<Option<Bundle>> {
        db::fetch_bundle_payload(&self.pool, meeting_id, activity_id, kind)
            .await?
            .map(|payload| Bundle::from_payload(&payload))
            .transpose()
    }

    async fn insert_input(
        &self,
        meeting_id: &str,
        activity_id: &str,
        bundle: &Bundle,
    ) -> Result<bool> {
        db::insert_input_bundle(&self.pool, meeting_id, activity_id, &bundle.to_payload()?).await
    }

    async fn save_draft(&self, meeting_id: &str, activity_id: &str, bundle: &Bundle) -> Result<()> {
        db::upsert_draft_bundle(&self.pool, meeting_id, activity_id, &bundle.to_payload()?).await
    }

    async fn append_output(
        &self,
        meeting_id: &str,
        activity_id: &str,
        bundle: &Bundle,
    ) -> Result<i64> {
        db::append_output_bundle(&self.pool, meeting_id, activity_id, &bundle.to_payload()?).await
    }

    async fn discard_latest(
        &self,
        meeting_id: &str,
        activity_id: &str,
        kind: BundleKind,
    ) -> Result<()> {
        db::delete_latest_bundle(&self.pool, meeting_id, activity_id, kind).await
    }

    async fn complete_activity(&self, _pool: &Pool, activity: &Activity, output: &Bundle) -> Result<i64> {
        db::complete_activity(&self.pool, activity, &output.to_payload()?).await
    }

    async fn insert_seeded_activity(
        &self,
        _pool: &Pool,
        activity: &Activity,
        input: &Bundle,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        db::insert_seeded_activity(&self.pool, activity, &input.to_payload()?, idempotency_key).await
    }
}

type StoreKey = (String, String, BundleKind);

/// Process-local store, used where persistence is not wanted (tests, dry runs).
#[derive(Debug, Default)]
pub struct MemoryBundleStore {
    rows: Mutex<HashMap<StoreKey, Vec<String>>>,
    draft_writes: Mutex<HashMap<(String, String), usize>>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times a draft has been written for the activity.
    pub fn draft_writes(&self, meeting_id: &str, activity_id: &str) -> usize {
        self.draft_writes
            .lock()
            .map(|m| {
                m.get(&(meeting_id.to_string(), activity_id.to_string()))
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn key(meeting_id: &str, activity_id: &str, kind: BundleKind) -> StoreKey {
        (meeting_id.to_string(), activity_id.to_string(), kind)
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("bundle store lock poisoned")
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn load(
        &self,
        meeting_id: &str,
        activity_id: &str,
        kind: BundleKind,
    ) -> Result<Option<Bundle>> {
        let rows = self.rows.lock().map_err(poisoned)?;
        rows.get(&Self::key(meeting_id, activity_id, kind))
            .and_then(|revisions| revisions.last())
            .map(|payload| Bundle::from_payload(payload))
            .transpose()
    }

    async fn insert_input(
        &self,
        meeting_id: &str,
        activity_id: &str,
        bundle: &Bundle,
    ) -> Result<bool> {
        let payload = bundle.to_payload()?;
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let slot = rows
            .entry(Self::key(meeting_id, activity_id, BundleKind::Input))
            .or_default();
        if !slot.is_empty() {
            return Ok(false);
        }
        slot.push(payload);
        Ok(true)
    }

    async fn save_draft(&self, meeting_id: &str, activity_id: &str, bundle: &Bundle) -> Result<()> {
        let payload = bundle.to_payload()?;
        self.rows.lock().map_err(poisoned)?.insert(
            Self::key(meeting_id, activity_id, BundleKind::Draft),
            vec![payload],
        );
        *self
            .draft_writes
            .lock()
            .map_err(poisoned)?
            .entry((meeting_id.to_string(), activity_id.to_string()))
            .or_default() += 1;
        Ok(())
    }

    async fn append_output(
        &self,
        meeting_id: &str,
        activity_id: &str,
        bundle: &Bundle,
    ) -> Result<i64> {
        let payload = bundle.to_payload()?;
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let slot = rows
            .entry(Self::key(meeting_id, activity_id, BundleKind::Output))
            .or_default();
        slot.push(payload);
        Ok(slot.len() as i64)
    }

    async fn discard_latest(
        &self,
        meeting_id: &str,
        activity_id: &str,
        kind: BundleKind,
    ) -> Result<()> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        if let Some(slot) = rows.get_mut(&Self::key(meeting_id, activity_id, kind)) {
            slot.pop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_rejects_malformed_bundles() {
        assert!(Bundle::from_value(json!([1, 2])).is_err());
        assert!(Bundle::from_value(json!({ "items": "nope" })).is_err());
        let dup = json!({ "items": [{ "id": "a" }, { "id": "a" }] });
        assert!(Bundle::from_value(dup).is_err());

        let ok = Bundle::from_value(json!({ "items": [{ "id": "a", "content": "x" }] })).unwrap();
        assert_eq!(ok.items[0].content, json!("x"));
        assert!(ok.items[0].source.is_none());
    }

    #[test]
    fn absorb_provenance_only_adds() {
        let mut reference = Item::new("1", "idea");
        reference
            .metadata
            .insert("voting".into(), json!({ "votes": 3, "rank": 1 }));
        reference
            .metadata
            .insert("comments".into(), json!(["nice"]));
        reference.stamp_source("m:brainstorm:1");

        let mut edited = Item::new("1", "idea (edited)");
        edited.metadata.insert("voting".into(), json!({ "votes": 5 }));
        edited.absorb_provenance(&reference);

        assert_eq!(edited.metadata["voting"], json!({ "votes": 5, "rank": 1 }));
        assert_eq!(edited.metadata["comments"], json!(["nice"]));
        assert_eq!(edited.source.unwrap().activity_id, "m:brainstorm:1");
    }

    #[tokio::test]
    async fn memory_store_follows_kind_rules() {
        let store = MemoryBundleStore::new();
        let first = Bundle::new(vec![Item::new("1", "a")], Map::new());
        let second = Bundle::new(vec![Item::new("2", "b")], Map::new());

        assert!(store.insert_input("m", "a", &first).await.unwrap());
        assert!(!store.insert_input("m", "a", &second).await.unwrap());
        let input = store.load("m", "a", BundleKind::Input).await.unwrap().unwrap();
        assert_eq!(input, first);

        store.save_draft("m", "a", &first).await.unwrap();
        store.save_draft("m", "a", &second).await.unwrap();
        assert_eq!(store.draft_writes("m", "a"), 2);

        assert_eq!(store.append_output("m", "a", &first).await.unwrap(), 1);
        assert_eq!(store.append_output("m", "a", &second).await.unwrap(), 2);
        let out = store.load("m", "a", BundleKind::Output).await.unwrap().unwrap();
        assert_eq!(out, second);

        store.discard_latest("m", "a", BundleKind::Output).await.unwrap();
        let out = store.load("m", "a", BundleKind::Output).await.unwrap().unwrap();
        assert_eq!(out, first);
        assert_eq!(store.append_output("m", "a", &second).await.unwrap(), 2);
    }
}
