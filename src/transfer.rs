//! Handoff of one activity's work product into a new agenda activity.
//!
//! A transfer reads the donor's latest output (or its input if it never
//! closed), reshapes the items through a named profile, lets the facilitator
//! save a pending draft, and finally commits a new activity whose input is
//! the edited items. Item `metadata` and `source` only ever grow along the
//! way, and the `transfer` metadata block carries an append-only history.

use crate::bundle::{merge_missing, Bundle, BundleStore, Item};
use crate::error::{OrchestratorError, Result};
use crate::machine::Meeting;
use crate::model::{Activity, BundleKind};
use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

pub const TRANSFER_SCHEMA_VERSION: u32 = 1;
/// Bundle metadata key holding [`TransferMetadata`].
pub const TRANSFER_KEY: &str = "transfer";
pub const DRAFT_ENTRY: &str = "transfer_draft";
pub const COMMIT_ENTRY: &str = "transfer_commit";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSource {
    pub activity_id: String,
    pub tool_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub tool_type: String,
    pub round_index: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub item_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferMetadata {
    pub schema_version: u32,
    pub round_index: i64,
    pub source: TransferSource,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub tools: Map<String, Value>,
}

impl TransferMetadata {
    pub fn from_bundle(bundle: &Bundle) -> Option<Self> {
        bundle
            .metadata
            .get(TRANSFER_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn write_into(&self, metadata: &mut Map<String, Value>) -> anyhow::Result<()> {
        metadata.insert(TRANSFER_KEY.into(), serde_json::to_value(self)?);
        Ok(())
    }
}

/// Caller-supplied rounds are clamped at zero and kept. Otherwise the round
/// follows the donor's agenda position but never drops below the round the
/// donor itself was seeded with.
pub fn derive_round_index(requested: Option<i64>, donor_order_index: i64, carried: Option<i64>) -> i64 {
    match requested {
        Some(round) => round.max(0),
        None => (donor_order_index - 1).max(0).max(carried.unwrap_or(0)),
    }
}

/// Pending transfer drafts live beside the donor under a synthetic id.
pub fn draft_activity_id(donor_activity_id: &str) -> String {
    format!("{}#transfer", donor_activity_id)
}

/// Reshapes donor items. Implementations may add items and metadata blocks
/// but must keep every donor item's `metadata` and `source`.
pub trait TransformProfile: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, donor_activity_id: &str, items: Vec<Item>) -> anyhow::Result<Vec<Item>>;
}

/// Identity, apart from stamping provenance on original items.
pub struct Standard;

impl TransformProfile for Standard {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn apply(&self, donor_activity_id: &str, mut items: Vec<Item>) -> anyhow::Result<Vec<Item>> {
        for item in &mut items {
            item.stamp_source(donor_activity_id);
        }
        Ok(items)
    }
}

/// Groups top-level items under one parent per `categorize.bucket`.
pub struct BucketRollup;

const UNCATEGORIZED: &str = "uncategorized";

impl BucketRollup {
    fn bucket_of(item: &Item) -> anyhow::Result<String> {
        match item.metadata.get("categorize").and_then(|b| b.get("bucket")) {
            None | Some(Value::Null) => Ok(UNCATEGORIZED.to_string()),
            Some(Value::String(name)) => Ok(name.clone()),
            Some(other) => bail!("item {} has a non-string bucket {}", item.id, other),
        }
    }
}

impl TransformProfile for BucketRollup {
    fn name(&self) -> &'static str {
        "bucket_rollup"
    }

    fn apply(&self, donor_activity_id: &str, items: Vec<Item>) -> anyhow::Result<Vec<Item>> {
        let mut groups: Vec<(String, Vec<Item>)> = Vec::new();
        let mut threaded = Vec::new();
        for mut item in items {
            item.stamp_source(donor_activity_id);
            if item.parent_id.is_some() {
                threaded.push(item);
                continue;
            }
            let bucket = Self::bucket_of(&item)?;
            match groups.iter_mut().find(|(name, _)| *name == bucket) {
                Some((_, members)) => members.push(item),
                None => groups.push((bucket, vec![item])),
            }
        }

        let mut out = Vec::new();
        for (bucket, members) in groups {
            let parent_id = format!("bucket:{}", bucket);
            let mut parent = Item::new(parent_id.clone(), bucket.clone());
            parent.metadata.insert(
                self.name().into(),
                json!({ "bucket": bucket, "item_count": members.len() }),
            );
            out.push(parent);
            for mut member in members {
                member.parent_id = Some(parent_id.clone());
                out.push(member);
            }
        }
        out.extend(threaded);
        Ok(out)
    }
}

pub fn profile(name: &str) -> Option<&'static dyn TransformProfile> {
    match name {
        "standard" => Some(&Standard),
        "bucket_rollup" => Some(&BucketRollup),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

/// Display toggles. They choose which items are copied and never touch the
/// metadata of the items that are kept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferOptions {
    #[serde(default = "default_true")]
    pub include_comments: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            include_comments: true,
        }
    }
}

impl TransferOptions {
    fn filter(&self, items: Vec<Item>) -> Vec<Item> {
        if self.include_comments {
            return items;
        }
        items.into_iter().filter(|i| i.parent_id.is_none()).collect()
    }
}

/// What the facilitator edits before saving or committing.
#[derive(Debug, Clone, Serialize)]
pub struct TransferDraft {
    pub donor_activity_id: String,
    pub profile: String,
    pub round_index: i64,
    pub items: Vec<Item>,
    pub metadata: Map<String, Value>,
}

fn default_config() -> Value {
    json!({})
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRequest {
    pub donor_activity_id: String,
    pub items: Vec<Item>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub target_tool_type: String,
    #[serde(default = "default_config")]
    pub config: Value,
    #[serde(default)]
    pub round_index: Option<i64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Stored state of a donor as seen by the transfer engine.
struct DonorView {
    activity: Activity,
    bundle: Bundle,
    carried: Option<TransferMetadata>,
    pending: Option<TransferMetadata>,
}

pub struct TransferEngine {
    store: Arc<dyn BundleStore>,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn BundleStore>) -> Self {
        Self { store }
    }

    async fn donor(&self, meeting: &Meeting, donor_activity_id: &str) -> Result<DonorView> {
        let activity = meeting.activity(donor_activity_id).await?;
        self.donor_view(meeting.id(), activity).await
    }

    async fn donor_view(&self, meeting_id: &str, activity: Activity) -> Result<DonorView> {
        let donor_activity_id = activity.activity_id.as_str();
        let input = self
            .store
            .load(meeting_id, donor_activity_id, BundleKind::Input)
            .await?;
        let output = self
            .store
            .load(meeting_id, donor_activity_id, BundleKind::Output)
            .await?;
        let carried = output
            .as_ref()
            .and_then(TransferMetadata::from_bundle)
            .or_else(|| input.as_ref().and_then(TransferMetadata::from_bundle));
        let pending = self
            .store
            .load(meeting_id, &draft_activity_id(donor_activity_id), BundleKind::Draft)
            .await?
            .as_ref()
            .and_then(TransferMetadata::from_bundle);
        Ok(DonorView {
            activity,
            bundle: output.or(input).unwrap_or_default(),
            carried,
            pending,
        })
    }

    /// Existing history is never dropped: a pending draft already contains
    /// everything carried from the donor chain.
    fn base_metadata(donor: &DonorView, round_index: i64) -> TransferMetadata {
        let prior = donor.pending.as_ref().or(donor.carried.as_ref());
        let mut tools = prior.map(|p| p.tools.clone()).unwrap_or_default();
        if let Some(block) = donor.bundle.metadata.get(&donor.activity.tool_type) {
            tools
                .entry(donor.activity.tool_type.clone())
                .or_insert_with(|| block.clone());
        }
        TransferMetadata {
            schema_version: TRANSFER_SCHEMA_VERSION,
            round_index,
            source: TransferSource {
                activity_id: donor.activity.activity_id.clone(),
                tool_type: donor.activity.tool_type.clone(),
            },
            history: prior.map(|p| p.history.clone()).unwrap_or_default(),
            tools,
        }
    }

    fn round_for(donor: &DonorView, requested: Option<i64>) -> i64 {
        match (requested, donor.pending.as_ref()) {
            (None, Some(pending)) => pending.round_index,
            _ => derive_round_index(
                requested,
                donor.activity.order_index,
                donor.carried.as_ref().map(|c| c.round_index),
            ),
        }
    }

    #[instrument(skip_all, fields(meeting_id = %meeting.id(), donor = %donor_activity_id, profile = %profile_name))]
    pub async fn load_bundle(
        &self,
        meeting: &Meeting,
        donor_activity_id: &str,
        profile_name: &str,
        options: TransferOptions,
    ) -> Result<TransferDraft> {
        let transform = profile(profile_name).ok_or_else(|| OrchestratorError::TransformFailure {
            profile: profile_name.to_string(),
            reason: "unknown transform profile".into(),
        })?;
        let donor = self.donor(meeting, donor_activity_id).await?;
        let items = transform
            .apply(donor_activity_id, options.filter(donor.bundle.items.clone()))
            .map_err(|err| OrchestratorError::TransformFailure {
                profile: profile_name.to_string(),
                reason: format!("{:#}", err),
            })?;

        let round_index = Self::round_for(&donor, None);
        let mut metadata = donor.bundle.metadata.clone();
        Self::base_metadata(&donor, round_index).write_into(&mut metadata)?;
        info!(items = items.len(), round_index, "transfer bundle loaded");
        Ok(TransferDraft {
            donor_activity_id: donor_activity_id.to_string(),
            profile: profile_name.to_string(),
            round_index,
            items,
            metadata,
        })
    }

    /// Apply retention and history to edited items, producing the bundle
    /// that is stored as a draft or seeded as input.
    fn prepare(
        donor: &DonorView,
        mut items: Vec<Item>,
        mut metadata: Map<String, Value>,
        requested_round: Option<i64>,
        entry: &str,
    ) -> Result<(Bundle, i64)> {
        retain_provenance(&mut items, &donor.activity.activity_id, &donor.bundle.items);

        let round_index = Self::round_for(donor, requested_round);
        let mut transfer = Self::base_metadata(donor, round_index);
        if let Some(tools) = metadata
            .get(TRANSFER_KEY)
            .and_then(|t| t.get("tools"))
            .and_then(Value::as_object)
        {
            merge_missing(&mut transfer.tools, tools);
        }
        transfer.history.push(HistoryEntry {
            tool_type: entry.to_string(),
            round_index,
            created_at: Utc::now(),
            item_count: items.len(),
        });
        transfer.write_into(&mut metadata)?;
        merge_missing(&mut metadata, &donor.bundle.metadata);

        let bundle = Bundle::new(items, metadata);
        bundle
            .validate()
            .map_err(|err| OrchestratorError::TransformFailure {
                profile: entry.to_string(),
                reason: err.to_string(),
            })?;
        Ok((bundle, round_index))
    }

    #[instrument(skip_all, fields(meeting_id = %meeting.id(), donor = %donor_activity_id))]
    pub async fn save_draft(
        &self,
        meeting: &Meeting,
        donor_activity_id: &str,
        items: Vec<Item>,
        metadata: Map<String, Value>,
        round_index: Option<i64>,
    ) -> Result<TransferDraft> {
        let donor = self.donor(meeting, donor_activity_id).await?;
        let (bundle, round_index) = Self::prepare(&donor, items, metadata, round_index, DRAFT_ENTRY)?;
        self.store
            .save_draft(meeting.id(), &draft_activity_id(donor_activity_id), &bundle)
            .await?;
        info!(items = bundle.items.len(), round_index, "transfer draft saved");
        Ok(TransferDraft {
            donor_activity_id: donor_activity_id.to_string(),
            profile: DRAFT_ENTRY.to_string(),
            round_index,
            items: bundle.items,
            metadata: bundle.metadata,
        })
    }

    /// Create the target activity, seeded with the prepared items. The
    /// donor is read and the target appended under one hold of the meeting
    /// lock, so a concurrent stop or delete of the donor cannot interleave.
    #[instrument(skip_all, fields(meeting_id = %meeting.id(), donor = %request.donor_activity_id))]
    pub async fn commit(&self, meeting: &Meeting, request: CommitRequest) -> Result<Activity> {
        let guard = meeting.begin_commit().await?;
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = guard.replayed(key).await? {
                return Ok(existing);
            }
        }
        let donor_activity = guard.activity(&request.donor_activity_id)?;
        let donor = self.donor_view(meeting.id(), donor_activity).await?;
        let (bundle, round_index) = Self::prepare(
            &donor,
            request.items,
            request.metadata,
            request.round_index,
            COMMIT_ENTRY,
        )?;
        let activity = guard
            .append_seeded(
                &request.target_tool_type,
                request.config,
                &bundle,
                request.idempotency_key.as_deref(),
            )
            .await?;
        info!(
            target = %activity.activity_id,
            items = bundle.items.len(),
            round_index,
            "transfer committed"
        );
        Ok(activity)
    }
}

/// Give edited items back any donor metadata blocks and `source` they lost.
/// Items are matched to donor items by their provenance pointer or by id.
pub fn retain_provenance(items: &mut [Item], donor_activity_id: &str, donor_items: &[Item]) {
    let reference: HashMap<&str, Item> = donor_items
        .iter()
        .map(|item| {
            let mut stamped = item.clone();
            stamped.stamp_source(donor_activity_id);
            (item.id.as_str(), stamped)
        })
        .collect();
    for item in items.iter_mut() {
        let key = match &item.source {
            Some(source) if source.activity_id == donor_activity_id => source.original_id.clone(),
            _ => item.id.clone(),
        };
        if let Some(original) = reference.get(key.as_str()) {
            item.absorb_provenance(original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(id: &str, bucket: Option<Value>) -> Item {
        let mut item = Item::new(id, id);
        item.metadata
            .insert("brainstorm".into(), json!({ "author": "u1" }));
        if let Some(bucket) = bucket {
            item.metadata
                .insert("categorize".into(), json!({ "bucket": bucket }));
        }
        item
    }

    #[test]
    fn round_index_rules() {
        assert_eq!(derive_round_index(Some(-3), 5, Some(9)), 0);
        assert_eq!(derive_round_index(Some(4), 0, None), 4);
        assert_eq!(derive_round_index(None, 0, None), 0);
        assert_eq!(derive_round_index(None, 3, None), 2);
        assert_eq!(derive_round_index(None, 1, Some(4)), 4);
    }

    #[test]
    fn standard_profile_stamps_only_originals() {
        let mut carried = Item::new("x", "from earlier");
        carried.stamp_source("m:brainstorm:1");
        let out = Standard
            .apply("m:vote:2", vec![Item::new("a", "new"), carried])
            .unwrap();
        assert_eq!(out[0].source.as_ref().unwrap().activity_id, "m:vote:2");
        assert_eq!(out[1].source.as_ref().unwrap().activity_id, "m:brainstorm:1");
    }

    #[test]
    fn bucket_rollup_groups_and_keeps_metadata() {
        let mut comment = Item::new("c1", "+1");
        comment.parent_id = Some("a".into());
        let items = vec![
            tagged("a", Some(json!("keep"))),
            tagged("b", None),
            tagged("c", Some(json!("keep"))),
            comment,
        ];
        let out = BucketRollup.apply("m:categorize:2", items).unwrap();
        let ids: Vec<&str> = out.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bucket:keep", "a", "c", "bucket:uncategorized", "b", "c1"]);
        assert_eq!(out[1].parent_id.as_deref(), Some("bucket:keep"));
        assert_eq!(out[1].metadata["brainstorm"]["author"], "u1");
        assert_eq!(out[0].metadata["bucket_rollup"]["item_count"], 2);
        assert_eq!(out[5].parent_id.as_deref(), Some("a"));
    }

    #[test]
    fn bucket_rollup_rejects_non_string_bucket() {
        let err = BucketRollup
            .apply("d", vec![tagged("a", Some(json!(7)))])
            .unwrap_err();
        assert!(err.to_string().contains("non-string bucket"));
    }

    #[test]
    fn excluding_comments_keeps_metadata_of_retained_items() {
        let mut comment = Item::new("c1", "reply");
        comment.parent_id = Some("a".into());
        let opts = TransferOptions {
            include_comments: false,
        };
        let kept = opts.filter(vec![tagged("a", None), comment]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].metadata["brainstorm"]["author"], "u1");
    }

    #[test]
    fn retention_restores_stripped_blocks() {
        let donor = vec![tagged("a", Some(json!("keep")))];
        let mut edited = vec![Item::new("a", "edited text")];
        retain_provenance(&mut edited, "m:categorize:2", &donor);
        assert_eq!(edited[0].content, json!("edited text"));
        assert_eq!(edited[0].metadata["categorize"]["bucket"], "keep");
        assert_eq!(edited[0].source.as_ref().unwrap().original_id, "a");
    }

    #[test]
    fn profiles_by_name() {
        assert_eq!(profile("standard").unwrap().name(), "standard");
        assert_eq!(profile("bucket_rollup").unwrap().name(), "bucket_rollup");
        assert!(profile("shuffle").is_none());
    }
}
