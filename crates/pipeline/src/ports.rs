//! Port traits for every collaborator the orchestrator talks to.
//!
//! Infrastructure crates implement these traits; the executor and publish
//! coordinator in `nodes` only ever see `Arc<dyn Trait>`. Nothing in this
//! module performs I/O.
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`StageProducer`] | `stage-command` (external command per stage) |
//! | [`PlatformPublisher`] | `publisher` (HTTP destination) |
//! | [`StateStore`] | `store` (filesystem) and `store::fakes` |
//! | [`OperatorQueue`] | `store` (JSONL file) and `store::fakes` |

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Artifact, AssetAddress, AssetFingerprint, AssetRef, DestinationId, EscalationSignal,
    EscalationState, Item, ItemId, ProducerError, PublishError, RemotePostId, RunId, SafetyTier,
    StageId, StoreError, Timestamp, TopicLabel,
};

// ---------------------------------------------------------------------------
// Stage producers
// ---------------------------------------------------------------------------

/// Per-call context handed to a stage producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageContext {
    pub run_id: RunId,
    pub stage: StageId,
    /// 1-based attempt number of this stage for this item.
    pub attempt: u32,
    pub tier: SafetyTier,
}

/// Produces the artifact of one stage.
///
/// A producer never decides PASS/FAIL for review stages; it returns ratings
/// and the scoring engine judges them. Returning `Err` means no artifact
/// exists at all and is treated as a stage FAIL.
#[async_trait]
pub trait StageProducer: Send + Sync {
    async fn produce(&self, item: &Item, ctx: &StageContext) -> Result<Artifact, ProducerError>;
}

// ---------------------------------------------------------------------------
// Destination platforms
// ---------------------------------------------------------------------------

/// One asset to upload to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpload {
    pub asset: AssetRef,
    pub bytes: Vec<u8>,
}

/// The post a publisher is asked to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRequest {
    pub item: ItemId,
    /// Stable key the platform may use to de-duplicate retried posts.
    pub idempotency_key: String,
    pub caption: Option<String>,
    /// Remote addresses of the uploaded assets, in deliverable order.
    pub assets: Vec<AssetAddress>,
}

/// A remote platform that accepts uploads and posts.
///
/// Implementations must report rate limits as [`PublishError::RateLimited`];
/// every other failure is treated as non-retryable.
#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    /// The destination this publisher posts to.
    fn destination(&self) -> &DestinationId;

    async fn upload(&self, upload: &AssetUpload) -> Result<AssetAddress, PublishError>;

    async fn post(&self, request: &PostRequest) -> Result<RemotePostId, PublishError>;

    /// Looks up a post previously created for `item`, used to recover from a
    /// crash between posting and committing the record.
    ///
    /// Platforms that cannot search return `Ok(None)`.
    async fn find_existing_post(&self, item: ItemId) -> Result<Option<RemotePostId>, PublishError> {
        let _ = item;
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Durable record of one item's publication to one destination.
///
/// Written as an *intent* (no `post_id`) before the post is attempted and
/// committed with the post id afterwards. A committed record is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub item: ItemId,
    pub destination: DestinationId,
    pub assets: BTreeMap<AssetFingerprint, AssetAddress>,
    pub post_id: Option<RemotePostId>,
    pub intent_at: Timestamp,
    pub published_at: Option<Timestamp>,
}

impl PublishRecord {
    pub fn intent(item: ItemId, destination: DestinationId) -> Self {
        Self {
            item,
            destination,
            assets: BTreeMap::new(),
            post_id: None,
            intent_at: Timestamp::now(),
            published_at: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.post_id.is_some()
    }
}

/// Outcome of a compare-and-set commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This writer's record is now the committed one.
    Committed(PublishRecord),
    /// Another writer committed first; its record is returned unchanged.
    AlreadyCommitted(PublishRecord),
}

impl CommitOutcome {
    pub fn into_record(self) -> PublishRecord {
        match self {
            Self::Committed(r) | Self::AlreadyCommitted(r) => r,
        }
    }
}

/// Durable state of the orchestrator.
///
/// Every write is atomic per key: a crash leaves either the old or the new
/// document, never a torn one.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_item(&self, item: &Item) -> Result<(), StoreError>;

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, StoreError>;

    async fn list_items(&self) -> Result<Vec<Item>, StoreError>;

    async fn load_escalation(&self) -> Result<EscalationState, StoreError>;

    async fn save_escalation(&self, state: &EscalationState) -> Result<(), StoreError>;

    async fn get_publish_record(
        &self,
        item: ItemId,
        destination: &DestinationId,
    ) -> Result<Option<PublishRecord>, StoreError>;

    /// Writes an uncommitted intent unless a record already exists, and
    /// returns whichever record is now stored.
    async fn put_publish_intent(&self, intent: &PublishRecord) -> Result<PublishRecord, StoreError>;

    /// Commits `record` only if the stored record is not committed yet.
    async fn commit_publish_record(
        &self,
        record: &PublishRecord,
    ) -> Result<CommitOutcome, StoreError>;

    async fn get_asset_address(
        &self,
        destination: &DestinationId,
        fingerprint: &AssetFingerprint,
    ) -> Result<Option<AssetAddress>, StoreError>;

    /// Caches an uploaded asset's address. The first writer wins; the
    /// address actually stored is returned.
    async fn put_asset_address(
        &self,
        destination: &DestinationId,
        fingerprint: &AssetFingerprint,
        address: &AssetAddress,
    ) -> Result<AssetAddress, StoreError>;

    /// Stores bytes content-addressed and returns their fingerprint.
    async fn put_blob(&self, bytes: &[u8]) -> Result<AssetFingerprint, StoreError>;

    async fn get_blob(&self, fingerprint: &AssetFingerprint) -> Result<Vec<u8>, StoreError>;
}

// ---------------------------------------------------------------------------
// Operator queue
// ---------------------------------------------------------------------------

/// What happened to an item that needs a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    /// A mandatory stage failed and the automatic retry is spent.
    StageBlocked {
        stage: StageId,
        reasons: Vec<String>,
    },
    /// One or more destinations failed.
    PublishBlocked {
        failures: BTreeMap<DestinationId, PublishError>,
    },
    /// The escalation tracker terminated the item.
    Terminated { signal: EscalationSignal },
    /// A whole cohort was halted; new items will not start until reset.
    CohortHalted { signal: EscalationSignal },
}

/// Entry on the human-review queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNotice {
    pub item: ItemId,
    pub topic: TopicLabel,
    pub tier: SafetyTier,
    pub kind: NoticeKind,
    pub at: Timestamp,
}

impl OperatorNotice {
    pub fn for_item(item: &Item, kind: NoticeKind) -> Self {
        Self {
            item: item.id(),
            topic: item.topic().clone(),
            tier: item.tier(),
            kind,
            at: Timestamp::now(),
        }
    }
}

/// Sink for notices that need operator attention.
#[async_trait]
pub trait OperatorQueue: Send + Sync {
    async fn submit(&self, notice: OperatorNotice) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// Operator request to start a new item.
///
/// `start_index` and `start_stage` select direct mode; at most one may be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub topic: TopicLabel,
    pub tier: SafetyTier,
    #[serde(default)]
    pub start_index: Option<usize>,
    #[serde(default)]
    pub start_stage: Option<StageId>,
}

impl Directive {
    pub fn new(topic: TopicLabel, tier: SafetyTier) -> Self {
        Self {
            topic,
            tier,
            start_index: None,
            start_stage: None,
        }
    }
}
