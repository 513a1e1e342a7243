//! Shared fixtures for the orchestration integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nodes::{Collaborators, PipelineExecutor};
use pipeline::{
    Artifact, AssetAddress, AssetPayload, AssetUpload, DestinationId, DimensionName, Item, ItemId,
    LoadedConfig, OperatorQueue, PipelineConfig, PlatformPublisher, PostRequest, ProducerError,
    PublishError, RemotePostId, StageContext, StageId, StageProducer, StateStore,
};
use serde::Deserialize;
use store::fakes::{MemoryOperatorQueue, MemoryStateStore};

pub const DESTINATIONS: [&str; 2] = ["instagram", "threads"];

#[derive(Deserialize)]
struct ExampleFile {
    pipeline: PipelineConfig,
}

/// The shipped example configuration with a 1ms publish backoff.
pub fn example_config() -> PipelineConfig {
    let file: ExampleFile =
        toml::from_str(include_str!("../../../../config/contentworks.example.toml")).unwrap();
    let mut config = file.pipeline;
    config.publish.rate_limit_backoff_ms = 1;
    config
}

pub fn ratings(values: &[(&str, u8)]) -> BTreeMap<DimensionName, u8> {
    values
        .iter()
        .map(|(d, r)| (DimensionName::new(*d).unwrap(), *r))
        .collect()
}

pub fn good_review() -> Artifact {
    Artifact {
        ratings: ratings(&[("hook", 5), ("accuracy", 5), ("clarity", 5), ("brand_voice", 5)]),
        ..Artifact::default()
    }
}

pub fn image(bytes: &[u8]) -> Artifact {
    Artifact {
        assets: vec![AssetPayload {
            name: "cover.png".into(),
            media_type: "image/png".into(),
            bytes: bytes.to_vec(),
        }],
        ..Artifact::default()
    }
}

pub fn caption(text: &str) -> Artifact {
    Artifact {
        caption: Some(text.into()),
        ..Artifact::default()
    }
}

pub fn producer_failure() -> Result<Artifact, ProducerError> {
    Err(ProducerError::Failed {
        message: "upstream template broken".into(),
    })
}

// ---------------------------------------------------------------------------
// ScriptedProducer
// ---------------------------------------------------------------------------

/// Returns queued results first, then `fallback` forever.
pub struct ScriptedProducer {
    calls: AtomicU32,
    queued: Mutex<VecDeque<Result<Artifact, ProducerError>>>,
    fallback: Result<Artifact, ProducerError>,
    hang: bool,
}

impl ScriptedProducer {
    pub fn always(fallback: Result<Artifact, ProducerError>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            queued: Mutex::new(VecDeque::new()),
            fallback,
            hang: false,
        }
    }

    pub fn passing(artifact: Artifact) -> Self {
        Self::always(Ok(artifact))
    }

    /// Never returns; used to hold a stage in flight.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::passing(Artifact::default())
        }
    }

    pub fn then(self, queued: Vec<Result<Artifact, ProducerError>>) -> Self {
        *self.queued.lock().unwrap() = queued.into();
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProducer for ScriptedProducer {
    async fn produce(&self, _item: &Item, _ctx: &StageContext) -> Result<Artifact, ProducerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        let next = self.queued.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// CountingPublisher
// ---------------------------------------------------------------------------

/// Platform fake that remembers posts by item, like a real idempotent API.
pub struct CountingPublisher {
    destination: DestinationId,
    pub uploads: AtomicU32,
    pub posts: AtomicU32,
    /// Rate-limit this many upcoming post calls.
    pub rate_limits: AtomicU32,
    pub reject: AtomicBool,
    pub posted: Mutex<HashMap<ItemId, RemotePostId>>,
}

impl CountingPublisher {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: DestinationId::new(destination).unwrap(),
            uploads: AtomicU32::new(0),
            posts: AtomicU32::new(0),
            rate_limits: AtomicU32::new(0),
            reject: AtomicBool::new(false),
            posted: Mutex::new(HashMap::new()),
        }
    }

    pub fn uploads(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> u32 {
        self.posts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformPublisher for CountingPublisher {
    fn destination(&self) -> &DestinationId {
        &self.destination
    }

    async fn upload(&self, upload: &AssetUpload) -> Result<AssetAddress, PublishError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(AssetAddress::new(format!(
            "{}://{}",
            self.destination,
            upload.asset.fingerprint.short()
        ))
        .unwrap())
    }

    async fn post(&self, request: &PostRequest) -> Result<RemotePostId, PublishError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected {
                status: Some(401),
                message: "token expired".into(),
            });
        }
        let limited = self
            .rate_limits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(PublishError::RateLimited { retry_after: None });
        }
        let mut posted = self.posted.lock().unwrap();
        let id = posted
            .entry(request.item)
            .or_insert_with(|| {
                RemotePostId::new(format!("{}-{}", self.destination, request.idempotency_key))
                    .unwrap()
            })
            .clone();
        Ok(id)
    }

    async fn find_existing_post(&self, item: ItemId) -> Result<Option<RemotePostId>, PublishError> {
        Ok(self.posted.lock().unwrap().get(&item).cloned())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub executor: Arc<PipelineExecutor>,
    pub store: Arc<MemoryStateStore>,
    pub queue: Arc<MemoryOperatorQueue>,
    pub producers: BTreeMap<String, Arc<ScriptedProducer>>,
    pub publishers: BTreeMap<String, Arc<CountingPublisher>>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        let mut producers = BTreeMap::new();
        for stage in ["topic-selection", "fact-check", "amount-and-dosage"] {
            producers.insert(stage.to_string(), ScriptedProducer::passing(Artifact::default()));
        }
        producers.insert(
            "copy-generation".into(),
            ScriptedProducer::passing(caption("Most people need less than they think.")),
        );
        producers.insert(
            "image-generation".into(),
            ScriptedProducer::passing(image(b"cover image")),
        );
        for review in ["copy-review", "copy-review-strict"] {
            producers.insert(review.to_string(), ScriptedProducer::passing(good_review()));
        }
        HarnessBuilder {
            config: example_config(),
            producers,
            publishers: DESTINATIONS
                .iter()
                .map(|d| (d.to_string(), CountingPublisher::new(d)))
                .collect(),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub fn producer(&self, stage: &str) -> &ScriptedProducer {
        &self.producers[stage]
    }

    pub fn publisher(&self, destination: &str) -> &CountingPublisher {
        &self.publishers[destination]
    }
}

pub struct HarnessBuilder {
    pub config: PipelineConfig,
    producers: BTreeMap<String, ScriptedProducer>,
    publishers: BTreeMap<String, CountingPublisher>,
    store: Arc<MemoryStateStore>,
}

impl HarnessBuilder {
    pub fn producer(mut self, stage: &str, producer: ScriptedProducer) -> Self {
        self.producers.insert(stage.to_string(), producer);
        self
    }

    pub fn publisher(mut self, publisher: CountingPublisher) -> Self {
        self.publishers
            .insert(publisher.destination().to_string(), publisher);
        self
    }

    pub fn thresholds(mut self, item: u32, cohort: u32) -> Self {
        self.config.escalation.item_failure_threshold = item;
        self.config.escalation.cohort_failure_threshold = cohort;
        self
    }

    pub fn loaded_config(&self) -> Arc<LoadedConfig> {
        Arc::new(self.config.validate().unwrap())
    }

    pub async fn build(self) -> Harness {
        let config = self.loaded_config();
        let producers: BTreeMap<String, Arc<ScriptedProducer>> = self
            .producers
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();
        let publishers: BTreeMap<String, Arc<CountingPublisher>> = self
            .publishers
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();
        let queue = Arc::new(MemoryOperatorQueue::new());

        let collaborators = Collaborators {
            producers: producers
                .iter()
                .map(|(k, v)| {
                    (
                        StageId::new(k.as_str()).unwrap(),
                        Arc::clone(v) as Arc<dyn StageProducer>,
                    )
                })
                .collect(),
            publishers: publishers
                .values()
                .map(|p| Arc::clone(p) as Arc<dyn PlatformPublisher>)
                .collect(),
            store: Arc::clone(&self.store) as Arc<dyn StateStore>,
            queue: Arc::clone(&queue) as Arc<dyn OperatorQueue>,
        };
        let executor = Arc::new(PipelineExecutor::new(config, collaborators).await.unwrap());

        Harness {
            executor,
            store: self.store,
            queue,
            producers,
            publishers,
        }
    }
}
