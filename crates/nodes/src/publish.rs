//! Publish Coordinator: idempotent, crash-safe delivery to every destination.
//!
//! For each destination the coordinator walks the same ladder:
//!
//! 1. A committed [`PublishRecord`] already exists: return it, touch nothing.
//! 2. An uncommitted intent exists: a previous attempt may have posted and
//!    crashed before committing, so ask the publisher whether the post exists
//!    and adopt it.
//! 3. Resolve every asset through the fingerprint → address cache, uploading
//!    misses once under a per-fingerprint lock.
//! 4. Write the intent, post with the item id as idempotency key, commit with
//!    compare-and-set.
//!
//! Rate limits are retried exactly once, after the configured backoff or the
//! platform's `Retry-After`, whichever is longer. Every other failure is
//! surfaced immediately.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pipeline::{
    AssetAddress, AssetFingerprint, AssetUpload, DestinationId, Item, PlatformPublisher,
    PostRequest, PublishError, PublishRecord, RetryPolicy, StateStore, Timestamp,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::locks::KeyedLocks;
use crate::spans;

/// Per-destination result of one publish call.
pub type PublishOutcome = BTreeMap<DestinationId, Result<PublishRecord, PublishError>>;

type UploadKey = (DestinationId, AssetFingerprint);

pub struct PublishCoordinator {
    publishers: BTreeMap<DestinationId, Arc<dyn PlatformPublisher>>,
    store: Arc<dyn StateStore>,
    backoff: Duration,
    upload_locks: KeyedLocks<UploadKey>,
    cancel: CancellationToken,
}

impl PublishCoordinator {
    pub fn new(
        publishers: impl IntoIterator<Item = Arc<dyn PlatformPublisher>>,
        store: Arc<dyn StateStore>,
        backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let publishers = publishers
            .into_iter()
            .map(|p| (p.destination().clone(), p))
            .collect();
        Self {
            publishers,
            store,
            backoff,
            upload_locks: KeyedLocks::new(),
            cancel,
        }
    }

    pub fn has_publisher(&self, destination: &DestinationId) -> bool {
        self.publishers.contains_key(destination)
    }

    /// Publishes `item`'s deliverable to each destination independently.
    pub async fn publish(&self, item: &Item, destinations: &[DestinationId]) -> PublishOutcome {
        let mut outcome = BTreeMap::new();
        for destination in destinations {
            let span = spans::publish_span(item, destination);
            let result = self
                .publish_one(item, destination)
                .instrument(span.clone())
                .await;
            match &result {
                Ok(record) => {
                    if let Some(post) = &record.post_id {
                        span.record("publish.post_id", tracing::field::display(post));
                    }
                }
                Err(e) => warn!(
                    item = %item.id(),
                    destination = %destination,
                    error = %e,
                    retryable = e.is_rate_limited(),
                    "publish to destination failed"
                ),
            }
            outcome.insert(destination.clone(), result);
        }
        outcome
    }

    async fn publish_one(
        &self,
        item: &Item,
        destination: &DestinationId,
    ) -> Result<PublishRecord, PublishError> {
        let publisher = self
            .publishers
            .get(destination)
            .ok_or_else(|| PublishError::Rejected {
                status: None,
                message: format!("no publisher registered for '{destination}'"),
            })?
            .as_ref();

        let existing = self
            .store
            .get_publish_record(item.id(), destination)
            .await?;
        if let Some(record) = &existing {
            if record.is_committed() {
                debug!(item = %item.id(), destination = %destination, "already published");
                return Ok(record.clone());
            }
        }

        if let Some(mut intent) = existing {
            let id = item.id();
            let found = self
                .with_rate_limit_retry(destination, "find_existing_post", move || {
                    publisher.find_existing_post(id)
                })
                .await?;
            if let Some(post_id) = found {
                info!(
                    item = %item.id(),
                    destination = %destination,
                    post = %post_id,
                    "adopting post created before an interrupted commit"
                );
                intent.post_id = Some(post_id);
                intent.published_at = Some(Timestamp::now());
                return Ok(self.store.commit_publish_record(&intent).await?.into_record());
            }
        }

        let assets = self.resolve_assets(item, destination, publisher).await?;

        let mut record = self
            .store
            .put_publish_intent(&PublishRecord::intent(item.id(), destination.clone()))
            .await?;
        record.assets = assets.iter().cloned().collect();

        let request = PostRequest {
            item: item.id(),
            idempotency_key: item.id().to_string(),
            caption: item.deliverable().caption.clone(),
            assets: assets.into_iter().map(|(_, address)| address).collect(),
        };
        let request = &request;
        let post_id = self
            .with_rate_limit_retry(destination, "post", move || publisher.post(request))
            .await?;

        record.post_id = Some(post_id);
        record.published_at = Some(Timestamp::now());
        let committed = self.store.commit_publish_record(&record).await?.into_record();
        info!(item = %item.id(), destination = %destination, "published");
        Ok(committed)
    }

    /// Remote address of every deliverable asset, in deliverable order.
    async fn resolve_assets(
        &self,
        item: &Item,
        destination: &DestinationId,
        publisher: &dyn PlatformPublisher,
    ) -> Result<Vec<(AssetFingerprint, AssetAddress)>, PublishError> {
        let mut resolved = Vec::with_capacity(item.deliverable().assets.len());
        for asset in &item.deliverable().assets {
            let fingerprint = &asset.fingerprint;
            if let Some(address) = self.store.get_asset_address(destination, fingerprint).await? {
                resolved.push((fingerprint.clone(), address));
                continue;
            }

            let _guard = self
                .upload_locks
                .lock((destination.clone(), fingerprint.clone()))
                .await;

            // Another item may have uploaded while we waited.
            if let Some(address) = self.store.get_asset_address(destination, fingerprint).await? {
                resolved.push((fingerprint.clone(), address));
                continue;
            }

            let bytes = self.store.get_blob(fingerprint).await.map_err(|e| {
                PublishError::AssetUnavailable {
                    message: e.to_string(),
                }
            })?;
            let upload = AssetUpload {
                asset: asset.clone(),
                bytes,
            };
            let upload = &upload;
            let address = self
                .with_rate_limit_retry(destination, "upload", move || publisher.upload(upload))
                .await?;
            let address = self
                .store
                .put_asset_address(destination, fingerprint, &address)
                .await?;
            debug!(
                destination = %destination,
                asset = %fingerprint.short(),
                address = %address,
                "asset uploaded"
            );
            resolved.push((fingerprint.clone(), address));
        }
        Ok(resolved)
    }

    /// Runs `call`, and once more if the error's [`RetryPolicy`] allows it.
    async fn with_rate_limit_retry<T, F, Fut>(
        &self,
        destination: &DestinationId,
        operation: &'static str,
        call: F,
    ) -> Result<T, PublishError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PublishError>>,
    {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let RetryPolicy::Retryable { after } = error.retry_policy() else {
            return Err(error);
        };
        let backoff = after.map_or(self.backoff, |after| after.max(self.backoff));
        warn!(
            destination = %destination,
            operation,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "retrying once after backoff"
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PublishError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
        call().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use pipeline::{AssetRef, RemotePostId, SafetyTier, TopicLabel};
    use store::fakes::MemoryStateStore;

    use super::*;

    struct FlakyPublisher {
        destination: DestinationId,
        rate_limits_left: AtomicU32,
        retry_after: Option<Duration>,
        rejects: bool,
        posts: AtomicU32,
    }

    fn flaky(rate_limits: u32, retry_after: Option<Duration>) -> Arc<FlakyPublisher> {
        Arc::new(FlakyPublisher {
            destination: DestinationId::new("threads").unwrap(),
            rate_limits_left: AtomicU32::new(rate_limits),
            retry_after,
            rejects: false,
            posts: AtomicU32::new(0),
        })
    }

    #[async_trait]
    impl PlatformPublisher for FlakyPublisher {
        fn destination(&self) -> &DestinationId {
            &self.destination
        }

        async fn upload(&self, upload: &AssetUpload) -> Result<AssetAddress, PublishError> {
            Ok(AssetAddress::new(format!("cdn://{}", upload.asset.fingerprint.short())).unwrap())
        }

        async fn post(&self, request: &PostRequest) -> Result<RemotePostId, PublishError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            if self.rejects {
                return Err(PublishError::Rejected {
                    status: Some(400),
                    message: "caption too long".into(),
                });
            }
            if self.rate_limits_left.load(Ordering::SeqCst) > 0 {
                self.rate_limits_left.fetch_sub(1, Ordering::SeqCst);
                return Err(PublishError::RateLimited {
                    retry_after: self.retry_after,
                });
            }
            Ok(RemotePostId::new(format!("post-{}", request.idempotency_key)).unwrap())
        }
    }

    async fn ready_item(store: &MemoryStateStore) -> Item {
        let mut item = Item::new(TopicLabel::new("sleep").unwrap(), SafetyTier::Safe, 0);
        item.start().unwrap();
        let fingerprint = store.put_blob(b"jpeg bytes").await.unwrap();
        item.ingest(
            Some("caption".into()),
            vec![AssetRef {
                fingerprint,
                name: "cover.jpg".into(),
                media_type: "image/jpeg".into(),
            }],
        )
        .unwrap();
        item
    }

    fn coordinator(
        publisher: Arc<FlakyPublisher>,
        store: Arc<MemoryStateStore>,
    ) -> PublishCoordinator {
        PublishCoordinator::new(
            [publisher as Arc<dyn PlatformPublisher>],
            store,
            Duration::from_millis(1),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn single_rate_limit_is_retried() {
        let store = Arc::new(MemoryStateStore::new());
        let publisher = flaky(1, None);
        let item = ready_item(&store).await;
        let coordinator = coordinator(Arc::clone(&publisher), Arc::clone(&store));
        let dest = DestinationId::new("threads").unwrap();

        let outcome = coordinator.publish(&item, &[dest.clone()]).await;
        assert!(outcome[&dest].as_ref().unwrap().is_committed());
        assert_eq!(publisher.posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_rate_limit_surfaces_as_retryable() {
        let store = Arc::new(MemoryStateStore::new());
        let publisher = flaky(2, None);
        let item = ready_item(&store).await;
        let coordinator = coordinator(Arc::clone(&publisher), Arc::clone(&store));
        let dest = DestinationId::new("threads").unwrap();

        let outcome = coordinator.publish(&item, &[dest.clone()]).await;
        let err = outcome[&dest].as_ref().unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(publisher.posts.load(Ordering::SeqCst), 2);

        // The intent stays behind, uncommitted.
        let record = store
            .get_publish_record(item.id(), &dest)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_committed());
    }

    #[tokio::test]
    async fn unknown_destination_is_rejected_not_panicking() {
        let store = Arc::new(MemoryStateStore::new());
        let publisher = flaky(0, None);
        let item = ready_item(&store).await;
        let coordinator = coordinator(publisher, store);
        let dest = DestinationId::new("myspace").unwrap();

        let outcome = coordinator.publish(&item, &[dest.clone()]).await;
        assert!(matches!(
            outcome[&dest],
            Err(PublishError::Rejected { status: None, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_the_longer_of_backoff_and_retry_after() {
        let store = Arc::new(MemoryStateStore::new());
        let publisher = flaky(1, Some(Duration::from_secs(30)));
        let item = ready_item(&store).await;
        let coordinator = coordinator(Arc::clone(&publisher), Arc::clone(&store));
        let dest = DestinationId::new("threads").unwrap();

        let started = tokio::time::Instant::now();
        let outcome = coordinator.publish(&item, &[dest.clone()]).await;
        assert!(outcome[&dest].is_ok());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(publisher.posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let store = Arc::new(MemoryStateStore::new());
        let publisher = Arc::new(FlakyPublisher {
            destination: DestinationId::new("threads").unwrap(),
            rate_limits_left: AtomicU32::new(0),
            retry_after: None,
            rejects: true,
            posts: AtomicU32::new(0),
        });
        let item = ready_item(&store).await;
        let coordinator = coordinator(Arc::clone(&publisher), Arc::clone(&store));
        let dest = DestinationId::new("threads").unwrap();

        let outcome = coordinator.publish(&item, &[dest.clone()]).await;
        assert!(matches!(
            outcome[&dest],
            Err(PublishError::Rejected { status: Some(400), .. })
        ));
        assert_eq!(publisher.posts.load(Ordering::SeqCst), 1);
    }
}
