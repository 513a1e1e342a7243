//! Pipeline Executor: drives items through their tier's stage plan.
//!
//! ```text
//! submit ─► PENDING ─► run_item ─► stage loop ─► publish ─► PUBLISHED
//!                                     │             │
//!                                     ▼             ▼
//!                          BLOCKED / TERMINATED   BLOCKED(PublishFailed)
//! ```
//!
//! One call of [`PipelineExecutor::run_item`] owns its item for the whole
//! loop through a per-item async mutex, so an item is never mutated
//! concurrently. The mutex lives only while someone holds or awaits it. Different items run in parallel under
//! [`PipelineExecutor::run_pending`]. The escalation tracker sits behind one
//! async mutex; each FAIL/PASS update and its persistence happen under it.
//!
//! The item is persisted after every transition, so a crashed process resumes
//! an `IN_PROGRESS` item from its cursor. Item-scope escalation counters are
//! dropped once the item is PUBLISHED or TERMINATED.

use std::collections::BTreeMap;
use std::sync::Arc;

use pipeline::{
    score, Artifact, AssetRef, BlockReason, DestinationId, Directive, EscalationKey,
    EscalationSignal, EscalationTracker, FailReason, Item, ItemId, LifecycleState, LoadedConfig,
    NoticeKind, OperatorNotice, OperatorQueue, PipelineError, PlatformPublisher, PublishError,
    RunId, SafetyTier, StageContext, StageId, StageKind, StageOutcome, StagePlan, StageProducer,
    StageRecord, StageSpec, StateStore, TerminationReason, Timestamp,
};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::locks::KeyedLocks;
use crate::publish::PublishCoordinator;
use crate::spans;

/// Infrastructure the executor is composed with.
pub struct Collaborators {
    pub producers: BTreeMap<StageId, Arc<dyn StageProducer>>,
    pub publishers: Vec<Arc<dyn PlatformPublisher>>,
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn OperatorQueue>,
}

/// Final states reached by one `run_pending` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub published: Vec<ItemId>,
    pub blocked: Vec<ItemId>,
    pub terminated: Vec<ItemId>,
    /// Still PENDING afterwards (their cohort is halted).
    pub held: Vec<ItemId>,
    pub errors: Vec<(ItemId, String)>,
}

impl RunSummary {
    fn record(&mut self, item: &Item) {
        let id = item.id();
        match item.state() {
            LifecycleState::Published => self.published.push(id),
            LifecycleState::Blocked => self.blocked.push(id),
            LifecycleState::Terminated => self.terminated.push(id),
            LifecycleState::Pending | LifecycleState::InProgress => self.held.push(id),
        }
    }
}

/// What the stage loop does after one stage.
enum StageStep {
    Advance,
    /// The automatic retry was consumed; run the same stage again.
    Retry,
    /// The item left IN_PROGRESS.
    Stop,
}

/// Result of evaluating one producer call.
struct Evaluation {
    verdict: Option<pipeline::Verdict>,
    fail_reasons: Vec<FailReason>,
    artifact: Option<Artifact>,
    notes: Option<String>,
}

impl Evaluation {
    fn failed(reason: FailReason) -> Self {
        Self {
            verdict: None,
            fail_reasons: vec![reason],
            artifact: None,
            notes: None,
        }
    }

    fn passed(&self) -> bool {
        self.fail_reasons.is_empty()
    }
}

pub struct PipelineExecutor {
    run_id: RunId,
    config: Arc<LoadedConfig>,
    producers: BTreeMap<StageId, Arc<dyn StageProducer>>,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn OperatorQueue>,
    publisher: PublishCoordinator,
    escalation: Mutex<EscalationTracker>,
    item_locks: KeyedLocks<ItemId>,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    /// Wires the executor and restores persisted escalation counters.
    ///
    /// Fails fast when a planned stage has no producer or a configured
    /// destination has no publisher.
    pub async fn new(
        config: Arc<LoadedConfig>,
        collaborators: Collaborators,
    ) -> Result<Self, PipelineError> {
        let Collaborators {
            producers,
            publishers,
            store,
            queue,
        } = collaborators;

        for tier in SafetyTier::ALL {
            let plan = config.registry().plan_for(tier);
            if let Some(stage) = plan
                .stages()
                .iter()
                .find(|s| !s.forbidden_in_tier && !producers.contains_key(&s.id))
            {
                return Err(PipelineError::MissingProducer {
                    stage: stage.id.clone(),
                });
            }
        }

        let cancel = CancellationToken::new();
        let publisher = PublishCoordinator::new(
            publishers,
            Arc::clone(&store),
            config.publish().rate_limit_backoff,
            cancel.clone(),
        );
        if let Some(destination) = config
            .publish()
            .destinations
            .iter()
            .find(|d| !publisher.has_publisher(d))
        {
            return Err(PipelineError::MissingPublisher {
                destination: destination.clone(),
            });
        }

        let state = store.load_escalation().await?;
        let escalation = EscalationTracker::with_state(config.escalation(), state);

        Ok(Self {
            run_id: RunId::new_random(),
            config,
            producers,
            store,
            queue,
            publisher,
            escalation: Mutex::new(escalation),
            item_locks: KeyedLocks::new(),
            cancel,
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Token that cancels every in-flight stage and publish of this executor.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // -----------------------------------------------------------------------
    // Operator surface
    // -----------------------------------------------------------------------

    /// Creates a PENDING item. Direct mode starts at a later stage of the plan.
    pub async fn submit(&self, directive: Directive) -> Result<Item, PipelineError> {
        let plan = self.config.registry().plan_for(directive.tier);
        let start = match (directive.start_index, &directive.start_stage) {
            (Some(_), Some(_)) => {
                return Err(PipelineError::InvalidDirective {
                    message: "give either a start index or a start stage, not both".into(),
                });
            }
            (Some(index), None) => index,
            (None, Some(stage)) => plan.position_of(stage).ok_or_else(|| {
                PipelineError::InvalidDirective {
                    message: format!(
                        "stage '{stage}' is not in the {} plan",
                        directive.tier
                    ),
                }
            })?,
            (None, None) => 0,
        };
        validate_start(plan, start)?;

        let item = Item::new(directive.topic, directive.tier, start);
        self.store.put_item(&item).await?;
        info!(
            item = %item.id(),
            tier = %item.tier(),
            topic = %item.topic(),
            start_index = start,
            "item submitted"
        );
        Ok(item)
    }

    pub async fn status(&self, id: ItemId) -> Result<Item, PipelineError> {
        self.load(id).await
    }

    pub async fn list(&self) -> Result<Vec<Item>, PipelineError> {
        Ok(self.store.list_items().await?)
    }

    /// Runs one item until it leaves IN_PROGRESS.
    ///
    /// Terminal and BLOCKED items are returned unchanged; PENDING items whose
    /// cohort is halted are not started.
    pub async fn run_item(&self, id: ItemId) -> Result<Item, PipelineError> {
        let _guard = self.item_locks.lock(id).await;

        let mut item = self.load(id).await?;
        match item.state() {
            LifecycleState::Published | LifecycleState::Terminated | LifecycleState::Blocked => {
                return Ok(item);
            }
            LifecycleState::Pending => {
                let cohort = item.tier().cohort_key();
                if self.escalation.lock().await.is_cohort_halted(&cohort) {
                    info!(item = %id, cohort = %cohort, "cohort halted; item left pending");
                    return Ok(item);
                }
                item.start()?;
                self.store.put_item(&item).await?;
            }
            LifecycleState::InProgress => {
                info!(item = %id, cursor = item.cursor(), "continuing interrupted item");
            }
        }

        let span = spans::item_span(self.run_id, &item);
        self.drive(&mut item).instrument(span.clone()).await?;
        spans::record_item_state(&span, item.state());
        Ok(item)
    }

    /// Runs every PENDING or interrupted IN_PROGRESS item, at most
    /// `concurrency` at a time.
    pub async fn run_pending(self: &Arc<Self>, concurrency: usize) -> Result<RunSummary, PipelineError> {
        let runnable: Vec<ItemId> = self
            .store
            .list_items()
            .await?
            .into_iter()
            .filter(|i| {
                matches!(
                    i.state(),
                    LifecycleState::Pending | LifecycleState::InProgress
                )
            })
            .map(|i| i.id())
            .collect();
        info!(items = runnable.len(), concurrency, "running pending items");

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for id in runnable {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (id, this.run_item(id).await)
            });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(item))) => summary.record(&item),
                Ok((id, Err(e))) => {
                    error!(item = %id, error = %e, "item run failed");
                    summary.errors.push((id, e.to_string()));
                }
                Err(e) => error!(error = %e, "item task panicked or was aborted"),
            }
        }
        Ok(summary)
    }

    /// Operator resume of a BLOCKED item, with a fresh automatic retry.
    pub async fn resume(&self, id: ItemId) -> Result<Item, PipelineError> {
        let _guard = self.item_locks.lock(id).await;

        let mut item = self.load(id).await?;
        item.resume()?;
        self.store.put_item(&item).await?;
        info!(item = %id, cursor = item.cursor(), "item resumed by operator");

        let span = spans::item_span(self.run_id, &item);
        self.drive(&mut item).instrument(span.clone()).await?;
        spans::record_item_state(&span, item.state());
        Ok(item)
    }

    /// Operator close of a BLOCKED item.
    pub async fn close(&self, id: ItemId, reason: String) -> Result<Item, PipelineError> {
        let _guard = self.item_locks.lock(id).await;

        let mut item = self.load(id).await?;
        if item.state() != LifecycleState::Blocked {
            return Err(PipelineError::InvalidTransition {
                item: id,
                from: item.state(),
                to: LifecycleState::Terminated,
            });
        }
        item.terminate(TerminationReason::OperatorClosed { reason })?;
        self.store.put_item(&item).await?;
        self.forget_counters(id).await?;
        info!(item = %id, "item closed by operator");
        Ok(item)
    }

    /// Clears a halted cohort. Returns whether it was halted.
    pub async fn reset_cohort(&self, tier: SafetyTier) -> Result<bool, PipelineError> {
        let cohort = tier.cohort_key();
        let mut tracker = self.escalation.lock().await;
        let was_halted = tracker.reset_cohort(&cohort);
        self.store.save_escalation(tracker.state()).await?;
        info!(cohort = %cohort, was_halted, "cohort reset");
        Ok(was_halted)
    }

    pub async fn is_cohort_halted(&self, tier: SafetyTier) -> bool {
        self.escalation
            .lock()
            .await
            .is_cohort_halted(&tier.cohort_key())
    }

    // -----------------------------------------------------------------------
    // Stage loop
    // -----------------------------------------------------------------------

    async fn drive(&self, item: &mut Item) -> Result<(), PipelineError> {
        let plan = self.config.registry().plan_for(item.tier());
        loop {
            let cursor = item.cursor();
            let Some(spec) = plan.stages().get(cursor) else {
                match first_unpassed(plan, item) {
                    Some(index) => {
                        warn!(item = %item.id(), index, "required stage has no PASS; rewinding");
                        item.advance_to(index)?;
                        self.store.put_item(item).await?;
                        continue;
                    }
                    None => return self.finish(item).await,
                }
            };

            if spec.forbidden_in_tier {
                debug!(item = %item.id(), stage = %spec.id, "stage forbidden for tier; skipped");
                item.advance_to(cursor + 1)?;
                self.store.put_item(item).await?;
                continue;
            }

            match self.run_stage(item, plan, spec).await? {
                StageStep::Advance => {
                    item.advance_to(cursor + 1)?;
                    self.store.put_item(item).await?;
                }
                StageStep::Retry => {
                    info!(item = %item.id(), stage = %spec.id, "automatic retry");
                }
                StageStep::Stop => return Ok(()),
            }
        }
    }

    async fn run_stage(
        &self,
        item: &mut Item,
        plan: &StagePlan,
        spec: &StageSpec,
    ) -> Result<StageStep, PipelineError> {
        let producer = self
            .producers
            .get(&spec.id)
            .ok_or_else(|| PipelineError::MissingProducer {
                stage: spec.id.clone(),
            })?;
        let attempt = item.attempts(&spec.id).saturating_add(1);
        let ctx = StageContext {
            run_id: self.run_id,
            stage: spec.id.clone(),
            attempt,
            tier: item.tier(),
        };

        let span = spans::stage_span(item, &spec.id, attempt);
        let produced = {
            let item: &Item = item;
            async {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = producer.produce(item, &ctx) => Some(result),
                }
            }
            .instrument(span.clone())
            .await
        };

        let Some(produced) = produced else {
            warn!(item = %item.id(), stage = %spec.id, "stage cancelled");
            item.block(BlockReason::Cancelled {
                stage: Some(spec.id.clone()),
            })?;
            self.store.put_item(item).await?;
            return Ok(StageStep::Stop);
        };

        let evaluation = match produced {
            Err(e) => {
                warn!(item = %item.id(), stage = %spec.id, error = %e, "producer failed");
                Evaluation::failed(FailReason::ProducerError {
                    message: e.to_string(),
                })
            }
            Ok(artifact) => self.evaluate(plan, spec, artifact)?,
        };
        let passed = evaluation.passed();
        spans::record_stage_result(&span, passed);

        if passed {
            self.on_pass(item, spec, attempt, evaluation).await?;
            return Ok(StageStep::Advance);
        }

        item.record_stage(StageRecord {
            stage: spec.id.clone(),
            outcome: StageOutcome::Fail,
            attempt,
            at: Timestamp::now(),
            verdict: evaluation.verdict,
            fail_reasons: evaluation.fail_reasons.clone(),
            notes: evaluation.notes,
        })?;

        if !spec.required {
            info!(
                item = %item.id(),
                stage = %spec.id,
                reasons = ?evaluation.fail_reasons,
                "optional stage failed; skipped"
            );
            return Ok(StageStep::Advance);
        }

        self.on_mandatory_fail(item, spec, evaluation.fail_reasons)
            .await
    }

    /// Turns a producer's artifact into a verdict-bearing evaluation.
    fn evaluate(
        &self,
        plan: &StagePlan,
        spec: &StageSpec,
        artifact: Artifact,
    ) -> Result<Evaluation, PipelineError> {
        let notes = artifact.notes.clone();
        if let Some(marker) = artifact.forbidden_marker(|s| plan.is_forbidden(s)) {
            return Ok(Evaluation {
                notes,
                ..Evaluation::failed(FailReason::ForbiddenContent {
                    stage: marker.clone(),
                })
            });
        }
        match spec.kind {
            StageKind::Production => Ok(Evaluation {
                verdict: None,
                fail_reasons: Vec::new(),
                artifact: Some(artifact),
                notes,
            }),
            StageKind::Review => {
                let rubric = self.config.rubric_for(spec).ok_or_else(|| {
                    PipelineError::config(format!("review stage '{}' has no rubric", spec.id))
                })?;
                let verdict = score(&artifact, rubric);
                Ok(Evaluation {
                    fail_reasons: verdict.fail_reasons.clone(),
                    verdict: Some(verdict),
                    artifact: Some(artifact),
                    notes,
                })
            }
        }
    }

    async fn on_pass(
        &self,
        item: &mut Item,
        spec: &StageSpec,
        attempt: u32,
        evaluation: Evaluation,
    ) -> Result<(), PipelineError> {
        let mut caption = None;
        let mut assets = Vec::new();
        if let Some(artifact) = evaluation.artifact {
            caption = artifact.caption;
            for payload in artifact.assets {
                let fingerprint = self.store.put_blob(&payload.bytes).await?;
                assets.push(AssetRef {
                    fingerprint,
                    name: payload.name,
                    media_type: payload.media_type,
                });
            }
        }
        item.ingest(caption, assets)?;
        item.record_stage(StageRecord {
            stage: spec.id.clone(),
            outcome: StageOutcome::Pass,
            attempt,
            at: Timestamp::now(),
            verdict: evaluation.verdict,
            fail_reasons: Vec::new(),
            notes: evaluation.notes,
        })?;

        {
            let mut tracker = self.escalation.lock().await;
            tracker.record_result(&item_key(item, spec), true);
            tracker.record_result(&cohort_key(item, spec), true);
            self.store.save_escalation(tracker.state()).await?;
        }
        debug!(item = %item.id(), stage = %spec.id, attempt, "stage passed");
        Ok(())
    }

    async fn on_mandatory_fail(
        &self,
        item: &mut Item,
        spec: &StageSpec,
        fail_reasons: Vec<FailReason>,
    ) -> Result<StageStep, PipelineError> {
        let (item_signal, cohort_signal, newly_halted) = {
            let mut tracker = self.escalation.lock().await;
            let cohort = item.tier().cohort_key();
            let was_halted = tracker.is_cohort_halted(&cohort);
            let item_signal = tracker.record_result(&item_key(item, spec), false);
            let cohort_signal = tracker.record_result(&cohort_key(item, spec), false);
            let newly_halted = !was_halted && tracker.is_cohort_halted(&cohort);
            if item_signal.is_termination() || cohort_signal.is_termination() {
                tracker.forget_item(item.id());
            }
            self.store.save_escalation(tracker.state()).await?;
            (item_signal, cohort_signal, newly_halted)
        };

        if newly_halted {
            error!(cohort = %item.tier().cohort_key(), stage = %spec.id, "cohort halted");
            self.notify(OperatorNotice::for_item(
                item,
                NoticeKind::CohortHalted {
                    signal: cohort_signal.clone(),
                },
            ))
            .await;
        }

        let termination = [item_signal, cohort_signal]
            .into_iter()
            .find(EscalationSignal::is_termination);
        if let Some(signal) = termination {
            warn!(item = %item.id(), stage = %spec.id, signal = ?signal, "item terminated");
            item.terminate(TerminationReason::Escalation {
                signal: signal.clone(),
            })?;
            self.store.put_item(item).await?;
            self.notify(OperatorNotice::for_item(item, NoticeKind::Terminated { signal }))
                .await;
            return Ok(StageStep::Stop);
        }

        item.block(BlockReason::StageFailed {
            stage: spec.id.clone(),
            fail_reasons: fail_reasons.clone(),
        })?;
        if item.automatic_retry_available() {
            item.begin_automatic_retry()?;
            self.store.put_item(item).await?;
            return Ok(StageStep::Retry);
        }

        self.store.put_item(item).await?;
        warn!(item = %item.id(), stage = %spec.id, "item blocked; waiting for operator");
        self.notify(OperatorNotice::for_item(
            item,
            NoticeKind::StageBlocked {
                stage: spec.id.clone(),
                reasons: fail_reasons.iter().map(ToString::to_string).collect(),
            },
        ))
        .await;
        Ok(StageStep::Stop)
    }

    async fn finish(&self, item: &mut Item) -> Result<(), PipelineError> {
        let destinations: &[DestinationId] = &self.config.publish().destinations;
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            outcome = self.publisher.publish(item, destinations) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            return self.block_cancelled(item).await;
        };

        let failures: BTreeMap<DestinationId, PublishError> = outcome
            .into_iter()
            .filter_map(|(d, r)| r.err().map(|e| (d, e)))
            .collect();

        if failures.is_empty() {
            item.mark_published()?;
            self.store.put_item(item).await?;
            self.forget_counters(item.id()).await?;
            info!(item = %item.id(), destinations = destinations.len(), "item published");
            return Ok(());
        }
        if failures.values().any(|e| matches!(e, PublishError::Cancelled)) {
            return self.block_cancelled(item).await;
        }

        let retryable = failures.values().all(PublishError::is_rate_limited);
        item.block(BlockReason::PublishFailed {
            failures: failures.clone(),
            retryable,
        })?;
        self.store.put_item(item).await?;
        warn!(item = %item.id(), failed = failures.len(), retryable, "publish blocked");
        self.notify(OperatorNotice::for_item(
            item,
            NoticeKind::PublishBlocked { failures },
        ))
        .await;
        Ok(())
    }

    async fn block_cancelled(&self, item: &mut Item) -> Result<(), PipelineError> {
        warn!(item = %item.id(), "publish cancelled");
        item.block(BlockReason::Cancelled { stage: None })?;
        self.store.put_item(item).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, id: ItemId) -> Result<Item, PipelineError> {
        self.store
            .get_item(id)
            .await?
            .ok_or(PipelineError::ItemNotFound { item: id })
    }

    /// Drops the item-scope counters of an item that reached a terminal state.
    async fn forget_counters(&self, id: ItemId) -> Result<(), PipelineError> {
        let mut tracker = self.escalation.lock().await;
        if tracker.forget_item(id) {
            self.store.save_escalation(tracker.state()).await?;
        }
        Ok(())
    }

    /// Queues a notice. A queue failure is logged, never swallowed silently.
    async fn notify(&self, notice: OperatorNotice) {
        let item = notice.item;
        if let Err(e) = self.queue.submit(notice).await {
            error!(item = %item, error = %e, "failed to queue operator notice");
        }
    }
}

fn item_key(item: &Item, spec: &StageSpec) -> EscalationKey {
    EscalationKey::Item {
        item: item.id(),
        stage: spec.id.clone(),
    }
}

fn cohort_key(item: &Item, spec: &StageSpec) -> EscalationKey {
    EscalationKey::Cohort {
        cohort: item.tier().cohort_key(),
        stage: spec.id.clone(),
        item: item.id(),
    }
}

fn validate_start(plan: &StagePlan, start: usize) -> Result<(), PipelineError> {
    let Some(stage) = plan.stages().get(start) else {
        return Err(PipelineError::InvalidDirective {
            message: format!(
                "start index {start} is outside the {} plan of {} stages",
                plan.tier(),
                plan.len()
            ),
        });
    };
    if stage.forbidden_in_tier {
        return Err(PipelineError::InvalidDirective {
            message: format!(
                "cannot start at stage '{}', which is forbidden for {}",
                stage.id,
                plan.tier()
            ),
        });
    }
    Ok(())
}

/// Plan index of the first required stage (from the start index on) without a PASS.
fn first_unpassed(plan: &StagePlan, item: &Item) -> Option<usize> {
    plan.required_from(item.start_index())
        .find(|s| !item.has_passed(&s.id))
        .and_then(|s| plan.position_of(&s.id))
}
