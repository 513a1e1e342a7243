//! Span constructors for the orchestration layer.
//!
//! Centralised so span names and field keys stay identical between the
//! executor, the publish coordinator, and whatever exporter the CLI wires up.
//! Result fields start out `Empty` and are filled in with the `record_*`
//! helpers once the outcome is known.

use pipeline::{DestinationId, Item, LifecycleState, RunId, StageId};
use tracing::Span;

pub const ITEM: &str = "contentworks.item";
pub const STAGE: &str = "contentworks.stage";
pub const PUBLISH: &str = "contentworks.publish";

/// Root span for one `run_item` / `resume` call.
pub fn item_span(run_id: RunId, item: &Item) -> Span {
    tracing::info_span!(
        "contentworks.item",
        "run.id" = %run_id,
        "item.id" = %item.id(),
        "item.tier" = %item.tier(),
        "item.topic" = %item.topic(),
        "item.state" = tracing::field::Empty,
    )
}

pub fn record_item_state(span: &Span, state: LifecycleState) {
    span.record("item.state", tracing::field::display(state));
}

/// Child span for one producer call.
pub fn stage_span(item: &Item, stage: &StageId, attempt: u32) -> Span {
    tracing::info_span!(
        "contentworks.stage",
        "item.id" = %item.id(),
        "stage.id" = %stage,
        "stage.attempt" = attempt,
        "stage.passed" = tracing::field::Empty,
    )
}

pub fn record_stage_result(span: &Span, passed: bool) {
    span.record("stage.passed", passed);
}

/// Span for one destination of one publish.
pub fn publish_span(item: &Item, destination: &DestinationId) -> Span {
    tracing::info_span!(
        "contentworks.publish",
        "item.id" = %item.id(),
        "publish.destination" = %destination,
        "publish.post_id" = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{SafetyTier, TopicLabel};

    #[test]
    fn span_helpers_accept_records_without_subscriber() {
        let item = Item::new(TopicLabel::new("sleep").unwrap(), SafetyTier::Safe, 0);
        let span = item_span(RunId::new_random(), &item);
        record_item_state(&span, LifecycleState::Published);
        let stage = stage_span(&item, &StageId::new("fact-check").unwrap(), 1);
        record_stage_result(&stage, true);
        let _ = publish_span(&item, &DestinationId::new("threads").unwrap());
        assert_eq!(ITEM, "contentworks.item");
    }
}
