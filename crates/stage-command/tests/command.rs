//! CommandProducer against real `sh` scripts.

use std::time::Duration;

use pipeline::{
    DimensionName, Item, ProducerError, RunId, SafetyTier, StageContext, StageId, StageProducer,
    TopicLabel,
};
use stage_command::CommandProducer;

fn sh(script: &str) -> CommandProducer {
    CommandProducer::new(
        vec!["sh".into(), "-c".into(), script.into()],
        Duration::from_secs(5),
    )
    .unwrap()
}

fn fixture() -> (Item, StageContext) {
    let mut item = Item::new(TopicLabel::new("electrolytes").unwrap(), SafetyTier::Caution, 0);
    item.start().unwrap();
    let ctx = StageContext {
        run_id: RunId::new_random(),
        stage: StageId::new("copy-review").unwrap(),
        attempt: 1,
        tier: SafetyTier::Caution,
    };
    (item, ctx)
}

#[tokio::test]
async fn ratings_and_caption_are_read_from_stdout() {
    let (item, ctx) = fixture();
    let producer = sh(r#"cat >/dev/null; echo '{"ratings":{"hook":4,"accuracy":5},"caption":"Salt matters."}'"#);
    let artifact = producer.produce(&item, &ctx).await.unwrap();
    assert_eq!(artifact.ratings[&DimensionName::new("hook").unwrap()], 4);
    assert_eq!(artifact.caption.as_deref(), Some("Salt matters."));
}

#[tokio::test]
async fn request_is_written_to_stdin() {
    let (item, ctx) = fixture();
    // Echo the stage name from the request back as the caption.
    let producer = sh(
        r#"req=$(cat); stage=$(printf '%s' "$req" | sed 's/.*"stage":"\([^"]*\)".*/\1/'); printf '{"caption":"%s"}' "$stage""#,
    );
    let artifact = producer.produce(&item, &ctx).await.unwrap();
    assert_eq!(artifact.caption.as_deref(), Some("copy-review"));
}

#[tokio::test]
async fn asset_files_are_loaded() {
    let (item, ctx) = fixture();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cover.png");
    std::fs::write(&path, b"\x89PNG fake").unwrap();
    let producer = sh(&format!(
        r#"cat >/dev/null; echo '{{"assets":[{{"name":"cover.png","media_type":"image/png","path":"{}"}}]}}'"#,
        path.display()
    ));
    let artifact = producer.produce(&item, &ctx).await.unwrap();
    assert_eq!(artifact.assets.len(), 1);
    assert_eq!(artifact.assets[0].bytes, b"\x89PNG fake");
}

#[tokio::test]
async fn nonzero_exit_is_a_failure_with_stderr() {
    let (item, ctx) = fixture();
    let producer = sh("cat >/dev/null; echo 'model unavailable' >&2; exit 3");
    match producer.produce(&item, &ctx).await {
        Err(ProducerError::Failed { message }) => assert!(message.contains("model unavailable")),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_output_is_malformed() {
    let (item, ctx) = fixture();
    let producer = sh("cat >/dev/null; echo 'not json'");
    assert!(matches!(
        producer.produce(&item, &ctx).await,
        Err(ProducerError::MalformedOutput { .. })
    ));
}

#[tokio::test]
async fn slow_command_times_out() {
    let (item, ctx) = fixture();
    let producer = CommandProducer::new(
        vec!["sh".into(), "-c".into(), "sleep 5".into()],
        Duration::from_millis(100),
    )
    .unwrap();
    assert!(matches!(
        producer.produce(&item, &ctx).await,
        Err(ProducerError::Timeout { .. })
    ));
}
