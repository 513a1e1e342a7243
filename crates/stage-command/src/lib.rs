//! ContentWorks stage producer adapter.
//!
//! Each stage is an external command. The executor's request is written to
//! the command's stdin as one JSON document; the command answers with one
//! JSON artifact on stdout and exits 0.
//!
//! ```json
//! // stdin
//! {"run_id": "...", "item": "...", "topic": "...", "tier": "SAFE",
//!  "stage": "copy-review", "attempt": 1, "caption": "..."}
//! // stdout
//! {"ratings": {"hook": 4}, "content_markers": [], "caption": "...",
//!  "assets": [{"name": "cover.png", "media_type": "image/png", "path": "/tmp/cover.png"}]}
//! ```
//!
//! A non-zero exit, unreadable output, or an elapsed timeout is a
//! [`ProducerError`]. The child is killed if the call is dropped (for example
//! on cancellation).
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Process management lives here; the executor only sees
//! [`pipeline::StageProducer`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{
    Artifact, AssetPayload, DimensionName, Item, ItemId, ProducerError, RunId, SafetyTier,
    StageContext, StageId, StageProducer, TopicLabel,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt kept in a failure message.
const MAX_STDERR: usize = 2048;

#[derive(Debug, Serialize)]
struct StageRequest<'a> {
    run_id: RunId,
    item: ItemId,
    topic: &'a TopicLabel,
    tier: SafetyTier,
    stage: &'a StageId,
    attempt: u32,
    caption: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WireArtifact {
    ratings: BTreeMap<DimensionName, u8>,
    content_markers: BTreeSet<StageId>,
    caption: Option<String>,
    notes: Option<String>,
    assets: Vec<WireAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireAsset {
    name: String,
    media_type: String,
    path: PathBuf,
}

/// Runs `program args...` for every call.
#[derive(Debug, Clone)]
pub struct CommandProducer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProducer {
    /// `command[0]` is the program; the rest are its arguments.
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self, ProducerError> {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or_else(|| ProducerError::Failed {
            message: "stage command is empty".into(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    async fn run(&self, request: &[u8]) -> Result<Vec<u8>, ProducerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProducerError::Failed {
                message: format!("cannot start '{}': {e}", self.program),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(request).await {
                debug!(program = %self.program, error = %e, "stage command closed stdin");
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProducerError::Timeout {
                after: self.timeout,
            })?
            .map_err(|e| ProducerError::Failed {
                message: format!("waiting for '{}': {e}", self.program),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(MAX_STDERR).collect();
            return Err(ProducerError::Failed {
                message: format!("'{}' exited with {}: {excerpt}", self.program, output.status),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl StageProducer for CommandProducer {
    async fn produce(&self, item: &Item, ctx: &StageContext) -> Result<Artifact, ProducerError> {
        let request = serde_json::to_vec(&StageRequest {
            run_id: ctx.run_id,
            item: item.id(),
            topic: item.topic(),
            tier: ctx.tier,
            stage: &ctx.stage,
            attempt: ctx.attempt,
            caption: item.deliverable().caption.as_deref(),
        })
        .map_err(|e| ProducerError::Failed {
            message: format!("cannot encode stage request: {e}"),
        })?;

        let stdout = self.run(&request).await?;
        let wire: WireArtifact =
            serde_json::from_slice(&stdout).map_err(|e| ProducerError::MalformedOutput {
                message: e.to_string(),
            })?;

        let mut assets = Vec::with_capacity(wire.assets.len());
        for asset in wire.assets {
            let bytes = tokio::fs::read(&asset.path)
                .await
                .map_err(|e| ProducerError::MalformedOutput {
                    message: format!("asset '{}' at {}: {e}", asset.name, asset.path.display()),
                })?;
            assets.push(AssetPayload {
                name: asset.name,
                media_type: asset.media_type,
                bytes,
            });
        }

        debug!(
            stage = %ctx.stage,
            item = %item.id(),
            ratings = wire.ratings.len(),
            assets = assets.len(),
            "stage command produced artifact"
        );
        Ok(Artifact {
            ratings: wire.ratings,
            content_markers: wire.content_markers,
            caption: wire.caption,
            assets,
            notes: wire.notes,
        })
    }
}
