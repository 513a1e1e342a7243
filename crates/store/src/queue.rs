use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::{OperatorNotice, OperatorQueue, StoreError};
use tokio::sync::Mutex;
use tracing::info;

/// Operator queue persisted as one JSON notice per line.
pub struct FileOperatorQueue {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl FileOperatorQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            path,
            append_lock: Mutex::new(()),
        })
    }

    /// Every notice queued so far, oldest first.
    pub async fn notices(&self) -> Result<Vec<OperatorNotice>, StoreError> {
        let path = self.path.clone();
        let _guard = self.append_lock.lock().await;
        tokio::task::spawn_blocking(move || -> Result<Vec<OperatorNotice>, StoreError> {
            let file = match fs::File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut notices = Vec::new();
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                notices.push(serde_json::from_str(&line)?);
            }
            Ok(notices)
        })
        .await
        .map_err(|e| StoreError::Io {
            message: format!("queue task failed: {e}"),
        })?
    }
}

#[async_trait]
impl OperatorQueue for FileOperatorQueue {
    async fn submit(&self, notice: OperatorNotice) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&notice)?;
        line.push(b'\n');
        let path = self.path.clone();
        let _guard = self.append_lock.lock().await;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&line)?;
            file.sync_data()?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io {
            message: format!("queue task failed: {e}"),
        })??;
        info!(item = %notice.item, tier = %notice.tier, "operator notice queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pipeline::{Item, NoticeKind, SafetyTier, StageId, TopicLabel};

    use super::*;

    #[tokio::test]
    async fn notices_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue").join("notices.jsonl");
        let item = Item::new(TopicLabel::new("iron").unwrap(), SafetyTier::Danger, 0);

        let queue = FileOperatorQueue::open(&path).unwrap();
        for stage in ["fact-check", "copy-review"] {
            queue
                .submit(OperatorNotice::for_item(
                    &item,
                    NoticeKind::StageBlocked {
                        stage: StageId::new(stage).unwrap(),
                        reasons: vec!["LOW_TOTAL".into()],
                    },
                ))
                .await
                .unwrap();
        }

        let reopened = FileOperatorQueue::open(&path).unwrap();
        let notices = reopened.notices().await.unwrap();
        assert_eq!(notices.len(), 2);
        assert!(matches!(
            &notices[1].kind,
            NoticeKind::StageBlocked { stage, .. } if stage.as_str() == "copy-review"
        ));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileOperatorQueue::open(dir.path().join("none.jsonl")).unwrap();
        assert!(queue.notices().await.unwrap().is_empty());
    }
}
