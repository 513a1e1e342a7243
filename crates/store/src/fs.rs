use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::{
    AssetAddress, AssetFingerprint, CommitOutcome, DestinationId, EscalationState, Item, ItemId,
    PublishRecord, StateStore, StoreError,
};
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

const ITEMS: &str = "items";
const PUBLISH: &str = "publish";
const ASSETS: &str = "assets";
const OBJECTS: &str = "objects";
const ESCALATION: &str = "escalation.json";

/// Filesystem-backed state store.
///
/// Layout under `root`:
///
/// ```text
/// items/<item-id>.json
/// escalation.json
/// publish/<item-id>/<destination>.json
/// assets/<destination>/<fingerprint>.json
/// objects/<first 2 hex chars>/<remaining hex chars>
/// ```
///
/// Every document is written to a temp file in its target directory and then
/// renamed over the target, so readers see the old or the new document and
/// never a torn one.
pub struct FileStateStore {
    root: PathBuf,
    /// Serialises read-modify-write operations (intents, commits, address cache).
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        for dir in [ITEMS, PUBLISH, ASSETS, OBJECTS] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn item_path(&self, id: ItemId) -> PathBuf {
        self.root.join(ITEMS).join(format!("{id}.json"))
    }

    fn publish_path(
        &self,
        item: ItemId,
        destination: &DestinationId,
    ) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(PUBLISH)
            .join(item.to_string())
            .join(format!("{}.json", path_component(destination.as_str())?)))
    }

    fn address_path(
        &self,
        destination: &DestinationId,
        fingerprint: &AssetFingerprint,
    ) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(ASSETS)
            .join(path_component(destination.as_str())?)
            .join(format!("{}.json", path_component(fingerprint.as_str())?)))
    }

    fn blob_path(&self, fingerprint: &AssetFingerprint) -> Result<PathBuf, StoreError> {
        let hex = path_component(fingerprint.as_str())?;
        match (hex.get(..2), hex.get(2..)) {
            (Some(shard), Some(rest)) if !rest.is_empty() => {
                Ok(self.root.join(OBJECTS).join(shard).join(rest))
            }
            _ => Err(StoreError::Io {
                message: format!("fingerprint '{hex}' is too short to shard"),
            }),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn put_item(&self, item: &Item) -> Result<(), StoreError> {
        let path = self.item_path(item.id());
        let bytes = serde_json::to_vec_pretty(item)?;
        blocking(move || write_atomic(&path, &bytes)).await
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        let path = self.item_path(id);
        blocking(move || read_json(&path)).await
    }

    async fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        let dir = self.root.join(ITEMS);
        let mut items: Vec<Item> = blocking(move || {
            let mut items = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(item) = read_json::<Item>(&path)? {
                    items.push(item);
                }
            }
            Ok(items)
        })
        .await?;
        items.sort_by_key(|i| (i.created_at(), i.id()));
        Ok(items)
    }

    async fn load_escalation(&self) -> Result<EscalationState, StoreError> {
        let path = self.root.join(ESCALATION);
        Ok(blocking(move || read_json(&path))
            .await?
            .unwrap_or_default())
    }

    async fn save_escalation(&self, state: &EscalationState) -> Result<(), StoreError> {
        let path = self.root.join(ESCALATION);
        let bytes = serde_json::to_vec_pretty(state)?;
        blocking(move || write_atomic(&path, &bytes)).await
    }

    async fn get_publish_record(
        &self,
        item: ItemId,
        destination: &DestinationId,
    ) -> Result<Option<PublishRecord>, StoreError> {
        let path = self.publish_path(item, destination)?;
        blocking(move || read_json(&path)).await
    }

    async fn put_publish_intent(&self, intent: &PublishRecord) -> Result<PublishRecord, StoreError> {
        let path = self.publish_path(intent.item, &intent.destination)?;
        let _guard = self.write_lock.lock().await;
        let intent = intent.clone();
        blocking(move || {
            if let Some(existing) = read_json::<PublishRecord>(&path)? {
                return Ok(existing);
            }
            write_atomic(&path, &serde_json::to_vec_pretty(&intent)?)?;
            Ok(intent)
        })
        .await
    }

    async fn commit_publish_record(
        &self,
        record: &PublishRecord,
    ) -> Result<CommitOutcome, StoreError> {
        let path = self.publish_path(record.item, &record.destination)?;
        let _guard = self.write_lock.lock().await;
        let record = record.clone();
        blocking(move || {
            if let Some(existing) = read_json::<PublishRecord>(&path)? {
                if existing.is_committed() {
                    return Ok(CommitOutcome::AlreadyCommitted(existing));
                }
            }
            write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;
            Ok(CommitOutcome::Committed(record))
        })
        .await
    }

    async fn get_asset_address(
        &self,
        destination: &DestinationId,
        fingerprint: &AssetFingerprint,
    ) -> Result<Option<AssetAddress>, StoreError> {
        let path = self.address_path(destination, fingerprint)?;
        blocking(move || read_json(&path)).await
    }

    async fn put_asset_address(
        &self,
        destination: &DestinationId,
        fingerprint: &AssetFingerprint,
        address: &AssetAddress,
    ) -> Result<AssetAddress, StoreError> {
        let path = self.address_path(destination, fingerprint)?;
        let _guard = self.write_lock.lock().await;
        let address = address.clone();
        blocking(move || {
            if let Some(existing) = read_json::<AssetAddress>(&path)? {
                return Ok(existing);
            }
            write_atomic(&path, &serde_json::to_vec(&address)?)?;
            Ok(address)
        })
        .await
    }

    async fn put_blob(&self, bytes: &[u8]) -> Result<AssetFingerprint, StoreError> {
        let fingerprint = AssetFingerprint::compute(bytes);
        let path = self.blob_path(&fingerprint)?;
        let bytes = bytes.to_vec();
        let stored = blocking(move || {
            if path.exists() {
                return Ok(false);
            }
            write_atomic(&path, &bytes)?;
            Ok(true)
        })
        .await?;
        debug!(fingerprint = %fingerprint.short(), stored, "blob put");
        Ok(fingerprint)
    }

    async fn get_blob(&self, fingerprint: &AssetFingerprint) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(fingerprint)?;
        let key = fingerprint.as_str().to_owned();
        blocking(move || {
            fs::read(&path).map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    StoreError::BlobNotFound { fingerprint: key }
                } else {
                    e.into()
                }
            })
        })
        .await
    }
}

/// Rejects names that would escape their directory.
fn path_component(name: &str) -> Result<&str, StoreError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(name)
    } else {
        Err(StoreError::Io {
            message: format!("'{name}' is not a valid storage key"),
        })
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io {
            message: format!("storage task failed: {e}"),
        })?
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().ok_or_else(|| StoreError::Io {
        message: format!("{} has no parent directory", path.display()),
    })?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::from(e.error))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
