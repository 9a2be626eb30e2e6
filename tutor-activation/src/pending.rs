//! Pending Activation Store
//!
//! Client-held, durable record of activations that still have to happen.
//! Keyed by external payment reference; a second `put` for the same reference
//! replaces the first. Intents outlive restarts and are only removed by
//! `clear` (no expiry).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tutor_common::Result;

use crate::models::PendingActivationIntent;

/// Mutation applied atomically by [`PendingActivationStore::update`]
pub type IntentUpdate = Box<dyn FnOnce(&mut PendingActivationIntent) + Send>;

#[async_trait]
pub trait PendingActivationStore: Send + Sync {
    /// Insert or replace the intent for its payment reference
    async fn put(&self, intent: PendingActivationIntent) -> Result<()>;

    async fn get(&self, reference: &str) -> Result<Option<PendingActivationIntent>>;

    /// Remove the intent; returns whether one existed
    async fn clear(&self, reference: &str) -> Result<bool>;

    /// Apply `update` to an existing intent
    ///
    /// Never resurrects a cleared intent: returns `None` if there is none.
    async fn update(
        &self,
        reference: &str,
        update: IntentUpdate,
    ) -> Result<Option<PendingActivationIntent>>;

    /// All outstanding intents, ordered by payment reference
    async fn list(&self) -> Result<Vec<PendingActivationIntent>>;
}

/// Pending store persisted as one JSON document
///
/// Every mutation rewrites the file atomically (temp file + rename) while
/// holding the lock, so the file always holds a complete snapshot.
pub struct FilePendingStore {
    path: PathBuf,
    intents: Mutex<BTreeMap<String, PendingActivationIntent>>,
}

impl FilePendingStore {
    /// Default file name inside the service root folder
    pub const FILE_NAME: &'static str = "pending_activations.json";

    /// Open the store, loading any intents left by a previous run
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let intents = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<PendingActivationIntent> = serde_json::from_slice(&bytes)?;
                list.into_iter()
                    .map(|intent| (intent.external_payment_reference.clone(), intent))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        if !intents.is_empty() {
            tracing::info!(
                count = intents.len(),
                path = %path.display(),
                "Loaded outstanding activation intents"
            );
        }

        Ok(Self {
            path,
            intents: Mutex::new(intents),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, intents: &BTreeMap<String, PendingActivationIntent>) -> Result<()> {
        let list: Vec<&PendingActivationIntent> = intents.values().collect();
        let json = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PendingActivationStore for FilePendingStore {
    async fn put(&self, intent: PendingActivationIntent) -> Result<()> {
        let mut intents = self.intents.lock().await;
        let reference = intent.external_payment_reference.clone();

        let previous = intents.insert(reference.clone(), intent);
        if let Err(e) = self.persist(&intents).await {
            // Keep memory consistent with disk
            match previous {
                Some(previous) => intents.insert(reference, previous),
                None => intents.remove(&reference),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, reference: &str) -> Result<Option<PendingActivationIntent>> {
        Ok(self.intents.lock().await.get(reference).cloned())
    }

    async fn clear(&self, reference: &str) -> Result<bool> {
        let mut intents = self.intents.lock().await;

        let Some(previous) = intents.remove(reference) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&intents).await {
            intents.insert(reference.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn update(
        &self,
        reference: &str,
        update: IntentUpdate,
    ) -> Result<Option<PendingActivationIntent>> {
        let mut intents = self.intents.lock().await;

        let Some(current) = intents.get(reference).cloned() else {
            return Ok(None);
        };
        let mut updated = current.clone();
        update(&mut updated);

        intents.insert(reference.to_string(), updated.clone());
        if let Err(e) = self.persist(&intents).await {
            intents.insert(reference.to_string(), current);
            return Err(e);
        }
        Ok(Some(updated))
    }

    async fn list(&self) -> Result<Vec<PendingActivationIntent>> {
        Ok(self.intents.lock().await.values().cloned().collect())
    }
}
