//! Entity stores together with their persistence effect.
//!
//! Every mutation goes through [`Repository::dispatch`]: the reducer runs and
//! the resulting snapshot is written while the store lock is held, so
//! persisted snapshots land in apply order.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, instrument, warn};

use crate::attachments::AttachmentFiles;
use crate::error::{EngineError, EngineResult};
use crate::model::{with_record, EntityKind, Record};
use crate::persistence::{self, KeyValueStore};
use crate::store::{Applied, EntityStore, StoreAction, StoreError, StoreSnapshot, Stores};

pub const SETUP_LOOKUPS_KEY: &str = "setup_lookups";

pub struct Repository {
    stores: Stores,
    kv: Arc<dyn KeyValueStore>,
    files: AttachmentFiles,
    last_persist_error: RwLock<Option<String>>,
}

impl Repository {
    pub fn new(kv: Arc<dyn KeyValueStore>, files: AttachmentFiles) -> Self {
        Self {
            stores: Stores::default(),
            kv,
            files,
            last_persist_error: RwLock::new(None),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn files(&self) -> &AttachmentFiles {
        &self.files
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    /// Apply an action and persist the new snapshot if anything changed.
    ///
    /// A failed write is logged and kept in [`Repository::persist_error`]; the
    /// in-memory store stays authoritative and the call still succeeds.
    pub async fn dispatch<T: Record>(&self, action: StoreAction<T>) -> EngineResult<Applied> {
        self.dispatch_with(|_| Ok(action)).await
    }

    /// Like [`Repository::dispatch`], but builds the action from the current
    /// store contents under the same lock.
    pub async fn dispatch_with<T, F>(&self, build: F) -> EngineResult<Applied>
    where
        T: Record,
        F: FnOnce(&EntityStore<T>) -> EngineResult<StoreAction<T>> + Send,
    {
        let applied = {
            let mut store = T::slot(&self.stores).lock().await;
            let action = build(&store)?;
            let applied = store
                .apply(action)
                .map_err(|err| store_error(T::KIND, err))?;
            if applied.changed {
                self.persist(T::KIND, &store.snapshot()).await;
            }
            applied
        };
        if !applied.orphaned_files.is_empty() {
            self.files.remove_best_effort(&applied.orphaned_files).await;
        }
        Ok(applied)
    }

    async fn persist<T: Record>(&self, kind: EntityKind, snapshot: &StoreSnapshot<T>) {
        match persistence::save_json(self.kv.as_ref(), &kind.storage_key(), snapshot).await {
            Ok(()) => {
                let mut last = self.last_persist_error.write().await;
                if last.is_some() {
                    *last = None;
                }
            }
            Err(err) => {
                error!(?err, %kind, "failed to persist store snapshot");
                *self.last_persist_error.write().await = Some(format!("{err:#}"));
            }
        }
    }

    /// Most recent persistence failure, cleared by the next successful write.
    pub async fn persist_error(&self) -> Option<String> {
        self.last_persist_error.read().await.clone()
    }

    /// Load every persisted snapshot into memory. Corrupt snapshots are skipped.
    #[instrument(skip_all)]
    pub async fn restore(&self) -> EngineResult<()> {
        for kind in EntityKind::ALL {
            with_record!(kind, T => self.restore_kind::<T>().await?);
        }
        Ok(())
    }

    async fn restore_kind<T: Record>(&self) -> EngineResult<()> {
        let key = T::KIND.storage_key();
        let snapshot = match persistence::load_json::<StoreSnapshot<T>>(self.kv.as_ref(), &key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(?err, kind=%T::KIND, "ignoring unreadable snapshot");
                return Ok(());
            }
        };
        T::slot(&self.stores)
            .lock()
            .await
            .apply(StoreAction::Restore(snapshot))
            .map_err(|err| store_error(T::KIND, err))?;
        Ok(())
    }

    pub async fn save_setup_lookups(&self, kind: EntityKind, lookups: &Value) -> EngineResult<()> {
        persistence::save_json(self.kv.as_ref(), &setup_lookups_key(kind), lookups).await?;
        Ok(())
    }

    pub async fn setup_lookups(&self, kind: EntityKind) -> EngineResult<Option<Value>> {
        Ok(persistence::load_json(self.kv.as_ref(), &setup_lookups_key(kind)).await?)
    }
}

fn setup_lookups_key(kind: EntityKind) -> String {
    format!("{SETUP_LOOKUPS_KEY}/{}", kind.as_str())
}

pub(crate) fn store_error(kind: EntityKind, err: StoreError) -> EngineError {
    match err {
        StoreError::NotFound(id) | StoreError::AttachmentNotFound(id) => {
            EngineError::NotFound { kind, id }
        }
        StoreError::PendingDelete(id) => EngineError::InvalidUpdate {
            kind,
            message: format!("{id} is pending deletion"),
        },
    }
}
