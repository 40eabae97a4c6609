//! Facade wiring the stores, gateway, orchestrator and token store together.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::accounting::{self, PendingCounts};
use crate::attachments::AttachmentFiles;
use crate::auth::TokenStore;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{HttpGateway, RemoteGateway};
use crate::ids::{IdGenerator, TimestampIdGenerator};
use crate::merge::merge;
use crate::model::{with_record, AnyEntity, Attachment, EntityKind, Record, Syncable};
use crate::orchestrator::{SyncMode, SyncOrchestrator, SyncOutcome};
use crate::persistence::{KeyValueStore, SqliteStore};
use crate::repository::Repository;
use crate::store::StoreAction;

pub struct SyncEngine {
    repo: Arc<Repository>,
    gateway: Arc<dyn RemoteGateway>,
    tokens: Arc<TokenStore>,
    ids: Arc<dyn IdGenerator>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncEngine {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        gateway: Arc<dyn RemoteGateway>,
        tokens: Arc<TokenStore>,
        files: AttachmentFiles,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let repo = Arc::new(Repository::new(kv, files));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            repo.clone(),
            gateway.clone(),
            tokens.clone(),
        ));
        Self {
            repo,
            gateway,
            tokens,
            ids,
            orchestrator,
        }
    }

    /// Build the production engine: SQLite snapshots and the HTTP gateway.
    pub async fn open(cfg: &Config, database_url: &str) -> anyhow::Result<Self> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(database_url).await?);
        let tokens = Arc::new(TokenStore::new(kv.clone()));
        let gateway = Arc::new(HttpGateway::new(
            &cfg.api.base_url,
            cfg.api.timeout_secs,
            tokens.clone(),
        )?);
        let files = AttachmentFiles::new(cfg.app.attachments_dir());
        Ok(Self::new(
            kv,
            gateway,
            tokens,
            files,
            Arc::new(TimestampIdGenerator),
        ))
    }

    /// Load persisted stores and the saved session.
    pub async fn restore(&self) -> EngineResult<()> {
        self.tokens.restore().await?;
        self.repo.restore().await?;
        let counts = self.pending_counts().await;
        info!(pending = counts.total(), "restored local state");
        Ok(())
    }

    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn is_syncing(&self) -> bool {
        self.orchestrator.is_syncing()
    }

    // ---- reads ----

    /// Visible entities of one type (pending deletes hidden).
    pub async fn entities<T: Record>(&self) -> Vec<Syncable<T>> {
        T::slot(self.repo.stores()).lock().await.visible()
    }

    pub async fn entity<T: Record>(&self, id: &str) -> Option<Syncable<T>> {
        T::slot(self.repo.stores())
            .lock()
            .await
            .get(id)
            .filter(|e| e.is_visible())
            .cloned()
    }

    pub async fn entities_of(&self, kind: EntityKind) -> Vec<AnyEntity> {
        with_record!(kind, T => self
            .entities::<T>()
            .await
            .into_iter()
            .map(T::into_any)
            .collect())
    }

    pub async fn last_fetched(&self, kind: EntityKind) -> Option<DateTime<Utc>> {
        with_record!(kind, T => T::slot(self.repo.stores()).lock().await.last_fetched())
    }

    pub async fn setup_lookups(&self, kind: EntityKind) -> EngineResult<Option<Value>> {
        self.repo.setup_lookups(kind).await
    }

    pub async fn pending_counts(&self) -> PendingCounts {
        accounting::pending_counts(self.repo.stores()).await
    }

    pub async fn pending_counts_for(&self, kind: EntityKind) -> PendingCounts {
        accounting::pending_counts_for(self.repo.stores(), kind).await
    }

    pub async fn persist_error(&self) -> Option<String> {
        self.repo.persist_error().await
    }

    // ---- local mutations ----

    /// Create an entity offline under a temporary id.
    #[instrument(skip(self, data), fields(kind = %T::KIND))]
    pub async fn create_local<T: Record>(&self, data: T) -> EngineResult<Syncable<T>> {
        let entity = Syncable::new_local(self.ids.entity_id(T::KIND), data);
        self.repo
            .dispatch(StoreAction::Insert(entity.clone()))
            .await?;
        debug!(id=%entity.id, "created local entity");
        Ok(entity)
    }

    pub async fn create_local_any(&self, kind: EntityKind, fields: Value) -> EngineResult<AnyEntity> {
        with_record!(kind, T => {
            let data: T = serde_json::from_value(fields).map_err(|e| EngineError::InvalidUpdate {
                kind,
                message: e.to_string(),
            })?;
            Ok(T::into_any(self.create_local(data).await?))
        })
    }

    /// Apply a JSON merge patch to an entity's domain fields.
    #[instrument(skip(self, patch), fields(kind = %T::KIND))]
    pub async fn update_local<T: Record>(
        &self,
        id: &str,
        patch: &Map<String, Value>,
    ) -> EngineResult<Syncable<T>> {
        self.repo
            .dispatch_with::<T, _>(|store| {
                let current = store.get(id).ok_or_else(|| EngineError::NotFound {
                    kind: T::KIND,
                    id: id.to_string(),
                })?;
                let invalid = |message: String| EngineError::InvalidUpdate {
                    kind: T::KIND,
                    message,
                };
                let mut fields = current.data_json().map_err(invalid)?;
                merge_patch(&mut fields, patch);
                let data: T = serde_json::from_value(Value::Object(fields))
                    .map_err(|e| invalid(e.to_string()))?;
                Ok(StoreAction::Update {
                    id: id.to_string(),
                    data,
                })
            })
            .await?;
        self.entity(id).await.ok_or_else(|| EngineError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })
    }

    pub async fn update_local_any(
        &self,
        kind: EntityKind,
        id: &str,
        patch: Value,
    ) -> EngineResult<AnyEntity> {
        let Value::Object(patch) = patch else {
            return Err(EngineError::InvalidUpdate {
                kind,
                message: "patch must be a JSON object".into(),
            });
        };
        with_record!(kind, T => Ok(T::into_any(self.update_local::<T>(id, &patch).await?)))
    }

    /// Delete locally. Never-synced entities disappear at once; synced ones
    /// wait for the remote delete.
    pub async fn delete_local<T: Record>(&self, id: &str) -> EngineResult<()> {
        self.repo
            .dispatch(StoreAction::<T>::Delete { id: id.to_string() })
            .await?;
        Ok(())
    }

    pub async fn delete_local_any(&self, kind: EntityKind, id: &str) -> EngineResult<()> {
        with_record!(kind, T => self.delete_local::<T>(id).await)
    }

    /// Copy `source` into app storage and attach it to the entity.
    #[instrument(skip(self), fields(kind = %T::KIND))]
    pub async fn add_attachment<T: Record>(&self, id: &str, source: &Path) -> EngineResult<Attachment> {
        {
            let store = T::slot(self.repo.stores()).lock().await;
            match store.get(id) {
                Some(e) if e.pending_delete => {
                    return Err(EngineError::InvalidUpdate {
                        kind: T::KIND,
                        message: format!("{id} is pending deletion"),
                    })
                }
                Some(_) => {}
                None => {
                    return Err(EngineError::NotFound {
                        kind: T::KIND,
                        id: id.to_string(),
                    })
                }
            }
        }
        let local_ref = self.ids.attachment_ref();
        let (path, file_name) = self
            .repo
            .files()
            .import(T::KIND, &local_ref, source)
            .await?;
        let attachment = Attachment::new_local(local_ref, path.clone(), Some(file_name));
        let added = self
            .repo
            .dispatch(StoreAction::<T>::AddImage {
                id: id.to_string(),
                attachment: attachment.clone(),
            })
            .await;
        if let Err(err) = added {
            self.repo.files().remove_best_effort(&[path]).await;
            return Err(err);
        }
        Ok(attachment)
    }

    pub async fn remove_attachment<T: Record>(&self, id: &str, local_ref: &str) -> EngineResult<()> {
        self.repo
            .dispatch(StoreAction::<T>::RemoveImage {
                id: id.to_string(),
                local_ref: local_ref.to_string(),
            })
            .await?;
        Ok(())
    }

    // ---- remote ----

    pub async fn login(&self, username: &str, password: &str) -> EngineResult<()> {
        let creds = self.gateway.login(username, password).await?;
        self.tokens.set(creds).await?;
        info!("signed in");
        Ok(())
    }

    pub async fn logout(&self) -> EngineResult<()> {
        self.tokens.clear().await?;
        Ok(())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.bearer().await.is_some()
    }

    /// Fetch the server collection and merge it with local state.
    /// Returns the number of entities held afterwards.
    #[instrument(skip(self))]
    pub async fn fetch_and_merge(&self, kind: EntityKind) -> EngineResult<usize> {
        let data = self.gateway.fetch_all(kind).await?;
        let count = with_record!(kind, T => self.merge_fetched::<T>(data.entities).await?);
        if !data.setup_lookups.is_null() {
            self.repo.save_setup_lookups(kind, &data.setup_lookups).await?;
        }
        info!(%kind, count, "fetched and merged");
        Ok(count)
    }

    async fn merge_fetched<T: Record>(&self, raw: Vec<Value>) -> EngineResult<usize> {
        let server: Vec<Syncable<T>> = raw
            .into_iter()
            .filter_map(|value| match Syncable::from_server_json(value) {
                Ok(entity) => Some(entity),
                Err(err) => {
                    warn!(%err, "skipping malformed server entity");
                    None
                }
            })
            .collect();
        let mut count = 0;
        self.repo
            .dispatch_with::<T, _>(|store| {
                let merged = merge(server, store.entities());
                count = merged.len();
                Ok(StoreAction::ReplaceAll {
                    entities: merged,
                    fetched_at: Some(Utc::now()),
                })
            })
            .await?;
        Ok(count)
    }

    /// Fetch every kind. Failures are logged per kind and do not stop the others.
    pub async fn fetch_all_kinds(&self) -> Vec<(EntityKind, EngineResult<usize>)> {
        let fetches = EntityKind::ALL.map(|kind| async move { (kind, self.fetch_and_merge(kind).await) });
        let results = futures::future::join_all(fetches).await;
        for (kind, result) in &results {
            if let Err(err) = result {
                warn!(?err, %kind, "fetch failed");
            }
        }
        results
    }

    /// User-initiated sync of one kind, or of everything.
    pub async fn sync_now(&self, kind: Option<EntityKind>) -> EngineResult<SyncOutcome> {
        match kind {
            Some(kind) => self.orchestrator.sync_pending(kind, SyncMode::Manual).await,
            None => self.orchestrator.sync_all(SyncMode::Manual).await,
        }
    }

    /// Download server images the device does not have yet. Returns how many were stored.
    #[instrument(skip(self), fields(kind = %T::KIND))]
    pub async fn hydrate_attachments<T: Record>(&self, id: &str) -> EngineResult<usize> {
        let (server_id, have): (String, Vec<String>) = {
            let store = T::slot(self.repo.stores()).lock().await;
            let entity = store.get(id).ok_or_else(|| EngineError::NotFound {
                kind: T::KIND,
                id: id.to_string(),
            })?;
            let Some(server_id) = entity.server_id.clone() else {
                return Ok(0);
            };
            let have = entity
                .images
                .iter()
                .filter(|a| a.local_path.is_some())
                .filter_map(|a| a.image_id.clone())
                .collect();
            (server_id, have)
        };

        let remote = self.gateway.download_attachments(T::KIND, &server_id).await?;
        let mut fetched = Vec::new();
        for item in remote.into_iter().filter(|r| !have.contains(&r.image_id)) {
            let bytes = match self.gateway.download_file(&item.url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(?err, image_id=%item.image_id, "attachment download failed");
                    continue;
                }
            };
            let path = self
                .repo
                .files()
                .write_download(T::KIND, &item.image_id, item.file_name.as_deref(), &bytes)
                .await?;
            let mut attachment = Attachment::from_server(item.image_id, item.file_name);
            attachment.local_path = Some(path);
            fetched.push(attachment);
        }
        let stored = fetched.len();
        if stored > 0 {
            self.repo
                .dispatch(StoreAction::<T>::HydrateImages {
                    id: id.to_string(),
                    attachments: fetched,
                })
                .await?;
        }
        Ok(stored)
    }
}

/// RFC 7386 merge patch: `null` removes a key, objects merge recursively.
fn merge_patch(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(inner) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(existing) = slot {
                    merge_patch(existing, inner);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn merge_patch_sets_removes_and_recurses() {
        let mut target = obj(json!({
            "legend": "STOP",
            "notes": "bent",
            "location": {"lat": 1.0, "lng": 2.0}
        }));
        merge_patch(
            &mut target,
            &obj(json!({"legend": "YIELD", "notes": null, "location": {"lat": 3.0}})),
        );
        assert_eq!(
            Value::Object(target),
            json!({"legend": "YIELD", "location": {"lat": 3.0, "lng": 2.0}})
        );
    }

    #[test]
    fn merge_patch_replaces_scalar_with_object() {
        let mut target = obj(json!({"location": "unknown"}));
        merge_patch(&mut target, &obj(json!({"location": {"lat": 1.0}})));
        assert_eq!(target["location"], json!({"lat": 1.0}));
    }
}
