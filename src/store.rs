//! In-memory entity collections with a pure reducer.
//!
//! `EntityStore::apply` is the only place entities are mutated. It performs no
//! I/O: callers persist the snapshot (and remove orphaned attachment files)
//! after a changed apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::merge;
use crate::model::{
    Attachment, Collision, MaintenanceJob, Record, Sign, Support, SyncState, Syncable,
    TrafficCountWorkOrder,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("entity {0} not found")]
    NotFound(String),
    #[error("entity {0} is pending deletion")]
    PendingDelete(String),
    #[error("attachment {0} not found")]
    AttachmentNotFound(String),
}

/// Correlates an uploaded attachment with its server id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBinding {
    pub local_ref: String,
    pub server_image_id: String,
}

/// Transitions accepted by [`EntityStore::apply`].
#[derive(Debug, Clone)]
pub enum StoreAction<T> {
    /// Append a locally-created entity.
    Insert(Syncable<T>),
    /// Replace domain fields; demotes a synced entity on real change.
    Update { id: String, data: T },
    AddImage { id: String, attachment: Attachment },
    RemoveImage { id: String, local_ref: String },
    /// Local delete: removal if never synced, demotion to a pending delete otherwise.
    Delete { id: String },
    /// Load a persisted snapshot at start-up.
    Restore(StoreSnapshot<T>),
    /// Result of a fetch-and-merge.
    ReplaceAll {
        entities: Vec<Syncable<T>>,
        fetched_at: Option<DateTime<Utc>>,
    },
    /// Server accepted a push: adopt the server identity. `data` carries the
    /// server's echo of the record and is applied only if no edit raced the push.
    Promote {
        id: String,
        server_id: String,
        pushed_revision: u64,
        data: Option<T>,
    },
    /// Attachments handled: drop `local_id` and mark synced if nothing changed meanwhile.
    FinishPromotion { id: String, pushed_revision: u64 },
    BindImages { id: String, bindings: Vec<ImageBinding> },
    /// Attach server-side images downloaded to the device.
    HydrateImages { id: String, attachments: Vec<Attachment> },
    /// Remote delete succeeded.
    ConfirmDelete { id: String },
}

/// Outcome of a reducer step.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub changed: bool,
    /// Local attachment files no longer referenced by any entity.
    pub orphaned_files: Vec<PathBuf>,
}

impl Applied {
    fn changed() -> Self {
        Self {
            changed: true,
            orphaned_files: Vec::new(),
        }
    }

    fn unchanged() -> Self {
        Self::default()
    }

    fn removed<T>(entity: &Syncable<T>) -> Self {
        Self {
            changed: true,
            orphaned_files: local_files(&entity.images),
        }
    }
}

fn local_files(images: &[Attachment]) -> Vec<PathBuf> {
    images.iter().filter_map(|a| a.local_path.clone()).collect()
}

/// Persisted form of one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "T: Record")]
pub struct StoreSnapshot<T> {
    pub entities: Vec<Syncable<T>>,
    #[serde(default)]
    pub backend_image_map: BTreeMap<String, String>,
    #[serde(default)]
    pub last_fetched_timestamp: Option<DateTime<Utc>>,
}

/// Collection of one entity type, holding synced and pending entities together.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStore<T> {
    entities: Vec<Syncable<T>>,
    backend_image_map: BTreeMap<String, String>,
    last_fetched: Option<DateTime<Utc>>,
}

impl<T> Default for EntityStore<T> {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            backend_image_map: BTreeMap::new(),
            last_fetched: None,
        }
    }
}

impl<T: Record> EntityStore<T> {
    pub fn from_snapshot(snapshot: StoreSnapshot<T>) -> Self {
        Self {
            entities: snapshot.entities,
            backend_image_map: snapshot.backend_image_map,
            last_fetched: snapshot.last_fetched_timestamp,
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot<T> {
        StoreSnapshot {
            entities: self.entities.clone(),
            backend_image_map: self.backend_image_map.clone(),
            last_fetched_timestamp: self.last_fetched,
        }
    }

    /// Every entity, including pending deletes.
    pub fn entities(&self) -> &[Syncable<T>] {
        &self.entities
    }

    /// Entities shown to users.
    pub fn visible(&self) -> Vec<Syncable<T>> {
        self.entities
            .iter()
            .filter(|e| e.is_visible())
            .cloned()
            .collect()
    }

    /// Entities needing a sync pass, in store order.
    pub fn pending(&self) -> Vec<Syncable<T>> {
        self.entities
            .iter()
            .filter(|e| e.is_pending())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Syncable<T>> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn last_fetched(&self) -> Option<DateTime<Utc>> {
        self.last_fetched
    }

    pub fn backend_image_map(&self) -> &BTreeMap<String, String> {
        &self.backend_image_map
    }

    fn position(&self, id: &str) -> Result<usize, StoreError> {
        self.entities
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn live_mut(&mut self, id: &str) -> Result<&mut Syncable<T>, StoreError> {
        let idx = self.position(id)?;
        let entity = &mut self.entities[idx];
        if entity.pending_delete {
            return Err(StoreError::PendingDelete(id.to_string()));
        }
        Ok(entity)
    }

    /// Apply one transition.
    pub fn apply(&mut self, action: StoreAction<T>) -> Result<Applied, StoreError> {
        let drops_images = matches!(
            action,
            StoreAction::RemoveImage { .. }
                | StoreAction::Delete { .. }
                | StoreAction::ReplaceAll { .. }
                | StoreAction::BindImages { .. }
                | StoreAction::ConfirmDelete { .. }
        );
        let applied = self.transition(action)?;
        if drops_images {
            self.prune_image_map();
        }
        Ok(applied)
    }

    /// Keep bindings only for refs still carried by an attachment in this store.
    fn prune_image_map(&mut self) {
        if self.backend_image_map.is_empty() {
            return;
        }
        let live: BTreeSet<&str> = self
            .entities
            .iter()
            .flat_map(|e| e.images.iter().map(|a| a.local_ref.as_str()))
            .collect();
        self.backend_image_map
            .retain(|local_ref, _| live.contains(local_ref.as_str()));
    }

    fn transition(&mut self, action: StoreAction<T>) -> Result<Applied, StoreError> {
        match action {
            StoreAction::Insert(entity) => {
                if self.get(&entity.id).is_some() {
                    return Ok(Applied::unchanged());
                }
                self.entities.push(entity);
                Ok(Applied::changed())
            }
            StoreAction::Update { id, data } => {
                let entity = self.live_mut(&id)?;
                if entity.data == data {
                    return Ok(Applied::unchanged());
                }
                entity.data = data;
                touch(entity);
                Ok(Applied::changed())
            }
            StoreAction::AddImage { id, attachment } => {
                let entity = self.live_mut(&id)?;
                entity.images.push(attachment);
                touch(entity);
                Ok(Applied::changed())
            }
            StoreAction::RemoveImage { id, local_ref } => {
                let entity = self.live_mut(&id)?;
                let idx = entity
                    .images
                    .iter()
                    .position(|a| a.local_ref == local_ref)
                    .ok_or_else(|| StoreError::AttachmentNotFound(local_ref.clone()))?;
                let removed = entity.images.remove(idx);
                touch(entity);
                Ok(Applied {
                    changed: true,
                    orphaned_files: removed.local_path.into_iter().collect(),
                })
            }
            StoreAction::Delete { id } => {
                let idx = self.position(&id)?;
                let entity = &mut self.entities[idx];
                if entity.pending_delete {
                    return Ok(Applied::unchanged());
                }
                if entity.server_id.is_none() {
                    let removed = self.entities.remove(idx);
                    return Ok(Applied::removed(&removed));
                }
                entity.pending_delete = true;
                touch(entity);
                Ok(Applied::changed())
            }
            StoreAction::Restore(snapshot) => {
                let restored = Self::from_snapshot(snapshot);
                let changed = restored != *self;
                *self = restored;
                Ok(Applied {
                    changed,
                    orphaned_files: Vec::new(),
                })
            }
            StoreAction::ReplaceAll {
                mut entities,
                fetched_at,
            } => {
                merge::rebind_images(&mut entities, &self.backend_image_map);
                let changed = entities != self.entities;
                let orphaned_files = dropped_files(&self.entities, &entities);
                self.entities = entities;
                if fetched_at.is_some() {
                    self.last_fetched = fetched_at;
                }
                Ok(Applied {
                    changed: changed || fetched_at.is_some(),
                    orphaned_files,
                })
            }
            StoreAction::Promote {
                id,
                server_id,
                pushed_revision,
                data,
            } => {
                self.position(&id)?;
                if id != server_id {
                    // A fetch that raced the push may already hold the server copy.
                    self.entities
                        .retain(|e| !(e.id == server_id && e.is_synced()));
                }
                let idx = self.position(&id)?;
                let entity = &mut self.entities[idx];
                if id != server_id {
                    entity.local_id = Some(id);
                    entity.id = server_id.clone();
                }
                entity.server_id = Some(server_id);
                if entity.revision == pushed_revision {
                    if let Some(data) = data {
                        entity.data = data;
                    }
                }
                if !entity.state.is_synced() {
                    entity.state = SyncState::EDITED;
                }
                Ok(Applied::changed())
            }
            StoreAction::FinishPromotion {
                id,
                pushed_revision,
            } => {
                let idx = self.position(&id)?;
                let entity = &mut self.entities[idx];
                entity.local_id = None;
                if entity.revision == pushed_revision && !entity.pending_delete {
                    entity.state = SyncState::Synced;
                }
                Ok(Applied::changed())
            }
            StoreAction::BindImages { id, bindings } => {
                for b in &bindings {
                    self.backend_image_map
                        .insert(b.local_ref.clone(), b.server_image_id.clone());
                }
                if let Ok(idx) = self.position(&id) {
                    bind(&mut self.entities[idx].images, &bindings);
                }
                Ok(Applied {
                    changed: !bindings.is_empty(),
                    orphaned_files: Vec::new(),
                })
            }
            StoreAction::HydrateImages { id, attachments } => {
                let idx = self.position(&id)?;
                let entity = &mut self.entities[idx];
                let mut changed = false;
                for incoming in attachments {
                    let existing = entity
                        .images
                        .iter_mut()
                        .find(|a| a.image_id.is_some() && a.image_id == incoming.image_id);
                    match existing {
                        Some(a) if a.local_path.is_none() => {
                            a.local_path = incoming.local_path;
                            changed = true;
                        }
                        Some(_) => {}
                        None => {
                            entity.images.push(incoming);
                            changed = true;
                        }
                    }
                }
                Ok(Applied {
                    changed,
                    orphaned_files: Vec::new(),
                })
            }
            StoreAction::ConfirmDelete { id } => {
                let idx = self.position(&id)?;
                let removed = self.entities.remove(idx);
                Ok(Applied::removed(&removed))
            }
        }
    }
}

/// Record a local mutation.
fn touch<T>(entity: &mut Syncable<T>) {
    entity.revision += 1;
    entity.state = entity.state.demoted();
}

fn bind(images: &mut [Attachment], bindings: &[ImageBinding]) {
    for b in bindings {
        if let Some(a) = images.iter_mut().find(|a| a.local_ref == b.local_ref) {
            a.image_id = Some(b.server_image_id.clone());
            a.state = SyncState::Synced;
        }
    }
}

/// Local files referenced before a replace but not after it.
fn dropped_files<T>(before: &[Syncable<T>], after: &[Syncable<T>]) -> Vec<PathBuf> {
    let kept: Vec<&PathBuf> = after
        .iter()
        .flat_map(|e| e.images.iter().filter_map(|a| a.local_path.as_ref()))
        .collect();
    before
        .iter()
        .flat_map(|e| e.images.iter().filter_map(|a| a.local_path.as_ref()))
        .filter(|p| !kept.contains(p))
        .cloned()
        .collect()
}

/// One store per domain type; each sits behind its own lock.
#[derive(Debug, Default)]
pub struct Stores {
    pub signs: Mutex<EntityStore<Sign>>,
    pub supports: Mutex<EntityStore<Support>>,
    pub collisions: Mutex<EntityStore<Collision>>,
    pub maintenance_jobs: Mutex<EntityStore<MaintenanceJob>>,
    pub traffic_counts: Mutex<EntityStore<TrafficCountWorkOrder>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;

    fn sign(legend: &str) -> Sign {
        Sign {
            mutcd_code: "R1-1".into(),
            legend: Some(legend.into()),
            ..Default::default()
        }
    }

    fn local(id: &str) -> Syncable<Sign> {
        Syncable::new_local(id.into(), sign("STOP"))
    }

    fn synced(id: &str) -> Syncable<Sign> {
        Syncable::from_server(id.into(), sign("STOP"), Vec::new())
    }

    fn attachment(local_ref: &str, path: &str) -> Attachment {
        Attachment::new_local(local_ref.into(), PathBuf::from(path), None)
    }

    #[test]
    fn update_demotes_synced_and_ignores_noop() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(synced("srv-1"))).unwrap();

        let noop = store
            .apply(StoreAction::Update {
                id: "srv-1".into(),
                data: sign("STOP"),
            })
            .unwrap();
        assert!(!noop.changed);
        assert!(store.get("srv-1").unwrap().is_synced());

        let applied = store
            .apply(StoreAction::Update {
                id: "srv-1".into(),
                data: sign("YIELD"),
            })
            .unwrap();
        assert!(applied.changed);
        let e = store.get("srv-1").unwrap();
        assert_eq!(e.sync_status(), SyncStatus::NotSynced);
        assert!(!e.is_new());
        assert_eq!(e.revision, 1);
    }

    #[test]
    fn delete_never_synced_removes_and_reports_files() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(local("local_sign_1_a"))).unwrap();
        store
            .apply(StoreAction::AddImage {
                id: "local_sign_1_a".into(),
                attachment: attachment("ref-1", "/data/a.jpg"),
            })
            .unwrap();

        let applied = store
            .apply(StoreAction::Delete {
                id: "local_sign_1_a".into(),
            })
            .unwrap();
        assert!(store.is_empty());
        assert_eq!(applied.orphaned_files, vec![PathBuf::from("/data/a.jpg")]);
    }

    #[test]
    fn delete_synced_demotes_and_hides() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(synced("srv-1"))).unwrap();
        store
            .apply(StoreAction::Delete { id: "srv-1".into() })
            .unwrap();

        let e = store.get("srv-1").unwrap();
        assert!(e.pending_delete);
        assert!(!e.is_synced());
        assert!(store.visible().is_empty());
        assert_eq!(store.pending().len(), 1);

        let err = store
            .apply(StoreAction::Update {
                id: "srv-1".into(),
                data: sign("X"),
            })
            .unwrap_err();
        assert_eq!(err, StoreError::PendingDelete("srv-1".into()));
    }

    #[test]
    fn promote_then_finish_reaches_synced() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(local("local_sign_1_a"))).unwrap();
        store
            .apply(StoreAction::Promote {
                id: "local_sign_1_a".into(),
                server_id: "srv-42".into(),
                pushed_revision: 0,
                data: None,
            })
            .unwrap();

        let e = store.get("srv-42").unwrap();
        assert_eq!(e.local_id.as_deref(), Some("local_sign_1_a"));
        assert!(!e.is_synced());
        assert!(!e.is_new());

        store
            .apply(StoreAction::FinishPromotion {
                id: "srv-42".into(),
                pushed_revision: 0,
            })
            .unwrap();
        let e = store.get("srv-42").unwrap();
        assert!(e.is_synced());
        assert!(e.local_id.is_none());
        assert_eq!(e.server_id.as_deref(), Some("srv-42"));
    }

    #[test]
    fn promote_keeps_edit_made_during_push() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(local("local_sign_1_a"))).unwrap();
        // edit lands while the create request is in flight
        store
            .apply(StoreAction::Update {
                id: "local_sign_1_a".into(),
                data: sign("YIELD"),
            })
            .unwrap();
        store
            .apply(StoreAction::Promote {
                id: "local_sign_1_a".into(),
                server_id: "srv-7".into(),
                pushed_revision: 0,
                data: Some(sign("STOP")),
            })
            .unwrap();
        store
            .apply(StoreAction::FinishPromotion {
                id: "srv-7".into(),
                pushed_revision: 0,
            })
            .unwrap();

        let e = store.get("srv-7").unwrap();
        assert_eq!(e.data.legend.as_deref(), Some("YIELD"));
        assert_eq!(e.state, SyncState::EDITED);
        assert!(e.local_id.is_none());
    }

    #[test]
    fn promote_drops_raced_server_copy() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(local("local_sign_1_a"))).unwrap();
        store.apply(StoreAction::Insert(synced("srv-42"))).unwrap();
        store
            .apply(StoreAction::Promote {
                id: "local_sign_1_a".into(),
                server_id: "srv-42".into(),
                pushed_revision: 0,
                data: None,
            })
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("srv-42").unwrap().local_id.as_deref(),
            Some("local_sign_1_a")
        );
    }

    #[test]
    fn bind_images_marks_attachment_and_records_map() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(synced("srv-1"))).unwrap();
        store
            .apply(StoreAction::AddImage {
                id: "srv-1".into(),
                attachment: attachment("ref-1", "/data/a.jpg"),
            })
            .unwrap();
        assert!(!store.get("srv-1").unwrap().is_synced());

        store
            .apply(StoreAction::BindImages {
                id: "srv-1".into(),
                bindings: vec![ImageBinding {
                    local_ref: "ref-1".into(),
                    server_image_id: "img-9".into(),
                }],
            })
            .unwrap();
        let img = &store.get("srv-1").unwrap().images[0];
        assert_eq!(img.image_id.as_deref(), Some("img-9"));
        assert!(img.state.is_synced());
        assert_eq!(
            store.backend_image_map().get("ref-1").map(String::as_str),
            Some("img-9")
        );
    }

    #[test]
    fn image_map_drops_bindings_with_their_attachments() {
        let mut store = EntityStore::default();
        for id in ["srv-1", "srv-2"] {
            store.apply(StoreAction::Insert(synced(id))).unwrap();
        }
        for (id, r) in [("srv-1", "ref-1"), ("srv-2", "ref-2")] {
            store
                .apply(StoreAction::AddImage {
                    id: id.into(),
                    attachment: attachment(r, "/data/a.jpg"),
                })
                .unwrap();
            store
                .apply(StoreAction::BindImages {
                    id: id.into(),
                    bindings: vec![ImageBinding {
                        local_ref: r.into(),
                        server_image_id: format!("img-{r}"),
                    }],
                })
                .unwrap();
        }
        // bound to an entity the store no longer has
        store
            .apply(StoreAction::BindImages {
                id: "gone".into(),
                bindings: vec![ImageBinding {
                    local_ref: "ref-x".into(),
                    server_image_id: "img-x".into(),
                }],
            })
            .unwrap();
        assert_eq!(store.backend_image_map().len(), 2);

        store
            .apply(StoreAction::ConfirmDelete { id: "srv-1".into() })
            .unwrap();
        store
            .apply(StoreAction::RemoveImage {
                id: "srv-2".into(),
                local_ref: "ref-2".into(),
            })
            .unwrap();
        assert!(store.backend_image_map().is_empty());
        assert!(store.snapshot().backend_image_map.is_empty());
    }

    #[test]
    fn hydrate_images_skips_known_ids() {
        let mut store = EntityStore::default();
        store
            .apply(StoreAction::Insert(Syncable::from_server(
                "srv-1".into(),
                sign("STOP"),
                vec![Attachment::from_server("img-1".into(), None)],
            )))
            .unwrap();
        let mut downloaded = Attachment::from_server("img-1".into(), None);
        downloaded.local_path = Some(PathBuf::from("/data/img-1.jpg"));
        let fresh = Attachment::from_server("img-2".into(), None);

        let applied = store
            .apply(StoreAction::HydrateImages {
                id: "srv-1".into(),
                attachments: vec![downloaded, fresh],
            })
            .unwrap();
        assert!(applied.changed);
        let e = store.get("srv-1").unwrap();
        assert_eq!(e.images.len(), 2);
        assert_eq!(
            e.images[0].local_path.as_deref(),
            Some(std::path::Path::new("/data/img-1.jpg"))
        );
        assert!(e.is_synced());
    }

    #[test]
    fn snapshot_roundtrip_through_json() {
        let mut store = EntityStore::default();
        store.apply(StoreAction::Insert(local("local_sign_1_a"))).unwrap();
        store.apply(StoreAction::Insert(synced("srv-1"))).unwrap();
        let json = serde_json::to_string(&store.snapshot()).unwrap();
        assert!(json.contains("backendImageMap"));
        let back: StoreSnapshot<Sign> = serde_json::from_str(&json).unwrap();
        assert_eq!(EntityStore::from_snapshot(back), store);
    }
}
