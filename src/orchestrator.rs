//! Pushes pending local work to the backend.
//!
//! A pass snapshots the pending entities of one kind and pushes them one at a
//! time. No store lock is held across a network call; every result goes back
//! through the repository so concurrent local edits are never overwritten.
//! One entity's failure never stops the rest of the pass.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::auth::TokenStore;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{ImageUpload, RemoteGateway};
use crate::ids::is_temporary_id;
use crate::model::{with_record, EntityKind, Record, Syncable};
use crate::repository::Repository;
use crate::store::StoreAction;

/// Who asked for the pass. Manual passes surface the first rejection message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Manual,
    Background,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Ids (after promotion) of entities pushed successfully.
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Server ids confirmed deleted.
    pub deleted: Vec<String>,
    pub images_uploaded: usize,
    pub images_failed: usize,
    /// First server rejection message, manual passes only.
    pub notice: Option<String>,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        format!(
            "Synced {}, failed {}",
            self.succeeded.len() + self.deleted.len(),
            self.failed.len()
        )
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.images_failed == 0
    }

    fn absorb(&mut self, other: SyncReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.deleted.extend(other.deleted);
        self.images_uploaded += other.images_uploaded;
        self.images_failed += other.images_failed;
        if self.notice.is_none() {
            self.notice = other.notice;
        }
    }

    fn note(&mut self, mode: SyncMode, err: &EngineError) {
        if mode != SyncMode::Manual || self.notice.is_some() {
            return;
        }
        if let EngineError::Gateway(gw) = err {
            self.notice = gw.user_message();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass over the same scope is running; nothing was done.
    AlreadySyncing,
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::AlreadySyncing => None,
            SyncOutcome::Completed(report) => Some(report),
        }
    }
}

/// Something a connectivity change can kick.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    fn is_syncing(&self) -> bool;

    /// Start a background pass over every kind. Errors are logged.
    async fn trigger_sync(&self);
}

/// Holds an in-flight flag; clears it on drop.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Pushed {
    Saved { id: String, images: ImageTally },
    Deleted { id: String },
    /// Only attachments were pending and some could not be uploaded.
    Incomplete { images: ImageTally },
    /// Deleted locally while the create was in flight.
    Discarded,
}

#[derive(Default)]
struct ImageTally {
    uploaded: usize,
    failed: usize,
}

pub struct SyncOrchestrator {
    repo: Arc<Repository>,
    gateway: Arc<dyn RemoteGateway>,
    tokens: Arc<TokenStore>,
    all_in_flight: AtomicBool,
    kind_in_flight: [AtomicBool; EntityKind::ALL.len()],
}

impl SyncOrchestrator {
    pub fn new(
        repo: Arc<Repository>,
        gateway: Arc<dyn RemoteGateway>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            repo,
            gateway,
            tokens,
            all_in_flight: AtomicBool::new(false),
            kind_in_flight: Default::default(),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.all_in_flight.load(Ordering::Acquire)
            || self
                .kind_in_flight
                .iter()
                .any(|flag| flag.load(Ordering::Acquire))
    }

    pub fn is_syncing_kind(&self, kind: EntityKind) -> bool {
        self.kind_flag(kind).load(Ordering::Acquire)
    }

    fn kind_flag(&self, kind: EntityKind) -> &AtomicBool {
        &self.kind_in_flight[kind as usize]
    }

    async fn require_auth(&self) -> EngineResult<()> {
        if self.tokens.bearer().await.is_none() {
            return Err(EngineError::NotAuthenticated);
        }
        Ok(())
    }

    /// Push pending entities of one kind. Returns immediately if that kind is already syncing.
    #[instrument(skip(self))]
    pub async fn sync_pending(&self, kind: EntityKind, mode: SyncMode) -> EngineResult<SyncOutcome> {
        let Some(_guard) = PassGuard::acquire(self.kind_flag(kind)) else {
            debug!("pass already running");
            return Ok(SyncOutcome::AlreadySyncing);
        };
        self.require_auth().await?;
        let report = with_record!(kind, T => self.push_pending::<T>(mode).await);
        Ok(SyncOutcome::Completed(report))
    }

    /// Push every kind concurrently. Kinds with a pass already running are skipped.
    #[instrument(skip(self))]
    pub async fn sync_all(&self, mode: SyncMode) -> EngineResult<SyncOutcome> {
        let Some(_guard) = PassGuard::acquire(&self.all_in_flight) else {
            debug!("full sync already running");
            return Ok(SyncOutcome::AlreadySyncing);
        };
        self.require_auth().await?;

        let passes = EntityKind::ALL.map(|kind| self.pass_if_idle(kind, mode));
        let mut report = SyncReport::default();
        for kind_report in join_all(passes).await.into_iter().flatten() {
            report.absorb(kind_report);
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            deleted = report.deleted.len(),
            "sync pass finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn pass_if_idle(&self, kind: EntityKind, mode: SyncMode) -> Option<SyncReport> {
        let Some(_guard) = PassGuard::acquire(self.kind_flag(kind)) else {
            debug!(%kind, "skipping kind with a pass in flight");
            return None;
        };
        Some(with_record!(kind, T => self.push_pending::<T>(mode).await))
    }

    async fn push_pending<T: Record>(&self, mode: SyncMode) -> SyncReport {
        let pending = T::slot(self.repo.stores()).lock().await.pending();
        let mut report = SyncReport::default();
        if pending.is_empty() {
            return report;
        }
        debug!(kind=%T::KIND, count = pending.len(), "pushing pending entities");

        for entity in pending {
            match self.push_entity(&entity).await {
                Ok(Pushed::Saved { id, images }) => {
                    report.images_uploaded += images.uploaded;
                    report.images_failed += images.failed;
                    report.succeeded.push(id);
                }
                Ok(Pushed::Deleted { id }) => report.deleted.push(id),
                Ok(Pushed::Incomplete { images }) => {
                    warn!(kind=%T::KIND, id=%entity.id, failed = images.failed, "attachments left pending");
                    report.images_uploaded += images.uploaded;
                    report.images_failed += images.failed;
                    report.failed.push(entity.id.clone());
                }
                Ok(Pushed::Discarded) => {}
                Err(err) => {
                    let retry = match &err {
                        EngineError::Gateway(gw) => Some(gw.retry_class()),
                        _ => None,
                    };
                    warn!(?err, ?retry, kind=%T::KIND, id=%entity.id, "push failed; leaving pending");
                    report.note(mode, &err);
                    report.failed.push(entity.id.clone());
                }
            }
        }
        report
    }

    async fn push_entity<T: Record>(&self, entity: &Syncable<T>) -> EngineResult<Pushed> {
        let kind = T::KIND;
        let revision = entity.revision;

        if entity.pending_delete {
            let remote_id = remote_id(entity);
            match self.gateway.delete(kind, &remote_id).await {
                Ok(()) => {}
                Err(err) if err.status_code() == Some(404) => {
                    debug!(%kind, id=%remote_id, "already gone on the server");
                }
                Err(err) => return Err(err.into()),
            }
            self.repo
                .dispatch(StoreAction::<T>::ConfirmDelete {
                    id: entity.id.clone(),
                })
                .await?;
            info!(%kind, id=%remote_id, "remote delete confirmed");
            return Ok(Pushed::Deleted { id: remote_id });
        }

        let mut id = entity.id.clone();
        if !entity.is_synced() {
            let body = wire_body(entity)?;
            let creating =
                entity.is_new() || (entity.server_id.is_none() && is_temporary_id(&entity.id));
            let (server_id, fields) = if creating {
                let created = self.gateway.create(kind, &body).await?;
                (created.server_id, created.fields)
            } else {
                let remote_id = remote_id(entity);
                let fields = self.gateway.update(kind, &remote_id, &body).await?;
                (remote_id, fields)
            };
            let promoted = self
                .repo
                .dispatch(StoreAction::<T>::Promote {
                    id: id.clone(),
                    server_id: server_id.clone(),
                    pushed_revision: revision,
                    data: echoed_data(&entity.data, fields),
                })
                .await;
            match promoted {
                Ok(_) => {}
                Err(EngineError::NotFound { .. }) if creating => {
                    self.discard_orphan(kind, &server_id).await;
                    return Ok(Pushed::Discarded);
                }
                Err(err) => return Err(err),
            }
            info!(%kind, local_id=%id, %server_id, "entity pushed");
            id = server_id;
        }

        let images = if entity.has_pending_images() {
            match self.upload_images(entity, &id).await {
                Ok(tally) => tally,
                // Record already saved: the attachments stay pending for the next pass.
                Err(err) if !entity.is_synced() => {
                    warn!(?err, %kind, %id, "image upload failed");
                    ImageTally {
                        uploaded: 0,
                        failed: entity.images.iter().filter(|a| a.is_pending_upload()).count(),
                    }
                }
                Err(err) => return Err(err),
            }
        } else {
            ImageTally::default()
        };

        self.repo
            .dispatch(StoreAction::<T>::FinishPromotion {
                id: id.clone(),
                pushed_revision: revision,
            })
            .await?;
        if entity.is_synced() && images.failed > 0 {
            return Ok(Pushed::Incomplete { images });
        }
        Ok(Pushed::Saved { id, images })
    }

    async fn upload_images<T: Record>(
        &self,
        entity: &Syncable<T>,
        id: &str,
    ) -> EngineResult<ImageTally> {
        let (uploads, missing) = pending_images(entity).await;
        if uploads.is_empty() {
            return Ok(ImageTally {
                uploaded: 0,
                failed: missing,
            });
        }
        let bindings = self.gateway.add_images(T::KIND, id, &uploads).await?;
        let uploaded = uploads
            .iter()
            .filter(|u| bindings.iter().any(|b| b.local_ref == u.local_ref))
            .count();
        self.repo
            .dispatch(StoreAction::<T>::BindImages {
                id: id.to_string(),
                bindings,
            })
            .await?;
        debug!(kind=%T::KIND, %id, uploaded, missing, "images uploaded");
        Ok(ImageTally {
            uploaded,
            failed: uploads.len() - uploaded + missing,
        })
    }

    /// The server holds a record the user already deleted; remove it there too.
    async fn discard_orphan(&self, kind: EntityKind, server_id: &str) {
        info!(%kind, %server_id, "entity deleted during create; removing remote copy");
        if let Err(err) = self.gateway.delete(kind, server_id).await {
            warn!(?err, %kind, %server_id, "failed to remove orphaned remote copy");
        }
    }
}

#[async_trait]
impl SyncTrigger for SyncOrchestrator {
    fn is_syncing(&self) -> bool {
        SyncOrchestrator::is_syncing(self)
    }

    async fn trigger_sync(&self) {
        match self.sync_all(SyncMode::Background).await {
            Ok(SyncOutcome::Completed(report)) if !report.is_clean() => {
                warn!(summary = %report.summary(), "background sync left work pending");
            }
            Ok(_) => {}
            Err(EngineError::NotAuthenticated) => debug!("background sync skipped: not signed in"),
            Err(err) => warn!(?err, "background sync failed"),
        }
    }
}

fn remote_id<T>(entity: &Syncable<T>) -> String {
    entity.server_id.clone().unwrap_or_else(|| entity.id.clone())
}

/// Request body: domain fields plus `localId` on create or `id` on update.
fn wire_body<T: Record>(entity: &Syncable<T>) -> EngineResult<Value> {
    let mut body = entity.data_json().map_err(|message| EngineError::InvalidUpdate {
        kind: T::KIND,
        message,
    })?;
    if entity.is_new() || entity.server_id.is_none() {
        body.insert("localId".into(), Value::String(entity.id.clone()));
    } else {
        body.insert("id".into(), Value::String(remote_id(entity)));
    }
    Ok(Value::Object(body))
}

/// Overlay server-echoed fields onto the pushed data. None if there is nothing usable.
fn echoed_data<T: Record>(pushed: &T, fields: Map<String, Value>) -> Option<T> {
    if fields.is_empty() {
        return None;
    }
    let Ok(Value::Object(mut merged)) = serde_json::to_value(pushed) else {
        return None;
    };
    merged.extend(fields);
    match serde_json::from_value(Value::Object(merged)) {
        Ok(data) => Some(data),
        Err(err) => {
            debug!(?err, kind=%T::KIND, "ignoring unparseable server echo");
            None
        }
    }
}

/// Attachments awaiting upload that still have a file on disk, and how many do not.
async fn pending_images<T>(entity: &Syncable<T>) -> (Vec<ImageUpload>, usize) {
    let mut uploads = Vec::new();
    let mut missing = 0;
    for a in entity.images.iter().filter(|a| a.is_pending_upload()) {
        let Some(path) = a.local_path.clone() else {
            missing += 1;
            continue;
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(local_ref=%a.local_ref, path=%path.display(), "attachment file missing; cannot upload");
            missing += 1;
            continue;
        }
        let file_name = a
            .file_name
            .clone()
            .or_else(|| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .unwrap_or_else(|| a.local_ref.clone());
        uploads.push(ImageUpload {
            local_ref: a.local_ref.clone(),
            path,
            file_name,
        });
    }
    (uploads, missing)
}
