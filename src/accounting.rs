//! Pending-work counts derived on demand from the entity stores.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::AddAssign;

use crate::model::{with_record, EntityKind, Record, Syncable};
use crate::store::Stores;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub images: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes + self.images
    }

    /// Whether a manual sync has anything to do.
    pub fn has_pending(&self) -> bool {
        self.total() > 0
    }
}

impl AddAssign for PendingCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.creates += rhs.creates;
        self.updates += rhs.updates;
        self.deletes += rhs.deletes;
        self.images += rhs.images;
    }
}

/// Count pending work in one collection. Pending deletes are counted as deletes, not updates.
pub fn count_entities<T>(entities: &[Syncable<T>]) -> PendingCounts {
    let mut counts = PendingCounts::default();
    for e in entities {
        if e.pending_delete {
            counts.deletes += 1;
        } else if e.state.is_new() {
            counts.creates += 1;
        } else if !e.state.is_synced() {
            counts.updates += 1;
        }
        counts.images += e
            .images
            .iter()
            .filter(|a| a.is_pending_upload())
            .count();
    }
    counts
}

async fn count_kind<T: Record>(stores: &Stores) -> PendingCounts {
    let store = T::slot(stores).lock().await;
    count_entities(store.entities())
}

pub async fn pending_counts_for(stores: &Stores, kind: EntityKind) -> PendingCounts {
    with_record!(kind, T => count_kind::<T>(stores).await)
}

pub async fn pending_counts_by_kind(stores: &Stores) -> BTreeMap<EntityKind, PendingCounts> {
    let mut out = BTreeMap::new();
    for kind in EntityKind::ALL {
        out.insert(kind, pending_counts_for(stores, kind).await);
    }
    out
}

/// Totals across every store.
pub async fn pending_counts(stores: &Stores) -> PendingCounts {
    let mut total = PendingCounts::default();
    for counts in pending_counts_by_kind(stores).await.into_values() {
        total += counts;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, Collision, Sign, SyncState};
    use crate::store::StoreAction;
    use std::path::PathBuf;

    fn with_image(mut e: Syncable<Sign>, state: SyncState) -> Syncable<Sign> {
        let mut a = Attachment::new_local("r".into(), PathBuf::from("/x.jpg"), None);
        a.state = state;
        e.images.push(a);
        e
    }

    #[test]
    fn counts_each_category() {
        let created = with_image(
            Syncable::new_local("local_sign_1_a".into(), Sign::default()),
            SyncState::NEW,
        );
        let mut edited = Syncable::from_server("srv-1".into(), Sign::default(), Vec::new());
        edited.state = SyncState::EDITED;
        let mut deleted = Syncable::from_server("srv-2".into(), Sign::default(), Vec::new());
        deleted.state = SyncState::EDITED;
        deleted.pending_delete = true;
        let synced = with_image(
            Syncable::from_server("srv-3".into(), Sign::default(), Vec::new()),
            SyncState::Synced,
        );

        let counts = count_entities(&[created, edited, deleted, synced]);
        assert_eq!(
            counts,
            PendingCounts {
                creates: 1,
                updates: 1,
                deletes: 1,
                images: 1,
            }
        );
        assert_eq!(counts.total(), 4);
    }

    #[tokio::test]
    async fn totals_span_all_stores() {
        let stores = Stores::default();
        stores
            .signs
            .lock()
            .await
            .apply(StoreAction::Insert(Syncable::new_local(
                "local_sign_1_a".into(),
                Sign::default(),
            )))
            .unwrap();
        stores
            .collisions
            .lock()
            .await
            .apply(StoreAction::Insert(Syncable::new_local(
                "local_collision_1_a".into(),
                Collision::default(),
            )))
            .unwrap();

        let totals = pending_counts(&stores).await;
        assert_eq!(totals.creates, 2);
        assert!(totals.has_pending());
        let by_kind = pending_counts_by_kind(&stores).await;
        assert_eq!(by_kind[&EntityKind::Support], PendingCounts::default());
    }
}
