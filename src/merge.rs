//! Reconciliation of a freshly fetched server collection with local state.
//!
//! Local entities that still need a sync pass always win over the server copy,
//! so a fetch never discards offline work. Everything else takes the server
//! version. Output order is server order followed by local-only entities in
//! their local order.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{Record, SyncState, Syncable};

/// Merge `server` into `local`, preserving every pending local entity.
pub fn merge<T: Record>(server: Vec<Syncable<T>>, local: &[Syncable<T>]) -> Vec<Syncable<T>> {
    let (pending, settled): (Vec<&Syncable<T>>, Vec<&Syncable<T>>) =
        local.iter().partition(|e| e.is_pending());
    let pending_by_id: HashMap<&str, &Syncable<T>> =
        pending.iter().map(|e| (e.id.as_str(), *e)).collect();
    let settled_by_id: HashMap<&str, &Syncable<T>> =
        settled.iter().map(|e| (e.id.as_str(), *e)).collect();

    let mut seen: HashSet<String> = HashSet::with_capacity(server.len());
    let mut out = Vec::with_capacity(server.len() + pending.len());

    for mut incoming in server {
        if !seen.insert(incoming.id.clone()) {
            continue;
        }
        if let Some(local) = pending_by_id.get(incoming.id.as_str()) {
            out.push((*local).clone());
            continue;
        }
        if let Some(local) = settled_by_id.get(incoming.id.as_str()) {
            carry_local_files(&mut incoming, local);
        }
        out.push(incoming);
    }

    // Pending creations (and pending edits the server did not return) stay.
    out.extend(
        pending
            .into_iter()
            .filter(|e| !seen.contains(&e.id))
            .cloned(),
    );
    out
}

/// Keep device file paths for attachments the server still lists.
fn carry_local_files<T>(incoming: &mut Syncable<T>, local: &Syncable<T>) {
    for att in incoming.images.iter_mut().filter(|a| a.local_path.is_none()) {
        if let Some(path) = local
            .images
            .iter()
            .find(|l| l.image_id.is_some() && l.image_id == att.image_id)
            .and_then(|l| l.local_path.clone())
        {
            att.local_path = Some(path);
        }
    }
}

/// Apply known `local_ref -> server_image_id` bindings to attachments still
/// marked pending. Returns true if anything changed.
pub fn rebind_images<T>(entities: &mut [Syncable<T>], map: &BTreeMap<String, String>) -> bool {
    if map.is_empty() {
        return false;
    }
    let mut changed = false;
    for att in entities
        .iter_mut()
        .flat_map(|e| e.images.iter_mut())
        .filter(|a| !a.state.is_synced())
    {
        if let Some(server_id) = map.get(&att.local_ref) {
            att.image_id = Some(server_id.clone());
            att.state = SyncState::Synced;
            changed = true;
        }
    }
    changed
}
