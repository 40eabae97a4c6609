use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::Mutex;

use crate::store::{EntityStore, Stores};

/// Domain types that participate in offline sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sign,
    Support,
    Collision,
    MaintenanceJob,
    TrafficCountWorkOrder,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Sign,
        EntityKind::Support,
        EntityKind::Collision,
        EntityKind::MaintenanceJob,
        EntityKind::TrafficCountWorkOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sign => "sign",
            EntityKind::Support => "support",
            EntityKind::Collision => "collision",
            EntityKind::MaintenanceJob => "maintenance_job",
            EntityKind::TrafficCountWorkOrder => "traffic_count_work_order",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Path segment for the backend API family of this kind.
    pub fn api_path(&self) -> &'static str {
        match self {
            EntityKind::Sign => "signs",
            EntityKind::Support => "supports",
            EntityKind::Collision => "collisions",
            EntityKind::MaintenanceJob => "maintenance-jobs",
            EntityKind::TrafficCountWorkOrder => "traffic-count-work-orders",
        }
    }

    /// Persistence key holding this kind's snapshot.
    pub fn storage_key(&self) -> String {
        format!("entities/{}", self.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_kind(s).ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// Flat status used for filtering and display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Synced,
    NotSynced,
}

/// Single source of truth for an entity's (or attachment's) sync state.
/// `is_synced` and `status` are derived from it and cannot disagree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    NotSynced {
        #[serde(rename = "isNew")]
        is_new: bool,
    },
    Synced,
}

impl SyncState {
    pub const NEW: SyncState = SyncState::NotSynced { is_new: true };
    pub const EDITED: SyncState = SyncState::NotSynced { is_new: false };

    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced)
    }

    pub fn is_new(&self) -> bool {
        matches!(self, SyncState::NotSynced { is_new: true })
    }

    pub fn status(&self) -> SyncStatus {
        match self {
            SyncState::Synced => SyncStatus::Synced,
            SyncState::NotSynced { .. } => SyncStatus::NotSynced,
        }
    }

    /// State after a local edit: synced records become edited, new ones stay new.
    pub fn demoted(&self) -> SyncState {
        match self {
            SyncState::Synced => SyncState::EDITED,
            other => *other,
        }
    }
}

/// Image attached to an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Client-side reference used to correlate upload results.
    pub local_ref: String,
    /// Server-assigned id once uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub state: SyncState,
}

impl Attachment {
    pub fn new_local(local_ref: String, local_path: PathBuf, file_name: Option<String>) -> Self {
        Self {
            local_ref,
            image_id: None,
            local_path: Some(local_path),
            file_name,
            state: SyncState::NEW,
        }
    }

    pub fn from_server(image_id: String, file_name: Option<String>) -> Self {
        Self {
            local_ref: image_id.clone(),
            image_id: Some(image_id),
            local_path: None,
            file_name,
            state: SyncState::Synced,
        }
    }

    pub fn is_pending_upload(&self) -> bool {
        self.state.is_new()
    }
}

/// Concrete domain record carried inside a [`Syncable`] envelope.
pub trait Record:
    Serialize + DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// The store slot holding records of this type.
    fn slot(stores: &Stores) -> &Mutex<EntityStore<Self>>;

    fn into_any(entity: Syncable<Self>) -> AnyEntity;
}

/// Sync envelope shared by every domain type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Syncable<T> {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub state: SyncState,
    /// Previously-synced entity deleted locally; removed once the remote delete succeeds.
    #[serde(default)]
    pub pending_delete: bool,
    /// Bumped on every local mutation.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub images: Vec<Attachment>,
    pub data: T,
}

impl<T: Record> Syncable<T> {
    pub fn new_local(id: String, data: T) -> Self {
        Self {
            id,
            local_id: None,
            server_id: None,
            state: SyncState::NEW,
            pending_delete: false,
            revision: 0,
            images: Vec::new(),
            data,
        }
    }

    pub fn from_server(id: String, data: T, images: Vec<Attachment>) -> Self {
        Self {
            server_id: Some(id.clone()),
            id,
            local_id: None,
            state: SyncState::Synced,
            pending_delete: false,
            revision: 0,
            images,
            data,
        }
    }

    /// Build a synced entity from a server JSON object (`id` plus camelCase domain fields).
    pub fn from_server_json(value: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err(format!("{} payload is not an object", T::KIND));
        };
        let id = obj
            .remove("id")
            .and_then(|v| id_string(&v))
            .ok_or_else(|| format!("{} payload has no id", T::KIND))?;
        let images = obj
            .remove("images")
            .map(parse_server_images)
            .unwrap_or_default();
        let data: T = serde_json::from_value(Value::Object(obj))
            .map_err(|e| format!("invalid {} payload {}: {}", T::KIND, id, e))?;
        Ok(Self::from_server(id, data, images))
    }

    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    pub fn is_new(&self) -> bool {
        self.state.is_new()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.state.status()
    }

    pub fn has_pending_images(&self) -> bool {
        self.images.iter().any(Attachment::is_pending_upload)
    }

    /// Needs a sync pass: unsynced record or attachments awaiting upload.
    pub fn is_pending(&self) -> bool {
        !self.state.is_synced() || self.has_pending_images()
    }

    /// Shown in collections (pending deletes are hidden).
    pub fn is_visible(&self) -> bool {
        !self.pending_delete
    }

    /// Domain fields as a wire object, without envelope fields.
    pub fn data_json(&self) -> Result<Map<String, Value>, String> {
        match serde_json::to_value(&self.data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(format!("{} data is not an object", T::KIND)),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Normalise a JSON id (string or number) to a string.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_server_images(value: Value) -> Vec<Attachment> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let image_id = item
                .get("imageId")
                .or_else(|| item.get("id"))
                .and_then(id_string)?;
            let file_name = item
                .get("fileName")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(Attachment::from_server(image_id, file_name))
        })
        .collect()
}

/// Tagged union over every synchronizable entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum AnyEntity {
    Sign(Syncable<Sign>),
    Support(Syncable<Support>),
    Collision(Syncable<Collision>),
    MaintenanceJob(Syncable<MaintenanceJob>),
    TrafficCountWorkOrder(Syncable<TrafficCountWorkOrder>),
}

impl AnyEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            AnyEntity::Sign(_) => EntityKind::Sign,
            AnyEntity::Support(_) => EntityKind::Support,
            AnyEntity::Collision(_) => EntityKind::Collision,
            AnyEntity::MaintenanceJob(_) => EntityKind::MaintenanceJob,
            AnyEntity::TrafficCountWorkOrder(_) => EntityKind::TrafficCountWorkOrder,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            AnyEntity::Sign(e) => &e.id,
            AnyEntity::Support(e) => &e.id,
            AnyEntity::Collision(e) => &e.id,
            AnyEntity::MaintenanceJob(e) => &e.id,
            AnyEntity::TrafficCountWorkOrder(e) => &e.id,
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        match self {
            AnyEntity::Sign(e) => e.sync_status(),
            AnyEntity::Support(e) => e.sync_status(),
            AnyEntity::Collision(e) => e.sync_status(),
            AnyEntity::MaintenanceJob(e) => e.sync_status(),
            AnyEntity::TrafficCountWorkOrder(e) => e.sync_status(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Sign {
    pub support_id: Option<String>,
    pub mutcd_code: String,
    pub legend: Option<String>,
    pub condition: Option<String>,
    pub facing: Option<String>,
    pub location: Option<GeoPoint>,
    pub installed_on: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Support {
    pub support_type: Option<String>,
    pub material: Option<String>,
    pub condition: Option<String>,
    pub location: Option<GeoPoint>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Collision {
    pub report_number: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub severity: Option<String>,
    pub vehicles_involved: u32,
    pub location: Option<GeoPoint>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MaintenanceJob {
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub asset_ids: Vec<String>,
    pub assigned_to: Option<String>,
    pub scheduled_for: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TrafficCountWorkOrder {
    pub counter_type: Option<String>,
    pub direction: Option<String>,
    pub status: Option<String>,
    pub location: Option<GeoPoint>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

macro_rules! record {
    ($ty:ident, $kind:ident, $slot:ident) => {
        impl Record for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn slot(stores: &Stores) -> &Mutex<EntityStore<Self>> {
                &stores.$slot
            }

            fn into_any(entity: Syncable<Self>) -> AnyEntity {
                AnyEntity::$kind(entity)
            }
        }
    };
}

/// Run `$body` with `$T` aliased to the record type for `$kind`.
macro_rules! with_record {
    ($kind:expr, $T:ident => $body:expr) => {
        match $kind {
            $crate::model::EntityKind::Sign => {
                type $T = $crate::model::Sign;
                $body
            }
            $crate::model::EntityKind::Support => {
                type $T = $crate::model::Support;
                $body
            }
            $crate::model::EntityKind::Collision => {
                type $T = $crate::model::Collision;
                $body
            }
            $crate::model::EntityKind::MaintenanceJob => {
                type $T = $crate::model::MaintenanceJob;
                $body
            }
            $crate::model::EntityKind::TrafficCountWorkOrder => {
                type $T = $crate::model::TrafficCountWorkOrder;
                $body
            }
        }
    };
}
pub(crate) use with_record;

record!(Sign, Sign, signs);
record!(Support, Support, supports);
record!(Collision, Collision, collisions);
record!(MaintenanceJob, MaintenanceJob, maintenance_jobs);
record!(TrafficCountWorkOrder, TrafficCountWorkOrder, traffic_counts);
