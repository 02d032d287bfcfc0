//! Conflict-aware sync engine
//!
//! A batch of client mutations is applied in submission order inside a single
//! transaction. Every operation either counts as processed or produces exactly
//! one [`SyncConflict`]; a rejected operation never stops the ones after it.
//! Only a failing transaction (or feed query) aborts the batch, and then nothing
//! from it is kept.
//!
//! Entity types plug in through [`SyncEntity`]: a typed patch with a field
//! allowlist plus the row operations the engine needs.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::db::{self, Database};
use crate::models::{FrequencyType, Habit, Task, TaskStatus, ValidationError, day_start};

type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

/// One client-submitted mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub action: SyncAction,
    pub entity_type: String,
    /// Required for UPDATE and DELETE; optional client-chosen id for CREATE
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub data: Payload,
    /// When the client made the change
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Request to sync changes with server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub operations: Vec<SyncOperation>,
    /// Timestamp of last successful sync (None = no server changes returned)
    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    VersionConflict,
    NotFound,
    PermissionDenied,
    ValidationError,
    UnsupportedEntity,
    MissingId,
    CreationError,
    UpdateError,
    DeleteError,
}

/// Why operation `operation_index` of a batch was not applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub operation_index: usize,
    pub conflict_type: ConflictKind,
    /// Current server state, present for version conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<Value>,
    pub message: String,
}

/// A server-side record the client should upsert by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerChange {
    pub entity_type: String,
    /// Always UPDATE, even for records created since the last sync
    pub action: SyncAction,
    pub entity_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Response from sync server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub processed_operations: usize,
    pub conflicts: Vec<SyncConflict>,
    pub server_changes: Vec<ServerChange>,
    pub new_sync_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Apply the client's data
    Client,
    /// Keep the server's state untouched
    Server,
    /// Apply an explicitly merged payload
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub entity_type: String,
    pub entity_id: String,
    pub resolution: Resolution,
    #[serde(default, alias = "client_data", alias = "merged_data")]
    pub data: Option<Payload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub user_id: String,
    pub data_counts: BTreeMap<String, u64>,
    pub last_modified: BTreeMap<String, Option<DateTime<Utc>>>,
    pub server_timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("could not serialize entity: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("entity type '{0}' not supported")]
    UnsupportedEntity(String),
    #[error("{entity_type} {entity_id} not found")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// Entity handlers
// ---------------------------------------------------------------------------

/// A record type the engine can create, patch, delete and feed back
pub trait SyncEntity: Serialize + Sized {
    const ENTITY_TYPE: &'static str;

    type Patch;

    fn parse_patch(data: &Payload) -> Result<Self::Patch, ValidationError>;

    /// Build a new record from a CREATE payload, filling defaults
    fn create(
        id: String,
        owner: &str,
        patch: Self::Patch,
        at: DateTime<Utc>,
    ) -> Result<Self, ValidationError>;

    /// Apply the fields present in `patch` and stamp `at` as the modification time
    fn apply(&mut self, patch: Self::Patch, at: DateTime<Utc>);

    fn id(&self) -> &str;
    fn owner(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;

    fn load(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>>;
    fn insert(&self, conn: &Connection) -> rusqlite::Result<()>;
    fn save(&self, conn: &Connection) -> rusqlite::Result<()>;
    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<usize>;
    fn modified_since(
        conn: &Connection,
        owner: &str,
        since: &DateTime<Utc>,
    ) -> rusqlite::Result<Vec<Self>>;
    fn stats(conn: &Connection, owner: &str) -> rusqlite::Result<(u64, Option<DateTime<Utc>>)>;
}

/// Fields clients may echo back from a snapshot; accepted and ignored
const READ_ONLY_FIELDS: &[&str] = &[
    "id",
    "user_id",
    "created_at",
    "updated_at",
    "completed_at",
    "current_streak",
    "longest_streak",
    "total_completions",
];

fn check_fields(data: &Payload, allowed: &[&str]) -> Result<(), ValidationError> {
    match data
        .keys()
        .find(|k| !allowed.contains(&k.as_str()) && !READ_ONLY_FIELDS.contains(&k.as_str()))
    {
        Some(unknown) => Err(ValidationError::new(unknown.as_str(), "unknown field")),
        None => Ok(()),
    }
}

/// Absent -> `None`; present -> decoded value
fn field<T: DeserializeOwned>(data: &Payload, name: &str) -> Result<Option<T>, ValidationError> {
    data.get(name)
        .map(|v| {
            serde_json::from_value(v.clone()).map_err(|e| ValidationError::new(name, e.to_string()))
        })
        .transpose()
}

/// Absent -> `None`; `null` -> `Some(None)` (clear); value -> `Some(Some(v))`
fn nullable_field<T: DeserializeOwned>(
    data: &Payload,
    name: &str,
) -> Result<Option<Option<T>>, ValidationError> {
    match data.get(name) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(v) => serde_json::from_value(v.clone())
            .map(|x| Some(Some(x)))
            .map_err(|e| ValidationError::new(name, e.to_string())),
    }
}

/// Due dates arrive either as RFC 3339 timestamps or as plain `YYYY-MM-DD`
fn due_date_field(data: &Payload) -> Result<Option<Option<DateTime<Utc>>>, ValidationError> {
    let Some(raw) = nullable_field::<String>(data, "due_date")? else {
        return Ok(None);
    };
    let Some(raw) = raw else {
        return Ok(Some(None));
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(Some(ts.with_timezone(&Utc))));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map(|d| Some(Some(day_start(d))))
        .map_err(|_| ValidationError::new("due_date", format!("'{raw}' is not a date")))
}

#[derive(Debug, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub priority: Option<u8>,
    pub status: Option<TaskStatus>,
    pub estimated_duration: Option<Option<u32>>,
    pub completion_percentage: Option<f64>,
}

const TASK_FIELDS: &[&str] = &[
    "title",
    "description",
    "due_date",
    "priority",
    "status",
    "estimated_duration",
    "completion_percentage",
];

impl SyncEntity for Task {
    const ENTITY_TYPE: &'static str = "task";

    type Patch = TaskPatch;

    fn parse_patch(data: &Payload) -> Result<TaskPatch, ValidationError> {
        check_fields(data, TASK_FIELDS)?;

        let patch = TaskPatch {
            title: field(data, "title")?,
            description: nullable_field(data, "description")?,
            due_date: due_date_field(data)?,
            priority: field(data, "priority")?,
            status: field(data, "status")?,
            estimated_duration: nullable_field(data, "estimated_duration")?,
            completion_percentage: field(data, "completion_percentage")?,
        };

        if let Some(title) = &patch.title
            && title.trim().is_empty()
        {
            return Err(ValidationError::new("title", "must not be empty"));
        }
        if let Some(p) = patch.priority
            && !(1..=5).contains(&p)
        {
            return Err(ValidationError::new("priority", format!("{p} is outside 1-5")));
        }
        if let Some(pct) = patch.completion_percentage
            && !(0.0..=100.0).contains(&pct)
        {
            return Err(ValidationError::new(
                "completion_percentage",
                format!("{pct} is outside 0-100"),
            ));
        }

        Ok(patch)
    }

    fn create(
        id: String,
        owner: &str,
        patch: TaskPatch,
        at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let title = patch
            .title
            .clone()
            .ok_or_else(|| ValidationError::new("title", "required"))?;

        let mut task = Task::new(owner, title, at);
        task.id = id;
        task.apply(patch, at);
        Ok(task)
    }

    fn apply(&mut self, patch: TaskPatch, at: DateTime<Utc>) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(estimated) = patch.estimated_duration {
            self.estimated_duration = estimated;
        }
        if let Some(pct) = patch.completion_percentage {
            self.completion_percentage = pct;
        }
        self.updated_at = at;
        self.normalize_completion(at);
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn load(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>> {
        db::get_task(conn, id)
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        db::insert_task(conn, self)
    }

    fn save(&self, conn: &Connection) -> rusqlite::Result<()> {
        db::update_task(conn, self)
    }

    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
        db::delete_task(conn, id)
    }

    fn modified_since(
        conn: &Connection,
        owner: &str,
        since: &DateTime<Utc>,
    ) -> rusqlite::Result<Vec<Self>> {
        db::tasks_modified_since(conn, owner, since)
    }

    fn stats(conn: &Connection, owner: &str) -> rusqlite::Result<(u64, Option<DateTime<Utc>>)> {
        db::task_stats(conn, owner)
    }
}

#[derive(Debug, Default)]
pub struct HabitPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub frequency_type: Option<FrequencyType>,
    pub frequency_value: Option<u32>,
    pub is_active: Option<bool>,
}

const HABIT_FIELDS: &[&str] = &[
    "name",
    "description",
    "category",
    "frequency_type",
    "frequency_value",
    "is_active",
];

impl SyncEntity for Habit {
    const ENTITY_TYPE: &'static str = "habit";

    type Patch = HabitPatch;

    fn parse_patch(data: &Payload) -> Result<HabitPatch, ValidationError> {
        check_fields(data, HABIT_FIELDS)?;

        let patch = HabitPatch {
            name: field(data, "name")?,
            description: nullable_field(data, "description")?,
            category: nullable_field(data, "category")?,
            frequency_type: field(data, "frequency_type")?,
            frequency_value: field(data, "frequency_value")?,
            is_active: field(data, "is_active")?,
        };

        if let Some(name) = &patch.name
            && name.trim().is_empty()
        {
            return Err(ValidationError::new("name", "must not be empty"));
        }
        if patch.frequency_value == Some(0) {
            return Err(ValidationError::new("frequency_value", "must be at least 1"));
        }

        Ok(patch)
    }

    fn create(
        id: String,
        owner: &str,
        patch: HabitPatch,
        at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let name = patch
            .name
            .clone()
            .ok_or_else(|| ValidationError::new("name", "required"))?;

        let mut habit = Habit::new(owner, name, at);
        habit.id = id;
        habit.apply(patch, at);
        Ok(habit)
    }

    fn apply(&mut self, patch: HabitPatch, at: DateTime<Utc>) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(frequency_type) = patch.frequency_type {
            self.frequency_type = frequency_type;
        }
        if let Some(value) = patch.frequency_value {
            self.frequency_value = value;
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = at;
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn load(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>> {
        db::get_habit(conn, id)
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        db::insert_habit(conn, self)
    }

    fn save(&self, conn: &Connection) -> rusqlite::Result<()> {
        db::update_habit(conn, self)
    }

    fn remove(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
        db::delete_habit(conn, id)
    }

    fn modified_since(
        conn: &Connection,
        owner: &str,
        since: &DateTime<Utc>,
    ) -> rusqlite::Result<Vec<Self>> {
        db::habits_modified_since(conn, owner, since)
    }

    fn stats(conn: &Connection, owner: &str) -> rusqlite::Result<(u64, Option<DateTime<Utc>>)> {
        db::habit_stats(conn, owner)
    }
}

/// Supported entity types; anything else is `unsupported_entity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityKind {
    Task,
    Habit,
}

impl EntityKind {
    const ALL: [EntityKind; 2] = [EntityKind::Task, EntityKind::Habit];

    fn parse(entity_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.entity_type() == entity_type)
    }

    fn entity_type(&self) -> &'static str {
        match self {
            EntityKind::Task => Task::ENTITY_TYPE,
            EntityKind::Habit => Habit::ENTITY_TYPE,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A rejected operation before its batch index is attached
#[derive(Debug)]
struct Rejection {
    kind: ConflictKind,
    server_data: Option<Value>,
    message: String,
}

impl Rejection {
    fn new(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            server_data: None,
            message: message.into(),
        }
    }

    fn invalid(err: ValidationError) -> Self {
        Self::new(ConflictKind::ValidationError, err.to_string())
    }

    fn at(self, operation_index: usize) -> SyncConflict {
        SyncConflict {
            operation_index,
            conflict_type: self.kind,
            server_data: self.server_data,
            message: self.message,
        }
    }
}

/// Apply a batch of client operations and collect the server-side changes
pub fn sync(
    db: &Database,
    actor: &str,
    request: &SyncRequest,
    now: DateTime<Utc>,
) -> Result<SyncResponse, SyncError> {
    db.with_transaction(|tx| {
        let mut processed_operations = 0;
        let mut conflicts = Vec::new();

        for (index, operation) in request.operations.iter().enumerate() {
            match process_operation(tx, actor, operation) {
                Ok(()) => processed_operations += 1,
                Err(rejection) => {
                    tracing::debug!(
                        index,
                        kind = ?rejection.kind,
                        entity_type = %operation.entity_type,
                        message = %rejection.message,
                        "Sync operation rejected"
                    );
                    conflicts.push(rejection.at(index));
                }
            }
        }

        let server_changes = match &request.last_sync_timestamp {
            Some(since) => collect_server_changes(tx, actor, since)?,
            None => Vec::new(),
        };

        db::update_device_sync(tx, &request.device_id, actor, &now)?;

        Ok(SyncResponse {
            success: true,
            processed_operations,
            conflicts,
            server_changes,
            new_sync_timestamp: now,
        })
    })
}

fn process_operation(conn: &Connection, actor: &str, op: &SyncOperation) -> Result<(), Rejection> {
    match EntityKind::parse(&op.entity_type) {
        Some(EntityKind::Task) => apply_operation::<Task>(conn, actor, op),
        Some(EntityKind::Habit) => apply_operation::<Habit>(conn, actor, op),
        None => Err(Rejection::new(
            ConflictKind::UnsupportedEntity,
            format!("Entity type '{}' not supported", op.entity_type),
        )),
    }
}

fn apply_operation<T: SyncEntity>(
    conn: &Connection,
    actor: &str,
    op: &SyncOperation,
) -> Result<(), Rejection> {
    match op.action {
        SyncAction::Create => {
            let patch = T::parse_patch(&op.data).map_err(Rejection::invalid)?;
            let id = op
                .entity_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let entity = T::create(id, actor, patch, op.timestamp).map_err(Rejection::invalid)?;
            entity
                .insert(conn)
                .map_err(|e| Rejection::new(ConflictKind::CreationError, e.to_string()))
        }

        SyncAction::Update => {
            let id = op.entity_id.as_deref().ok_or_else(|| {
                Rejection::new(
                    ConflictKind::MissingId,
                    "Entity ID required for update operation",
                )
            })?;
            let mut entity = owned_entity::<T>(conn, actor, id, ConflictKind::UpdateError)?;

            if entity.updated_at() > op.timestamp {
                return Err(Rejection {
                    kind: ConflictKind::VersionConflict,
                    server_data: serde_json::to_value(&entity).ok(),
                    message: "Server version is newer than client version".to_string(),
                });
            }

            let patch = T::parse_patch(&op.data).map_err(Rejection::invalid)?;
            entity.apply(patch, op.timestamp);
            entity
                .save(conn)
                .map_err(|e| Rejection::new(ConflictKind::UpdateError, e.to_string()))
        }

        SyncAction::Delete => {
            let id = op.entity_id.as_deref().ok_or_else(|| {
                Rejection::new(
                    ConflictKind::MissingId,
                    "Entity ID required for delete operation",
                )
            })?;
            owned_entity::<T>(conn, actor, id, ConflictKind::DeleteError)?;
            T::remove(conn, id)
                .map(|_| ())
                .map_err(|e| Rejection::new(ConflictKind::DeleteError, e.to_string()))
        }
    }
}

/// Load `id` and check that `actor` owns it
fn owned_entity<T: SyncEntity>(
    conn: &Connection,
    actor: &str,
    id: &str,
    storage_failure: ConflictKind,
) -> Result<T, Rejection> {
    match T::load(conn, id) {
        Err(e) => Err(Rejection::new(storage_failure, e.to_string())),
        Ok(None) => Err(Rejection::new(
            ConflictKind::NotFound,
            format!("{} {id} not found", T::ENTITY_TYPE),
        )),
        Ok(Some(entity)) if entity.owner() != actor => Err(Rejection::new(
            ConflictKind::PermissionDenied,
            format!("{} {id} belongs to another user", T::ENTITY_TYPE),
        )),
        Ok(Some(entity)) => Ok(entity),
    }
}

fn collect_server_changes(
    conn: &Connection,
    actor: &str,
    since: &DateTime<Utc>,
) -> Result<Vec<ServerChange>, SyncError> {
    let mut changes = Vec::new();
    push_changes::<Task>(conn, actor, since, &mut changes)?;
    push_changes::<Habit>(conn, actor, since, &mut changes)?;
    Ok(changes)
}

fn push_changes<T: SyncEntity>(
    conn: &Connection,
    actor: &str,
    since: &DateTime<Utc>,
    out: &mut Vec<ServerChange>,
) -> Result<(), SyncError> {
    for entity in T::modified_since(conn, actor, since)? {
        out.push(ServerChange {
            entity_type: T::ENTITY_TYPE.to_string(),
            action: SyncAction::Update,
            entity_id: entity.id().to_string(),
            timestamp: entity.updated_at(),
            data: serde_json::to_value(&entity)?,
        });
    }
    Ok(())
}

/// Settle a reported version conflict.
///
/// `server` touches nothing. `client` and `merge` apply the supplied data as a
/// partial update stamped with `now`, so the resolved state wins over every
/// earlier write and reaches other devices through the change feed.
pub fn resolve_conflict(
    db: &Database,
    actor: &str,
    request: &ConflictResolution,
    now: DateTime<Utc>,
) -> Result<ResolutionOutcome, SyncError> {
    let kind = EntityKind::parse(&request.entity_type)
        .ok_or_else(|| SyncError::UnsupportedEntity(request.entity_type.clone()))?;

    if request.resolution == Resolution::Server {
        tracing::info!(
            entity_type = kind.entity_type(),
            entity_id = %request.entity_id,
            "Conflict resolved in favour of server"
        );
        return Ok(ResolutionOutcome {
            success: true,
            message: "Server version kept".to_string(),
            data: None,
        });
    }

    let data = request.data.as_ref().ok_or_else(|| {
        ValidationError::new("data", "required for client and merge resolutions")
    })?;

    db.with_transaction(|tx| match kind {
        EntityKind::Task => overwrite::<Task>(tx, actor, &request.entity_id, data, now),
        EntityKind::Habit => overwrite::<Habit>(tx, actor, &request.entity_id, data, now),
    })
}

fn overwrite<T: SyncEntity>(
    conn: &Connection,
    actor: &str,
    id: &str,
    data: &Payload,
    at: DateTime<Utc>,
) -> Result<ResolutionOutcome, SyncError> {
    let mut entity = T::load(conn, id)?
        .filter(|e| e.owner() == actor)
        .ok_or_else(|| SyncError::NotFound {
            entity_type: T::ENTITY_TYPE.to_string(),
            entity_id: id.to_string(),
        })?;

    let patch = T::parse_patch(data)?;
    entity.apply(patch, at);
    entity.save(conn)?;

    Ok(ResolutionOutcome {
        success: true,
        message: "Resolution applied".to_string(),
        data: Some(serde_json::to_value(&entity)?),
    })
}

/// Per-entity counts and latest modification times for one user
pub fn sync_status(db: &Database, actor: &str, now: DateTime<Utc>) -> Result<SyncStatus, SyncError> {
    db.with_conn(|conn| {
        let mut data_counts = BTreeMap::new();
        let mut last_modified = BTreeMap::new();

        for kind in EntityKind::ALL {
            let (count, latest) = match kind {
                EntityKind::Task => Task::stats(conn, actor)?,
                EntityKind::Habit => Habit::stats(conn, actor)?,
            };
            let key = format!("{}s", kind.entity_type());
            data_counts.insert(key.clone(), count);
            last_modified.insert(key, latest);
        }

        Ok(SyncStatus {
            user_id: actor.to_string(),
            data_counts,
            last_modified,
            server_timestamp: now,
        })
    })
}
