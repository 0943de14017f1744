//! Data models for tasksync
//!
//! Defines the synced domain entities (tasks, spaces, repetitive task
//! templates, tags) and the closed vocabularies the sync engine works with.
//!
//! Entities serialize to the camelCase JSON shape used by the task API.
//! Identifiers are strings: a client-generated UUID until the server assigns
//! a canonical id.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh client-side identifier
pub fn new_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// A container that groups tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Space {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_client_id(),
            name: name.into(),
            color: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Rename the space
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.modified_at = Utc::now();
    }
}

/// A task, optionally placed in a space and generated from a template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_client_id(),
            title: title.into(),
            notes: None,
            space_id: None,
            template_id: None,
            due_at: None,
            completed_at: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Update the title
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.modified_at = Utc::now();
    }

    /// Mark the task complete
    pub fn complete(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.modified_at = now;
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Template from which recurring tasks are generated
///
/// The recurrence rule is kept opaque; scheduling happens elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepetitiveTaskTemplate {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub space_id: Option<String>,
    pub recurrence: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl RepetitiveTaskTemplate {
    pub fn new(title: impl Into<String>, recurrence: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_client_id(),
            title: title.into(),
            space_id: None,
            recurrence: recurrence.into(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// A label attached to tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_client_id(),
            name: name.into(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Kind of entity a pending operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Space,
    Tag,
    RepetitiveTaskTemplate,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Task,
        EntityType::Space,
        EntityType::Tag,
        EntityType::RepetitiveTaskTemplate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Task => "task",
            EntityType::Space => "space",
            EntityType::Tag => "tag",
            EntityType::RepetitiveTaskTemplate => "repetitive_task_template",
        }
    }

    /// Local table holding rows of this type
    pub fn table(self) -> &'static str {
        match self {
            EntityType::Task => "tasks",
            EntityType::Space => "spaces",
            EntityType::Tag => "tags",
            EntityType::RepetitiveTaskTemplate => "repetitive_task_templates",
        }
    }
}

/// Kind of mutation a pending operation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Whether the request for this operation carries the entity as its body
    pub fn has_body(self) -> bool {
        !matches!(self, OperationType::Delete)
    }
}

/// Error returned when parsing one of the closed vocabularies from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseKindError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for EntityType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseKindError {
                kind: "entity type",
                value: s.to_string(),
            })
    }
}

impl FromStr for OperationType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(ParseKindError {
                kind: "operation type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed entity snapshot, as carried in a pending operation's payload
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPayload {
    Task(Task),
    Space(Space),
    Tag(Tag),
    RepetitiveTaskTemplate(RepetitiveTaskTemplate),
}

impl EntityPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Task(_) => EntityType::Task,
            EntityPayload::Space(_) => EntityType::Space,
            EntityPayload::Tag(_) => EntityType::Tag,
            EntityPayload::RepetitiveTaskTemplate(_) => EntityType::RepetitiveTaskTemplate,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityPayload::Task(t) => &t.id,
            EntityPayload::Space(s) => &s.id,
            EntityPayload::Tag(t) => &t.id,
            EntityPayload::RepetitiveTaskTemplate(t) => &t.id,
        }
    }

    /// Replace the entity's id (used after a remap to a canonical id)
    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        match self {
            EntityPayload::Task(t) => t.id = id,
            EntityPayload::Space(s) => s.id = id,
            EntityPayload::Tag(t) => t.id = id,
            EntityPayload::RepetitiveTaskTemplate(t) => t.id = id,
        }
    }

    /// Serialize to the opaque text stored in the ledger
    pub fn encode(&self) -> serde_json::Result<String> {
        match self {
            EntityPayload::Task(t) => serde_json::to_string(t),
            EntityPayload::Space(s) => serde_json::to_string(s),
            EntityPayload::Tag(t) => serde_json::to_string(t),
            EntityPayload::RepetitiveTaskTemplate(t) => serde_json::to_string(t),
        }
    }

    /// Parse ledger text back into the entity type it was stored for
    pub fn decode(entity_type: EntityType, payload: &str) -> serde_json::Result<Self> {
        Ok(match entity_type {
            EntityType::Task => EntityPayload::Task(serde_json::from_str(payload)?),
            EntityType::Space => EntityPayload::Space(serde_json::from_str(payload)?),
            EntityType::Tag => EntityPayload::Tag(serde_json::from_str(payload)?),
            EntityType::RepetitiveTaskTemplate => {
                EntityPayload::RepetitiveTaskTemplate(serde_json::from_str(payload)?)
            }
        })
    }

    /// JSON request body for the API
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            EntityPayload::Task(t) => serde_json::to_value(t),
            EntityPayload::Space(s) => serde_json::to_value(s),
            EntityPayload::Tag(t) => serde_json::to_value(t),
            EntityPayload::RepetitiveTaskTemplate(t) => serde_json::to_value(t),
        }
    }
}

macro_rules! into_payload {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for EntityPayload {
                fn from(entity: $ty) -> Self {
                    EntityPayload::$variant(entity)
                }
            }
        )*
    };
}

into_payload! {
    Task => Task,
    Space => Space,
    Tag => Tag,
    RepetitiveTaskTemplate => RepetitiveTaskTemplate,
}
