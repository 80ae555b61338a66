// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assistant aggregate and service.
//!
//! An assistant binds a `graph_id` to configuration. Runs reference an assistant, and the
//! assistant's graph decides which workers are eligible to execute them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::error::{CoreError, Result};
use crate::event_store::{AGGREGATE_ASSISTANT, DomainEvent, EventStore, NewEvent, UnitOfWork};
use crate::persistence::{AssistantRecord, EventRecord, Persistence, ProjectionWrite};

/// Request to create an assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAssistant {
    /// Explicit id; generated when absent.
    #[serde(default)]
    pub assistant_id: Option<String>,
    pub graph_id: String,
    /// Defaults to the graph id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub metadata: Value,
}

/// Partial update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantUpdate {
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    /// Merged into the existing metadata.
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    Created {
        assistant_id: String,
        graph_id: String,
        name: String,
        description: Option<String>,
        config: Value,
        metadata: Value,
        created_at: DateTime<Utc>,
    },
    Updated {
        graph_id: Option<String>,
        name: Option<String>,
        description: Option<String>,
        config: Option<Value>,
        metadata: Option<Value>,
        updated_at: DateTime<Utc>,
    },
    Deleted {
        deleted_at: DateTime<Utc>,
    },
}

impl DomainEvent for AssistantEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "assistant.created",
            Self::Updated { .. } => "assistant.updated",
            Self::Deleted { .. } => "assistant.deleted",
        }
    }
}

fn object(value: Value, field: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        _ => Err(CoreError::invalid_input(field, "must be a JSON object")),
    }
}

/// Event-sourced assistant.
#[derive(Debug, Clone)]
pub struct Assistant {
    record: AssistantRecord,
    deleted: bool,
    version: i64,
    pending: Vec<AssistantEvent>,
}

impl Assistant {
    fn blank(assistant_id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            record: AssistantRecord {
                assistant_id,
                graph_id: String::new(),
                name: String::new(),
                description: None,
                config: Value::Null,
                metadata: Value::Null,
                created_at,
                updated_at: created_at,
            },
            deleted: false,
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Validate and record creation.
    pub fn create(req: NewAssistant) -> Result<Self> {
        if req.graph_id.trim().is_empty() {
            return Err(CoreError::invalid_input("graph_id", "graph_id is required"));
        }
        let assistant_id = match req.assistant_id {
            Some(id) if id.trim().is_empty() => {
                return Err(CoreError::invalid_input("assistant_id", "must not be empty"));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        let name = req
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| req.graph_id.clone());
        let config = Value::Object(object(req.config, "config")?);
        let metadata = Value::Object(object(req.metadata, "metadata")?);
        let now = Utc::now();

        let mut assistant = Self::blank(assistant_id.clone(), now);
        assistant.record(AssistantEvent::Created {
            assistant_id,
            graph_id: req.graph_id,
            name,
            description: req.description,
            config,
            metadata,
            created_at: now,
        });
        Ok(assistant)
    }

    /// Rebuild from the assistant stream.
    pub fn from_events(records: &[EventRecord]) -> Result<Self> {
        let mut assistant: Option<Self> = None;
        for r in records {
            let event: AssistantEvent = serde_json::from_value(r.payload.clone())?;
            if assistant.is_none() {
                let AssistantEvent::Created {
                    assistant_id,
                    created_at,
                    ..
                } = &event
                else {
                    return Err(CoreError::internal(
                        "rehydrate_assistant",
                        format!("stream {} does not start with assistant.created", r.stream_id),
                    ));
                };
                assistant = Some(Self::blank(assistant_id.clone(), *created_at));
            }
            if let Some(a) = assistant.as_mut() {
                a.apply(&event);
                a.version = r.event_version;
            }
        }
        assistant.ok_or_else(|| CoreError::internal("rehydrate_assistant", "empty stream"))
    }

    fn apply(&mut self, event: &AssistantEvent) {
        let r = &mut self.record;
        match event {
            AssistantEvent::Created {
                graph_id,
                name,
                description,
                config,
                metadata,
                ..
            } => {
                r.graph_id = graph_id.clone();
                r.name = name.clone();
                r.description = description.clone();
                r.config = config.clone();
                r.metadata = metadata.clone();
            }
            AssistantEvent::Updated {
                graph_id,
                name,
                description,
                config,
                metadata,
                updated_at,
            } => {
                if let Some(g) = graph_id {
                    r.graph_id = g.clone();
                }
                if let Some(n) = name {
                    r.name = n.clone();
                }
                if let Some(d) = description {
                    r.description = Some(d.clone());
                }
                if let Some(c) = config {
                    r.config = c.clone();
                }
                if let (Some(Value::Object(patch)), Value::Object(current)) =
                    (metadata, &mut r.metadata)
                {
                    for (k, v) in patch {
                        current.insert(k.clone(), v.clone());
                    }
                }
                r.updated_at = *updated_at;
            }
            AssistantEvent::Deleted { deleted_at } => {
                self.deleted = true;
                r.updated_at = *deleted_at;
            }
        }
    }

    fn record(&mut self, event: AssistantEvent) {
        self.apply(&event);
        self.pending.push(event);
    }

    pub fn update(&mut self, upd: AssistantUpdate) -> Result<()> {
        if self.deleted {
            return Err(CoreError::invalid_state("deleted", "update assistant"));
        }
        if matches!(&upd.graph_id, Some(g) if g.trim().is_empty()) {
            return Err(CoreError::invalid_input("graph_id", "must not be empty"));
        }
        let config = upd
            .config
            .map(|c| object(c, "config").map(Value::Object))
            .transpose()?;
        let metadata = upd
            .metadata
            .map(|m| object(m, "metadata").map(Value::Object))
            .transpose()?;
        self.record(AssistantEvent::Updated {
            graph_id: upd.graph_id,
            name: upd.name.filter(|n| !n.trim().is_empty()),
            description: upd.description,
            config,
            metadata,
            updated_at: Utc::now(),
        });
        Ok(())
    }

    pub fn delete(&mut self) -> Result<()> {
        if self.deleted {
            return Err(CoreError::invalid_state("deleted", "delete assistant"));
        }
        self.record(AssistantEvent::Deleted {
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.record.assistant_id
    }

    pub fn graph_id(&self) -> &str {
        &self.record.graph_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn to_record(&self) -> AssistantRecord {
        self.record.clone()
    }

    /// Move pending events and the projection write into `uow`.
    pub fn stage(&mut self, uow: &mut UnitOfWork) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let events = self
            .pending
            .iter()
            .map(NewEvent::from_domain)
            .collect::<Result<Vec<_>>>()?;
        let count = events.len() as i64;
        uow.append(AGGREGATE_ASSISTANT, self.id(), self.version, events);
        uow.project(if self.deleted {
            ProjectionWrite::DeleteAssistant {
                assistant_id: self.id().to_string(),
            }
        } else {
            ProjectionWrite::UpsertAssistant(self.to_record())
        });
        self.pending.clear();
        self.version += count;
        Ok(())
    }
}

/// Assistant operations.
#[derive(Clone)]
pub struct AssistantService {
    events: EventStore,
    persistence: Arc<dyn Persistence>,
}

impl AssistantService {
    pub fn new(events: EventStore, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            events,
            persistence,
        }
    }

    #[instrument(skip(self, req), fields(graph_id = %req.graph_id))]
    pub async fn create(&self, req: NewAssistant) -> Result<AssistantRecord> {
        let mut assistant = Assistant::create(req)?;
        if self.events.version(AGGREGATE_ASSISTANT, assistant.id()).await? > 0 {
            return Err(CoreError::AlreadyExists {
                resource: "assistant",
                id: assistant.id().to_string(),
            });
        }
        let mut uow = UnitOfWork::new();
        assistant.stage(&mut uow)?;
        self.events.commit(uow).await.map_err(|e| match e {
            CoreError::ConcurrencyConflict { aggregate_id, .. } => CoreError::AlreadyExists {
                resource: "assistant",
                id: aggregate_id,
            },
            other => other,
        })?;
        info!(assistant_id = %assistant.id(), "Assistant created");
        Ok(assistant.to_record())
    }

    /// Load the aggregate; deleted assistants are not found.
    pub async fn load(&self, assistant_id: &str) -> Result<Assistant> {
        let records = self.events.load(AGGREGATE_ASSISTANT, assistant_id).await?;
        if records.is_empty() {
            return Err(CoreError::not_found("assistant", assistant_id));
        }
        let assistant = Assistant::from_events(&records)?;
        if assistant.is_deleted() {
            return Err(CoreError::not_found("assistant", assistant_id));
        }
        Ok(assistant)
    }

    pub async fn get(&self, assistant_id: &str) -> Result<AssistantRecord> {
        self.persistence
            .get_assistant(assistant_id)
            .await?
            .ok_or_else(|| CoreError::not_found("assistant", assistant_id))
    }

    pub async fn list(
        &self,
        graph_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AssistantRecord>> {
        let limit = if limit <= 0 { 100 } else { limit };
        self.persistence
            .list_assistants(graph_id, limit, offset.max(0))
            .await
    }

    #[instrument(skip(self, upd))]
    pub async fn update(&self, assistant_id: &str, upd: AssistantUpdate) -> Result<AssistantRecord> {
        let mut assistant = self.load(assistant_id).await?;
        assistant.update(upd)?;
        let mut uow = UnitOfWork::new();
        assistant.stage(&mut uow)?;
        self.events.commit(uow).await?;
        Ok(assistant.to_record())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, assistant_id: &str) -> Result<()> {
        let mut assistant = self.load(assistant_id).await?;
        assistant.delete()?;
        let mut uow = UnitOfWork::new();
        assistant.stage(&mut uow)?;
        self.events.commit(uow).await?;
        info!(assistant_id = %assistant_id, "Assistant deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use serde_json::json;

    async fn service() -> AssistantService {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.expect("in-memory db"));
        AssistantService::new(EventStore::new(persistence.clone()), persistence)
    }

    fn req(graph_id: &str) -> NewAssistant {
        NewAssistant {
            graph_id: graph_id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_graph_id_required() {
        let err = Assistant::create(req(" ")).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_create_defaults_name_to_graph() {
        let svc = service().await;
        let created = svc.create(req("agent")).await.unwrap();
        assert_eq!(created.name, "agent");
        assert_eq!(created.config, json!({}));
        assert_eq!(svc.get(&created.assistant_id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_update_and_list_by_graph() {
        let svc = service().await;
        let a = svc
            .create(NewAssistant {
                assistant_id: Some("a-1".into()),
                graph_id: "agent".into(),
                metadata: json!({"team": "x"}),
                ..Default::default()
            })
            .await
            .unwrap();
        svc.create(req("other")).await.unwrap();

        let updated = svc
            .update(
                &a.assistant_id,
                AssistantUpdate {
                    name: Some("Support agent".into()),
                    metadata: Some(json!({"tier": 2})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Support agent");
        assert_eq!(updated.metadata, json!({"team": "x", "tier": 2}));

        let listed = svc.list(Some("agent"), 0, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Support agent");
        assert_eq!(svc.list(None, 10, 0).await.unwrap().len(), 2);

        let err = svc
            .create(NewAssistant {
                assistant_id: Some("a-1".into()),
                graph_id: "agent".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn test_delete_removes_projection() {
        let svc = service().await;
        let a = svc.create(req("agent")).await.unwrap();
        svc.delete(&a.assistant_id).await.unwrap();
        assert_eq!(
            svc.get(&a.assistant_id).await.unwrap_err().error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            svc.update(&a.assistant_id, AssistantUpdate::default())
                .await
                .unwrap_err()
                .error_code(),
            "NOT_FOUND"
        );
    }
}
