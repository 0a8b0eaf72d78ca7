use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use beacon_core::domain::{Checkpoint, Session};
use beacon_core::{emit_json, topics, EventChannel, TopicEvent};
use beacon_store::sessions::SessionRepo;
use beacon_store::Database;

use crate::error::{EngineError, Result};
use crate::SessionService;

/// Tracks the single active work session and its checkpoints.
pub struct SessionManager {
    repo: SessionRepo,
    events: Arc<dyn EventChannel>,
}

impl SessionManager {
    pub fn new(db: Database, events: Arc<dyn EventChannel>) -> Self {
        Self {
            repo: SessionRepo::new(db),
            events,
        }
    }

    fn require_active(&self) -> Result<Session> {
        self.repo.active()?.ok_or(EngineError::NoActiveSession)
    }
}

#[async_trait]
impl SessionService for SessionManager {
    /// Start a session. Any session still active is completed first.
    async fn start(&self, name: &str, project_path: Option<&str>) -> Result<Session> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("session name must not be empty".into()));
        }
        if let Some(previous) = self.repo.active()? {
            let _ = self.repo.complete(&previous.id, Some("superseded by a new session"))?;
            info!(session_id = %previous.id, "completed superseded session");
        }

        let session = self.repo.create(name, project_path)?;
        info!(session_id = %session.id, name, "session started");
        emit_json(self.events.as_ref(), topics::SESSION_STATUS, &session);
        Ok(session)
    }

    async fn get_active(&self) -> Result<Option<Session>> {
        Ok(self.repo.active()?)
    }

    async fn create_checkpoint(&self, description: &str, context_tokens: Option<u64>) -> Result<Checkpoint> {
        let session = self.require_active()?;
        let checkpoint = self.repo.add_checkpoint(&session.id, description, context_tokens)?;
        info!(session_id = %session.id, checkpoint_id = %checkpoint.id, "checkpoint created");

        emit_json(self.events.as_ref(), topics::SESSION_CHECKPOINT, &checkpoint);
        let refreshed = self.repo.get(&session.id)?;
        emit_json(self.events.as_ref(), topics::SESSION_STATUS, &refreshed);
        Ok(checkpoint)
    }

    async fn complete(&self, summary: Option<&str>) -> Result<Session> {
        let session = self.require_active()?;
        let completed = self.repo.complete(&session.id, summary)?;
        info!(session_id = %completed.id, "session completed");
        self.events
            .emit(TopicEvent::new(topics::SESSION_STATUS, Value::Null));
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::domain::SessionStatus;
    use beacon_core::EventBus;
    use tokio::sync::broadcast;

    fn manager() -> (SessionManager, broadcast::Receiver<TopicEvent>) {
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        let mgr = SessionManager::new(Database::in_memory().unwrap(), Arc::new(bus));
        (mgr, rx)
    }

    #[tokio::test]
    async fn get_active_none_without_session() {
        let (mgr, _rx) = manager();
        assert!(mgr.get_active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_emits_session_status() {
        let (mgr, mut rx) = manager();
        let session = mgr.start("spike", Some("/repo")).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, topics::SESSION_STATUS);
        assert_eq!(event.data["id"], session.id.as_str());
        assert_eq!(event.data["projectPath"], "/repo");
    }

    #[tokio::test]
    async fn start_rejects_blank_name() {
        let (mgr, _rx) = manager();
        let err = mgr.start("   ", None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn start_supersedes_active_session() {
        let (mgr, _rx) = manager();
        let first = mgr.start("one", None).await.unwrap();
        let second = mgr.start("two", None).await.unwrap();

        let active = mgr.get_active().await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_ne!(active.id, first.id);
    }

    #[tokio::test]
    async fn checkpoint_requires_active_session() {
        let (mgr, _rx) = manager();
        let err = mgr.create_checkpoint("wip", None).await.unwrap_err();
        assert!(matches!(err, EngineError::NoActiveSession));
    }

    #[tokio::test]
    async fn checkpoint_emits_checkpoint_then_status() {
        let (mgr, mut rx) = manager();
        let _ = mgr.start("s", None).await.unwrap();
        let _ = rx.try_recv().unwrap();

        let checkpoint = mgr.create_checkpoint("tests green", Some(4200)).await.unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.topic, topics::SESSION_CHECKPOINT);
        assert_eq!(first.data["id"], checkpoint.id.as_str());

        let second = rx.try_recv().unwrap();
        assert_eq!(second.topic, topics::SESSION_STATUS);
        assert_eq!(second.data["checkpointCount"], 1);
    }

    #[tokio::test]
    async fn complete_emits_null_status() {
        let (mgr, mut rx) = manager();
        let _ = mgr.start("s", None).await.unwrap();
        let _ = rx.try_recv().unwrap();

        let done = mgr.complete(Some("done")).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, topics::SESSION_STATUS);
        assert!(event.data.is_null());
        assert!(mgr.get_active().await.unwrap().is_none());
    }
}
