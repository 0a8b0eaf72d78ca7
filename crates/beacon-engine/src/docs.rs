use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use beacon_core::domain::{DocStatus, Priority, Suggestion};
use beacon_core::{emit_json, topics, EventChannel};

use crate::error::{EngineError, Result};
use crate::DocumentationService;

struct DocEntry {
    content: String,
    last_updated: DateTime<Utc>,
}

/// Tracks generated documentation targets and flags the stale ones.
pub struct DocumentationManager {
    stale_after: Duration,
    docs: Mutex<BTreeMap<String, DocEntry>>,
    events: Arc<dyn EventChannel>,
}

impl DocumentationManager {
    pub fn new(stale_after_hours: u32, events: Arc<dyn EventChannel>) -> Self {
        Self {
            stale_after: Duration::hours(i64::from(stale_after_hours)),
            docs: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn status_of(&self, target: &str, entry: &DocEntry, now: DateTime<Utc>) -> DocStatus {
        DocStatus {
            target: target.to_string(),
            last_updated: entry.last_updated.to_rfc3339(),
            stale: now - entry.last_updated >= self.stale_after,
        }
    }

    fn write(&self, target: &str, content: String) -> DocStatus {
        let now = Utc::now();
        let mut docs = self.docs.lock();
        let entry = docs.entry(target.to_string()).or_insert_with(|| DocEntry {
            content: String::new(),
            last_updated: now,
        });
        entry.content = content;
        entry.last_updated = now;
        debug!(target, bytes = entry.content.len(), "doc written");
        self.status_of(target, entry, now)
    }
}

fn require_target(target: &str) -> Result<&str> {
    let target = target.trim();
    if target.is_empty() {
        return Err(EngineError::InvalidInput("target must not be empty".into()));
    }
    Ok(target)
}

#[async_trait]
impl DocumentationService for DocumentationManager {
    async fn generate(&self, target: &str, content: Option<&str>) -> Result<DocStatus> {
        let target = require_target(target)?;
        let body = content
            .map(str::to_string)
            .unwrap_or_else(|| format!("# {target}\n"));
        let status = self.write(target, body);
        info!(target, "doc generated");
        Ok(status)
    }

    async fn update(&self, target: &str, content: &str) -> Result<DocStatus> {
        let target = require_target(target)?;
        if !self.docs.lock().contains_key(target) {
            return Err(EngineError::NotFound(format!("doc {target}")));
        }
        Ok(self.write(target, content.to_string()))
    }

    /// Status for every known target, sorted by name. Stale targets are
    /// also pushed as suggestions.
    async fn check_status(&self) -> Result<Vec<DocStatus>> {
        let now = Utc::now();
        let statuses: Vec<DocStatus> = self
            .docs
            .lock()
            .iter()
            .map(|(target, entry)| self.status_of(target, entry, now))
            .collect();

        let stale: Vec<Suggestion> = statuses
            .iter()
            .filter(|s| s.stale)
            .map(|s| Suggestion {
                kind: "docs".into(),
                message: format!("Documentation for `{}` is stale; run updateDocs", s.target),
                priority: Priority::Normal,
            })
            .collect();
        if !stale.is_empty() {
            emit_json(self.events.as_ref(), topics::AGENT_SUGGESTIONS, &stale);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{EventBus, TopicEvent};
    use tokio::sync::broadcast;

    fn manager(hours: u32) -> (DocumentationManager, broadcast::Receiver<TopicEvent>) {
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        (DocumentationManager::new(hours, Arc::new(bus)), rx)
    }

    #[tokio::test]
    async fn fresh_docs_are_not_stale() {
        let (mgr, mut rx) = manager(24);
        let _ = mgr.generate("api", None).await.unwrap();
        let statuses = mgr.check_status().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].stale);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_window_marks_everything_stale() {
        let (mgr, mut rx) = manager(0);
        let _ = mgr.generate("readme", Some("# hi")).await.unwrap();
        let _ = mgr.generate("api", None).await.unwrap();

        let statuses = mgr.check_status().await.unwrap();
        assert_eq!(statuses[0].target, "api");
        assert!(statuses.iter().all(|s| s.stale));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, topics::AGENT_SUGGESTIONS);
        assert_eq!(event.data.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_requires_existing_target() {
        let (mgr, _rx) = manager(24);
        let err = mgr.update("nope", "body").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let _ = mgr.generate("guide", None).await.unwrap();
        let status = mgr.update("guide", "new body").await.unwrap();
        assert_eq!(status.target, "guide");
    }

    #[tokio::test]
    async fn blank_target_rejected() {
        let (mgr, _rx) = manager(24);
        assert!(matches!(
            mgr.generate(" ", None).await.unwrap_err(),
            EngineError::InvalidInput(_)
        ));
    }
}
