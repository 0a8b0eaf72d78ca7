use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::info;

use beacon_core::domain::{Priority, ProjectStatus, ProjectTask, Suggestion, TaskStatus, Velocity};
use beacon_core::ids::TaskId;
use beacon_core::{emit_json, topics, EventChannel};
use beacon_store::tasks::TaskRepo;
use beacon_store::Database;

use crate::error::{EngineError, Result};
use crate::ProjectService;

pub struct ProjectManager {
    repo: TaskRepo,
    events: Arc<dyn EventChannel>,
}

impl ProjectManager {
    pub fn new(db: Database, events: Arc<dyn EventChannel>) -> Self {
        Self {
            repo: TaskRepo::new(db),
            events,
        }
    }

    fn status(&self) -> Result<ProjectStatus> {
        let tasks = self.repo.list()?;
        let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
        Ok(ProjectStatus {
            total: tasks.len(),
            pending: count(TaskStatus::Pending),
            in_progress: count(TaskStatus::InProgress),
            completed: count(TaskStatus::Completed),
            blocked: count(TaskStatus::Blocked),
            tasks,
        })
    }

    /// Push the project snapshot and one action per blocked task.
    fn publish(&self) -> Result<()> {
        let status = self.status()?;
        let actions: Vec<Suggestion> = status
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .map(|t| Suggestion {
                kind: "blocker".into(),
                message: match &t.blocker {
                    Some(reason) => format!("Unblock `{}`: {reason}", t.title),
                    None => format!("Unblock `{}`", t.title),
                },
                priority: Priority::High,
            })
            .collect();

        emit_json(self.events.as_ref(), topics::PROJECT_STATUS, &status);
        emit_json(self.events.as_ref(), topics::SUGGESTIONS_ACTIONS, &actions);
        Ok(())
    }
}

#[async_trait]
impl ProjectService for ProjectManager {
    async fn track(&self, task: &str, status: TaskStatus, blocker: Option<&str>) -> Result<ProjectTask> {
        let title = task.trim();
        if title.is_empty() {
            return Err(EngineError::InvalidInput("task must not be empty".into()));
        }
        let blocker = if status == TaskStatus::Blocked { blocker } else { None };
        let tracked = self.repo.upsert(title, status, blocker)?;
        info!(task_id = %tracked.id, status = %tracked.status, "task tracked");
        self.publish()?;
        Ok(tracked)
    }

    async fn get_status(&self) -> Result<ProjectStatus> {
        self.status()
    }

    async fn analyze_velocity(&self, window_hours: u32) -> Result<Velocity> {
        if window_hours == 0 {
            return Err(EngineError::InvalidInput("windowHours must be positive".into()));
        }
        let since = Duration::try_hours(i64::from(window_hours))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| EngineError::InvalidInput(format!("windowHours {window_hours} is out of range")))?;
        let completed = self.repo.completed_since(since)?;
        Ok(Velocity {
            window_hours,
            completed,
            per_hour: completed as f64 / f64::from(window_hours),
        })
    }

    async fn resolve_blocker(&self, task_id: &TaskId, resolution: Option<&str>) -> Result<ProjectTask> {
        let task = self.repo.resolve_blocker(task_id)?;
        info!(task_id = %task.id, resolution = resolution.unwrap_or(""), "blocker resolved");
        self.publish()?;
        Ok(task)
    }
}
