use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::instrument;

use beacon_core::domain::{ProjectTask, TaskStatus};
use beacon_core::ids::TaskId;

use crate::database::Database;
use crate::error::StoreError;

const TASK_COLUMNS: &str = "id, title, status, blocker, updated_at, completed_at";

pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a task or update the one with the same title.
    ///
    /// `completed_at` is stamped the first time a task reaches `completed`
    /// and cleared if it moves out of that state again.
    #[instrument(skip(self, blocker))]
    pub fn upsert(
        &self,
        title: &str,
        status: TaskStatus,
        blocker: Option<&str>,
    ) -> Result<ProjectTask, StoreError> {
        let now = Utc::now().to_rfc3339();
        let new_id = TaskId::new();
        let status_text = status.to_string();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, title, status, blocker, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, CASE WHEN ?3 = 'completed' THEN ?5 END)
                 ON CONFLICT(title) DO UPDATE SET
                    status = excluded.status,
                    blocker = excluded.blocker,
                    updated_at = excluded.updated_at,
                    completed_at = CASE
                        WHEN excluded.status = 'completed' THEN COALESCE(tasks.completed_at, excluded.updated_at)
                        ELSE NULL
                    END",
                rusqlite::params![new_id.as_str(), title, status_text, blocker, now],
            )?;
            let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE title = ?1");
            conn.query_row(&sql, [title], row_to_raw)?.try_into()
        })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    pub fn get(&self, id: &TaskId) -> Result<ProjectTask, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
            conn.query_row(&sql, [id.as_str()], row_to_raw)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?
                .try_into()
        })
    }

    /// All tasks, most recently updated first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ProjectTask>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY updated_at DESC, id DESC");
            let mut stmt = conn.prepare(&sql)?;
            let raws = stmt
                .query_map([], row_to_raw)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(ProjectTask::try_from).collect()
        })
    }

    /// Clear a task's blocker and move it back to in-progress.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn resolve_blocker(&self, id: &TaskId) -> Result<ProjectTask, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE tasks SET status = 'in_progress', blocker = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'blocked'",
                rusqlite::params![now, id.as_str()],
            )?)
        })?;
        let task = self.get(id)?;
        if changed == 0 {
            tracing::debug!(task_id = %id, status = %task.status, "task was not blocked");
        }
        Ok(task)
    }

    /// Number of tasks completed at or after `since`.
    pub fn completed_since(&self, since: DateTime<Utc>) -> Result<usize, StoreError> {
        let since = since.to_rfc3339();
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'completed' AND completed_at >= ?1",
                [since],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
    }
}

struct TaskRaw {
    id: String,
    title: String,
    status: String,
    blocker: Option<String>,
    updated_at: String,
    completed_at: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRaw> {
    Ok(TaskRaw {
        id: row.get(0)?,
        title: row.get(1)?,
        status: row.get(2)?,
        blocker: row.get(3)?,
        updated_at: row.get(4)?,
        completed_at: row.get(5)?,
    })
}

impl TryFrom<TaskRaw> for ProjectTask {
    type Error = StoreError;

    fn try_from(raw: TaskRaw) -> Result<Self, Self::Error> {
        let status = raw.status.parse().map_err(|detail| StoreError::CorruptRow {
            table: "tasks",
            column: "status",
            detail,
        })?;
        Ok(ProjectTask {
            id: TaskId::from_raw(raw.id),
            title: raw.title,
            status,
            blocker: raw.blocker,
            updated_at: raw.updated_at,
            completed_at: raw.completed_at,
        })
    }
}
