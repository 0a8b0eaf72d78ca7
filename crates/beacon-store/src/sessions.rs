use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use beacon_core::domain::{Checkpoint, Session, SessionStatus};
use beacon_core::ids::{CheckpointId, SessionId};

use crate::database::Database;
use crate::error::StoreError;

const SESSION_COLUMNS: &str = "s.id, s.name, s.project_path, s.status, s.started_at, s.completed_at, s.summary,
     (SELECT COUNT(*) FROM checkpoints c WHERE c.session_id = s.id)";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new active session.
    #[instrument(skip(self))]
    pub fn create(&self, name: &str, project_path: Option<&str>) -> Result<Session, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, project_path, status, started_at)
                 VALUES (?1, ?2, ?3, 'active', ?4)",
                rusqlite::params![id.as_str(), name, project_path, now],
            )?;

            Ok(Session {
                id,
                name: name.to_string(),
                project_path: project_path.map(String::from),
                status: SessionStatus::Active,
                started_at: now,
                completed_at: None,
                summary: None,
                checkpoint_count: 0,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.id = ?1");
            conn.query_row(&sql, [id.as_str()], row_to_session_raw)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?
                .try_into()
        })
    }

    /// The most recently started active session, if any.
    #[instrument(skip(self))]
    pub fn active(&self) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.status = 'active'
                 ORDER BY s.started_at DESC LIMIT 1"
            );
            conn.query_row(&sql, [], row_to_session_raw)
                .optional()?
                .map(Session::try_from)
                .transpose()
        })
    }

    /// Mark a session completed. Completing twice is a no-op.
    #[instrument(skip(self, summary), fields(session_id = %id))]
    pub fn complete(&self, id: &SessionId, summary: Option<&str>) -> Result<Session, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET status = 'completed', completed_at = ?1,
                        summary = COALESCE(?2, summary)
                 WHERE id = ?3 AND status = 'active'",
                rusqlite::params![now, summary, id.as_str()],
            )?)
        })?;
        if changed == 0 {
            tracing::debug!(session_id = %id, "session already completed or missing");
        }
        self.get(id)
    }

    #[instrument(skip(self, description), fields(session_id = %session_id))]
    pub fn add_checkpoint(
        &self,
        session_id: &SessionId,
        description: &str,
        context_tokens: Option<u64>,
    ) -> Result<Checkpoint, StoreError> {
        let id = CheckpointId::new();
        let now = Utc::now().to_rfc3339();
        let tokens = context_tokens.map(|t| t as i64);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints (id, session_id, description, context_tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), session_id.as_str(), description, tokens, now],
            )?;
            Ok(Checkpoint {
                id,
                session_id: session_id.clone(),
                description: description.to_string(),
                context_tokens,
                created_at: now,
            })
        })
    }

    /// Checkpoints for a session, newest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn checkpoints(&self, session_id: &SessionId, limit: u32) -> Result<Vec<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, description, context_tokens, created_at
                 FROM checkpoints WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![session_id.as_str(), limit], |row| {
                let tokens: Option<i64> = row.get(3)?;
                Ok(Checkpoint {
                    id: CheckpointId::from_raw(row.get::<_, String>(0)?),
                    session_id: SessionId::from_raw(row.get::<_, String>(1)?),
                    description: row.get(2)?,
                    context_tokens: tokens.map(|t| t.max(0) as u64),
                    created_at: row.get(4)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }
}

/// Columns as read, before the status text is validated.
struct SessionRaw {
    id: String,
    name: String,
    project_path: Option<String>,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    summary: Option<String>,
    checkpoint_count: u32,
}

fn row_to_session_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRaw> {
    Ok(SessionRaw {
        id: row.get(0)?,
        name: row.get(1)?,
        project_path: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        summary: row.get(6)?,
        checkpoint_count: row.get(7)?,
    })
}

impl TryFrom<SessionRaw> for Session {
    type Error = StoreError;

    fn try_from(raw: SessionRaw) -> Result<Self, Self::Error> {
        let status = raw.status.parse().map_err(|detail| StoreError::CorruptRow {
            table: "sessions",
            column: "status",
            detail,
        })?;
        Ok(Session {
            id: SessionId::from_raw(raw.id),
            name: raw.name,
            project_path: raw.project_path,
            status,
            started_at: raw.started_at,
            completed_at: raw.completed_at,
            summary: raw.summary,
            checkpoint_count: raw.checkpoint_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn no_active_session_initially() {
        assert!(repo().active().unwrap().is_none());
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let session = repo.create("refactor", Some("/work/app")).unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched, session);
        assert_eq!(repo.active().unwrap().unwrap().id, session.id);
    }

    #[test]
    fn get_missing_is_not_found() {
        let err = repo().get(&SessionId::from_raw("sess_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn complete_clears_active() {
        let repo = repo();
        let session = repo.create("s", None).unwrap();
        let done = repo.complete(&session.id, Some("shipped")).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.summary.as_deref(), Some("shipped"));
        assert!(done.completed_at.is_some());
        assert!(repo.active().unwrap().is_none());

        let again = repo.complete(&session.id, None).unwrap();
        assert_eq!(again.completed_at, done.completed_at);
        assert_eq!(again.summary.as_deref(), Some("shipped"));
    }

    #[test]
    fn checkpoints_newest_first_and_counted() {
        let repo = repo();
        let session = repo.create("s", None).unwrap();
        let first = repo.add_checkpoint(&session.id, "one", Some(100)).unwrap();
        let second = repo.add_checkpoint(&session.id, "two", None).unwrap();

        let list = repo.checkpoints(&session.id, 10).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].id, first.id);
        assert_eq!(list[1].context_tokens, Some(100));
        assert_eq!(repo.get(&session.id).unwrap().checkpoint_count, 2);
    }

    #[test]
    fn checkpoint_limit_applies() {
        let repo = repo();
        let session = repo.create("s", None).unwrap();
        for i in 0..5 {
            let _ = repo.add_checkpoint(&session.id, &format!("cp {i}"), None).unwrap();
        }
        assert_eq!(repo.checkpoints(&session.id, 3).unwrap().len(), 3);
    }
}
