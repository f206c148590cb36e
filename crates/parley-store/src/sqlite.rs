//! SQLite implementation of the persistence port.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, instrument};

use parley_core::{
    EngineError, Message, PersistencePort, Role, ServerConfig, ServerId, Session, SessionId,
};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        let backend = serde_json::to_string(&session.backend)?;
        self.db.with_conn(|conn| {
            // Existing rows keep their creation time and, when the incoming
            // record has none, their title.
            conn.execute(
                "INSERT INTO sessions (id, server_id, title, backend, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    title = COALESCE(excluded.title, sessions.title),
                    backend = excluded.backend,
                    updated_at = excluded.updated_at",
                params![
                    session.id.as_str(),
                    session.server_id.as_str(),
                    session.title,
                    backend,
                    timestamp(&session.created_at),
                    timestamp(&session.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn replace_messages(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        let bodies = messages
            .iter()
            .map(|m| Ok((m, serde_json::to_string(m)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE server_id = ?1 AND session_id = ?2",
                params![server_id.as_str(), session_id.as_str()],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (session_id, server_id, position, id, role, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (position, (message, body)) in bodies.iter().enumerate() {
                    stmt.execute(params![
                        session_id.as_str(),
                        server_id.as_str(),
                        position as i64,
                        message.id.as_str(),
                        role_str(message.role),
                        body,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "sessions",
            column,
            detail: e.to_string(),
        })
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

fn row_to_server(row: &Row<'_>) -> Result<ServerConfig, StoreError> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let kind: String = row.get(2)?;
    Ok(ServerConfig {
        id: ServerId::from_raw(id),
        name,
        kind: parse_json(&kind, "servers", "kind")?,
    })
}

fn row_to_session(row: &Row<'_>) -> Result<Session, StoreError> {
    let id: String = row.get(0)?;
    let server_id: String = row.get(1)?;
    let title: Option<String> = row.get(2)?;
    let backend: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Session {
        id: SessionId::from_raw(id),
        server_id: ServerId::from_raw(server_id),
        title,
        backend: parse_json(&backend, "sessions", "backend")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

impl PersistencePort for SqliteStore {
    fn load_servers(&self) -> Result<Vec<ServerConfig>, EngineError> {
        let servers = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, kind FROM servers ORDER BY created_at, rowid")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_server(row)?);
            }
            Ok(out)
        })?;
        Ok(servers)
    }

    #[instrument(skip_all, fields(server_id = %server.id))]
    fn save_server(&self, server: &ServerConfig) -> Result<(), EngineError> {
        let kind = serde_json::to_string(&server.kind).map_err(StoreError::from)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO servers (id, name, kind, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, kind = excluded.kind",
                params![
                    server.id.as_str(),
                    server.name,
                    kind,
                    timestamp(&Utc::now())
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(server_id = %server_id))]
    fn delete_server(&self, server_id: &ServerId) -> Result<(), EngineError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let messages = tx.execute(
                "DELETE FROM messages WHERE server_id = ?1",
                [server_id.as_str()],
            )?;
            let sessions = tx.execute(
                "DELETE FROM sessions WHERE server_id = ?1",
                [server_id.as_str()],
            )?;
            tx.execute("DELETE FROM servers WHERE id = ?1", [server_id.as_str()])?;
            tx.commit()?;
            debug!(sessions, messages, "server removed");
            Ok(())
        })?;
        Ok(())
    }

    fn load_sessions(&self, server_id: &ServerId) -> Result<Vec<Session>, EngineError> {
        let sessions = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, server_id, title, backend, created_at, updated_at
                 FROM sessions WHERE server_id = ?1
                 ORDER BY updated_at DESC, rowid DESC",
            )?;
            let mut rows = stmt.query([server_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })?;
        Ok(sessions)
    }

    #[instrument(skip_all, fields(session_id = %session.id))]
    fn save_session(&self, session: &Session) -> Result<(), EngineError> {
        Ok(self.upsert_session(session)?)
    }

    #[instrument(skip(self), fields(server_id = %server_id, session_id = %session_id))]
    fn delete_session(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
    ) -> Result<(), EngineError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE server_id = ?1 AND session_id = ?2",
                params![server_id.as_str(), session_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM sessions WHERE server_id = ?1 AND id = ?2",
                params![server_id.as_str(), session_id.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    fn load_messages(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
    ) -> Result<Vec<Message>, EngineError> {
        let messages = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM messages
                 WHERE server_id = ?1 AND session_id = ?2
                 ORDER BY position",
            )?;
            let mut rows = stmt.query(params![server_id.as_str(), session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let body: String = row.get(0)?;
                out.push(parse_json(&body, "messages", "body")?);
            }
            Ok(out)
        })?;
        Ok(messages)
    }

    #[instrument(skip(self, messages), fields(session_id = %session_id, count = messages.len()))]
    fn save_messages(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
        messages: &[Message],
    ) -> Result<(), EngineError> {
        Ok(self.replace_messages(server_id, session_id, messages)?)
    }

    fn delete_messages(
        &self,
        server_id: &ServerId,
        session_id: &SessionId,
    ) -> Result<(), EngineError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE server_id = ?1 AND session_id = ?2",
                params![server_id.as_str(), session_id.as_str()],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

impl SqliteStore {
    /// Fetch a single session by id, if stored.
    pub fn find_session(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT id, server_id, title, backend, created_at, updated_at
                     FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |row| Ok(row_to_session(row)),
                )
                .optional()?;
            found.transpose()
        })
    }
}
