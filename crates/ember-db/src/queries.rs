use crate::models::SessionRow;
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

impl Database {
    pub fn get_session(&self) -> Result<SessionRow> {
        self.with_conn(query_session)
    }

    /// Overwrite all columns in one statement.
    pub fn put_session(&self, row: &SessionRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session (id, access, refresh, user_json, updated_at)
                     VALUES (1, ?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                     access = excluded.access,
                     refresh = excluded.refresh,
                     user_json = excluded.user_json,
                     updated_at = excluded.updated_at",
                (&row.access, &row.refresh, &row.user_json),
            )?;
            Ok(())
        })
    }

    /// Store a new access token; the refresh token is only replaced when given.
    pub fn update_access(&self, access: &str, refresh: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session (id, access, refresh, updated_at)
                     VALUES (1, ?1, ?2, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                     access = excluded.access,
                     refresh = COALESCE(excluded.refresh, session.refresh),
                     updated_at = excluded.updated_at",
                (access, refresh),
            )?;
            Ok(())
        })
    }

    pub fn update_user(&self, user_json: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session (id, user_json, updated_at)
                     VALUES (1, ?1, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                     user_json = excluded.user_json,
                     updated_at = excluded.updated_at",
                [user_json],
            )?;
            Ok(())
        })
    }

    pub fn delete_session(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM session", [])?;
            Ok(())
        })
    }
}

fn query_session(conn: &Connection) -> Result<SessionRow> {
    let row = conn
        .query_row(
            "SELECT access, refresh, user_json FROM session WHERE id = 1",
            [],
            |row| {
                Ok(SessionRow {
                    access: row.get(0)?,
                    refresh: row.get(1)?,
                    user_json: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row.unwrap_or_default())
}
