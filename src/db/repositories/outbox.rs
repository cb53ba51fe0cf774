use std::future::Future;

use anyhow::{Context, Result};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::{
    db::{
        helpers::{attempts_from_sql, priority_from_sql, timestamp_from_sql, timestamp_to_sql},
        Database,
    },
    models::Envelope,
};

fn row_to_envelope(row: &Row) -> Result<Envelope> {
    let id: String = row.get("id")?;
    let payload: String = row.get("payload")?;
    let priority: String = row.get("priority")?;
    let attempts: i64 = row.get("attempts")?;
    let created_at: String = row.get("created_at")?;

    Ok(Envelope {
        id: Uuid::parse_str(&id).with_context(|| format!("invalid outbox id {id}"))?,
        kind: row.get("kind")?,
        payload: serde_json::from_str(&payload).context("invalid outbox payload")?,
        created_at: timestamp_from_sql(&created_at)?,
        attempts: attempts_from_sql(attempts)?,
        priority: priority_from_sql(&priority)?,
    })
}

impl Database {
    pub fn persist_envelope(&self, envelope: &Envelope) -> impl Future<Output = Result<()>> + Send + 'static {
        let record = envelope.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO outbox_messages (id, kind, payload, priority, attempts, created_at, enqueued_seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                         (SELECT COALESCE(MAX(enqueued_seq), 0) + 1 FROM outbox_messages))",
                params![
                    record.id.to_string(),
                    record.kind,
                    serde_json::to_string(&record.payload)?,
                    record.priority.as_str(),
                    i64::from(record.attempts),
                    timestamp_to_sql(&record.created_at),
                ],
            )
            .with_context(|| "failed to persist outbox message")?;
            Ok(())
        })
    }

    pub fn record_envelope_attempts(
        &self,
        id: Uuid,
        attempts: u32,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE outbox_messages SET attempts = ?1 WHERE id = ?2",
                params![i64::from(attempts), id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn delete_envelope(&self, id: Uuid) -> impl Future<Output = Result<()>> + Send + 'static {
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM outbox_messages WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn clear_outbox(&self) -> impl Future<Output = Result<usize>> + Send + 'static {
        self.execute(|conn| Ok(conn.execute("DELETE FROM outbox_messages", [])?))
    }

    /// Persisted envelopes in the order they were enqueued.
    pub async fn load_envelopes(&self) -> Result<Vec<Envelope>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, payload, priority, attempts, created_at
                 FROM outbox_messages
                 ORDER BY enqueued_seq ASC",
            )?;

            let mut rows = stmt.query([])?;
            let mut envelopes = Vec::new();
            while let Some(row) = rows.next()? {
                envelopes.push(row_to_envelope(row)?);
            }
            Ok(envelopes)
        })
        .await
    }
}
