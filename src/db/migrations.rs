//! Schema versioning through SQLite's `user_version` pragma.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema scripts in version order; entry `i` upgrades to version `i + 1`.
const STEPS: &[(&str, &str)] = &[("schema_v1.sql", include_str!("schemas/schema_v1.sql"))];

fn latest_version() -> i32 {
    STEPS.len() as i32
}

/// Bring the outbox schema up to date inside one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let installed: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read outbox schema version")?;
    let latest = latest_version();

    if installed > latest {
        bail!("outbox schema v{installed} was written by a newer build (this one knows v{latest})");
    }
    if installed == latest {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to begin outbox migration")?;
    for (index, (name, script)) in STEPS.iter().enumerate().skip(installed.max(0) as usize) {
        tx.execute_batch(script)
            .with_context(|| format!("failed to apply {name} (v{})", index + 1))?;
    }
    tx.pragma_update(None, "user_version", latest)
        .context("failed to record outbox schema version")?;
    tx.commit().context("failed to commit outbox migration")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(conn: &Connection) -> i32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn running_twice_is_harmless() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        assert_eq!(installed(&conn), latest_version());
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'outbox_messages'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn refuses_a_schema_from_the_future() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", latest_version() + 1)
            .unwrap();
        assert!(run_migrations(&mut conn).is_err());
    }
}
