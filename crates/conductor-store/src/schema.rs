use rusqlite::{Connection, Result};
use std::path::Path;

/// Open a database file with WAL journaling and a busy timeout so several
/// orchestrator processes can share it.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(conn)
}

/// Apply the schema. Every statement is idempotent.
pub fn migrate(conn: &Connection) -> Result<()> {
    let sql = include_str!("../migrations/0001_init.sql");
    conn.execute_batch(sql)?;
    Ok(())
}

/// [`open`] followed by [`migrate`].
pub fn open_and_migrate(path: &Path) -> Result<Connection> {
    let conn = open(path)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Private in-memory database with the full schema.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}
