//! Alias records: stable named routes to fixed ports
//!
//! The routing synthesizer only ever asks one question of this module, "which
//! aliases are active?", through the [`AliasSource`] trait. The SQLite-backed
//! [`AliasStore`] also carries `upsert_alias` for seeding the table. Rows
//! with a port outside `1..=65535` are skipped rather than failing the query.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// A persisted mapping from an alias name to a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alias {
    pub name: String,
    pub port: u16,
    pub file_name: String,
    pub is_active: bool,
}

impl Alias {
    /// An active alias with no backing file name
    pub fn active(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            file_name: String::new(),
            is_active: true,
        }
    }
}

/// Read-only view of the alias records the routing table depends on
pub trait AliasSource: Send + Sync {
    /// All aliases currently flagged active
    fn active_aliases(&self) -> Result<Vec<Alias>>;
}

/// Fixed alias set, for bootstrap without a database and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticAliases(pub Vec<Alias>);

impl AliasSource for StaticAliases {
    fn active_aliases(&self) -> Result<Vec<Alias>> {
        Ok(self.0.iter().filter(|a| a.is_active).cloned().collect())
    }
}

/// SQLite-backed alias table with thread-safe access
pub struct AliasStore {
    conn: Arc<Mutex<Connection>>,
}

impl AliasStore {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path).context("Failed to open alias database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Alias database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("alias database mutex poisoned"))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running alias migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Insert an alias or update the one with the same file name
    pub fn upsert_alias(&self, alias: &Alias) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO aliases (file_name, alias, port, is_active)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_name) DO UPDATE SET
                alias = excluded.alias,
                port = excluded.port,
                is_active = excluded.is_active",
            params![alias.file_name, alias.name, alias.port, alias.is_active],
        )
        .with_context(|| format!("Failed to save alias {}", alias.name))?;
        Ok(())
    }

    /// Flip the active flag, returns false if the alias does not exist
    #[cfg(test)]
    pub fn set_active(&self, name: &str, active: bool) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE aliases SET is_active = ?1 WHERE alias = ?2",
            params![active, name],
        )?;
        Ok(rows > 0)
    }

    #[cfg(test)]
    pub fn get_alias(&self, name: &str) -> Result<Option<Alias>> {
        use rusqlite::OptionalExtension;

        let conn = self.lock()?;
        let alias = conn
            .query_row(
                "SELECT alias, port, file_name, is_active FROM aliases WHERE alias = ?1",
                params![name],
                row_to_alias,
            )
            .optional()?;
        Ok(alias.and_then(AliasRow::into_alias))
    }

    #[cfg(test)]
    pub fn list_aliases(&self) -> Result<Vec<Alias>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT alias, port, file_name, is_active FROM aliases ORDER BY alias",
        )?;
        let rows = stmt
            .query_map([], row_to_alias)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().filter_map(AliasRow::into_alias).collect())
    }

    #[cfg(test)]
    pub fn delete_alias(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM aliases WHERE alias = ?1", params![name])?;
        Ok(rows > 0)
    }
}

impl AliasSource for AliasStore {
    fn active_aliases(&self) -> Result<Vec<Alias>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT alias, port, file_name, is_active FROM aliases
                 WHERE is_active = 1 ORDER BY alias",
            )
            .context("Failed to fetch aliases")?;
        let aliases: Vec<Alias> = stmt
            .query_map([], row_to_alias)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to fetch aliases")?
            .into_iter()
            .filter_map(AliasRow::into_alias)
            .collect();
        debug!(count = aliases.len(), "Loaded active aliases");
        Ok(aliases)
    }
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying alias migration v1: aliases table");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS aliases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name TEXT NOT NULL UNIQUE,
            alias TEXT NOT NULL UNIQUE,
            port INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0
        );

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// An alias row as stored, before its port is checked
struct AliasRow {
    name: String,
    port: i64,
    file_name: String,
    is_active: bool,
}

impl AliasRow {
    /// Rows whose port cannot be routed to are skipped
    fn into_alias(self) -> Option<Alias> {
        match u16::try_from(self.port) {
            Ok(port) if port > 0 => Some(Alias {
                name: self.name,
                port,
                file_name: self.file_name,
                is_active: self.is_active,
            }),
            _ => {
                warn!(alias = %self.name, port = self.port, "Skipping alias with invalid port");
                None
            }
        }
    }
}

fn row_to_alias(row: &rusqlite::Row<'_>) -> rusqlite::Result<AliasRow> {
    Ok(AliasRow {
        name: row.get(0)?,
        port: row.get(1)?,
        file_name: row.get(2)?,
        is_active: row.get(3)?,
    })
}
