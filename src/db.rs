//! SQLite store for hosts, groups, access lists and settings
//!
//! The store is the source of truth; everything under the generated config
//! directory is derived from it. Locations and stream ports live in JSON
//! columns of the host row and are normalized on every read.

use crate::model::{
    normalize_locations, normalize_stream_ports, AccessList, AccessListInput, AuthEntry,
    ClientRule, Directive, Host, HostGroup, HostInput, RawLocation, RawStreamPort, Satisfy,
    Snapshot, SslMode, SslSettings,
};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

const HOST_COLUMNS: &str = "id, domains, group_id, enabled, ssl_type, force_https, cert_path, key_path,
                            hsts, http2, locations, stream_ports, webhook_url, advanced_yaml";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps readers from blocking the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn();

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
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS host_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- locations and stream_ports hold JSON documents; older rows may be NULL
            CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domains TEXT NOT NULL DEFAULT '[]',
                group_id INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                ssl_type TEXT NOT NULL DEFAULT 'none',
                force_https INTEGER NOT NULL DEFAULT 0,
                cert_path TEXT,
                key_path TEXT,
                hsts INTEGER NOT NULL DEFAULT 0,
                http2 INTEGER NOT NULL DEFAULT 0,
                locations TEXT,
                stream_ports TEXT,
                webhook_url TEXT,
                advanced_yaml TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (group_id) REFERENCES host_groups(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS access_lists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                satisfy TEXT NOT NULL DEFAULT 'any',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS access_list_clients (
                list_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                address TEXT NOT NULL,
                directive TEXT NOT NULL,
                PRIMARY KEY (list_id, position),
                FOREIGN KEY (list_id) REFERENCES access_lists(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS access_list_auth (
                list_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                PRIMARY KEY (list_id, position),
                FOREIGN KEY (list_id) REFERENCES access_lists(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_hosts_group ON hosts(group_id);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    // ==================== Host Operations ====================

    /// Create a host and return its identifier
    pub fn create_host(&self, host: &HostInput) -> Result<i64> {
        let row = HostColumns::encode(host)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO hosts (domains, group_id, enabled, ssl_type, force_https, cert_path, key_path,
                                hsts, http2, locations, stream_ports, webhook_url, advanced_yaml)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                row.domains,
                host.group_id,
                host.enabled,
                host.ssl.mode.as_str(),
                host.ssl.force_https,
                host.ssl.cert_path,
                host.ssl.key_path,
                host.hsts,
                host.http2,
                row.locations,
                row.stream_ports,
                host.webhook_url,
                host.advanced_yaml,
            ],
        )
        .context("Failed to create host")?;
        Ok(conn.last_insert_rowid())
    }

    /// Get a host by id
    pub fn get_host(&self, id: i64) -> Result<Option<Host>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM hosts WHERE id = ?1", HOST_COLUMNS),
                params![id],
                HostRow::from_row,
            )
            .optional()
            .context("Failed to get host")?;

        row.map(HostRow::into_host).transpose()
    }

    /// List all hosts ordered by id
    pub fn list_hosts(&self) -> Result<Vec<Host>> {
        let conn = self.conn();
        Self::query_hosts(&conn)
    }

    fn query_hosts(conn: &Connection) -> Result<Vec<Host>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM hosts ORDER BY id",
            HOST_COLUMNS
        ))?;

        let rows = stmt
            .query_map([], HostRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(HostRow::into_host).collect()
    }

    /// Replace every attribute of a host. Returns false if it does not exist.
    pub fn update_host(&self, id: i64, host: &HostInput) -> Result<bool> {
        let row = HostColumns::encode(host)?;
        let conn = self.conn();
        let rows = conn
            .execute(
                "UPDATE hosts SET domains = ?1, group_id = ?2, enabled = ?3, ssl_type = ?4,
                        force_https = ?5, cert_path = ?6, key_path = ?7, hsts = ?8, http2 = ?9,
                        locations = ?10, stream_ports = ?11, webhook_url = ?12, advanced_yaml = ?13,
                        updated_at = datetime('now')
                 WHERE id = ?14",
                params![
                    row.domains,
                    host.group_id,
                    host.enabled,
                    host.ssl.mode.as_str(),
                    host.ssl.force_https,
                    host.ssl.cert_path,
                    host.ssl.key_path,
                    host.hsts,
                    host.http2,
                    row.locations,
                    row.stream_ports,
                    host.webhook_url,
                    host.advanced_yaml,
                    id,
                ],
            )
            .context("Failed to update host")?;
        Ok(rows > 0)
    }

    /// Enable or disable a host
    pub fn set_host_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE hosts SET enabled = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![enabled, id],
        )?;
        Ok(rows > 0)
    }

    /// Delete a host
    pub fn delete_host(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Group Operations ====================

    pub fn create_group(&self, name: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute("INSERT INTO host_groups (name) VALUES (?1)", params![name])
            .context("Failed to create group")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_groups(&self) -> Result<Vec<HostGroup>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name FROM host_groups ORDER BY id")?;
        let groups = stmt
            .query_map([], |row| {
                Ok(HostGroup {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    pub fn rename_group(&self, id: i64, name: &str) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE host_groups SET name = ?1 WHERE id = ?2",
            params![name, id],
        )?;
        Ok(rows > 0)
    }

    /// Delete a group; member hosts keep existing with no group
    pub fn delete_group(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute("DELETE FROM host_groups WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Access List Operations ====================

    pub fn create_access_list(&self, list: &AccessListInput) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO access_lists (name, satisfy) VALUES (?1, ?2)",
            params![list.name, list.satisfy.as_str()],
        )
        .context("Failed to create access list")?;
        let id = tx.last_insert_rowid();
        Self::insert_access_rules(&tx, id, list)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_access_list(&self, id: i64) -> Result<Option<AccessList>> {
        let conn = self.conn();
        let header = conn
            .query_row(
                "SELECT id, name, satisfy FROM access_lists WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()
            .context("Failed to get access list")?;

        match header {
            Some((id, name, satisfy)) => Ok(Some(Self::load_access_list(&conn, id, name, &satisfy)?)),
            None => Ok(None),
        }
    }

    /// List all access lists ordered by id, rules in stored order
    pub fn list_access_lists(&self) -> Result<Vec<AccessList>> {
        let conn = self.conn();
        Self::query_access_lists(&conn)
    }

    fn query_access_lists(conn: &Connection) -> Result<Vec<AccessList>> {
        let mut stmt = conn.prepare("SELECT id, name, satisfy FROM access_lists ORDER BY id")?;
        let headers = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        headers
            .into_iter()
            .map(|(id, name, satisfy)| Self::load_access_list(conn, id, name, &satisfy))
            .collect()
    }

    fn load_access_list(
        conn: &Connection,
        id: i64,
        name: String,
        satisfy: &str,
    ) -> Result<AccessList> {
        let mut stmt = conn.prepare(
            "SELECT address, directive FROM access_list_clients WHERE list_id = ?1 ORDER BY position",
        )?;
        let clients = stmt
            .query_map(params![id], |row| {
                let directive: String = row.get(1)?;
                Ok(ClientRule {
                    address: row.get(0)?,
                    // Unreadable directives fail closed
                    directive: Directive::parse(&directive).unwrap_or(Directive::Deny),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT username, password FROM access_list_auth WHERE list_id = ?1 ORDER BY position",
        )?;
        let auth = stmt
            .query_map(params![id], |row| {
                Ok(AuthEntry {
                    username: row.get(0)?,
                    password: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AccessList {
            id,
            name,
            satisfy: Satisfy::parse(satisfy),
            clients,
            auth,
        })
    }

    /// Replace an access list and all of its rules
    pub fn update_access_list(&self, id: i64, list: &AccessListInput) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let rows = tx
            .execute(
                "UPDATE access_lists SET name = ?1, satisfy = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![list.name, list.satisfy.as_str(), id],
            )
            .context("Failed to update access list")?;
        if rows == 0 {
            return Ok(false);
        }

        tx.execute("DELETE FROM access_list_clients WHERE list_id = ?1", params![id])?;
        tx.execute("DELETE FROM access_list_auth WHERE list_id = ?1", params![id])?;
        Self::insert_access_rules(&tx, id, list)?;
        tx.commit()?;
        Ok(true)
    }

    fn insert_access_rules(conn: &Connection, id: i64, list: &AccessListInput) -> Result<()> {
        for (position, client) in list.clients.iter().enumerate() {
            conn.execute(
                "INSERT INTO access_list_clients (list_id, position, address, directive)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, position as i64, client.address, client.directive.as_str()],
            )?;
        }
        for (position, entry) in list.auth.iter().enumerate() {
            conn.execute(
                "INSERT INTO access_list_auth (list_id, position, username, password)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, position as i64, entry.username, entry.password],
            )?;
        }
        Ok(())
    }

    /// Delete an access list. Locations referencing it are left untouched.
    pub fn delete_access_list(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute("DELETE FROM access_lists WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Settings Operations ====================

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// Upsert several settings atomically
    pub fn set_settings(&self, values: &HashMap<String, String>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (key, value) in values {
            tx.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = datetime('now')",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn();
        Self::query_settings(&conn)
    }

    fn query_settings(conn: &Connection) -> Result<HashMap<String, String>> {
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let settings = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(settings)
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    // ==================== Snapshot ====================

    /// Read hosts, access lists and settings in one transaction.
    ///
    /// Always hits the database; nothing is cached between calls.
    pub fn read_snapshot(&self) -> Result<Snapshot> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let snapshot = Snapshot {
            hosts: Self::query_hosts(&tx)?,
            access_lists: Self::query_access_lists(&tx)?,
            settings: Self::query_settings(&tx)?,
        };

        tx.commit()?;
        debug!(
            hosts = snapshot.hosts.len(),
            access_lists = snapshot.access_lists.len(),
            settings = snapshot.settings.len(),
            "Snapshot read"
        );
        Ok(snapshot)
    }
}

/// JSON-encoded columns of a host row
struct HostColumns {
    domains: String,
    locations: String,
    stream_ports: String,
}

impl HostColumns {
    fn encode(host: &HostInput) -> Result<Self> {
        Ok(Self {
            domains: serde_json::to_string(&host.domains)?,
            locations: serde_json::to_string(&host.locations)?,
            stream_ports: serde_json::to_string(&host.stream_ports)?,
        })
    }
}

/// Host row as stored, before JSON decoding and normalization
struct HostRow {
    id: i64,
    domains: String,
    group_id: Option<i64>,
    enabled: bool,
    ssl_type: String,
    force_https: bool,
    cert_path: Option<String>,
    key_path: Option<String>,
    hsts: bool,
    http2: bool,
    locations: Option<String>,
    stream_ports: Option<String>,
    webhook_url: Option<String>,
    advanced_yaml: String,
}

impl HostRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            domains: row.get(1)?,
            group_id: row.get(2)?,
            enabled: row.get(3)?,
            ssl_type: row.get(4)?,
            force_https: row.get(5)?,
            cert_path: row.get(6)?,
            key_path: row.get(7)?,
            hsts: row.get(8)?,
            http2: row.get(9)?,
            locations: row.get(10)?,
            stream_ports: row.get(11)?,
            webhook_url: row.get(12)?,
            advanced_yaml: row.get(13)?,
        })
    }

    fn into_host(self) -> Result<Host> {
        let id = self.id;
        let domains: Option<Vec<String>> = serde_json::from_str(&self.domains)
            .with_context(|| format!("Host {}: malformed domains column", id))?;
        let locations: Option<Vec<RawLocation>> = decode_json_column(self.locations.as_deref())
            .with_context(|| format!("Host {}: malformed locations column", id))?;
        let stream_ports: Option<Vec<RawStreamPort>> =
            decode_json_column(self.stream_ports.as_deref())
                .with_context(|| format!("Host {}: malformed stream_ports column", id))?;

        Ok(Host {
            id,
            domains: domains.unwrap_or_default(),
            group_id: self.group_id,
            enabled: self.enabled,
            ssl: SslSettings {
                mode: SslMode::parse(&self.ssl_type),
                force_https: self.force_https,
                cert_path: self.cert_path,
                key_path: self.key_path,
            },
            hsts: self.hsts,
            http2: self.http2,
            locations: normalize_locations(locations),
            stream_ports: normalize_stream_ports(stream_ports),
            webhook_url: self.webhook_url,
            advanced_yaml: self.advanced_yaml,
        })
    }
}

fn decode_json_column<T: serde::de::DeserializeOwned>(value: Option<&str>) -> Result<Option<T>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}
