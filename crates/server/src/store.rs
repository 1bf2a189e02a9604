//! Synchronous SQLite store behind the operation catalog.
//!
//! Each call opens its own connection (WAL, busy timeout), the same way the
//! persistence writer does. Async callers go through [`Store::run`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock::now_ms;
use crate::crypto::{CryptoError, SecretCipher};
use crate::persistence::open_db;

pub const NS_ACCOUNT: &str = "account";
pub const NS_APIKEY: &str = "apikey";
pub const NS_KEYCHAIN: &str = "keychain";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage is full")]
    Full,
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("stored value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("store task failed: {0}")]
    Join(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        if error.sqlite_error_code() == Some(ErrorCode::DiskFull) {
            Self::Full
        } else {
            Self::Sqlite(error)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvProfile {
    pub name: String,
    pub variables: BTreeMap<String, String>,
    pub active: bool,
    pub updated_at: u64,
}

/// Secret metadata; the value itself never leaves the store through listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEntry {
    pub name: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub struct Store {
    db_path: PathBuf,
    cipher: SecretCipher,
}

impl Store {
    pub fn new(db_path: PathBuf, cipher: SecretCipher) -> Self {
        Self { db_path, cipher }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        Ok(open_db(&self.db_path)?)
    }

    /// Run a store call on the blocking pool.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -- config --------------------------------------------------------------

    pub fn config_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self
            .conn()?
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    pub fn config_set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.conn()?.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, raw, now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn config_list(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (key, raw) = row?;
            out.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(out)
    }

    // -- environment profiles ------------------------------------------------

    pub fn profiles_list(&self) -> Result<Vec<EnvProfile>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, variables, active, updated_at FROM env_profiles ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (name, variables, active, updated_at) = row?;
            out.push(EnvProfile {
                name,
                variables: serde_json::from_str(&variables)?,
                active,
                updated_at: updated_at as u64,
            });
        }
        Ok(out)
    }

    /// Upsert; saving an active profile keeps it active.
    pub fn profile_save(
        &self,
        name: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<EnvProfile, StoreError> {
        let raw = serde_json::to_string(variables)?;
        let now = now_ms();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO env_profiles (name, variables, active, updated_at) VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(name) DO UPDATE SET variables = ?2, updated_at = ?3",
            params![name, raw, now as i64],
        )?;
        let active: bool = conn.query_row(
            "SELECT active FROM env_profiles WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(EnvProfile {
            name: name.to_string(),
            variables: variables.clone(),
            active,
            updated_at: now,
        })
    }

    /// Exactly one profile is active afterwards.
    pub fn profile_activate(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM env_profiles WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound(format!("profile `{name}`")));
        }
        tx.execute("UPDATE env_profiles SET active = (name = ?1)", params![name])?;
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn profile_delete(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM env_profiles WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    // -- secrets -------------------------------------------------------------

    pub fn secret_set(&self, namespace: &str, name: &str, value: &str) -> Result<(), StoreError> {
        let encrypted = self.cipher.encrypt(value)?;
        self.conn()?.execute(
            "INSERT INTO secrets (namespace, name, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, name) DO UPDATE SET value = ?3, updated_at = ?4",
            params![namespace, name, encrypted, now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn secret_get(&self, namespace: &str, name: &str) -> Result<Option<String>, StoreError> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM secrets WHERE namespace = ?1 AND name = ?2",
                params![namespace, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|v| self.cipher.decrypt(&v)).transpose()?)
    }

    pub fn secret_list(&self, namespace: &str) -> Result<Vec<SecretEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, updated_at FROM secrets WHERE namespace = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok(SecretEntry {
                name: row.get(0)?,
                updated_at: row.get::<_, i64>(1)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, rusqlite::Error>>()?)
    }

    pub fn secret_delete(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let removed = self.conn()?.execute(
            "DELETE FROM secrets WHERE namespace = ?1 AND name = ?2",
            params![namespace, name],
        )?;
        Ok(removed > 0)
    }

    // -- MCP servers ---------------------------------------------------------

    pub fn mcp_list(&self) -> Result<Vec<McpServer>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, command, args, env, enabled FROM mcp_servers ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (name, command, args, env, enabled) = row?;
            out.push(McpServer {
                name,
                command,
                args: serde_json::from_str(&args)?,
                env: serde_json::from_str(&env)?,
                enabled,
            });
        }
        Ok(out)
    }

    pub fn mcp_add(&self, server: &McpServer) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO mcp_servers (name, command, args, env, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET command = ?2, args = ?3, env = ?4, enabled = ?5, updated_at = ?6",
            params![
                server.name,
                server.command,
                serde_json::to_string(&server.args)?,
                serde_json::to_string(&server.env)?,
                server.enabled,
                now_ms() as i64,
            ],
        )?;
        Ok(())
    }

    pub fn mcp_remove(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM mcp_servers WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::migration_runner::run_migrations;

    pub(crate) fn test_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("daemon.db");
        let mut conn = Connection::open(&db_path).unwrap();
        run_migrations(&mut conn).unwrap();
        let store = Store::new(db_path, SecretCipher::from_key([7u8; 32]));
        (dir, Arc::new(store))
    }

    #[test]
    fn config_values_roundtrip_as_json() {
        let (_dir, store) = test_store();
        assert_eq!(store.config_get("model").unwrap(), None);

        store.config_set("model", &serde_json::json!("qwen3")).unwrap();
        store.config_set("temperature", &serde_json::json!(0.2)).unwrap();
        store.config_set("model", &serde_json::json!("llama")).unwrap();

        let all = store.config_list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["model"], "llama");
    }

    #[test]
    fn activating_a_profile_deactivates_the_rest() {
        let (_dir, store) = test_store();
        let vars = BTreeMap::from([("LMX_HOST".to_string(), "mono512".to_string())]);
        store.profile_save("home", &vars).unwrap();
        store.profile_save("office", &BTreeMap::new()).unwrap();

        store.profile_activate("home").unwrap();
        store.profile_activate("office").unwrap();

        let profiles = store.profiles_list().unwrap();
        let active: Vec<_> = profiles.iter().filter(|p| p.active).map(|p| p.name.as_str()).collect();
        assert_eq!(active, vec!["office"]);

        let saved = store.profile_save("office", &vars).unwrap();
        assert!(saved.active, "re-saving keeps the profile active");
    }

    #[test]
    fn activating_missing_profile_is_not_found() {
        let (_dir, store) = test_store();
        match store.profile_activate("ghost") {
            Err(StoreError::NotFound(what)) => assert!(what.contains("ghost")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn secrets_are_encrypted_at_rest() {
        let (_dir, store) = test_store();
        store.secret_set(NS_APIKEY, "openai", "sk-abc").unwrap();

        let raw: String = open_db(store.db_path())
            .unwrap()
            .query_row("SELECT value FROM secrets WHERE name = 'openai'", [], |row| row.get(0))
            .unwrap();
        assert!(raw.starts_with(crate::crypto::ENC_PREFIX));
        assert!(!raw.contains("sk-abc"));

        assert_eq!(store.secret_get(NS_APIKEY, "openai").unwrap().as_deref(), Some("sk-abc"));
        assert_eq!(store.secret_list(NS_APIKEY).unwrap().len(), 1);
        assert!(store.secret_list(NS_KEYCHAIN).unwrap().is_empty());
    }

    #[test]
    fn deletes_report_whether_anything_was_removed() {
        let (_dir, store) = test_store();
        store.secret_set(NS_KEYCHAIN, "gh", "token").unwrap();
        assert!(store.secret_delete(NS_KEYCHAIN, "gh").unwrap());
        assert!(!store.secret_delete(NS_KEYCHAIN, "gh").unwrap());
        assert!(!store.profile_delete("none").unwrap());
        assert!(!store.mcp_remove("none").unwrap());
    }

    #[test]
    fn mcp_servers_upsert_by_name() {
        let (_dir, store) = test_store();
        let mut server = McpServer {
            name: "fs".into(),
            command: "npx".into(),
            args: vec!["@mcp/fs".into()],
            env: BTreeMap::new(),
            enabled: true,
        };
        store.mcp_add(&server).unwrap();
        server.enabled = false;
        store.mcp_add(&server).unwrap();

        assert_eq!(store.mcp_list().unwrap(), vec![server]);
    }

    #[tokio::test]
    async fn run_executes_on_blocking_pool() {
        let (_dir, store) = test_store();
        store
            .run(|s| s.config_set("k", &serde_json::json!(1)))
            .await
            .unwrap();
        let value = store.run(|s| s.config_get("k")).await.unwrap();
        assert_eq!(value, Some(serde_json::json!(1)));
    }
}
