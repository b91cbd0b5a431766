use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::{Account, AccountStatus};
use crate::util::now_ms;

/// Token counts extracted from upstream `usageMetadata`. The last observed
/// snapshot of a streamed response wins.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageTokens {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub thinking_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub token: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

/// Append-only record of one inbound request, written exactly once per
/// request on every exit path.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub request_id: String,
    pub account_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub model: String,
    pub usage: UsageTokens,
    pub status: String,
    pub latency_ms: i64,
    pub error_message: Option<String>,
    pub attempt_no: i64,
    pub account_attempt: i64,
    pub same_retry: bool,
    pub created_at: i64,
}

/// Durable mapping of accounts, API keys, request logs, and model
/// mappings. Connections are short-lived, one per operation; sqlite's
/// single-writer transactions serialise concurrent writers.
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn open(data_dir: &Path) -> Result<Self, String> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        let store = Self {
            db_path: data_dir.join("trestle.db"),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, String> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| format!("Failed to open database: {}", e))?;
        conn.pragma_update(None, "busy_timeout", 5_000)
            .map_err(|e| format!("Failed to set busy_timeout: {}", e))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT UNIQUE,
                refresh_token TEXT NOT NULL,
                access_token TEXT,
                access_token_expires_at INTEGER,
                project_id TEXT,
                tier TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                error_count INTEGER NOT NULL DEFAULT 0,
                last_used_at INTEGER,
                last_error_at INTEGER,
                last_error_message TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create accounts table: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT UNIQUE NOT NULL,
                label TEXT,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER
            )",
            [],
        )
        .map_err(|e| format!("Failed to create api_keys table: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                account_id INTEGER,
                api_key_id INTEGER,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                thinking_tokens INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                attempt_no INTEGER NOT NULL DEFAULT 1,
                account_attempt INTEGER NOT NULL DEFAULT 1,
                same_retry BOOLEAN NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create request_logs table: {}", e))?;
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_request_logs_created_at ON request_logs(created_at)",
            [],
        );

        conn.execute(
            "CREATE TABLE IF NOT EXISTS model_mappings (
                alias TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create model_mappings table: {}", e))?;

        Ok(())
    }

    // ---- accounts ----

    pub fn insert_account(
        &self,
        email: Option<&str>,
        refresh_token: &str,
    ) -> Result<Account, String> {
        if refresh_token.trim().is_empty() {
            return Err("refresh_token must not be empty".to_string());
        }
        let conn = self.connect()?;
        let now = now_ms();
        conn.execute(
            "INSERT INTO accounts (email, refresh_token, status, created_at)
             VALUES (?1, ?2, 'active', ?3)",
            params![email, refresh_token, now],
        )
        .map_err(|e| format!("Failed to insert account: {}", e))?;
        let id = conn.last_insert_rowid();
        self.get_account(id)?
            .ok_or_else(|| "Inserted account vanished".to_string())
    }

    pub fn get_account(&self, id: i64) -> Result<Option<Account>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM accounts WHERE id = ?1")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        stmt.query_row(params![id], row_to_account)
            .optional()
            .map_err(|e| format!("Failed to query account: {}", e))
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM accounts ORDER BY id ASC")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map([], row_to_account)
            .map_err(|e| format!("Failed to query accounts: {}", e))?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row.map_err(|e| format!("Failed to parse account row: {}", e))?);
        }
        Ok(accounts)
    }

    pub fn delete_account(&self, id: i64) -> Result<bool, String> {
        let conn = self.connect()?;
        let changed = conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(|e| format!("Failed to delete account: {}", e))?;
        Ok(changed > 0)
    }

    /// Persist the result of a successful token refresh.
    pub fn update_access_token(
        &self,
        id: i64,
        access_token: &str,
        expires_at_ms: i64,
    ) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE accounts SET access_token = ?1, access_token_expires_at = ?2 WHERE id = ?3",
            params![access_token, expires_at_ms, id],
        )
        .map_err(|e| format!("Failed to update access token: {}", e))?;
        Ok(())
    }

    /// Persist onboarding discovery. Runs once per account.
    pub fn set_onboarding(&self, id: i64, project_id: &str, tier: &str) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE accounts SET project_id = ?1, tier = ?2 WHERE id = ?3",
            params![project_id, tier, id],
        )
        .map_err(|e| format!("Failed to set onboarding fields: {}", e))?;
        Ok(())
    }

    pub fn set_status(&self, id: i64, status: AccountStatus) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE accounts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .map_err(|e| format!("Failed to set account status: {}", e))?;
        Ok(())
    }

    pub fn touch_last_used(&self, id: i64, at_ms: i64) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE accounts SET last_used_at = ?1 WHERE id = ?2",
            params![at_ms, id],
        )
        .map_err(|e| format!("Failed to touch last_used_at: {}", e))?;
        Ok(())
    }

    /// Increment the consecutive-error counter and return the new value.
    pub fn bump_error(&self, id: i64, message: &str, at_ms: i64) -> Result<i64, String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE accounts SET error_count = error_count + 1,
                last_error_at = ?1, last_error_message = ?2 WHERE id = ?3",
            params![at_ms, message, id],
        )
        .map_err(|e| format!("Failed to bump error count: {}", e))?;
        conn.query_row(
            "SELECT error_count FROM accounts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(|e| format!("Failed to read error count: {}", e))
    }

    pub fn reset_error_count(&self, id: i64) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE accounts SET error_count = 0 WHERE id = ?1",
            params![id],
        )
        .map_err(|e| format!("Failed to reset error count: {}", e))?;
        Ok(())
    }

    /// Find another account already bound to `project_id`, for duplicate
    /// detection during onboarding.
    pub fn find_account_by_project(
        &self,
        project_id: &str,
        exclude_id: i64,
    ) -> Result<Option<i64>, String> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id FROM accounts WHERE project_id = ?1 AND id != ?2 LIMIT 1",
            params![project_id, exclude_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("Failed to query by project: {}", e))
    }

    // ---- api keys ----

    pub fn create_api_key(&self, label: Option<&str>) -> Result<ApiKey, String> {
        let conn = self.connect()?;
        let token = format!("sk-{}", Uuid::new_v4().to_string().replace('-', ""));
        let now = now_ms();
        conn.execute(
            "INSERT INTO api_keys (token, label, enabled, created_at) VALUES (?1, ?2, 1, ?3)",
            params![token, label, now],
        )
        .map_err(|e| format!("Failed to insert api key: {}", e))?;
        Ok(ApiKey {
            id: conn.last_insert_rowid(),
            token,
            label: label.map(str::to_string),
            enabled: true,
            created_at: now,
            last_used_at: None,
        })
    }

    pub fn get_api_key_by_value(&self, token: &str) -> Result<Option<ApiKey>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM api_keys WHERE token = ?1")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        stmt.query_row(params![token], row_to_api_key)
            .optional()
            .map_err(|e| format!("Failed to query api key: {}", e))
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKey>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM api_keys ORDER BY id ASC")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map([], row_to_api_key)
            .map_err(|e| format!("Failed to query api keys: {}", e))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(|e| format!("Failed to parse api key row: {}", e))?);
        }
        Ok(keys)
    }

    pub fn delete_api_key(&self, id: i64) -> Result<bool, String> {
        let conn = self.connect()?;
        let changed = conn
            .execute("DELETE FROM api_keys WHERE id = ?1", params![id])
            .map_err(|e| format!("Failed to delete api key: {}", e))?;
        Ok(changed > 0)
    }

    pub fn touch_api_key(&self, id: i64, at_ms: i64) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            params![at_ms, id],
        )
        .map_err(|e| format!("Failed to touch api key: {}", e))?;
        Ok(())
    }

    // ---- request logs ----

    pub fn insert_request_log(&self, log: &RequestLog) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO request_logs (
                request_id, account_id, api_key_id, model,
                prompt_tokens, completion_tokens, total_tokens, thinking_tokens,
                status, latency_ms, error_message,
                attempt_no, account_attempt, same_retry, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                log.request_id,
                log.account_id,
                log.api_key_id,
                log.model,
                log.usage.prompt_tokens,
                log.usage.completion_tokens,
                log.usage.total_tokens,
                log.usage.thinking_tokens,
                log.status,
                log.latency_ms,
                log.error_message,
                log.attempt_no,
                log.account_attempt,
                log.same_retry,
                log.created_at,
            ],
        )
        .map_err(|e| format!("Failed to insert request log: {}", e))?;
        Ok(())
    }

    pub fn recent_request_logs(&self, limit: usize) -> Result<Vec<RequestLog>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM request_logs ORDER BY id DESC LIMIT ?1")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_request_log)
            .map_err(|e| format!("Failed to query request logs: {}", e))?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.map_err(|e| format!("Failed to parse request log row: {}", e))?);
        }
        Ok(logs)
    }

    // ---- model mappings ----

    pub fn upsert_model_mapping(&self, alias: &str, target: &str) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO model_mappings (alias, target, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(alias) DO UPDATE SET target = excluded.target",
            params![alias, target, now_ms()],
        )
        .map_err(|e| format!("Failed to upsert model mapping: {}", e))?;
        Ok(())
    }

    pub fn list_model_mappings(&self) -> Result<Vec<(String, String)>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT alias, target FROM model_mappings ORDER BY alias ASC")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| format!("Failed to query model mappings: {}", e))?;
        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row.map_err(|e| format!("Failed to parse mapping row: {}", e))?);
        }
        Ok(mappings)
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let status: String = row.get("status")?;
    Ok(Account {
        id: row.get("id")?,
        email: row.get("email")?,
        refresh_token: row.get("refresh_token")?,
        access_token: row.get("access_token")?,
        access_token_expires_at: row.get("access_token_expires_at")?,
        project_id: row.get("project_id")?,
        tier: row.get("tier")?,
        status: AccountStatus::parse(&status),
        error_count: row.get("error_count")?,
        last_used_at: row.get("last_used_at")?,
        last_error_at: row.get("last_error_at")?,
        last_error_message: row.get("last_error_message")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_api_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get("id")?,
        token: row.get("token")?,
        label: row.get("label")?,
        enabled: row.get("enabled")?,
        created_at: row.get("created_at")?,
        last_used_at: row.get("last_used_at")?,
    })
}

fn row_to_request_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestLog> {
    Ok(RequestLog {
        request_id: row.get("request_id")?,
        account_id: row.get("account_id")?,
        api_key_id: row.get("api_key_id")?,
        model: row.get("model")?,
        usage: UsageTokens {
            prompt_tokens: row.get("prompt_tokens")?,
            completion_tokens: row.get("completion_tokens")?,
            total_tokens: row.get("total_tokens")?,
            thinking_tokens: row.get("thinking_tokens")?,
        },
        status: row.get("status")?,
        latency_ms: row.get("latency_ms")?,
        error_message: row.get("error_message")?,
        attempt_no: row.get("attempt_no")?,
        account_attempt: row.get("account_attempt")?,
        same_retry: row.get("same_retry")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
pub(crate) fn test_store(tag: &str) -> Store {
    let dir = std::env::temp_dir().join(format!(
        "trestle-test-{}-{}-{}",
        tag,
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    Store::open(&dir).expect("open test store")
}
