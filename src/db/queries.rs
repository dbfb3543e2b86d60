use anyhow::Result;
use sqlx::SqlitePool;

use super::models::{DeviceCapabilities, Setting};

/// Settings key the capability record is stored under.
pub const CAPABILITIES_KEY: &str = "/deviceCapabilities.json";

// ─── Settings queries ─────────────────────────────────────────────────────────

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row = sqlx::query_as::<_, Setting>("SELECT * FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|s| s.value))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Returns whether a row was removed.
pub async fn delete_setting(pool: &SqlitePool, key: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ─── Capability queries ───────────────────────────────────────────────────────

pub async fn save_capabilities(pool: &SqlitePool, caps: &DeviceCapabilities) -> Result<()> {
    let json = serde_json::to_string(caps)?;
    set_setting(pool, CAPABILITIES_KEY, &json).await
}

/// Missing, unreadable or malformed records all come back as `None`.
pub async fn load_capabilities(pool: &SqlitePool) -> Option<DeviceCapabilities> {
    let raw = match get_setting(pool, CAPABILITIES_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!("Could not read device capabilities: {}", e);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(caps) => Some(caps),
        Err(e) => {
            tracing::warn!("Ignoring malformed device capabilities record: {}", e);
            None
        }
    }
}

pub async fn clear_capabilities(pool: &SqlitePool) -> Result<bool> {
    delete_setting(pool, CAPABILITIES_KEY).await
}
