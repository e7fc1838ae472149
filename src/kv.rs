//! Key-value store client
//!
//! Thin async wrapper over a multiplexed Redis connection, plus the two cache
//! combinators the repository layer builds on: read-through memoization and
//! invalidate-before-write. All cross-task coordination in the relay (worker
//! status slots, retry lists, repository caches) flows through this client;
//! workers never share mutable memory.

use std::future::Future;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{AppError, AppResult};

/// Key templates for every slot the relay touches
///
/// Kept in one place so the control API, the workers, and the retry job can
/// never drift apart on naming.
pub mod keys {
    pub const ACTIVE_USERS: &str = "active_users";
    pub const EMAIL_SERVICES: &str = "email_services";

    pub fn bot_user(telegram_id: i64) -> String {
        format!("bot_user_{telegram_id}")
    }

    pub fn bot_user_exists(telegram_id: i64) -> String {
        format!("bot_user_exists_{telegram_id}")
    }

    pub fn email_service(service_id: i64) -> String {
        format!("email_service_{service_id}")
    }

    pub fn email_box(box_id: i64) -> String {
        format!("email_box_{box_id}")
    }

    pub fn user_email_boxes(telegram_id: i64) -> String {
        format!("bot_user_{telegram_id}_email_boxes")
    }

    pub fn box_filters(box_id: i64) -> String {
        format!("box_filters_{box_id}")
    }

    pub fn worker_status(telegram_id: i64, box_id: i64) -> String {
        format!("imap_client_status_{telegram_id}_{box_id}")
    }

    pub fn failed_emails(telegram_id: i64) -> String {
        format!("telegram_id_{telegram_id}_failed_emails")
    }

    pub fn failed_photos(telegram_id: i64) -> String {
        format!("telegram_id_{telegram_id}_failed_photos")
    }

    pub const FAILED_EMAILS_PATTERN: &str = "telegram_id_*_failed_emails";
    pub const FAILED_PHOTOS_PATTERN: &str = "telegram_id_*_failed_photos";
}

/// Shared key-value store handle
///
/// `ConnectionManager` multiplexes one TCP connection and reconnects on
/// failure; cloning the handle is cheap and every task owns its own clone.
#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    /// Connect and build the multiplexed manager
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    /// Set a value, optionally bounded by a TTL in seconds
    pub async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(seconds) => {
                let _: () = conn.set_ex(key, value, seconds).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    /// Prepend a value to the list at `key`
    pub async fn lpush(&self, key: &str, value: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    /// Pop the head of the list at `key`
    pub async fn lpop(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lpop(key, None).await?)
    }

    /// Read the whole list at `key`, head first
    pub async fn lrange(&self, key: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    /// Remove the first occurrence of `value` from the list at `key`
    #[allow(dead_code)] // retention policy for non-head retries is still open
    pub async fn lrem(&self, key: &str, value: &str) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.lrem(key, 1, value).await?)
    }

    /// Collect all keys matching a glob pattern
    pub async fn scan(&self, pattern: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Reset the TTL of an existing key, in seconds
    pub async fn touch(&self, key: &str, ttl: u64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl as i64).await?;
        Ok(())
    }

    /// Read-through memoization
    ///
    /// Returns the cached JSON value under `key` if present, otherwise runs
    /// `producer`, stores its result with the given TTL, and returns it. A
    /// cache entry that no longer deserializes (schema drift) is treated as a
    /// miss and overwritten.
    pub async fn cached<T, F, Fut>(&self, key: &str, ttl: u64, producer: F) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if let Some(raw) = self.get(key).await?
            && let Ok(value) = serde_json::from_str(&raw)
        {
            return Ok(value);
        }
        let value = producer().await?;
        let raw = serde_json::to_string(&value)
            .map_err(|e| AppError::internal(format!("cache serialization failed: {e}")))?;
        self.set(key, &raw, Some(ttl)).await?;
        Ok(value)
    }

    /// Delete the given keys, then run `producer`
    ///
    /// Write paths wrap their statements in this so stale reads cannot
    /// outlive the write.
    pub async fn invalidating<T, F, Fut>(&self, stale: &[String], producer: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        for key in stale {
            self.delete(key).await?;
        }
        producer().await
    }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn key_templates_interpolate_ids() {
        assert_eq!(keys::bot_user(42), "bot_user_42");
        assert_eq!(keys::bot_user_exists(42), "bot_user_exists_42");
        assert_eq!(keys::email_service(3), "email_service_3");
        assert_eq!(keys::email_box(7), "email_box_7");
        assert_eq!(keys::user_email_boxes(42), "bot_user_42_email_boxes");
        assert_eq!(keys::box_filters(7), "box_filters_7");
        assert_eq!(keys::worker_status(42, 7), "imap_client_status_42_7");
        assert_eq!(keys::failed_emails(42), "telegram_id_42_failed_emails");
        assert_eq!(keys::failed_photos(42), "telegram_id_42_failed_photos");
    }

    #[test]
    fn retry_list_keys_match_their_scan_patterns() {
        fn glob_matches(pattern: &str, key: &str) -> bool {
            let (prefix, suffix) = pattern.split_once('*').expect("single wildcard");
            key.starts_with(prefix) && key.ends_with(suffix)
        }
        assert!(glob_matches(
            keys::FAILED_EMAILS_PATTERN,
            &keys::failed_emails(42)
        ));
        assert!(glob_matches(
            keys::FAILED_PHOTOS_PATTERN,
            &keys::failed_photos(42)
        ));
        assert!(!glob_matches(
            keys::FAILED_PHOTOS_PATTERN,
            &keys::failed_emails(42)
        ));
    }
}
