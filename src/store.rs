//! Repositories over the persistent store
//!
//! Runtime-checked sqlx queries wrapped in the KV cache combinators: reads
//! are memoized under the stable key templates, writes delete the affected
//! keys before touching the database. Constraint violations surface as the
//! domain errors the control API maps to responses.

use sqlx::PgPool;

use crate::errors::{AppError, AppResult};
use crate::kv::{KvStore, keys};
use crate::models::{BotUser, BoxFilter, BoxFilterIn, EmailBox, EmailService};

/// Shared repository handle
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    kv: KvStore,
    cache_ttl: u64,
}

impl Store {
    pub fn new(pool: PgPool, kv: KvStore, cache_ttl: u64) -> Self {
        Self {
            pool,
            kv,
            cache_ttl,
        }
    }

    /// Create a bot user
    ///
    /// # Errors
    ///
    /// `UserAlreadyExists` when the primary key is taken.
    pub async fn create_user(&self, telegram_id: i64) -> AppResult<BotUser> {
        let stale = [
            keys::bot_user(telegram_id),
            keys::ACTIVE_USERS.to_owned(),
            keys::bot_user_exists(telegram_id),
        ];
        self.kv
            .invalidating(&stale, || async {
                sqlx::query_as::<_, BotUser>(
                    "INSERT INTO bot_user (telegram_id, is_active) VALUES ($1, TRUE) \
                     RETURNING telegram_id, is_active",
                )
                .bind(telegram_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        AppError::UserAlreadyExists
                    } else {
                        e.into()
                    }
                })
            })
            .await
    }

    pub async fn get_user(&self, telegram_id: i64) -> AppResult<BotUser> {
        self.kv
            .cached(&keys::bot_user(telegram_id), self.cache_ttl, || async {
                sqlx::query_as::<_, BotUser>(
                    "SELECT telegram_id, is_active FROM bot_user WHERE telegram_id = $1",
                )
                .bind(telegram_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(AppError::UserNotFound(telegram_id))
            })
            .await
    }

    pub async fn user_exists(&self, telegram_id: i64) -> AppResult<bool> {
        self.kv
            .cached(
                &keys::bot_user_exists(telegram_id),
                self.cache_ttl,
                || async {
                    let count: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM bot_user WHERE telegram_id = $1",
                    )
                    .bind(telegram_id)
                    .fetch_one(&self.pool)
                    .await?;
                    Ok(count > 0)
                },
            )
            .await
    }

    /// Users whose mailboxes are restarted on process boot
    pub async fn active_users(&self) -> AppResult<Vec<BotUser>> {
        self.kv
            .cached(keys::ACTIVE_USERS, self.cache_ttl, || async {
                Ok(sqlx::query_as::<_, BotUser>(
                    "SELECT telegram_id, is_active FROM bot_user WHERE is_active = TRUE",
                )
                .fetch_all(&self.pool)
                .await?)
            })
            .await
    }

    pub async fn get_service(&self, service_id: i64) -> AppResult<EmailService> {
        self.kv
            .cached(&keys::email_service(service_id), self.cache_ttl, || async {
                sqlx::query_as::<_, EmailService>(
                    "SELECT id, title, slug, address, port FROM email_service WHERE id = $1",
                )
                .bind(service_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(AppError::ServiceNotFound(service_id))
            })
            .await
    }

    pub async fn list_services(&self) -> AppResult<Vec<EmailService>> {
        self.kv
            .cached(keys::EMAIL_SERVICES, self.cache_ttl, || async {
                Ok(sqlx::query_as::<_, EmailService>(
                    "SELECT id, title, slug, address, port FROM email_service ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?)
            })
            .await
    }

    /// Create a mailbox with its submitted ciphertext credential
    ///
    /// # Errors
    ///
    /// `BoxAlreadyExists` when `(user, login, service)` is taken.
    pub async fn create_box(
        &self,
        telegram_id: i64,
        service_id: i64,
        email_username: &str,
        email_password: &str,
    ) -> AppResult<EmailBox> {
        let stale = [keys::user_email_boxes(telegram_id)];
        self.kv
            .invalidating(&stale, || async {
                sqlx::query_as::<_, EmailBox>(
                    "INSERT INTO email_box \
                     (user_id, email_service_id, email_username, email_password, is_active) \
                     VALUES ($1, $2, $3, $4, TRUE) \
                     RETURNING id, user_id, email_service_id, email_username, email_password, is_active",
                )
                .bind(telegram_id)
                .bind(service_id)
                .bind(email_username)
                .bind(email_password)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        AppError::BoxAlreadyExists
                    } else {
                        e.into()
                    }
                })
            })
            .await
    }

    pub async fn get_box(&self, box_id: i64) -> AppResult<EmailBox> {
        self.kv
            .cached(&keys::email_box(box_id), self.cache_ttl, || async {
                sqlx::query_as::<_, EmailBox>(
                    "SELECT id, user_id, email_service_id, email_username, email_password, is_active \
                     FROM email_box WHERE id = $1",
                )
                .bind(box_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(AppError::BoxNotFound(box_id))
            })
            .await
    }

    pub async fn user_boxes(&self, telegram_id: i64) -> AppResult<Vec<EmailBox>> {
        self.kv
            .cached(
                &keys::user_email_boxes(telegram_id),
                self.cache_ttl,
                || async {
                    Ok(sqlx::query_as::<_, EmailBox>(
                        "SELECT id, user_id, email_service_id, email_username, email_password, is_active \
                         FROM email_box WHERE user_id = $1 ORDER BY id",
                    )
                    .bind(telegram_id)
                    .fetch_all(&self.pool)
                    .await?)
                },
            )
            .await
    }

    pub async fn delete_box(&self, box_id: i64, telegram_id: i64) -> AppResult<()> {
        let stale = [keys::user_email_boxes(telegram_id), keys::email_box(box_id)];
        self.kv
            .invalidating(&stale, || async {
                sqlx::query("DELETE FROM email_box WHERE id = $1")
                    .bind(box_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            })
            .await
    }

    /// Flip the `is_active` flag (pause/resume persistence half)
    pub async fn set_box_active(
        &self,
        box_id: i64,
        telegram_id: i64,
        active: bool,
    ) -> AppResult<()> {
        let stale = [keys::user_email_boxes(telegram_id), keys::email_box(box_id)];
        self.kv
            .invalidating(&stale, || async {
                sqlx::query("UPDATE email_box SET is_active = $2 WHERE id = $1")
                    .bind(box_id)
                    .bind(active)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            })
            .await
    }

    /// Attach allowed-sender filters to a mailbox
    pub async fn create_filters(
        &self,
        box_id: i64,
        filters: &[BoxFilterIn],
    ) -> AppResult<Vec<BoxFilter>> {
        let stale = [keys::box_filters(box_id)];
        self.kv
            .invalidating(&stale, || async {
                let mut created = Vec::with_capacity(filters.len());
                for filter in filters {
                    let row = sqlx::query_as::<_, BoxFilter>(
                        "INSERT INTO box_filter (box_id, filter_value, filter_name) \
                         VALUES ($1, $2, $3) \
                         RETURNING id, box_id, filter_value, filter_name",
                    )
                    .bind(box_id)
                    .bind(&filter.filter_value)
                    .bind(&filter.filter_name)
                    .fetch_one(&self.pool)
                    .await?;
                    created.push(row);
                }
                Ok(created)
            })
            .await
    }

    pub async fn box_filters(&self, box_id: i64) -> AppResult<Vec<BoxFilter>> {
        self.kv
            .cached(&keys::box_filters(box_id), self.cache_ttl, || async {
                Ok(sqlx::query_as::<_, BoxFilter>(
                    "SELECT id, box_id, filter_value, filter_name \
                     FROM box_filter WHERE box_id = $1 ORDER BY id",
                )
                .bind(box_id)
                .fetch_all(&self.pool)
                .await?)
            })
            .await
    }
}

/// Whether a sqlx error is a unique-constraint violation
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
