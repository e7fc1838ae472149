//! Worker lifecycle orchestration
//!
//! Converges running workers with the declared configuration: on process
//! boot it relaunches a worker per mailbox of every active user, and for
//! control-API requests it transitions the status slot and launches or
//! retires workers. All steering goes through the status slot in the KV
//! store, never through in-process handles.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tracing::info;

use crate::config::Config;
use crate::crypto::CredentialCipher;
use crate::dispatch::Dispatcher;
use crate::errors::{AppError, AppResult};
use crate::imap::ConnectionManager;
use crate::kv::KvStore;
use crate::models::{BoxFilter, EmailBox, EmailBoxIn};
use crate::status::{StatusRegistry, WorkerStatus};
use crate::store::Store;
use crate::worker::MailboxWorker;

/// Delay between worker launches, smoothing reconnect storms
const LAUNCH_STAGGER: Duration = Duration::from_secs(5);

/// Process-wide worker coordinator
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<Config>,
    store: Store,
    kv: KvStore,
    dispatcher: Dispatcher,
    cipher: CredentialCipher,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        kv: KvStore,
        dispatcher: Dispatcher,
        cipher: CredentialCipher,
    ) -> Self {
        Self {
            config,
            store,
            kv,
            dispatcher,
            cipher,
        }
    }

    /// Relaunch a worker per mailbox of every active user
    ///
    /// Called once on process startup. Mailboxes with `is_active = false`
    /// come up paused; their worker still holds the connection and waits for
    /// a resume.
    pub async fn restart_workers(&self) -> AppResult<()> {
        let users = self.store.active_users().await?;
        info!(users = users.len(), "restarting mailbox workers");
        for user in users {
            for email_box in self.store.user_boxes(user.telegram_id).await? {
                let service = self.store.get_service(email_box.email_service_id).await?;
                let filters = self.store.box_filters(email_box.id).await?;
                let password = self.cipher.decrypt_password(&email_box.email_password)?;
                let initial = if email_box.is_active {
                    WorkerStatus::Active
                } else {
                    WorkerStatus::Paused
                };
                tokio::time::sleep(LAUNCH_STAGGER).await;
                self.spawn_worker(
                    service.address.clone(),
                    &email_box,
                    password,
                    whitelist_of(&filters),
                    initial,
                );
            }
        }
        Ok(())
    }

    /// Create a mailbox: verify credentials, persist, launch its worker
    ///
    /// # Errors
    ///
    /// - `UserNotFound` / `ServiceNotFound` for dangling references
    /// - `CredentialsInvalid` when the probe LOGIN is rejected
    /// - `ServerTimeout` when the IMAP server does not answer the probe
    /// - `BoxAlreadyExists` on the uniqueness constraint
    pub async fn create_box(&self, telegram_id: i64, payload: EmailBoxIn) -> AppResult<EmailBox> {
        let user = self.store.get_user(telegram_id).await?;
        let service = self.store.get_service(payload.email_service).await?;
        let password = self.cipher.decrypt_password(&payload.email_password)?;

        let probe = ConnectionManager::new(
            service.address.clone(),
            payload.email_username.clone(),
            password.clone(),
            Duration::from_millis(self.config.connect_timeout_ms),
        );
        if !probe.probe().await? {
            return Err(AppError::CredentialsInvalid);
        }

        let email_box = self
            .store
            .create_box(
                user.telegram_id,
                service.id,
                &payload.email_username,
                &payload.email_password,
            )
            .await?;
        let filters = self.store.create_filters(email_box.id, &payload.filters).await?;
        self.spawn_worker(
            service.address.clone(),
            &email_box,
            password,
            whitelist_of(&filters),
            WorkerStatus::Active,
        );
        Ok(email_box)
    }

    /// Pause listening: persist the flag, flip the status slot
    pub async fn pause_box(&self, telegram_id: i64, box_id: i64) -> AppResult<()> {
        self.owned_box(telegram_id, box_id).await?;
        self.store.set_box_active(box_id, telegram_id, false).await?;
        self.registry(telegram_id, box_id)
            .set(WorkerStatus::Paused)
            .await?;
        info!(telegram_id, box_id, "box listening paused");
        Ok(())
    }

    /// Resume listening: persist the flag, flip the status slot
    pub async fn resume_box(&self, telegram_id: i64, box_id: i64) -> AppResult<()> {
        self.owned_box(telegram_id, box_id).await?;
        self.store.set_box_active(box_id, telegram_id, true).await?;
        self.registry(telegram_id, box_id)
            .set(WorkerStatus::Active)
            .await?;
        info!(telegram_id, box_id, "box listening resumed");
        Ok(())
    }

    /// Delete a mailbox
    ///
    /// The slot is stopped before the row is removed, so the worker observes
    /// `stopped` no later than the delete becomes visible.
    pub async fn delete_box(&self, telegram_id: i64, box_id: i64) -> AppResult<()> {
        self.owned_box(telegram_id, box_id).await?;
        self.registry(telegram_id, box_id)
            .set(WorkerStatus::Stopped)
            .await?;
        self.store.delete_box(box_id, telegram_id).await?;
        info!(telegram_id, box_id, "box deleted");
        Ok(())
    }

    /// Fetch a box after verifying ownership
    pub async fn owned_box(&self, telegram_id: i64, box_id: i64) -> AppResult<EmailBox> {
        let user = self.store.get_user(telegram_id).await?;
        let email_box = self.store.get_box(box_id).await?;
        if email_box.user_id != user.telegram_id {
            return Err(AppError::BoxNotOwnedByUser);
        }
        Ok(email_box)
    }

    fn registry(&self, telegram_id: i64, box_id: i64) -> StatusRegistry {
        StatusRegistry::new(self.kv.clone(), telegram_id, box_id)
    }

    fn spawn_worker(
        &self,
        host: String,
        email_box: &EmailBox,
        password: SecretString,
        whitelist: HashSet<String>,
        initial: WorkerStatus,
    ) {
        let worker = MailboxWorker::new(
            &self.config,
            self.kv.clone(),
            self.dispatcher.clone(),
            host,
            email_box.email_username.clone(),
            password,
            email_box.user_id,
            email_box.id,
            whitelist,
        );
        info!(
            user = %email_box.email_username,
            box_id = email_box.id,
            initial = initial.as_str(),
            "launching mailbox worker"
        );
        tokio::spawn(worker.run(initial));
    }
}

/// Whitelist value-object captured at worker start
fn whitelist_of(filters: &[BoxFilter]) -> HashSet<String> {
    filters.iter().map(|f| f.filter_value.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::whitelist_of;
    use crate::models::BoxFilter;

    #[test]
    fn whitelist_collects_distinct_filter_values() {
        let filters = vec![
            BoxFilter {
                id: 1,
                box_id: 7,
                filter_value: "a@b.c".to_owned(),
                filter_name: Some("work".to_owned()),
            },
            BoxFilter {
                id: 2,
                box_id: 7,
                filter_value: "a@b.c".to_owned(),
                filter_name: None,
            },
            BoxFilter {
                id: 3,
                box_id: 7,
                filter_value: "d@e.f".to_owned(),
                filter_name: None,
            },
        ];
        let whitelist = whitelist_of(&filters);
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.contains("a@b.c"));
        assert!(whitelist.contains("d@e.f"));
    }
}
