//! Per-mailbox worker status slot
//!
//! Each `(telegram_id, box_id)` pair owns a single string slot in the
//! key-value store. The control API writes it to steer the worker; the worker
//! reads it at every loop head and writes it only for its own startup state
//! and cleanup. Transition legality is enforced by those callers, not here.

use crate::errors::AppResult;
use crate::kv::{KvStore, keys};

/// Lifecycle state of one mailbox worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Active,
    Paused,
    Stopped,
}

impl WorkerStatus {
    /// Canonical wire string stored in the slot
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    /// Parse the wire string; anything unrecognized is `None`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Status slot handle pinned to one mailbox
#[derive(Clone)]
pub struct StatusRegistry {
    kv: KvStore,
    key: String,
}

impl StatusRegistry {
    pub fn new(kv: KvStore, telegram_id: i64, box_id: i64) -> Self {
        Self {
            kv,
            key: keys::worker_status(telegram_id, box_id),
        }
    }

    pub async fn set(&self, status: WorkerStatus) -> AppResult<()> {
        self.kv.set(&self.key, status.as_str(), None).await
    }

    /// Current slot value; a missing or unparseable slot reads as `None`
    pub async fn get(&self) -> AppResult<Option<WorkerStatus>> {
        Ok(self
            .kv
            .get(&self.key)
            .await?
            .as_deref()
            .and_then(WorkerStatus::parse))
    }

    pub async fn remove(&self) -> AppResult<()> {
        self.kv.delete(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerStatus;

    #[test]
    fn wire_strings_round_trip() {
        for status in [
            WorkerStatus::Active,
            WorkerStatus::Paused,
            WorkerStatus::Stopped,
        ] {
            assert_eq!(WorkerStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_strings_parse_to_none() {
        assert_eq!(WorkerStatus::parse(""), None);
        assert_eq!(WorkerStatus::parse("ACTIVE"), None);
        assert_eq!(WorkerStatus::parse("running"), None);
    }
}
