//! Periodic retry-queue drain
//!
//! A single scheduled task re-sends what the dispatch paths could not
//! deliver. Each tick scans both list families, attempts every item in list
//! order, and pops one head element per successful send. Delivery is
//! at-least-once; the chat endpoint tolerates duplicates.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::errors::AppResult;
use crate::kv::{KvStore, keys};
use crate::models::{FailedPhoto, FailedText};

/// Run the drain loop forever
pub async fn run(dispatcher: Dispatcher, kv: KvStore, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = drain_failed_texts(&dispatcher, &kv).await {
            warn!(error = %e, "text retry drain failed");
        }
        if let Err(e) = drain_failed_photos(&dispatcher, &kv).await {
            warn!(error = %e, "photo retry drain failed");
        }
    }
}

/// Re-send every queued text payload, advancing one head per success
async fn drain_failed_texts(dispatcher: &Dispatcher, kv: &KvStore) -> AppResult<()> {
    for key in kv.scan(keys::FAILED_EMAILS_PATTERN).await? {
        for item in kv.lrange(&key).await? {
            let Ok(payload) = serde_json::from_str::<FailedText>(&item) else {
                warn!(key = %key, "dropping unparseable retry item");
                kv.lpop(&key).await?;
                continue;
            };
            if dispatcher.try_send_text(&payload).await {
                kv.lpop(&key).await?;
                debug!(key = %key, chat_id = payload.chat_id, "re-sent queued text");
            }
        }
    }
    Ok(())
}

/// Re-send every queued photo payload, advancing one head per success
async fn drain_failed_photos(dispatcher: &Dispatcher, kv: &KvStore) -> AppResult<()> {
    for key in kv.scan(keys::FAILED_PHOTOS_PATTERN).await? {
        for item in kv.lrange(&key).await? {
            let Ok(payload) = serde_json::from_str::<FailedPhoto>(&item) else {
                warn!(key = %key, "dropping unparseable retry item");
                kv.lpop(&key).await?;
                continue;
            };
            let Ok(png) = BASE64.decode(&payload.image) else {
                warn!(key = %key, "dropping retry item with invalid image encoding");
                kv.lpop(&key).await?;
                continue;
            };
            if dispatcher.try_send_photo(payload.data.chat_id, png).await {
                kv.lpop(&key).await?;
                debug!(key = %key, chat_id = payload.data.chat_id, "re-sent queued photo");
            }
        }
    }
    Ok(())
}
