//! Per-mailbox IMAP worker
//!
//! One worker task per tracked mailbox. The loop reads the status slot at
//! every head: `paused` sleeps, `active` runs one IDLE cycle, `stopped` (or a
//! removed slot) exits after cleanup. New-message pushes are resolved to
//! UIDs, gated by the sender whitelist, decoded, and handed to dispatch.
//! Failures feed a bounded retry wrapper; exhaustion ends the task and the
//! supervisor relaunches it on the next process boot.

use std::collections::HashSet;
use std::time::Duration;

use async_imap::imap_proto::{AttributeValue, MailboxDatum, Response};
use mailparse::MailHeader;
use secrecy::SecretString;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::decoder::{self, RawEmail};
use crate::dispatch::Dispatcher;
use crate::errors::{AppError, AppResult};
use crate::imap::ConnectionManager;
use crate::kv::KvStore;
use crate::status::{StatusRegistry, WorkerStatus};

/// Sleep between status polls while paused
const PAUSE_POLL: Duration = Duration::from_secs(5);
/// Attempts before the worker gives up
const MAX_ATTEMPTS: u32 = 5;
/// Pause between attempts
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// What a single unsolicited server push means for the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushEvent {
    /// A new message arrived; carries its sequence number
    NewMessage(u32),
    /// A message was removed
    Expunged(u32),
    /// An existing message was marked `\Seen`
    Seen(u32),
    /// Anything else the server felt like sending
    Other,
}

/// Categorize one unsolicited response from an IDLE cycle
fn categorize_push(response: &Response<'_>) -> PushEvent {
    match response {
        Response::MailboxData(MailboxDatum::Exists(seq)) => PushEvent::NewMessage(*seq),
        Response::Expunge(seq) => PushEvent::Expunged(*seq),
        Response::Fetch(seq, attrs) if has_seen_flag(attrs) => PushEvent::Seen(*seq),
        _ => PushEvent::Other,
    }
}

fn has_seen_flag(attrs: &[AttributeValue<'_>]) -> bool {
    attrs.iter().any(|attr| {
        matches!(attr, AttributeValue::Flags(flags)
            if flags.iter().any(|f| f.as_ref().eq_ignore_ascii_case("\\Seen")))
    })
}

/// First value of a header, unfolded but otherwise raw
///
/// Raw bytes keep encoded words intact for the decoder stage; folding
/// whitespace collapses to single spaces.
fn header_value(headers: &[MailHeader<'_>], key: &str) -> String {
    headers
        .iter()
        .find(|h| h.get_key_ref().eq_ignore_ascii_case(key))
        .map(|h| {
            String::from_utf8_lossy(h.get_value_raw())
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// One mailbox listener
pub struct MailboxWorker {
    conn: ConnectionManager,
    status: StatusRegistry,
    dispatcher: Dispatcher,
    user: String,
    telegram_id: i64,
    box_id: i64,
    /// Allowed sender addresses; empty accepts everything
    whitelist: HashSet<String>,
    /// Same-session high-water mark, monotonically nondecreasing
    persistent_max_uid: u32,
    idle_timeout: Duration,
    done_timeout: Duration,
}

impl MailboxWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        kv: KvStore,
        dispatcher: Dispatcher,
        host: String,
        user: String,
        password: SecretString,
        telegram_id: i64,
        box_id: i64,
        whitelist: HashSet<String>,
    ) -> Self {
        let conn = ConnectionManager::new(
            host,
            user.clone(),
            password,
            Duration::from_millis(config.connect_timeout_ms),
        );
        Self {
            conn,
            status: StatusRegistry::new(kv, telegram_id, box_id),
            dispatcher,
            user,
            telegram_id,
            box_id,
            whitelist,
            persistent_max_uid: 1,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            done_timeout: Duration::from_millis(config.done_timeout_ms),
        }
    }

    /// Run the worker until it stops or exhausts its retries
    ///
    /// Each failed attempt waits [`RETRY_DELAY`] and re-enters the loop with
    /// the same initial status; after [`MAX_ATTEMPTS`] failures the task ends
    /// and the mailbox stays dark until the next process boot.
    pub async fn run(mut self, initial: WorkerStatus) {
        let mut attempts = 0;
        loop {
            match self.imap_loop(initial).await {
                Ok(()) => {
                    info!(user = %self.user, box_id = self.box_id, "worker stopped");
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    error!(
                        user = %self.user,
                        box_id = self.box_id,
                        attempt = attempts,
                        max = MAX_ATTEMPTS,
                        error = %e,
                        "worker attempt failed"
                    );
                    if attempts >= MAX_ATTEMPTS {
                        error!(user = %self.user, box_id = self.box_id, "max retries reached, exiting");
                        return;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// The status-driven main loop
    async fn imap_loop(&mut self, initial: WorkerStatus) -> AppResult<()> {
        self.status.set(initial).await?;
        self.conn.open().await?;
        loop {
            match self.status.get().await? {
                Some(WorkerStatus::Paused) => {
                    debug!(
                        user = %self.user,
                        box_id = self.box_id,
                        idle_pending = self.conn.is_idle_pending(),
                        "paused, awaiting active state"
                    );
                    tokio::time::sleep(PAUSE_POLL).await;
                }
                Some(WorkerStatus::Active) => self.handle_active_state().await?,
                // A removed slot means the mailbox is gone; treat it as stop.
                Some(WorkerStatus::Stopped) | None => break,
            }
        }
        self.status.remove().await?;
        self.conn.close().await?;
        Ok(())
    }

    /// One IDLE cycle plus processing of whatever it surfaced
    async fn handle_active_state(&mut self) -> AppResult<()> {
        let Some(push) = self
            .conn
            .idle_cycle(self.idle_timeout, self.done_timeout)
            .await?
        else {
            return Ok(());
        };
        match categorize_push(push.parsed()) {
            PushEvent::NewMessage(seq) => {
                info!(user = %self.user, box_id = self.box_id, seq, "new message");
                if let Some(uid) = self.conn.uid_from_sequence(seq).await? {
                    self.process_message(uid).await?;
                    info!(user = %self.user, box_id = self.box_id, uid, "processed email");
                }
            }
            PushEvent::Expunged(seq) => debug!(user = %self.user, seq, "message removed"),
            PushEvent::Seen(seq) => debug!(user = %self.user, seq, "message seen"),
            PushEvent::Other => debug!(user = %self.user, "unprocessed push message"),
        }
        Ok(())
    }

    /// Fetch, gate, decode, and dispatch one message
    async fn process_message(&mut self, uid: u32) -> AppResult<()> {
        let Some(header_bytes) = self.conn.fetch_headers(uid).await? else {
            warn!(user = %self.user, uid, "message vanished before header fetch");
            return Ok(());
        };
        let (headers, _) = mailparse::parse_headers(&header_bytes)
            .map_err(|e| AppError::Internal(format!("header parse failed: {e}")))?;
        let from = header_value(&headers, "From");

        if !self.whitelist.is_empty() {
            let sender = decoder::extract_sender_address(&from);
            let allowed = sender
                .as_deref()
                .is_some_and(|addr| self.whitelist.contains(addr));
            if !allowed {
                debug!(user = %self.user, uid, "sender not in whitelist, dropping");
                return Ok(());
            }
        }

        let Some(body) = self.conn.fetch_body(uid).await? else {
            warn!(user = %self.user, uid, "message vanished before body fetch");
            return Ok(());
        };
        let raw = RawEmail {
            subject: header_value(&headers, "Subject"),
            from,
            to: header_value(&headers, "To"),
            date: header_value(&headers, "Date"),
            body,
        };
        let decoded = decoder::decode_email(&raw);
        self.dispatcher
            .deliver_email(self.telegram_id, &decoded)
            .await?;
        self.persistent_max_uid = self.persistent_max_uid.max(uid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{PushEvent, categorize_push, has_seen_flag, header_value};
    use async_imap::imap_proto::{AttributeValue, MailboxDatum, Response, Status};
    use std::borrow::Cow;

    #[test]
    fn exists_push_yields_the_sequence_number() {
        let push = Response::MailboxData(MailboxDatum::Exists(17));
        assert_eq!(categorize_push(&push), PushEvent::NewMessage(17));
    }

    #[test]
    fn expunge_push_is_not_a_new_message() {
        let push = Response::Expunge(3);
        assert_eq!(categorize_push(&push), PushEvent::Expunged(3));
    }

    #[test]
    fn fetch_with_seen_flag_is_categorized_as_seen() {
        let push = Response::Fetch(5, vec![AttributeValue::Flags(vec![Cow::Borrowed("\\Seen")])]);
        assert_eq!(categorize_push(&push), PushEvent::Seen(5));

        let push = Response::Fetch(5, vec![AttributeValue::Flags(vec![Cow::Borrowed("\\Flagged")])]);
        assert_eq!(categorize_push(&push), PushEvent::Other);
    }

    #[test]
    fn unrelated_responses_fall_through_to_other() {
        let push = Response::MailboxData(MailboxDatum::Recent(2));
        assert_eq!(categorize_push(&push), PushEvent::Other);
        let push = Response::Data {
            status: Status::Ok,
            code: None,
            information: None,
        };
        assert_eq!(categorize_push(&push), PushEvent::Other);
    }

    #[test]
    fn seen_flag_matching_ignores_case_and_other_flags() {
        assert!(has_seen_flag(&[AttributeValue::Flags(vec![
            Cow::Borrowed("\\Answered"),
            Cow::Borrowed("\\seen"),
        ])]));
        assert!(!has_seen_flag(&[AttributeValue::Rfc822Size(100)]));
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_unfolds() {
        let raw = b"From: =?utf-8?Q?Alice?=\r\n <alice@example.com>\r\nSubject: Hi\r\n\r\n";
        let (headers, _) = mailparse::parse_headers(raw).expect("parse");
        assert_eq!(
            header_value(&headers, "from"),
            "=?utf-8?Q?Alice?= <alice@example.com>"
        );
        assert_eq!(header_value(&headers, "Subject"), "Hi");
        assert_eq!(header_value(&headers, "Cc"), "");
    }
}
