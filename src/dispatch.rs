//! Telegram delivery with retry-list capture
//!
//! Sends rendered messages to the Bot API. Any non-OK response (or transport
//! failure) is captured as a self-contained payload in the owner's retry
//! list with a 24 h TTL; delivery failures never propagate to the worker or
//! the control API.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use tracing::warn;

use crate::config::Config;
use crate::decoder::{self, DecodedEmail};
use crate::errors::AppResult;
use crate::kv::{KvStore, keys};
use crate::models::{FailedPhoto, FailedText, PhotoTarget};
use crate::render;

/// Longest text message forwarded before truncation
pub const MAX_MESSAGE_LENGTH: usize = 1_000;
/// Lifetime of a retry list after its latest append
pub const RETRY_TTL_SECONDS: u64 = 86_400;

/// Outbound delivery handle
///
/// Cheap to clone; every worker and the retry job share the same underlying
/// HTTP connection pool.
#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    kv: KvStore,
    send_message_url: String,
    send_photo_url: String,
    renderer_bin: String,
}

impl Dispatcher {
    pub fn new(config: &Config, kv: KvStore) -> Self {
        Self {
            http: reqwest::Client::new(),
            kv,
            send_message_url: config.telegram_send_message_url(),
            send_photo_url: config.telegram_send_photo_url(),
            renderer_bin: config.renderer_bin.clone(),
        }
    }

    /// Render and deliver a decoded message to its owner's chat
    ///
    /// The photo path is primary; when rasterization itself fails the message
    /// still goes out through the text path.
    pub async fn deliver_email(&self, chat_id: i64, email: &DecodedEmail) -> AppResult<()> {
        let html = decoder::render_email_html(email);
        match render::rasterize_html(&self.renderer_bin, &html).await {
            Ok(png) => self.send_photo(chat_id, png).await,
            Err(e) => {
                warn!(chat_id, error = %e, "rasterization failed, falling back to text");
                self.send_text(chat_id, format_message(email)).await
            }
        }
    }

    /// POST a PNG to `sendPhoto`; capture failures in the photo retry list
    pub async fn send_photo(&self, chat_id: i64, png: Vec<u8>) -> AppResult<()> {
        if self.try_send_photo(chat_id, png.clone()).await {
            return Ok(());
        }
        let payload = FailedPhoto {
            data: PhotoTarget { chat_id },
            image: BASE64.encode(&png),
        };
        let raw = serde_json::to_string(&payload)
            .map_err(|e| crate::errors::AppError::internal(format!("payload encoding: {e}")))?;
        let key = keys::failed_photos(chat_id);
        self.kv.lpush(&key, &raw).await?;
        self.kv.touch(&key, RETRY_TTL_SECONDS).await?;
        warn!(chat_id, "photo delivery failed, queued for retry");
        Ok(())
    }

    /// POST text to `sendMessage`; capture failures in the text retry list
    pub async fn send_text(&self, chat_id: i64, text: String) -> AppResult<()> {
        let payload = FailedText {
            chat_id,
            text: truncate_message(text),
        };
        if self.try_send_text(&payload).await {
            return Ok(());
        }
        let raw = serde_json::to_string(&payload)
            .map_err(|e| crate::errors::AppError::internal(format!("payload encoding: {e}")))?;
        let key = keys::failed_emails(chat_id);
        self.kv.lpush(&key, &raw).await?;
        self.kv.touch(&key, RETRY_TTL_SECONDS).await?;
        warn!(chat_id, "text delivery failed, queued for retry");
        Ok(())
    }

    /// One delivery attempt for a text payload, no capture
    ///
    /// Used directly by the retry drain, which advances the list itself.
    pub async fn try_send_text(&self, payload: &FailedText) -> bool {
        let response = self
            .http
            .post(&self.send_message_url)
            .form(payload)
            .send()
            .await;
        matches!(response, Ok(r) if r.status() == StatusCode::OK)
    }

    /// One delivery attempt for a photo, no capture
    pub async fn try_send_photo(&self, chat_id: i64, png: Vec<u8>) -> bool {
        let part = match Part::bytes(png).file_name("email.png").mime_str("image/png") {
            Ok(part) => part,
            Err(_) => return false,
        };
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);
        let response = self
            .http
            .post(&self.send_photo_url)
            .multipart(form)
            .send()
            .await;
        matches!(response, Ok(r) if r.status() == StatusCode::OK)
    }
}

/// Format the text-path rendition of a decoded message
pub fn format_message(email: &DecodedEmail) -> String {
    format!(
        "Subject: {}\nFrom: {}\nTo: {}\nDate: {}\nBody: {}",
        email.subject, email.from, email.to, email.date, email.body.text_body
    )
}

/// Truncate a message to [`MAX_MESSAGE_LENGTH`] characters
fn truncate_message(text: String) -> String {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return text;
    }
    let mut truncated: String = text.chars().take(MAX_MESSAGE_LENGTH).collect();
    truncated.push_str("... (truncated)");
    truncated
}

#[cfg(test)]
mod tests {
    use super::{MAX_MESSAGE_LENGTH, format_message, truncate_message};
    use crate::decoder::{DecodedBody, DecodedEmail};

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(truncate_message("hello".to_owned()), "hello");
    }

    #[test]
    fn long_messages_are_cut_with_a_marker() {
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 50);
        let truncated = truncate_message(long);
        assert_eq!(
            truncated.chars().count(),
            MAX_MESSAGE_LENGTH + "... (truncated)".len()
        );
        assert!(truncated.ends_with("... (truncated)"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let long = "ы".repeat(MAX_MESSAGE_LENGTH + 1);
        let truncated = truncate_message(long);
        assert!(truncated.ends_with("... (truncated)"));
        assert_eq!(
            truncated.chars().count(),
            MAX_MESSAGE_LENGTH + "... (truncated)".len()
        );
    }

    #[test]
    fn formatted_message_lists_headers_then_body() {
        let email = DecodedEmail {
            subject: "Hi".to_owned(),
            from: "a@b.c".to_owned(),
            to: "d@e.f".to_owned(),
            date: "Wed, 1 Jan 2025 00:00:00 +0000".to_owned(),
            body: DecodedBody {
                text_body: "hello".to_owned(),
                html_body: String::new(),
                attachment_names: Vec::new(),
            },
        };
        assert_eq!(
            format_message(&email),
            "Subject: Hi\nFrom: a@b.c\nTo: d@e.f\nDate: Wed, 1 Jan 2025 00:00:00 +0000\nBody: hello"
        );
    }
}
