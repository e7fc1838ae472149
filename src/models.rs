//! Persistent rows and control-API DTOs
//!
//! Row structs derive `FromRow` for sqlx and `Serialize`/`Deserialize` so the
//! repository layer can memoize them in the key-value store as JSON. Output
//! DTOs strip the credential column; the ciphertext never leaves the process
//! through the API.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A chat user, keyed by their opaque Telegram id
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BotUser {
    pub telegram_id: i64,
    /// Gates whether the user's mailboxes are restarted on process boot
    pub is_active: bool,
}

/// An IMAP endpoint descriptor
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailService {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub address: String,
    pub port: i32,
}

/// A tracked mailbox
///
/// `email_password` holds ciphertext; decryption happens only inside the
/// supervisor's probe path and the worker constructor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailBox {
    pub id: i64,
    pub user_id: i64,
    pub email_service_id: i64,
    pub email_username: String,
    pub email_password: String,
    pub is_active: bool,
}

/// An allowed-sender entry for a mailbox
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BoxFilter {
    pub id: i64,
    pub box_id: i64,
    pub filter_value: String,
    pub filter_name: Option<String>,
}

/// Body of `POST /users`
#[derive(Debug, Deserialize)]
pub struct BotUserIn {
    pub telegram_id: i64,
}

/// Filter entry submitted alongside a new mailbox
#[derive(Debug, Clone, Deserialize)]
pub struct BoxFilterIn {
    pub filter_value: String,
    pub filter_name: Option<String>,
}

/// Body of `POST /users/{telegram_id}/boxes`
///
/// `email_password` arrives as ciphertext produced by the caller's
/// [`crate::crypto::CredentialCipher`].
#[derive(Debug, Deserialize)]
pub struct EmailBoxIn {
    pub email_service: i64,
    pub email_username: String,
    pub email_password: String,
    #[serde(default)]
    pub filters: Vec<BoxFilterIn>,
}

/// Service entry in `GET /services`
#[derive(Debug, Serialize)]
pub struct EmailServiceOut {
    pub id: i64,
    pub title: String,
}

impl From<EmailService> for EmailServiceOut {
    fn from(service: EmailService) -> Self {
        Self {
            id: service.id,
            title: service.title,
        }
    }
}

/// Mailbox entry in list responses, without credentials
#[derive(Debug, Serialize)]
pub struct EmailBoxOut {
    pub id: i64,
    pub email_service: i64,
    pub email_username: String,
    pub is_active: bool,
}

impl From<EmailBox> for EmailBoxOut {
    fn from(email_box: EmailBox) -> Self {
        Self {
            id: email_box.id,
            email_service: email_box.email_service_id,
            email_username: email_box.email_username,
            is_active: email_box.is_active,
        }
    }
}

/// Filter entry in box detail responses
#[derive(Debug, Serialize)]
pub struct BoxFilterOut {
    pub filter_value: String,
    pub filter_name: Option<String>,
}

impl From<BoxFilter> for BoxFilterOut {
    fn from(filter: BoxFilter) -> Self {
        Self {
            filter_value: filter.filter_value,
            filter_name: filter.filter_name,
        }
    }
}

/// Response of `GET /users/{telegram_id}/boxes`
#[derive(Debug, Serialize)]
pub struct EmailBoxesOut {
    pub email_boxes: Vec<EmailBoxOut>,
}

/// Response of `GET /users/{telegram_id}/boxes/{box_id}`
#[derive(Debug, Serialize)]
pub struct EmailBoxWithFiltersOut {
    pub id: i64,
    pub email_service_id: i64,
    pub email_username: String,
    pub is_active: bool,
    pub filters: Vec<BoxFilterOut>,
}

/// Response of `GET /users/{telegram_id}/boxes/{box_id}/filters`
#[derive(Debug, Serialize)]
pub struct BoxFiltersOut {
    pub filters: Vec<BoxFilterOut>,
}

/// Response of `GET /services`
#[derive(Debug, Serialize)]
pub struct EmailServicesOut {
    pub services: Vec<EmailServiceOut>,
}

/// Plain `{"message": ...}` envelope for status responses
#[derive(Debug, Serialize)]
pub struct ResponseMessage {
    pub message: String,
}

impl ResponseMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Undelivered text payload, stored verbatim in a retry list
///
/// The field layout doubles as the `sendMessage` form body, so the retry
/// worker re-posts items without reshaping them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedText {
    pub chat_id: i64,
    pub text: String,
}

/// Chat-id half of an undelivered photo payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoTarget {
    pub chat_id: i64,
}

/// Undelivered photo payload: target plus base64-encoded PNG bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPhoto {
    pub data: PhotoTarget,
    pub image: String,
}

#[cfg(test)]
mod tests {
    use super::{EmailBox, EmailBoxOut, FailedPhoto, FailedText, PhotoTarget};

    #[test]
    fn box_output_drops_the_credential_column() {
        let row = EmailBox {
            id: 7,
            user_id: 42,
            email_service_id: 1,
            email_username: "u@x.y".to_owned(),
            email_password: "ciphertext".to_owned(),
            is_active: true,
        };
        let out = EmailBoxOut::from(row);
        let json = serde_json::to_value(&out).expect("serialize");
        assert!(json.get("email_password").is_none());
        assert_eq!(json["email_service"], 1);
    }

    #[test]
    fn retry_payloads_keep_their_wire_shape() {
        let text = FailedText {
            chat_id: 42,
            text: "Subject: hi".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&text).expect("serialize"),
            r#"{"chat_id":42,"text":"Subject: hi"}"#
        );

        let photo = FailedPhoto {
            data: PhotoTarget { chat_id: 42 },
            image: "aGVsbG8=".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&photo).expect("serialize"),
            r#"{"data":{"chat_id":42},"image":"aGVsbG8="}"#
        );
    }
}
