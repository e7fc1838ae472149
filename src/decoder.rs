//! Email decoding and canonical HTML rendering
//!
//! Takes the raw header values and RFC822 body a worker fetched and produces
//! the decoded form the dispatch stage renders: MIME words resolved, bodies
//! split into text/HTML, attachment names collected. Also owns sender
//! extraction for the whitelist gate.

use std::sync::LazyLock;

use mailparse::{DispositionType, ParsedMail};
use regex::Regex;

static EMAIL_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.\-]+@[\w.\-]+").expect("static regex"));

/// Header values and raw body as fetched from the IMAP server
#[derive(Debug, Clone)]
pub struct RawEmail {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    /// Full RFC822 message source
    pub body: Vec<u8>,
}

/// Body content split out of the MIME tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBody {
    pub text_body: String,
    /// Sanitized HTML, empty when the message carried none
    pub html_body: String,
    pub attachment_names: Vec<String>,
}

/// Fully decoded message ready for rendering
#[derive(Debug, Clone)]
pub struct DecodedEmail {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    pub body: DecodedBody,
}

/// Decode every field of a fetched message
pub fn decode_email(raw: &RawEmail) -> DecodedEmail {
    DecodedEmail {
        subject: decode_mime_words(&raw.subject),
        from: decode_address(&raw.from),
        to: decode_address(&raw.to),
        date: decode_mime_words(&raw.date),
        body: decode_body(&raw.body),
    }
}

/// Decode RFC 2047 encoded words in a header value
///
/// Chunks are concatenated using their declared charsets; a missing charset
/// falls back to ASCII. Values that fail to parse pass through unchanged.
pub fn decode_mime_words(raw: &str) -> String {
    let synthetic = format!("X-Decode: {raw}\n");
    match mailparse::parse_header(synthetic.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => raw.to_owned(),
    }
}

/// Decode an address header preserving the `Display Name <addr>` split
///
/// Only the display-name half carries encoded words; the angle-addr part is
/// reattached verbatim.
pub fn decode_address(raw: &str) -> String {
    match raw.split_once(" <") {
        Some((name, addr)) => {
            format!("{} <{}>", decode_mime_words(name), addr.trim_end_matches('>'))
        }
        None => decode_mime_words(raw),
    }
}

/// Extract the canonical sender address from a raw `From` header
///
/// MIME-decodes the header and returns the first thing shaped like an email
/// address, or `None`. This is the value the whitelist gate compares against.
pub fn extract_sender_address(raw_from: &str) -> Option<String> {
    let decoded = decode_mime_words(raw_from);
    EMAIL_ADDRESS
        .find(&decoded)
        .map(|m| m.as_str().to_owned())
}

/// Split an RFC822 body into text, HTML, and attachment names
///
/// Multipart messages are walked depth-first: the first `text/plain` and
/// first `text/html` non-attachment parts win, attachment filenames are
/// collected along the way. Single-part messages decode straight into
/// `text_body`. When only HTML is present, the text is derived by stripping
/// tags.
pub fn decode_body(raw: &[u8]) -> DecodedBody {
    let mut body = DecodedBody::default();
    let Ok(parsed) = mailparse::parse_mail(raw) else {
        return body;
    };

    let mut text = None;
    let mut html = None;
    if parsed.subparts.is_empty() {
        text = parsed.get_body().ok();
    } else {
        walk_parts(&parsed, &mut text, &mut html, &mut body.attachment_names);
    }

    body.text_body = text.unwrap_or_default();
    body.html_body = html.map(|h| ammonia::clean(&h)).unwrap_or_default();
    if body.text_body.is_empty() && !body.html_body.is_empty() {
        body.text_body = html2text::from_read(body.html_body.as_bytes(), 80).unwrap_or_default();
    }
    body
}

/// Walk the MIME part tree collecting bodies and attachment names
fn walk_parts(
    part: &ParsedMail<'_>,
    text: &mut Option<String>,
    html: &mut Option<String>,
    attachment_names: &mut Vec<String>,
) {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned());
        if disposition.disposition == DispositionType::Attachment {
            if let Some(name) = filename {
                attachment_names.push(name);
            }
            return;
        }

        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        if ctype == "text/plain"
            && text.is_none()
            && let Ok(value) = part.get_body()
        {
            *text = Some(value);
        }
        if ctype == "text/html"
            && html.is_none()
            && let Ok(value) = part.get_body()
        {
            *html = Some(value);
        }
        return;
    }

    for sub in &part.subparts {
        walk_parts(sub, text, html, attachment_names);
    }
}

/// Render the canonical HTML document for a decoded message
///
/// Fixed template: header block with Subject/From/To/Date, the sanitized
/// HTML body inlined, attachment names as a bullet list.
pub fn render_email_html(email: &DecodedEmail) -> String {
    let attachment_items: String = email
        .body
        .attachment_names
        .iter()
        .map(|name| format!("<li>{}</li>", escape_html(name)))
        .collect();
    format!(
        r#"<html>
<head>
    <style>
        body {{
            font-family: Arial, sans-serif;
            padding: 20px;
        }}
        .email-header {{
            background-color: #f2f2f2;
            padding: 10px;
            margin-bottom: 20px;
        }}
        .email-body {{
            margin-bottom: 20px;
        }}
        .email-attachments {{
            margin-top: 20px;
        }}
    </style>
</head>
<body>
    <div class="email-header">
        <p><b>Subject:</b> {subject}</p>
        <p><b>From:</b> {from}</p>
        <p><b>To:</b> {to}</p>
        <p><b>Date:</b> {date}</p>
    </div>
    <div class="email-body">
        {html_body}
    </div>
    <div class="email-attachments">
        <b>Attachments:</b>
        <ul>
            {attachment_items}
        </ul>
    </div>
</body>
</html>
"#,
        subject = escape_html(&email.subject),
        from = escape_html(&email.from),
        to = escape_html(&email.to),
        date = escape_html(&email.date),
        html_body = email.body.html_body,
    )
}

/// Escape text for embedding in the rendered document
fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        DecodedBody, DecodedEmail, RawEmail, decode_address, decode_body, decode_email,
        decode_mime_words, extract_sender_address, render_email_html,
    };

    #[test]
    fn plain_headers_pass_through() {
        assert_eq!(decode_mime_words("Weekly report"), "Weekly report");
        assert_eq!(decode_mime_words(""), "");
    }

    #[test]
    fn decodes_base64_and_quoted_printable_words() {
        assert_eq!(
            decode_mime_words("=?UTF-8?B?0J/RgNC40LLQtdGC?="),
            "Привет"
        );
        assert_eq!(decode_mime_words("=?utf-8?Q?caf=C3=A9?="), "café");
        assert_eq!(
            decode_mime_words("=?UTF-8?B?0J/RgNC40LLQtdGC?= report"),
            "Привет report"
        );
    }

    #[test]
    fn address_decoding_preserves_the_angle_addr() {
        assert_eq!(
            decode_address("=?utf-8?Q?caf=C3=A9?= <cafe@example.com>"),
            "café <cafe@example.com>"
        );
        assert_eq!(decode_address("plain@example.com"), "plain@example.com");
    }

    #[test]
    fn sender_extraction_finds_the_first_address() {
        assert_eq!(
            extract_sender_address("\"Alice\" <alice@example.com>"),
            Some("alice@example.com".to_owned())
        );
        assert_eq!(
            extract_sender_address("=?utf-8?Q?Bob?= <bob.smith@mail.example.org>"),
            Some("bob.smith@mail.example.org".to_owned())
        );
        assert_eq!(extract_sender_address("no address here"), None);
    }

    #[test]
    fn single_part_message_fills_text_only() {
        let raw = b"From: a@b.c\r\nTo: d@e.f\r\nSubject: Hi\r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\r\nHello there";
        let body = decode_body(raw);
        assert_eq!(body.text_body, "Hello there");
        assert!(body.html_body.is_empty());
        assert!(body.attachment_names.is_empty());
    }

    #[test]
    fn multipart_message_splits_bodies_and_attachments() {
        let raw = b"From: a@b.c\r\nSubject: Hi\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\r\n\
--outer\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nplain part\r\n\
--outer\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<p>html part</p>\r\n\
--outer\r\nContent-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\r\nAAAA\r\n\
--outer--\r\n";
        let body = decode_body(raw);
        assert_eq!(body.text_body.trim_end(), "plain part");
        assert!(body.html_body.contains("html part"));
        assert_eq!(body.attachment_names, vec!["report.pdf".to_owned()]);
    }

    #[test]
    fn html_only_message_derives_text_by_stripping_tags() {
        let raw = b"From: a@b.c\r\nSubject: Hi\r\n\
Content-Type: multipart/alternative; boundary=\"alt\"\r\n\r\n\
--alt\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
<html><body><p>only html here</p></body></html>\r\n\
--alt--\r\n";
        let body = decode_body(raw);
        assert!(!body.html_body.is_empty());
        assert!(body.text_body.contains("only html here"));
    }

    #[test]
    fn decode_email_resolves_every_header() {
        let raw = RawEmail {
            subject: "=?utf-8?Q?caf=C3=A9?=".to_owned(),
            from: "=?utf-8?Q?Alice?= <alice@example.com>".to_owned(),
            to: "bob@example.com".to_owned(),
            date: "Wed, 1 Jan 2025 00:00:00 +0000".to_owned(),
            body: b"Content-Type: text/plain\r\n\r\nhi".to_vec(),
        };
        let decoded = decode_email(&raw);
        assert_eq!(decoded.subject, "café");
        assert_eq!(decoded.from, "Alice <alice@example.com>");
        assert_eq!(decoded.body.text_body, "hi");
    }

    #[test]
    fn rendered_document_carries_headers_body_and_attachments() {
        let email = DecodedEmail {
            subject: "Q3 <numbers>".to_owned(),
            from: "Alice <alice@example.com>".to_owned(),
            to: "bob@example.com".to_owned(),
            date: "Wed, 1 Jan 2025 00:00:00 +0000".to_owned(),
            body: DecodedBody {
                text_body: "see attached".to_owned(),
                html_body: "<p>see attached</p>".to_owned(),
                attachment_names: vec!["report.pdf".to_owned()],
            },
        };
        let html = render_email_html(&email);
        assert!(html.contains("<b>Subject:</b> Q3 &lt;numbers&gt;"));
        assert!(html.contains("Alice &lt;alice@example.com&gt;"));
        assert!(html.contains("<p>see attached</p>"));
        assert!(html.contains("<li>report.pdf</li>"));
    }
}
