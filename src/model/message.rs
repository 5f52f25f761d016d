//! Decoded view of a captured message.
//!
//! Produced on demand by [`crate::parser::mime::decode`] and never persisted.

use std::io::Cursor;

use chrono::{DateTime, Utc};

/// Headers, body and attachments of one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredMessage {
    /// Decoded `From:` header (empty when absent).
    pub from: String,
    /// Decoded `To:` header (empty when absent).
    pub to: String,
    /// Decoded `Cc:` header (empty when absent).
    pub cc: String,
    /// `Date:` header as written by the sender (empty when absent).
    pub date: String,
    /// `Date:` header parsed to UTC, when it could be understood.
    pub date_parsed: Option<DateTime<Utc>>,
    /// Decoded `Subject:` header (empty when absent).
    pub subject: String,
    /// `Message-ID:` header (empty when absent).
    pub message_id: String,
    /// HTML text when `html` is set, plain text otherwise.
    pub body: String,
    /// Whether `body` holds HTML.
    pub html: bool,
    /// Non-body MIME parts in message order.
    pub attachments: Vec<Attachment>,
    /// Every top-level header, unfolded, in original order.
    pub(crate) headers: Vec<(String, String)>,
}

impl StructuredMessage {
    /// First value of a top-level header (case-insensitive), undecoded.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Number of top-level headers, including unknown ones.
    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Find an attachment by content-id.
    pub fn attachment_by_content_id(&self, content_id: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.content_id.as_deref() == Some(content_id))
    }
}

/// One extracted MIME part.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// `Content-ID` without angle brackets. Unique within the message.
    pub content_id: Option<String>,
    /// MIME content type, e.g. `"image/png"`.
    pub content_type: String,
    /// File name from `Content-Disposition` or the `name` parameter.
    pub filename: Option<String>,
    data: Vec<u8>,
}

impl Attachment {
    pub(crate) fn new(
        content_id: Option<String>,
        content_type: String,
        filename: Option<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            content_id,
            content_type,
            filename,
            data,
        }
    }

    /// Decoded content bytes.
    pub fn content(&self) -> &[u8] {
        &self.data
    }

    /// A fresh reader over the decoded content, positioned at the start.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.data)
    }

    /// Decoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
