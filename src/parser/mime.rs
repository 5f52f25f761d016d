//! Structured-message decoding: a line-oriented MIME walker.
//!
//! The input is consumed one line at a time from any [`BufRead`]. Every line
//! read checks the caller's [`CancelToken`], so a superseded decode of a large
//! attachment stops within one line of the cancel request.

use std::collections::HashSet;
use std::io::BufRead;

use tracing::debug;

use crate::error::{PapercutError, Result};
use crate::model::{Attachment, StructuredMessage};
use crate::parser::header::{
    decode_charset, decode_encoded_words, decode_header_bytes, get_header, is_continuation,
    is_header_field, parse_date, strip_angle_brackets, unfold_headers, HeaderValue,
};
use crate::parser::html::rewrite_cid_references;
use crate::parser::transfer::TransferEncoding;
use crate::pipeline::CancelToken;

/// Maximum multipart nesting; deeper containers are kept as opaque parts.
const MAX_DEPTH: usize = 10;

/// Decode a complete message held in memory.
pub fn decode(raw: &[u8], cancel: &CancelToken) -> Result<StructuredMessage> {
    decode_reader(raw, cancel)
}

/// Decode a message from a buffered reader.
///
/// Fails with [`PapercutError::MalformedMessage`] when the input has no header
/// section, or when a top-level multipart container is missing its boundary.
/// Missing optional headers decode as empty strings.
pub fn decode_reader<R: BufRead>(reader: R, cancel: &CancelToken) -> Result<StructuredMessage> {
    let mut walker = Walker {
        lines: LineSource::new(reader, cancel),
        boundaries: Vec::new(),
        leaves: Vec::new(),
    };

    let first = match walker.lines.next_line()? {
        Some(line) => line,
        None => return Err(PapercutError::MalformedMessage("empty message".into())),
    };
    let first_text = decode_header_bytes(&first);
    if !is_header_field(&first_text) {
        return Err(PapercutError::MalformedMessage(
            "message does not start with a header field".into(),
        ));
    }

    let headers = walker.walk_entity(Some(first), 0)?.0;
    Ok(assemble(headers, walker.leaves))
}

/// How a body region ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    /// `--boundary` of the container at this stack index.
    Delimiter(usize),
    /// `--boundary--` of the container at this stack index.
    Close(usize),
    Eof,
}

/// A non-multipart part with its body still transfer-encoded.
struct Leaf {
    headers: Vec<(String, String)>,
    content_type: HeaderValue,
    disposition: Option<HeaderValue>,
    body: Vec<u8>,
}

impl Leaf {
    fn encoding(&self) -> TransferEncoding {
        TransferEncoding::from_header(get_header(&self.headers, "Content-Transfer-Encoding"))
    }

    fn is_attachment_disposition(&self) -> bool {
        self.disposition
            .as_ref()
            .is_some_and(|d| d.value == "attachment")
    }

    fn content_id(&self) -> Option<String> {
        get_header(&self.headers, "Content-ID")
            .map(strip_angle_brackets)
            .filter(|id| !id.is_empty())
    }

    fn filename(&self) -> Option<String> {
        self.disposition
            .as_ref()
            .and_then(|d| d.text_param("filename"))
            .or_else(|| self.content_type.text_param("name"))
            .map(|name| decode_encoded_words(&name))
    }

    fn decoded_bytes(&self) -> Vec<u8> {
        self.encoding().decode(&self.body)
    }

    /// Body decoded to text in the part's charset, with CRLF normalised.
    fn decoded_text(&self) -> String {
        let bytes = self.decoded_bytes();
        let charset = self.content_type.param("charset").unwrap_or("utf-8");
        let text = decode_charset(charset, &bytes);
        if text.contains('\r') {
            text.replace("\r\n", "\n")
        } else {
            text
        }
    }
}

/// Splits the input into lines without their terminators.
struct LineSource<'c, R> {
    reader: R,
    cancel: &'c CancelToken,
    buf: Vec<u8>,
}

impl<'c, R: BufRead> LineSource<'c, R> {
    fn new(reader: R, cancel: &'c CancelToken) -> Self {
        Self {
            reader,
            cancel,
            buf: Vec::with_capacity(256),
        }
    }

    fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        self.cancel.check()?;
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        let mut line = self.buf.as_slice();
        line = line.strip_suffix(b"\n").unwrap_or(line);
        line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(line.to_vec()))
    }
}

struct Walker<'c, R> {
    lines: LineSource<'c, R>,
    /// Boundaries of the open multipart containers, outermost first.
    boundaries: Vec<Vec<u8>>,
    leaves: Vec<Leaf>,
}

impl<R: BufRead> Walker<'_, R> {
    /// Classify a line against every open boundary, innermost first.
    fn boundary_of(&self, line: &[u8]) -> Option<End> {
        let rest = line.strip_prefix(b"--")?;
        for (i, boundary) in self.boundaries.iter().enumerate().rev() {
            let Some(after) = rest.strip_prefix(boundary.as_slice()) else {
                continue;
            };
            let after = trim_ascii_end(after);
            if after == b"--" {
                return Some(End::Close(i));
            }
            if after.is_empty() {
                return Some(End::Delimiter(i));
            }
        }
        None
    }

    /// Read a header block. `pending` is a line already consumed by the caller.
    ///
    /// Returns the unfolded headers, a line that turned out to belong to the
    /// body (a part without a separating blank line), and how the block ended
    /// if a boundary or EOF interrupted it.
    fn read_headers(
        &mut self,
        pending: Option<Vec<u8>>,
    ) -> Result<(Vec<(String, String)>, Option<Vec<u8>>, Option<End>)> {
        let mut header_lines: Vec<String> = Vec::new();
        let mut next = pending;

        loop {
            let line = match next.take() {
                Some(line) => line,
                None => match self.lines.next_line()? {
                    Some(line) => line,
                    None => return Ok((unfold_headers(&header_lines), None, Some(End::Eof))),
                },
            };
            if line.is_empty() {
                return Ok((unfold_headers(&header_lines), None, None));
            }
            if let Some(end) = self.boundary_of(&line) {
                return Ok((unfold_headers(&header_lines), None, Some(end)));
            }
            let text = decode_header_bytes(&line);
            if is_header_field(&text) || (is_continuation(&text) && !header_lines.is_empty()) {
                header_lines.push(text);
            } else {
                debug!(line = %text, "Body text before blank line; ending header block");
                return Ok((unfold_headers(&header_lines), Some(line), None));
            }
        }
    }

    /// Read lines until a boundary or EOF, joining them with `\n`.
    ///
    /// With `keep` false the lines are discarded (preamble and epilogue).
    fn read_body(&mut self, mut body: Vec<u8>, keep: bool) -> Result<(Vec<u8>, End)> {
        let mut first = body.is_empty();
        loop {
            let Some(line) = self.lines.next_line()? else {
                return Ok((body, End::Eof));
            };
            if let Some(end) = self.boundary_of(&line) {
                return Ok((body, end));
            }
            if keep {
                if !first {
                    body.push(b'\n');
                }
                body.extend_from_slice(&line);
                first = false;
            }
        }
    }

    /// Walk one entity (the message itself or a MIME part) and everything
    /// nested in it. Returns its headers and the terminator that ended it.
    fn walk_entity(
        &mut self,
        pending: Option<Vec<u8>>,
        depth: usize,
    ) -> Result<(Vec<(String, String)>, End)> {
        let (headers, spill, interrupted) = self.read_headers(pending)?;

        let content_type = get_header(&headers, "Content-Type")
            .map(HeaderValue::parse)
            .filter(|ct| !ct.value.is_empty())
            .unwrap_or_else(|| HeaderValue::parse("text/plain"));
        let disposition = get_header(&headers, "Content-Disposition").map(HeaderValue::parse);

        if let Some(end) = interrupted {
            self.leaves.push(Leaf {
                headers: headers.clone(),
                content_type,
                disposition,
                body: Vec::new(),
            });
            return Ok((headers, end));
        }

        if content_type.value.starts_with("multipart/") && depth < MAX_DEPTH {
            if let Some(boundary) = content_type.param("boundary").filter(|b| !b.is_empty()) {
                let boundary = boundary.as_bytes().to_vec();
                let end = self.walk_multipart(boundary, depth)?;
                return Ok((headers, end));
            }
            if depth == 0 {
                return Err(PapercutError::MalformedMessage(
                    "multipart message without a boundary".into(),
                ));
            }
            debug!(depth, "Nested multipart without boundary; keeping it opaque");
        }

        let (body, end) = self.read_body(spill.unwrap_or_default(), true)?;
        self.leaves.push(Leaf {
            headers: headers.clone(),
            content_type,
            disposition,
            body,
        });
        Ok((headers, end))
    }

    /// Walk the parts of a multipart container whose headers were just read.
    fn walk_multipart(&mut self, boundary: Vec<u8>, depth: usize) -> Result<End> {
        self.boundaries.push(boundary);
        let own = self.boundaries.len() - 1;

        let (_, end) = self.read_body(Vec::new(), false)?;
        match end {
            End::Delimiter(i) if i == own => {}
            other => {
                self.boundaries.pop();
                if depth == 0 {
                    return Err(PapercutError::MalformedMessage(
                        "multipart boundary never found".into(),
                    ));
                }
                debug!(depth, "Nested multipart boundary never found");
                return Ok(other);
            }
        }

        loop {
            let (_, end) = self.walk_entity(None, depth + 1)?;
            match end {
                End::Delimiter(i) if i == own => continue,
                End::Close(i) if i == own => break,
                // EOF or an outer boundary: this container was never closed.
                other => {
                    self.boundaries.pop();
                    return Ok(other);
                }
            }
        }

        self.boundaries.pop();
        let (_, end) = self.read_body(Vec::new(), false)?;
        Ok(end)
    }
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    &bytes[..end]
}

/// Build the message from its top-level headers and leaf parts (in order).
fn assemble(headers: Vec<(String, String)>, leaves: Vec<Leaf>) -> StructuredMessage {
    let field = |name: &str| {
        get_header(&headers, name)
            .map(decode_encoded_words)
            .unwrap_or_default()
    };

    let inline_text = |leaf: &Leaf, kind: &str| {
        leaf.content_type.value == kind && !leaf.is_attachment_disposition()
    };
    let html_index = leaves.iter().position(|l| inline_text(l, "text/html"));
    let plain_index = leaves.iter().position(|l| inline_text(l, "text/plain"));
    let body_index = html_index.or(plain_index);

    let mut body = body_index
        .map(|i| leaves[i].decoded_text())
        .unwrap_or_default();

    let mut seen_ids = HashSet::new();
    let mut attachments = Vec::new();
    for (i, leaf) in leaves.iter().enumerate() {
        if Some(i) == body_index {
            continue;
        }
        let content_id = leaf.content_id();
        let is_text = matches!(leaf.content_type.value.as_str(), "text/plain" | "text/html");
        if content_id.is_none() && !leaf.is_attachment_disposition() && is_text {
            continue;
        }
        let content_id = content_id.filter(|id| {
            let fresh = seen_ids.insert(id.clone());
            if !fresh {
                debug!(content_id = %id, "Duplicate Content-ID; dropping it from the later part");
            }
            fresh
        });
        attachments.push(Attachment::new(
            content_id,
            leaf.content_type.value.clone(),
            leaf.filename(),
            leaf.decoded_bytes(),
        ));
    }

    let html = html_index.is_some();
    if html {
        let ids: Vec<&str> = attachments
            .iter()
            .filter_map(|a| a.content_id.as_deref())
            .collect();
        body = rewrite_cid_references(&body, &ids);
    }

    let date = field("Date");
    StructuredMessage {
        from: field("From"),
        to: field("To"),
        cc: field("Cc"),
        date_parsed: parse_date(&date),
        date,
        subject: field("Subject"),
        message_id: get_header(&headers, "Message-ID")
            .map(|v| v.trim().to_string())
            .unwrap_or_default(),
        body,
        html,
        attachments,
        headers,
    }
}
