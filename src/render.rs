//! Materialise a decoded message for an external HTML renderer.
//!
//! Each attachment with a content-id is written to a file named exactly after
//! that id, next to the HTML document. Since the decoder rewrote `cid:ID` to
//! `ID`, the document's references resolve as relative paths.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PapercutError, Result};
use crate::model::StructuredMessage;

/// Name of the document written by [`write_html_preview`].
pub const PREVIEW_FILE: &str = "papercut.htm";

/// Write the message body and its inline parts into `dir`.
///
/// Plain-text bodies are escaped and wrapped in `<pre>`. Returns the path of
/// the HTML document.
pub fn write_html_preview(message: &StructuredMessage, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| PapercutError::io(dir, e))?;

    for attachment in &message.attachments {
        let Some(id) = attachment.content_id.as_deref() else {
            continue;
        };
        if !is_safe_file_name(id) {
            warn!(content_id = id, "Content-ID is not usable as a file name; skipping");
            continue;
        }
        let path = dir.join(id);
        fs::write(&path, attachment.content()).map_err(|e| PapercutError::io(&path, e))?;
        debug!(path = %path.display(), size = attachment.size(), "Wrote inline part");
    }

    let document = if message.html {
        message.body.clone()
    } else {
        format!(
            "<!DOCTYPE html>\n<html><body><pre>{}</pre></body></html>\n",
            escape_html(&message.body)
        )
    };
    let path = dir.join(PREVIEW_FILE);
    fs::write(&path, document).map_err(|e| PapercutError::io(&path, e))?;
    Ok(path)
}

/// A single path component that cannot escape `dir` or clash with the document.
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != PREVIEW_FILE
        && !name.contains(['/', '\\', '\0'])
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
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
