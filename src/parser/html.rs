//! HTML body helpers: `cid:` placeholder rewriting and plain-text rendering.

/// Rewrite `cid:ID`, `cid:'ID'` and `cid:"ID"` to the bare `ID` for each
/// content-id, so a renderer can resolve the reference against a file named
/// after the attachment.
///
/// This is literal text substitution; it does not parse the HTML.
pub fn rewrite_cid_references(html: &str, content_ids: &[&str]) -> String {
    let mut out = html.to_string();
    for id in content_ids.iter().filter(|id| !id.is_empty()) {
        for spelling in [format!("cid:{id}"), format!("cid:'{id}'"), format!("cid:\"{id}\"")] {
            if out.contains(&spelling) {
                out = out.replace(&spelling, id);
            }
        }
    }
    out
}

/// Convert HTML to plain text for terminal display.
pub fn html_to_text(html: &str) -> String {
    let mut text = remove_tag_block(html, "script");
    text = remove_tag_block(&text, "style");

    for tag in ["br", "BR", "br/", "br /"] {
        text = text.replace(&format!("<{tag}>"), "\n");
    }
    for tag in ["p", "div", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6"] {
        let upper = tag.to_uppercase();
        text = text.replace(&format!("<{tag}>"), "\n");
        text = text.replace(&format!("<{tag} "), "\n<");
        text = text.replace(&format!("<{upper}>"), "\n");
        text = text.replace(&format!("</{tag}>"), "\n");
        text = text.replace(&format!("</{upper}>"), "\n");
    }

    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => stripped.push(ch),
            _ => {}
        }
    }

    for (entity, ch) in [
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("&apos;", "'"),
        ("&nbsp;", " "),
        ("&#160;", " "),
        // Last, so `&amp;lt;` stays `&lt;`.
        ("&amp;", "&"),
    ] {
        stripped = stripped.replace(entity, ch);
    }

    // At most one blank line between paragraphs.
    let mut prev_was_blank = false;
    let mut cleaned = String::with_capacity(stripped.len());
    for line in stripped.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !prev_was_blank {
                cleaned.push('\n');
                prev_was_blank = true;
            }
        } else {
            cleaned.push_str(trimmed);
            cleaned.push('\n');
            prev_was_blank = false;
        }
    }

    cleaned.trim().to_string()
}

/// Remove an entire tag block (e.g. `<script>…</script>`), case-insensitively.
fn remove_tag_block(html: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut result = String::with_capacity(html.len());
    let mut remaining = html;

    // ASCII lowercasing keeps byte offsets aligned with `remaining`.
    while let Some(start) = remaining.to_ascii_lowercase().find(&open) {
        result.push_str(&remaining[..start]);
        let after = &remaining[start..];
        match after.to_ascii_lowercase().find(&close) {
            Some(end) => remaining = &after[end + close.len()..],
            None => {
                remaining = "";
                break;
            }
        }
    }
    result.push_str(remaining);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_all_spellings() {
        let html = r#"<img src="cid:logo"><img src=cid:'logo'><img src=cid:"logo"><a href="cid:other">"#;
        let out = rewrite_cid_references(html, &["logo"]);
        assert_eq!(
            out,
            r#"<img src="logo"><img src=logo><img src=logo><a href="cid:other">"#
        );
    }

    #[test]
    fn test_rewrite_without_ids_is_identity() {
        let html = "<p>cid:nothing</p>";
        assert_eq!(rewrite_cid_references(html, &[]), html);
        assert_eq!(rewrite_cid_references(html, &[""]), html);
    }

    #[test]
    fn test_html_to_text_basic() {
        let text = html_to_text("<p>Hello <b>World</b></p><p>Second &amp; last</p>");
        assert!(text.contains("Hello World"));
        assert!(text.contains("Second & last"));
    }

    #[test]
    fn test_html_to_text_drops_script_and_style() {
        let text = html_to_text("<STYLE>p{}</STYLE>Visible<script>alert(1)</script>");
        assert_eq!(text, "Visible");
    }

    #[test]
    fn test_remove_tag_block_with_non_ascii() {
        let out = remove_tag_block("Ünïcode<style>x</style>ok", "style");
        assert_eq!(out, "Ünïcodeok");
    }
}
