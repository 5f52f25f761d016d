//! Integration tests for the structured-message decoder, using `.eml` fixtures
//! and `mail-parser` as a reference for header decoding.

use std::io::BufReader;
use std::path::Path;

use mail_parser::MessageParser;
use papercut::error::PapercutError;
use papercut::parser::{decode, decode_reader};
use papercut::pipeline::CancelToken;

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn read_fixture(name: &str) -> Vec<u8> {
    std::fs::read(fixture(name)).unwrap()
}

// ─── Test 1: Plain text round trip ──────────────────────────────────

#[test]
fn test_plain_body_is_lines_joined_by_newline() {
    let raw = read_fixture("plain.eml");
    let msg = decode(&raw, &CancelToken::never()).unwrap();

    assert!(!msg.html);
    assert_eq!(
        msg.body,
        "Hello Receiver,\n\nThis is a plain text message.\nIt has three lines of body."
    );
    assert_eq!(msg.from, "Sender Person <sender@example.com>");
    assert_eq!(msg.to, "Receiver <receiver@example.com>");
    assert_eq!(msg.cc, "copy@example.com");
    assert_eq!(msg.subject, "Plain text test");
    assert_eq!(msg.message_id, "<plain001@example.com>");
    assert!(msg.attachments.is_empty());
}

// ─── Test 2: Unknown headers are kept, not surfaced ─────────────────

#[test]
fn test_unknown_headers_preserved() {
    let raw = read_fixture("plain.eml");
    let msg = decode(&raw, &CancelToken::never()).unwrap();
    assert_eq!(msg.header("x-custom-header"), Some("kept but not surfaced"));
    assert_eq!(msg.header_count(), 9);
}

// ─── Test 3: Date parsing ───────────────────────────────────────────

#[test]
fn test_date_is_parsed_to_utc() {
    let raw = read_fixture("plain.eml");
    let msg = decode(&raw, &CancelToken::never()).unwrap();
    let date = msg.date_parsed.expect("date should parse");
    assert_eq!(date.to_rfc3339(), "2024-01-16T08:15:00+00:00");
    assert_eq!(msg.date, "Tue, 16 Jan 2024 09:15:00 +0100");
}

// ─── Test 4: Inline images and cid rewriting ────────────────────────

#[test]
fn test_cid_placeholders_rewritten() {
    let raw = read_fixture("html_inline.eml");
    let msg = decode(&raw, &CancelToken::never()).unwrap();

    assert!(msg.html);
    assert!(msg.body.contains(r#"<img src="logo">"#), "{}", msg.body);
    assert!(msg.body.contains("<img src='banner@example.com'>"));
    assert!(msg.body.contains("<img src=logo>"));
    assert!(!msg.body.contains("cid:"));

    assert_eq!(msg.attachments.len(), 2);
    let logo = msg.attachment_by_content_id("logo").unwrap();
    assert_eq!(logo.content_type, "image/png");
    assert_eq!(logo.filename.as_deref(), Some("logo.png"));
    assert_eq!(logo.content(), b"\x89PNG\r\n\x1a\n");

    let banner = msg.attachment_by_content_id("banner@example.com").unwrap();
    assert_eq!(banner.content(), b"GIF89a");
}

// ─── Test 5: Attachment reader starts at the beginning ──────────────

#[test]
fn test_attachment_reader_positioned_at_start() {
    use std::io::Read;

    let raw = read_fixture("html_inline.eml");
    let msg = decode(&raw, &CancelToken::never()).unwrap();
    let banner = msg.attachment_by_content_id("banner@example.com").unwrap();

    for _ in 0..2 {
        let mut buf = Vec::new();
        banner.reader().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"GIF89a");
    }
}

// ─── Test 6: Nested alternative inside mixed ────────────────────────

#[test]
fn test_alternative_prefers_html_and_keeps_attachment() {
    let raw = read_fixture("alternative.eml");
    let msg = decode(&raw, &CancelToken::never()).unwrap();

    assert!(msg.html);
    assert!(msg.body.starts_with("<p>Caf&eacute; numbers attached.</p>"));
    assert_eq!(msg.from, "José García <jose@example.com>");

    assert_eq!(msg.attachments.len(), 1);
    let report = &msg.attachments[0];
    assert_eq!(report.filename.as_deref(), Some("report.csv"));
    assert_eq!(report.content_type, "text/csv");
    assert_eq!(report.content_id, None);
    assert_eq!(report.content(), b"quarter,revenue\nq1,100\n");
}

// ─── Test 7: Malformed input is reported, not panicked on ───────────

#[test]
fn test_malformed_fixture() {
    let raw = read_fixture("malformed.eml");
    let err = decode(&raw, &CancelToken::never()).unwrap_err();
    assert!(matches!(err, PapercutError::MalformedMessage(_)));
}

// ─── Test 8: Idempotence ────────────────────────────────────────────

#[test]
fn test_decode_twice_is_equal() {
    for name in ["plain.eml", "html_inline.eml", "alternative.eml"] {
        let raw = read_fixture(name);
        let a = decode(&raw, &CancelToken::never()).unwrap();
        let b = decode(&raw, &CancelToken::never()).unwrap();
        assert_eq!(a, b, "{name} decoded differently");
    }
}

// ─── Test 9: Streaming from a file matches in-memory decoding ───────

#[test]
fn test_decode_reader_matches_decode() {
    let file = std::fs::File::open(fixture("alternative.eml")).unwrap();
    let streamed = decode_reader(BufReader::new(file), &CancelToken::never()).unwrap();
    let in_memory = decode(&read_fixture("alternative.eml"), &CancelToken::never()).unwrap();
    assert_eq!(streamed, in_memory);
}

// ─── Test 10: Cancellation stops a large decode ─────────────────────

#[test]
fn test_cancelled_token_aborts_decode() {
    let mut raw = b"Subject: big\nContent-Type: multipart/mixed; boundary=b\n\n--b\n\
                    Content-Type: application/octet-stream\nContent-Transfer-Encoding: base64\n\n"
        .to_vec();
    for _ in 0..10_000 {
        raw.extend_from_slice(b"QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFB\n");
    }
    raw.extend_from_slice(b"--b--\n");

    let token = CancelToken::new();
    token.cancel();
    assert!(decode(&raw, &token).unwrap_err().is_cancelled());

    let full = decode(&raw, &CancelToken::never()).unwrap();
    assert_eq!(full.attachments[0].size(), 10_000 * 45);
}

// ─── Test 11: Headers agree with mail-parser ────────────────────────

#[test]
fn test_headers_match_reference_parser() {
    for name in ["plain.eml", "html_inline.eml", "alternative.eml"] {
        let raw = read_fixture(name);
        let ours = decode(&raw, &CancelToken::never()).unwrap();
        let reference = MessageParser::default().parse(&raw[..]).unwrap();

        assert_eq!(Some(ours.subject.as_str()), reference.subject(), "{name}");
        assert_eq!(
            ours.message_id.trim_matches(['<', '>']),
            reference.message_id().unwrap_or_default(),
            "{name}"
        );
        let reference_name = reference
            .from()
            .and_then(|a| a.first())
            .and_then(|a| a.name())
            .unwrap_or_default();
        assert!(ours.from.contains(reference_name), "{name}: {}", ours.from);
    }
}
