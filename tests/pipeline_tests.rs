//! Integration tests for the selection pipeline and the service that owns it.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use papercut::config::Config;
use papercut::model::MessageEntry;
use papercut::pipeline::{
    selection_after_delete, selection_after_removal, Publish, SelectionPipeline, Stage,
};
use papercut::service::MailService;

const WAIT: Duration = Duration::from_secs(5);

fn write_entry(dir: &Path, name: &str, content: &[u8]) -> MessageEntry {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    MessageEntry::from_path(&path).unwrap()
}

/// A message large enough that reading it byte by byte takes a while.
fn large_message() -> Vec<u8> {
    let mut raw = b"Subject: large\r\n\r\n".to_vec();
    for i in 0..20_000 {
        raw.extend_from_slice(format!("line {i}\r\n").as_bytes());
    }
    raw
}

// ─── Test 1: Last selection wins ────────────────────────────────────

#[test]
fn test_rapid_reselection_publishes_only_latest() {
    let dir = tempfile::tempdir().unwrap();
    let slow = write_entry(dir.path(), "slow.eml", &large_message());
    let quick = write_entry(dir.path(), "quick.eml", b"Subject: quick\r\n\r\nhi\r\n");
    let (pipeline, queue) = SelectionPipeline::new(1);

    let first = pipeline.select(slow);
    let second = pipeline.select(quick.clone());
    assert!(second > first);
    assert_eq!(pipeline.generation(), second);

    match queue.recv_timeout(WAIT) {
        Some(Publish::Message(preview)) => {
            assert_eq!(preview.entry, quick);
            assert_eq!(preview.message.subject, "quick");
        }
        other => panic!("unexpected publish: {other:?}"),
    }
    assert!(queue.recv_timeout(Duration::from_millis(300)).is_none());
    assert_eq!(pipeline.current_stage(), Some(Stage::Done));
}

// ─── Test 2: Many selections in a row ───────────────────────────────

#[test]
fn test_burst_of_selections_settles_on_last() {
    let dir = tempfile::tempdir().unwrap();
    let entries: Vec<_> = (0..10)
        .map(|i| {
            write_entry(
                dir.path(),
                &format!("{i}.eml"),
                format!("Subject: number {i}\r\n\r\nbody\r\n").as_bytes(),
            )
        })
        .collect();
    let (pipeline, queue) = SelectionPipeline::new(8);

    for entry in &entries {
        pipeline.select(entry.clone());
    }

    match queue.recv_timeout(WAIT) {
        Some(Publish::Message(preview)) => assert_eq!(preview.message.subject, "number 9"),
        other => panic!("unexpected publish: {other:?}"),
    }
    assert!(queue.recv_timeout(Duration::from_millis(300)).is_none());
}

// ─── Test 3: Cancel publishes nothing ───────────────────────────────

#[test]
fn test_cancel_discards_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let slow = write_entry(dir.path(), "slow.eml", &large_message());
    let (pipeline, queue) = SelectionPipeline::new(1);

    pipeline.select(slow);
    pipeline.cancel();
    assert_eq!(pipeline.current_stage(), None);
    assert!(queue.recv_timeout(Duration::from_millis(500)).is_none());
}

// ─── Test 4: Selection after deleting from the list ─────────────────

#[test]
fn test_selection_moves_to_neighbour_after_delete() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.message_dir = Some(dir.path().to_path_buf());
    for name in ["a.eml", "b.eml", "c.eml"] {
        write_entry(dir.path(), name, format!("Subject: {name}\n\n").as_bytes());
    }
    let (service, channels) = MailService::open(config).unwrap();

    let list = service.store().list();
    let last = list.len() - 1;
    service.delete(&list[last]).unwrap();

    let remaining = service.store().list();
    let next = selection_after_removal(last, remaining.len()).unwrap();
    assert_eq!(next, remaining.len() - 1);

    service.select(remaining[next].clone());
    match channels.previews.recv_timeout(WAIT) {
        Some(Publish::Message(preview)) => assert_eq!(preview.entry, remaining[next]),
        other => panic!("unexpected publish: {other:?}"),
    }

    for entry in remaining.iter() {
        service.delete(entry).unwrap();
    }
    assert_eq!(selection_after_removal(0, service.store().len()), None);
    service.clear_selection();
    assert!(matches!(
        channels.previews.recv_timeout(WAIT),
        Some(Publish::Cleared)
    ));
}

// ─── Test 5: Deleting another message keeps the selection ──────────

#[test]
fn test_deleting_other_message_keeps_selection() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.message_dir = Some(dir.path().to_path_buf());
    for name in ["a.eml", "b.eml", "c.eml", "d.eml"] {
        write_entry(dir.path(), name, format!("Subject: {name}\n\n").as_bytes());
    }
    let (service, _channels) = MailService::open(config).unwrap();

    let before = service.store().list();
    let selected = before[2].clone();

    // Below the selection: same index, same message.
    service.delete(&before[3]).unwrap();
    let after = service.store().list();
    let index = selection_after_delete(Some(2), 3, after.len()).unwrap();
    assert_eq!(after[index], selected);

    // Above the selection: the index shifts, the message stays.
    service.delete(&after[0]).unwrap();
    let after = service.store().list();
    let index = selection_after_delete(Some(index), 0, after.len()).unwrap();
    assert_eq!(index, 1);
    assert_eq!(after[index], selected);
}

// ─── Test 6: Delivered mail can be previewed ────────────────────────

#[test]
fn test_delivery_then_preview() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.message_dir = Some(dir.path().to_path_buf());
    config.smtp.port = 0;
    let (mut service, channels) = MailService::open(config).unwrap();
    let addr = service.start_listener().unwrap();

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;
    let mut expect = |code: &str| loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line.as_bytes().get(3) == Some(&b' ') {
            assert!(line.starts_with(code), "expected {code}, got {line:?}");
            break;
        }
    };

    expect("220");
    for (command, code) in [
        ("HELO client", "250"),
        ("MAIL FROM:<a@example.com>", "250"),
        ("RCPT TO:<b@example.com>", "250"),
        ("DATA", "354"),
    ] {
        write!(writer, "{command}\r\n").unwrap();
        expect(code);
    }
    writer
        .write_all(
            b"Subject: =?UTF-8?Q?Caf=C3=A9?=\r\nContent-Type: text/html\r\n\r\n<p>hello</p>\r\n.\r\n",
        )
        .unwrap();
    expect("250");

    let entry = channels.arrivals.recv_timeout(WAIT).unwrap();
    service.select(entry.clone());
    match channels.previews.recv_timeout(WAIT) {
        Some(Publish::Message(preview)) => {
            assert_eq!(preview.entry, entry);
            assert_eq!(preview.message.subject, "Café");
            assert!(preview.message.html);
            assert_eq!(preview.message.body, "<p>hello</p>");
            assert_eq!(
                preview.raw,
                "Subject: =?UTF-8?Q?Caf=C3=A9?=\nContent-Type: text/html\n\n<p>hello</p>"
            );
        }
        other => panic!("unexpected publish: {other:?}"),
    }

    service.shutdown();
}
