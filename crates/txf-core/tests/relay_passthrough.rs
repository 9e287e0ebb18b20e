//! Relay passthrough behavior: bytes move unmodified, marker lookalikes
//! stay in the stream, and a failed negotiation returns to passthrough.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;

use txf_core::config::FilterConfig;
use txf_core::protocol::{Features, HelloAckPayload, Message, WireFormat};
use txf_core::relay::StreamFilter;
use txf_core::session::SessionIo;
use txf_test_utils::{FakeTerminal, stream_pair};

struct Fixture {
    term: FakeTerminal,
    filter_task: tokio::task::JoinHandle<txf_core::Result<()>>,
    peer_end: Option<txf_test_utils::StreamEnd>,
}

fn start(config: FilterConfig) -> Fixture {
    let (filter_end, peer_end) = stream_pair();
    let mut term = FakeTerminal::new();
    let stdin = term.stdin();
    let stdout = term.stdout();
    let filter = StreamFilter::new(config);
    let (remote_in, remote_out) = filter_end;
    let filter_task = tokio::spawn(filter.run(stdin, stdout, remote_in, remote_out));
    Fixture {
        term,
        filter_task,
        peer_end: Some(peer_end),
    }
}

#[tokio::test]
async fn passthrough_is_byte_identical() {
    let mut fx = start(FilterConfig::default());
    let (_peer_in, mut peer_out) = fx.peer_end.take().unwrap();

    // Marker text as a substring or with trailing garbage is content,
    // not a trigger.
    let payload: &[u8] = b"$ echo **TXF:SEND** mid-line\r\n\
**TXF:SEND**with-suffix\n\
binary \x00\x01\x02 bytes\n\
::TXF:TRANSFER:S:1:80:extra:fields\n";
    peer_out.write_all(payload).await.unwrap();
    peer_out.shutdown().await.unwrap();

    fx.filter_task.await.unwrap().unwrap();
    assert_eq!(fx.term.output(), payload);
}

#[tokio::test]
async fn clipboard_writes_dropped_when_disallowed() {
    let mut fx = start(FilterConfig::new().with_clipboard_passthrough(false));
    let (_peer_in, mut peer_out) = fx.peer_end.take().unwrap();

    peer_out
        .write_all(b"before \x1b]52;c;c2VjcmV0\x07after\n")
        .await
        .unwrap();
    peer_out.shutdown().await.unwrap();

    fx.filter_task.await.unwrap().unwrap();
    assert_eq!(fx.term.output(), b"before after\n");
}

#[tokio::test]
async fn clipboard_writes_pass_by_default() {
    let mut fx = start(FilterConfig::default());
    let (_peer_in, mut peer_out) = fx.peer_end.take().unwrap();

    let payload: &[u8] = b"copy \x1b]52;c;c2VjcmV0\x07 done\n";
    peer_out.write_all(payload).await.unwrap();
    peer_out.shutdown().await.unwrap();

    fx.filter_task.await.unwrap().unwrap();
    assert_eq!(fx.term.output(), payload);
}

#[tokio::test]
async fn keystrokes_reach_the_remote() {
    let mut fx = start(FilterConfig::default());
    let (mut peer_in, mut peer_out) = fx.peer_end.take().unwrap();

    fx.term.type_bytes(b"ls -la\r").await;

    let mut buf = [0u8; 16];
    let n = peer_in.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ls -la\r");

    peer_out.shutdown().await.unwrap();
    fx.filter_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn prompt_without_newline_is_not_stalled() {
    let mut fx = start(FilterConfig::default());
    let (_peer_in, mut peer_out) = fx.peer_end.take().unwrap();

    peer_out.write_all(b"user@host:~$ ").await.unwrap();
    peer_out.flush().await.unwrap();

    // The stream stays open; the prompt must appear anyway.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.term.output(), b"user@host:~$ ");
}

#[tokio::test]
async fn rejected_negotiation_resumes_passthrough() {
    let mut fx = start(FilterConfig::default());
    let (mut peer_in, mut peer_out) = fx.peer_end.take().unwrap();

    // Marker split across two writes must still fire.
    peer_out.write_all(b"before\n::TXF:TRANS").await.unwrap();
    peer_out.flush().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    peer_out.write_all(b"FER:S:1:80\n").await.unwrap();
    peer_out.flush().await.unwrap();

    // The filter initiates; decline the session.
    let mut io = SessionIo::new(&mut peer_in, &mut peer_out, WireFormat::Native);
    match io.recv().await.unwrap() {
        Message::Hello(hello) => assert_eq!(hello.version, 1),
        other => panic!("expected Hello, got {}", other.name()),
    }
    io.send(&Message::HelloAck(HelloAckPayload {
        version: 1,
        accepted: false,
        reject_reason: Some("busy".into()),
        features: Features::default(),
        tunnel_port: None,
    }))
    .await
    .unwrap();

    // Back to plain content after the abort.
    peer_out.write_all(b"after$ ").await.unwrap();
    peer_out.shutdown().await.unwrap();

    fx.filter_task.await.unwrap().unwrap();
    let plain = fx.term.plain_output();
    let text = String::from_utf8_lossy(&plain);
    assert!(text.starts_with("before\n"), "{text:?}");
    assert!(text.contains("transfer aborted"), "{text:?}");
    assert!(text.contains("busy"), "{text:?}");
    assert!(text.ends_with("after$ "), "{text:?}");
    assert!(!text.contains("::TXF:TRANSFER"), "marker leaked: {text:?}");
}
