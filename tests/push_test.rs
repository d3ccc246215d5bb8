use filepush::config::PushConfig;
use filepush::connection::{Connection, LifecycleState};
use filepush::error::PushError;
use filepush::streaming::protocol::{read_message, Message};
use filepush::streaming::{status_channel, Outcome, Receiver, ReceiverConfig};
use filepush::transport::StreamTransport;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

// =============================================================================
// Helpers
// =============================================================================

/// Decode frames, ack every FILE, and return everything seen until STOP or EOF.
fn spawn_acking_peer(mut peer: DuplexStream) -> JoinHandle<Vec<Message>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            let msg = match read_message(&mut peer).await {
                Ok(msg) => msg,
                Err(_) => break,
            };
            let is_file = matches!(msg, Message::File(_));
            let is_stop = matches!(msg, Message::Stop);
            seen.push(msg);
            if is_file && peer.write_all(&[0x05]).await.is_err() {
                break;
            }
            if is_stop {
                break;
            }
        }
        seen
    })
}

/// Ack each FILE only after `quiet` passes with nothing more from the sender.
///
/// Returns the number of FILE frames seen before STOP.
fn spawn_strict_peer(mut peer: DuplexStream, quiet: Duration) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut files = 0;
        loop {
            match read_message(&mut peer).await.unwrap() {
                Message::File(_) => {
                    files += 1;
                    let early = tokio::time::timeout(quiet, peer.read_u8()).await;
                    assert!(early.is_err(), "sender wrote past an unacknowledged FILE");
                    peer.write_all(&[0x05]).await.unwrap();
                }
                Message::Stop => break,
                _ => {}
            }
        }
        files
    })
}

fn duplex_connection(
    local: DuplexStream,
    config: PushConfig,
) -> (
    Connection,
    tokio::sync::mpsc::UnboundedReceiver<filepush::streaming::StatusReport>,
) {
    let (tx, rx) = status_channel();
    let conn = Connection::new(StreamTransport::from_stream("duplex", local), tx, config);
    (conn, rx)
}

/// Relative path -> file content, `None` for directories.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Option<Vec<u8>>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            if path.is_dir() {
                out.insert(rel, None);
                walk(root, &path, out);
            } else {
                out.insert(rel, Some(fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

/// Forwards writes until `limit` bytes have passed, then rejects every write.
struct FailingWriter<W> {
    inner: W,
    limit: usize,
    written: usize,
    failed: bool,
    rejected: Arc<Mutex<Vec<u8>>>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FailingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.failed || this.written + buf.len() > this.limit {
            this.failed = true;
            this.rejected.lock().unwrap().extend_from_slice(buf);
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link dropped")));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// =============================================================================
// Wire scenarios
// =============================================================================

#[tokio::test]
async fn test_push_single_file() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("a.txt");
    fs::write(&file, "foo").unwrap();

    let (peer, local) = tokio::io::duplex(64 * 1024);
    let peer = spawn_acking_peer(peer);
    let (conn, mut rx) = duplex_connection(local, PushConfig::default());

    let stats = conn.send(&file).await.unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(conn.state(), LifecycleState::Closed);

    let seen = peer.await.unwrap();
    assert_eq!(seen.len(), 2);
    match &seen[0] {
        Message::File(f) => {
            assert_eq!(f.header.name, "a.txt");
            assert!(f.header.destination.is_root());
            assert_eq!(f.content.as_ref(), b"foo");
            assert_eq!(f.crc, 0x8C73_6521);
        }
        other => panic!("Expected File, got {:?}", other),
    }
    assert!(matches!(seen[1], Message::Stop));

    let report = rx.recv().await.unwrap();
    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.label, "a.txt");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_push_directory_with_two_files() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("d");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("x.txt"), "x").unwrap();
    fs::write(dir.join("y.txt"), "yy").unwrap();

    let (peer, local) = tokio::io::duplex(64 * 1024);
    let peer = spawn_acking_peer(peer);
    let (conn, mut rx) = duplex_connection(local, PushConfig::default());

    conn.send(&dir).await.unwrap();

    let seen = peer.await.unwrap();
    let summary: Vec<String> = seen
        .iter()
        .map(|m| match m {
            Message::Directory(d) => format!("D {} {}", d.destination.as_str(), d.child_count),
            Message::File(f) => format!("F {} {}", f.header.destination.as_str(), f.header.name),
            other => format!("{:?}", other.message_type()),
        })
        .collect();
    assert_eq!(summary, vec!["D d 2", "F d x.txt", "F d y.txt", "Stop"]);

    let report = rx.recv().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.label, "d");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_push_empty_directory() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("e");
    fs::create_dir(&dir).unwrap();

    let (peer, local) = tokio::io::duplex(1024);
    let peer = spawn_acking_peer(peer);
    let (conn, mut rx) = duplex_connection(local, PushConfig::default());

    let stats = conn.send(&dir).await.unwrap();
    assert_eq!(stats.files, 0);
    assert_eq!(stats.directories, 1);

    let seen = peer.await.unwrap();
    assert_eq!(seen.len(), 2);
    match &seen[0] {
        Message::Directory(d) => {
            assert_eq!(d.destination.as_str(), "e");
            assert_eq!(d.child_count, 0);
        }
        other => panic!("Expected Directory, got {:?}", other),
    }
    assert!(rx.recv().await.unwrap().is_success());
}

#[tokio::test]
async fn test_missing_path_reports_failure_and_stops() {
    let tmp = TempDir::new().unwrap();

    let (peer, local) = tokio::io::duplex(1024);
    let peer = spawn_acking_peer(peer);
    let (conn, mut rx) = duplex_connection(local, PushConfig::default());

    let err = conn.send(tmp.path().join("gone")).await.unwrap_err();
    assert!(matches!(err, PushError::Io(_)));

    let seen = peer.await.unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], Message::Stop));

    let report = rx.recv().await.unwrap();
    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(report.label, "gone");
}

// =============================================================================
// Flow control
// =============================================================================

#[tokio::test]
async fn test_nothing_written_while_ack_outstanding() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("d");
    fs::create_dir(&dir).unwrap();
    for name in ["a", "b", "c"] {
        fs::write(dir.join(name), name.repeat(100)).unwrap();
    }

    let (peer, local) = tokio::io::duplex(64 * 1024);
    let checker = spawn_strict_peer(peer, Duration::from_millis(50));

    let (conn, _rx) = duplex_connection(local, PushConfig::default());
    conn.send(&dir).await.unwrap();
    assert_eq!(checker.await.unwrap(), 3);
}

#[tokio::test]
async fn test_keep_alive_does_not_release_the_sender() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("a.txt");
    fs::write(&file, "foo").unwrap();

    let (mut peer, local) = tokio::io::duplex(1024);
    let (conn, _rx) = duplex_connection(local, PushConfig::default());
    let conn = Arc::new(conn);

    let send = {
        let conn = conn.clone();
        let file = file.clone();
        tokio::spawn(async move { conn.send(&file).await })
    };

    assert!(matches!(
        read_message(&mut peer).await.unwrap(),
        Message::File(_)
    ));
    peer.write_all(&[0x04, 0x04, 0x04]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!send.is_finished());
    assert!(conn.is_sending());

    peer.write_all(&[0x05]).await.unwrap();
    let stats = send.await.unwrap().unwrap();
    assert_eq!(stats.files, 1);
    assert!(matches!(read_message(&mut peer).await.unwrap(), Message::Stop));
}

#[tokio::test]
async fn test_concurrent_send_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let first = tmp.path().join("first.txt");
    let second = tmp.path().join("second.txt");
    fs::write(&first, "first").unwrap();
    fs::write(&second, "second").unwrap();

    let (mut peer, local) = tokio::io::duplex(64 * 1024);
    let (conn, mut rx) = duplex_connection(local, PushConfig::default());
    let conn = Arc::new(conn);

    let send = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&first).await })
    };

    // Blocked waiting for the ack of first.txt.
    match read_message(&mut peer).await.unwrap() {
        Message::File(f) => assert_eq!(f.header.name, "first.txt"),
        other => panic!("Expected File, got {:?}", other),
    }
    assert!(conn.is_sending());

    let err = conn.send(&second).await.unwrap_err();
    assert!(matches!(err, PushError::TransferBusy));
    let quiet = tokio::time::timeout(Duration::from_millis(50), peer.read_u8()).await;
    assert!(quiet.is_err());

    peer.write_all(&[0x05]).await.unwrap();
    send.await.unwrap().unwrap();
    assert!(matches!(read_message(&mut peer).await.unwrap(), Message::Stop));

    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let report = rx.recv().await.unwrap();
    assert_eq!(report.label, "first.txt");
    assert!(report.is_success());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unresponsive_receiver_blocks_forever() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("a.txt");
    fs::write(&file, "foo").unwrap();

    let (mut peer, local) = tokio::io::duplex(1024);
    let (conn, _rx) = duplex_connection(local, PushConfig::default());

    let res = tokio::time::timeout(Duration::from_millis(200), conn.send(&file)).await;
    assert!(res.is_err(), "send returned without a FILE_ACK");

    assert!(matches!(
        read_message(&mut peer).await.unwrap(),
        Message::File(_)
    ));
    let quiet = tokio::time::timeout(Duration::from_millis(50), peer.read_u8()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn test_ack_timeout_reports_failure() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("a.txt");
    fs::write(&file, "foo").unwrap();

    let (_peer, local) = tokio::io::duplex(1024);
    let config = PushConfig {
        ack_timeout_ms: Some(30),
        ..Default::default()
    };
    let (conn, mut rx) = duplex_connection(local, config);

    let err = conn.send(&file).await.unwrap_err();
    assert!(matches!(err, PushError::AckTimeout(_)));
    assert_eq!(rx.recv().await.unwrap().outcome, Outcome::Failure);
    assert_eq!(conn.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn test_peer_hangup_while_waiting_for_ack() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("a.txt");
    fs::write(&file, "foo").unwrap();

    let (mut peer, local) = tokio::io::duplex(1024);
    let (conn, mut rx) = duplex_connection(local, PushConfig::default());

    let hangup = tokio::spawn(async move {
        let msg = read_message(&mut peer).await.unwrap();
        drop(peer);
        msg
    });

    let err = conn.send(&file).await.unwrap_err();
    assert!(matches!(err, PushError::Closed));
    assert!(matches!(hangup.await.unwrap(), Message::File(_)));
    assert_eq!(rx.recv().await.unwrap().outcome, Outcome::Failure);
}

// =============================================================================
// Failure mid-transfer
// =============================================================================

#[tokio::test]
async fn test_write_failure_on_third_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("d");
    fs::create_dir(&dir).unwrap();
    for i in 1..=5 {
        fs::write(dir.join(format!("f{i}.bin")), vec![i as u8; 4096]).unwrap();
    }

    // DIRECTORY "d" frame, two whole FILE frames, then the third header and one chunk.
    let dir_frame = 1 + 2 + 1 + 2;
    let file_header = 1 + 2 + "f1.bin".len() + 2 + 1 + 1 + 4;
    let file_frame = file_header + 4096 + 8;
    let limit = dir_frame + 2 * file_frame + file_header + 1024;

    let (peer, local) = tokio::io::duplex(1 << 20);
    let peer = spawn_acking_peer(peer);

    let (reader, writer) = tokio::io::split(local);
    let rejected = Arc::new(Mutex::new(Vec::new()));
    let writer = FailingWriter {
        inner: writer,
        limit,
        written: 0,
        failed: false,
        rejected: rejected.clone(),
    };
    let (tx, mut rx) = status_channel();
    let conn = Connection::new(
        StreamTransport::new("flaky", reader, writer),
        tx,
        PushConfig::default(),
    );

    let err = conn.send(&dir).await.unwrap_err();
    assert!(err.is_link_failure());
    assert_eq!(conn.state(), LifecycleState::Closed);

    let seen = peer.await.unwrap();
    let names: Vec<&str> = seen
        .iter()
        .filter_map(|m| match m {
            Message::File(f) => Some(f.header.name.as_str()),
            _ => None,
        })
        .collect();
    assert!(matches!(seen[0], Message::Directory(_)));
    assert_eq!(names, vec!["f1.bin", "f2.bin"]);

    let report = rx.recv().await.unwrap();
    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(report.label, "d");
    assert!(rx.try_recv().is_err());

    // STOP was still attempted during shutdown.
    assert_eq!(rejected.lock().unwrap().last(), Some(&0x03));
}

// =============================================================================
// Round trip through the receiver
// =============================================================================

#[tokio::test]
async fn test_round_trip_through_receiver() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("tree");
    fs::create_dir_all(src.join("sub/deeper")).unwrap();
    fs::create_dir_all(src.join("empty")).unwrap();
    fs::write(src.join("zero.bin"), b"").unwrap();
    fs::write(src.join("one.txt"), b"1").unwrap();
    let big: Vec<u8> = (0..70_000u32).map(|i| (i * 7 % 256) as u8).collect();
    fs::write(src.join("sub/big.bin"), &big).unwrap();
    fs::write(src.join("sub/deeper/note.md"), "# note\n").unwrap();

    let dest = tmp.path().join("received");
    fs::create_dir(&dest).unwrap();

    let (remote, local) = tokio::io::duplex(16 * 1024);
    let (remote_reader, remote_writer) = tokio::io::split(remote);
    let mut receiver = Receiver::new(ReceiverConfig {
        root: dest.clone(),
        keep_alive: Some(Duration::from_millis(1)),
    });
    let receiving = tokio::spawn(async move { receiver.run(remote_reader, remote_writer).await });

    let (conn, mut rx) = duplex_connection(local, PushConfig::default());
    let sent = conn.send(&src).await.unwrap();
    let received = receiving.await.unwrap().unwrap();

    assert!(received.stopped);
    assert_eq!(received.checksum_failures, 0);
    assert_eq!(received.files, sent.files);
    assert_eq!(received.directories, sent.directories);
    assert_eq!(received.bytes, sent.bytes);
    assert_eq!(sent.files, 4);
    assert_eq!(sent.directories, 4);

    assert_eq!(snapshot(&src), snapshot(&dest.join("tree")));
    assert!(rx.recv().await.unwrap().is_success());
}

// =============================================================================
// Random trees
// =============================================================================

/// Parent directories, entry name, and file content or `None` for a directory.
type TreeLayout = Vec<(Vec<String>, String, Option<Vec<u8>>)>;

fn tree_strategy() -> impl Strategy<Value = TreeLayout> {
    let name = "[a-zA-Z0-9_][a-zA-Z0-9_. -]{0,7}";
    let entry = (
        proptest::collection::vec(name, 0..3),
        name,
        proptest::option::of(proptest::collection::vec(any::<u8>(), 0..3000)),
    );
    proptest::collection::vec(entry, 0..8)
}

/// Materialize `layout` under `root`, skipping entries that clash with earlier ones.
fn build_tree(root: &Path, layout: &TreeLayout) {
    fs::create_dir_all(root).unwrap();
    for (dirs, name, content) in layout {
        let parent = dirs.iter().fold(root.to_path_buf(), |p, d| p.join(d));
        let blocked = parent
            .ancestors()
            .take_while(|p| p != &root)
            .any(|p| p.is_file());
        let target = parent.join(name);
        if blocked || target.exists() {
            continue;
        }
        fs::create_dir_all(&parent).unwrap();
        match content {
            Some(bytes) => fs::write(&target, bytes).unwrap(),
            None => fs::create_dir(&target).unwrap(),
        }
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_random_tree_round_trips(layout in tree_strategy()) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("tree");
        build_tree(&src, &layout);
        let dest = tmp.path().join("received");
        fs::create_dir(&dest).unwrap();

        let (sent, received) = runtime().block_on(async {
            let (remote, local) = tokio::io::duplex(8 * 1024);
            let (remote_reader, remote_writer) = tokio::io::split(remote);
            let mut receiver = Receiver::new(ReceiverConfig {
                root: dest.clone(),
                keep_alive: None,
            });
            let receiving =
                tokio::spawn(async move { receiver.run(remote_reader, remote_writer).await });

            let (conn, _rx) = duplex_connection(local, PushConfig::default());
            let sent = conn.send(&src).await.unwrap();
            (sent, receiving.await.unwrap().unwrap())
        });

        prop_assert!(received.stopped);
        prop_assert_eq!(received.checksum_failures, 0);
        prop_assert_eq!(received.files, sent.files);
        prop_assert_eq!(received.bytes, sent.bytes);
        prop_assert_eq!(snapshot(&src), snapshot(&dest.join("tree")));
    }

    #[test]
    fn prop_one_file_in_flight_for_random_trees(layout in tree_strategy()) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("tree");
        build_tree(&src, &layout);
        let expected = snapshot(&src).values().filter(|v| v.is_some()).count();

        let files = runtime().block_on(async {
            let (peer, local) = tokio::io::duplex(64 * 1024);
            let checker = spawn_strict_peer(peer, Duration::from_millis(5));
            let (conn, _rx) = duplex_connection(local, PushConfig::default());
            conn.send(&src).await.unwrap();
            checker.await.unwrap()
        });

        prop_assert_eq!(files, expected);
    }
}
