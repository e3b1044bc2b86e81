//! A scripted control port and a fake Tor data directory.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tor_control_client::auth::format_cookie_hex;
use tor_control_client::{TorControlObserver, TorEvent};

/// Default timeout for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Cookie written by [`DataDir::new`].
pub const COOKIE: [u8; 32] = [0xa5; 32];

/// Fail the test instead of hanging when `fut` never completes.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("timed out waiting for the control session")
}

/// Turn on log output for a test run with `RUST_LOG` set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Data Directory
// ============================================================================

/// A temporary directory holding `controlport` and `control_auth_cookie`.
pub struct DataDir {
    dir: TempDir,
}

impl DataDir {
    /// Publish `port` the way Tor does: port file first, then the cookie.
    pub fn new(port: u16) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = Self { dir };
        data_dir.publish(port, &COOKIE);
        data_dir
    }

    pub fn publish(&self, port: u16, cookie: &[u8]) {
        std::fs::write(
            self.path().join("controlport"),
            format!("PORT=127.0.0.1:{port}\n"),
        )
        .unwrap();
        std::fs::write(self.path().join("control_auth_cookie"), cookie).unwrap();
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

// ============================================================================
// Mock Control Port
// ============================================================================

/// A TCP listener standing in for Tor's control port.
pub struct MockControlPort {
    listener: TcpListener,
}

impl MockControlPort {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub async fn accept(&self) -> MockConnection {
        let (stream, _) = within(self.listener.accept()).await.unwrap();
        let (reader, writer) = stream.into_split();
        MockConnection {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Accept a connection and answer the cookie `AUTHENTICATE` with `250 OK`.
    pub async fn accept_authenticated(&self) -> MockConnection {
        let mut conn = self.accept().await;
        conn.expect_authenticate().await;
        conn.send("250 OK\r\n").await;
        conn
    }
}

/// The server side of one control connection.
pub struct MockConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MockConnection {
    /// Next command line without its CRLF, or `None` once the client closed.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = within(self.reader.read_line(&mut line)).await.ok()?;
        if n == 0 {
            return None;
        }
        assert!(line.ends_with("\r\n"), "command not CRLF terminated: {line:?}");
        line.truncate(line.len() - 2);
        Some(line)
    }

    pub async fn expect_line(&mut self, expected: &str) {
        assert_eq!(self.read_line().await.as_deref(), Some(expected));
    }

    pub async fn expect_authenticate(&mut self) {
        let expected = format!("AUTHENTICATE {}", format_cookie_hex(&COOKIE));
        self.expect_line(&expected).await;
    }

    /// Write raw reply bytes; callers supply the line endings.
    pub async fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).await.unwrap();
    }
}

// ============================================================================
// Observer
// ============================================================================

/// What a [`Recorder`] saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Note {
    Ready,
    Closed(bool),
    Event(TorEvent),
}

/// Forwards lifecycle callbacks and events to a channel.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Note>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Note>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl TorControlObserver for Recorder {
    fn on_ready(&self) {
        let _ = self.tx.send(Note::Ready);
    }

    fn on_closed(&self, was_running: bool) {
        let _ = self.tx.send(Note::Closed(was_running));
    }

    fn on_event(&self, event: &TorEvent) {
        let _ = self.tx.send(Note::Event(event.clone()));
    }
}

/// Next note from a [`Recorder`].
pub async fn next_note(rx: &mut mpsc::UnboundedReceiver<Note>) -> Note {
    within(rx.recv()).await.expect("observer channel closed")
}

/// Records raw protocol callbacks as `kind:status:body` strings.
#[derive(Default)]
pub struct RawRecorder {
    lines: Mutex<Vec<String>>,
}

impl RawRecorder {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn push(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}

impl TorControlObserver for RawRecorder {
    fn on_raw_cmd(&self, cmd: &str) {
        self.push(format!("cmd:{cmd}"));
    }

    fn on_raw_async(&self, status: &str, body: &str) {
        self.push(format!("async:{status}:{body}"));
    }

    fn on_raw_mid(&self, status: &str, body: &str) {
        self.push(format!("mid:{status}:{body}"));
    }

    fn on_raw_end(&self, status: &str, body: &str) {
        self.push(format!("end:{status}:{body}"));
    }
}
