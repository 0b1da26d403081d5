//! End-to-end tests for the session layer.
//!
//! These tests drive `ServerLifecycle` and `SessionConnection` together the
//! way an editor integration does: start the backend, connect, send text,
//! and decode what comes back. The backend is either an in-memory pipe or a
//! real TCP listener on localhost, so no external server is required.
//!
//! # Running
//!
//! ```bash
//! cargo test --test session_e2e -- --nocapture
//! ```

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use evalbridge::response::Response;
use evalbridge::server::{
    LaunchError, ProcessHandle, ProcessLauncher, ServerCommand, ServerLifecycle, ServerState,
};
use evalbridge::session::{
    BoxedStream, ConnectionState, Connector, InboundFraming, SessionConnection, TcpConnector,
};
use evalbridge::sinks::OutputSink;

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct PipeConnector {
    peers: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Connector for PipeConnector {
    async fn open(&self) -> io::Result<BoxedStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.peers
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "test dropped"))?;
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "pipe".to_string()
    }
}

struct AlwaysRunning;

impl ProcessHandle for AlwaysRunning {
    fn is_alive(&mut self) -> bool {
        true
    }

    fn terminate(&mut self) {}
}

/// Launcher that always succeeds and counts launches.
#[derive(Default)]
struct MockLauncher {
    launches: Arc<AtomicUsize>,
}

impl ProcessLauncher for MockLauncher {
    fn launch(
        &self,
        _command: &ServerCommand,
        output: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        output.write_output("listening");
        Ok(Box::new(AlwaysRunning))
    }
}

fn record_responses(session: &mut SessionConnection) -> Arc<Mutex<Vec<Response>>> {
    let responses = Arc::new(Mutex::new(Vec::new()));
    let responses_clone = Arc::clone(&responses);
    session.on_response(move |_, response| {
        responses_clone.lock().unwrap().push(response.clone())
    });
    responses
}

async fn next_event(session: &mut SessionConnection) {
    timeout(TEST_TIMEOUT, session.process_next())
        .await
        .expect("Test timed out");
}

/// Test: start backend → connect → send while connecting → handshake then
/// payload → unknown-status reply is unclassified.
#[tokio::test]
async fn test_start_connect_send_and_classify() {
    let output = Arc::new(Mutex::new(Vec::new()));
    let output_clone = Arc::clone(&output);
    let mut server = ServerLifecycle::new(
        Box::new(MockLauncher::default()),
        ServerCommand::new("mock-eval-server"),
        Arc::new(move |line: &str| output_clone.lock().unwrap().push(line.to_string())),
    );

    assert!(server.start());
    assert_eq!(server.state(), ServerState::Running);
    assert_eq!(*output.lock().unwrap(), vec!["listening"]);

    let (peers, mut peer_rx) = mpsc::unbounded_channel();
    let mut session = SessionConnection::new(Box::new(PipeConnector { peers }));
    let queued_during_connect = Arc::new(Mutex::new(None));
    let queued_clone = Arc::clone(&queued_during_connect);
    session.on_state_change(move |session, state| {
        if state == ConnectionState::Connecting {
            session.send("1+1");
            *queued_clone.lock().unwrap() = Some(session.pending_len());
        }
    });
    let responses = record_responses(&mut session);

    assert!(session.connect().await);
    assert_eq!(*queued_during_connect.lock().unwrap(), Some(1));
    assert_eq!(session.pending_len(), 0);

    let mut peer = peer_rx.recv().await.unwrap();
    let expected = format!("@session {}\n1+1\n", session.session_id());
    let mut buf = vec![0u8; expected.len()];
    timeout(TEST_TIMEOUT, peer.read_exact(&mut buf))
        .await
        .expect("Test timed out")
        .expect("Read failed");
    assert_eq!(String::from_utf8_lossy(&buf), expected);

    peer.write_all(br#"{"status":"result","result":2}"#)
        .await
        .unwrap();
    next_event(&mut session).await;

    assert_eq!(
        *responses.lock().unwrap(),
        vec![Response::Unclassified {
            payload: json!({"status": "result", "result": 2})
        }]
    );

    session.disconnect();
    server.stop();
    assert_eq!(server.state(), ServerState::Stopped);
}

/// Minimal line-based evaluation server: records the handshake and answers
/// every following line with `{"result": <line>}`.
async fn run_echo_server(listener: TcpListener, handshakes: mpsc::UnboundedSender<String>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let handshakes = handshakes.clone();
        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let Ok(Some(handshake)) = lines.next_line().await else {
                return;
            };
            let _ = handshakes.send(handshake);

            while let Ok(Some(line)) = lines.next_line().await {
                if line == "close" {
                    return;
                }
                let reply = format!("{}\n", json!({ "result": line }));
                if write_half.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
    }
}

/// Test: TCP transport with line framing, remote close and reconnect.
#[tokio::test]
async fn test_tcp_session_roundtrip_and_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (handshake_tx, mut handshake_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_echo_server(listener, handshake_tx));

    let mut session = SessionConnection::new(Box::new(TcpConnector::new("127.0.0.1", port)))
        .with_framing(InboundFraming::Lines);
    let responses = record_responses(&mut session);
    let states = Arc::new(Mutex::new(Vec::new()));
    let states_clone = Arc::clone(&states);
    session.on_state_change(move |_, state| states_clone.lock().unwrap().push(state));

    session.send("x = 1");
    assert!(session.connect().await);
    session.send("x + 1");

    next_event(&mut session).await;
    next_event(&mut session).await;
    assert_eq!(
        *responses.lock().unwrap(),
        vec![
            Response::ValueResult {
                result: json!("x = 1")
            },
            Response::ValueResult {
                result: json!("x + 1")
            },
        ]
    );

    let expected_handshake = format!("@session {}", session.session_id());
    let first = timeout(TEST_TIMEOUT, handshake_rx.recv())
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(first, expected_handshake);

    // Server hangs up; the session reports it and queues further sends.
    session.send("close");
    next_event(&mut session).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    session.send("after close");
    assert_eq!(session.pending_len(), 1);

    assert!(session.connect().await);
    let second = timeout(TEST_TIMEOUT, handshake_rx.recv())
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(second, expected_handshake);

    next_event(&mut session).await;
    assert_eq!(
        responses.lock().unwrap().last(),
        Some(&Response::ValueResult {
            result: json!("after close")
        })
    );

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
}

/// Test: connecting to a port nobody listens on fails fast into `Error`.
#[tokio::test]
async fn test_tcp_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut session = SessionConnection::new(Box::new(TcpConnector::new("127.0.0.1", port)));
    session.send("kept");

    let result = timeout(TEST_TIMEOUT, session.connect())
        .await
        .expect("Should fail fast, not time out");
    assert!(!result);
    assert_eq!(session.state(), ConnectionState::Error);
    assert_eq!(session.pending_len(), 1);
}
