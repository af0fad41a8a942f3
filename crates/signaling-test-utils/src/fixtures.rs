//! Test fixtures: configuration, a fully wired context over mocks, and an
//! in-memory client transport driving real session tasks.

use crate::mock_presence::MockPresenceStore;
use crate::mock_relay::RecordingRelayClient;
use serde_json::{json, Value};
use signaling_service::config::Config;
use signaling_service::context::AppContext;
use signaling_service::directory::{AcceptAnyToken, Directory, StaticDirectory, TokenVerifier};
use signaling_service::protocol::OutboundFrame;
use signaling_service::session::{spawn_session, Connection, TransportError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender};

/// Advertised address of the instance under test.
pub const TEST_INSTANCE: &str = "127.0.0.1:50061";

/// Room configured in every test config.
pub const TEST_ROOM: u64 = 101;

/// How long a test waits for an expected frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment for [`test_config`].
#[must_use]
pub fn test_vars() -> HashMap<String, String> {
    HashMap::from([
        ("REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
        ("SIG_ADVERTISE_ADDRESS".to_string(), TEST_INSTANCE.to_string()),
        ("SIG_ROOM_IDS".to_string(), "101,102".to_string()),
        ("SIG_OUTBOUND_QUEUE_CAPACITY".to_string(), "16".to_string()),
    ])
}

#[must_use]
pub fn test_config() -> Config {
    Config::from_vars(&test_vars()).expect("test config should be valid")
}

/// A context wired to mocks, with handles to the mocks for assertions.
///
/// The registry actor is cancelled when the harness is dropped.
pub struct TestHarness {
    pub ctx: Arc<AppContext>,
    pub presence: MockPresenceStore,
    pub relay: RecordingRelayClient,
    pub cancel: CancellationToken,
}

impl TestHarness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(
            &test_config(),
            MockPresenceStore::new(),
            RecordingRelayClient::new(),
        )
    }

    #[must_use]
    pub fn with_parts(config: &Config, presence: MockPresenceStore, relay: RecordingRelayClient) -> Self {
        let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::new(&config.room_ids));
        Self::with_directory(config, presence, relay, directory, Arc::new(AcceptAnyToken))
    }

    #[must_use]
    pub fn with_directory(
        config: &Config,
        presence: MockPresenceStore,
        relay: RecordingRelayClient,
        directory: Arc<dyn Directory>,
        tokens: Arc<dyn TokenVerifier>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let ctx = AppContext::new(
            config,
            Arc::new(presence.clone()),
            directory,
            tokens,
            Arc::new(relay.clone()),
            cancel.child_token(),
        );
        Self {
            ctx,
            presence,
            relay,
            cancel,
        }
    }

    /// Connect a client from `addr`.
    pub async fn client(&self, addr: &str) -> TestClient {
        TestClient::connect(&self.ctx, addr).await
    }

    /// Connect a client and log it in.
    pub async fn logged_in(&self, room: u64, user: u64) -> TestClient {
        let mut client = self.client(&format!("192.168.1.{user}:40000")).await;
        let reply = client.login(room, user).await;
        assert_eq!(reply.code, 200, "login of {user} failed: {reply:?}");
        client
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Client end of an in-memory transport served by real session tasks.
pub struct TestClient {
    pub conn: Arc<Connection>,
    to_server: Option<mpsc::Sender<Result<String, TransportError>>>,
    from_server: mpsc::Receiver<String>,
    pending: VecDeque<OutboundFrame>,
    next_seq: u64,
    pub inbound: JoinHandle<()>,
    pub outbound: JoinHandle<()>,
}

impl TestClient {
    pub async fn connect(ctx: &Arc<AppContext>, addr: &str) -> Self {
        let (conn, outbound_rx) = ctx.open_connection(addr.to_string());
        ctx.registry
            .register(Arc::clone(&conn))
            .await
            .expect("registry should accept connection");

        let (to_server, server_rx) = mpsc::channel(64);
        let (server_tx, from_server) = mpsc::channel::<String>(256);

        let (inbound, outbound) = spawn_session(
            Arc::clone(ctx),
            Arc::clone(&conn),
            outbound_rx,
            Box::pin(PollSender::new(server_tx)),
            ReceiverStream::new(server_rx),
        );

        Self {
            conn,
            to_server: Some(to_server),
            from_server,
            pending: VecDeque::new(),
            next_seq: 1,
            inbound,
            outbound,
        }
    }

    /// Send a raw text frame.
    pub async fn send_raw(&self, text: &str) {
        self.to_server
            .as_ref()
            .expect("client already disconnected")
            .send(Ok(text.to_string()))
            .await
            .expect("session inbound task should be running");
    }

    /// Send a request and return its `seq`.
    pub async fn send(&mut self, cmd: &str, data: Value) -> String {
        let seq = self.next_seq.to_string();
        self.next_seq += 1;
        let frame = json!({"seq": seq, "cmd": cmd, "data": data});
        self.send_raw(&frame.to_string()).await;
        seq
    }

    /// Send a request and wait for its reply. Pushes received meanwhile are
    /// kept for [`Self::expect_push`].
    pub async fn request(&mut self, cmd: &str, data: Value) -> OutboundFrame {
        let seq = self.send(cmd, data).await;
        self.reply_to(&seq).await
    }

    pub async fn reply_to(&mut self, seq: &str) -> OutboundFrame {
        if let Some(pos) = self.pending.iter().position(|f| f.seq == seq) {
            return self.pending.remove(pos).expect("position is in range");
        }
        loop {
            let frame = self
                .recv_frame()
                .await
                .unwrap_or_else(|| panic!("no reply to seq {seq}"));
            if frame.seq == seq {
                return frame;
            }
            self.pending.push_back(frame);
        }
    }

    /// Wait for the next frame with `cmd`, keeping others.
    pub async fn expect_push(&mut self, cmd: &str) -> OutboundFrame {
        if let Some(pos) = self.pending.iter().position(|f| f.cmd == cmd) {
            return self.pending.remove(pos).expect("position is in range");
        }
        loop {
            let frame = self
                .recv_frame()
                .await
                .unwrap_or_else(|| panic!("no {cmd} push received"));
            if frame.cmd == cmd {
                return frame;
            }
            self.pending.push_back(frame);
        }
    }

    /// Next frame, buffered or fresh, if one arrives in time.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        if let Some(frame) = self.pending.pop_front() {
            return Some(frame);
        }
        self.recv_frame().await
    }

    /// True if nothing arrives within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        match tokio::time::timeout(wait, self.from_server.recv()).await {
            Ok(Some(text)) => {
                self.pending.push_back(parse_frame(&text));
                false
            }
            Ok(None) | Err(_) => true,
        }
    }

    async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        match tokio::time::timeout(FRAME_TIMEOUT, self.from_server.recv()).await {
            Ok(Some(text)) => Some(parse_frame(&text)),
            Ok(None) | Err(_) => None,
        }
    }

    /// Log in with an empty token.
    pub async fn login(&mut self, room: u64, user: u64) -> OutboundFrame {
        self.request(
            "login",
            json!({"token": "t", "roomId": room, "userId": user, "userName": format!("User {user}")}),
        )
        .await
    }

    /// Close the client side of the transport.
    pub fn disconnect(&mut self) {
        self.to_server.take();
    }

    /// Wait for the server to close the transport. Frames still in flight
    /// are discarded.
    pub async fn wait_closed(&mut self) -> bool {
        let drain = async {
            while self.from_server.recv().await.is_some() {}
        };
        tokio::time::timeout(FRAME_TIMEOUT, drain).await.is_ok()
    }
}

fn parse_frame(text: &str) -> OutboundFrame {
    serde_json::from_str(text).unwrap_or_else(|e| panic!("server sent invalid frame {text}: {e}"))
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
