//! Per-connection state shared between the session tasks, the registry and
//! the router.
//!
//! A `Connection` can only be stopped in two ways: closing its outbound
//! queue or closing its transport. Both are one-shot signals.

use crate::protocol::OutboundFrame;
use common::types::{PresenceKey, RoomId, UserId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Process-unique connection identity. Two connections for the same
/// (room, user) always differ here.
pub type ConnectionId = u64;

/// Failure to enqueue an outbound frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// One client transport connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    client_addr: String,
    outbound: mpsc::Sender<String>,
    outbound_closed: CancellationToken,
    transport_closed: CancellationToken,
    heartbeat_window: u64,
    first_time: u64,
    room_id: AtomicU64,
    user_id: AtomicU64,
    login_time: AtomicU64,
    heartbeat_time: AtomicU64,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        client_addr: String,
        now: u64,
        heartbeat_window: u64,
        outbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(outbound_capacity);
        let conn = Self {
            id,
            client_addr,
            outbound,
            outbound_closed: CancellationToken::new(),
            transport_closed: CancellationToken::new(),
            heartbeat_window,
            first_time: now,
            room_id: AtomicU64::new(0),
            user_id: AtomicU64::new(0),
            login_time: AtomicU64::new(0),
            heartbeat_time: AtomicU64::new(now),
        };
        (conn, receiver)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn client_addr(&self) -> &str {
        &self.client_addr
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        RoomId(self.room_id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        UserId(self.user_id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn presence_key(&self) -> PresenceKey {
        PresenceKey::new(self.room_id(), self.user_id())
    }

    #[must_use]
    pub fn first_time(&self) -> u64 {
        self.first_time
    }

    #[must_use]
    pub fn login_time(&self) -> u64 {
        self.login_time.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn heartbeat_time(&self) -> u64 {
        self.heartbeat_time.load(Ordering::Acquire)
    }

    /// Enqueue an encoded frame without waiting.
    pub fn send_raw(&self, frame: String) -> Result<(), SendError> {
        if self.outbound_closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn send_frame(&self, frame: &OutboundFrame) -> Result<(), SendError> {
        let text = frame
            .to_text()
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_raw(text)
    }

    /// Encode and enqueue a push.
    pub fn send_message<T: Serialize + ?Sized>(&self, cmd: &str, data: &T) -> Result<(), SendError> {
        let frame = OutboundFrame::push(cmd, data).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_frame(&frame)
    }

    pub fn heartbeat(&self, now: u64) {
        self.heartbeat_time.store(now, Ordering::Release);
    }

    /// True iff `now - last_heartbeat > window`. The boundary is not a timeout.
    #[must_use]
    pub fn is_heartbeat_timeout(&self, now: u64) -> bool {
        now.saturating_sub(self.heartbeat_time()) > self.heartbeat_window
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.login_time() != 0
    }

    pub fn login(&self, room_id: RoomId, user_id: UserId, now: u64) {
        self.room_id.store(room_id.0, Ordering::Release);
        self.user_id.store(user_id.0, Ordering::Release);
        self.login_time.store(now, Ordering::Release);
        self.heartbeat(now);
    }

    /// Undo a login that the registry refused.
    pub fn reset_login(&self) {
        self.login_time.store(0, Ordering::Release);
        self.room_id.store(0, Ordering::Release);
        self.user_id.store(0, Ordering::Release);
    }

    /// Close the outbound queue. The outbound task observes this, closes the
    /// transport and unregisters the connection.
    pub fn close_outbound(&self) {
        if !self.outbound_closed.is_cancelled() {
            debug!(
                target: "sig.session",
                connection_id = self.id,
                client_addr = %self.client_addr,
                "Closing outbound queue"
            );
            self.outbound_closed.cancel();
        }
    }

    #[must_use]
    pub fn is_outbound_closed(&self) -> bool {
        self.outbound_closed.is_cancelled()
    }

    pub fn outbound_closed(&self) -> WaitForCancellationFuture<'_> {
        self.outbound_closed.cancelled()
    }

    /// Forcibly close the transport. The inbound task stops reading.
    pub fn close_transport(&self) {
        self.transport_closed.cancel();
    }

    #[must_use]
    pub fn is_transport_closed(&self) -> bool {
        self.transport_closed.is_cancelled()
    }

    pub fn transport_closed(&self) -> WaitForCancellationFuture<'_> {
        self.transport_closed.cancelled()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const T: u64 = 1_700_000_000;

    fn conn(capacity: usize) -> (Connection, mpsc::Receiver<String>) {
        Connection::new(1, "10.0.0.9:51000".to_string(), T, 360, capacity)
    }

    #[test]
    fn test_heartbeat_timeout_boundary() {
        let (conn, _rx) = conn(4);
        conn.heartbeat(T);

        assert!(!conn.is_heartbeat_timeout(T + 360), "boundary is not a timeout");
        assert!(conn.is_heartbeat_timeout(T + 361));
        assert!(!conn.is_heartbeat_timeout(T - 10), "clock skew never times out");
    }

    #[test]
    fn test_login_sets_identity_and_heartbeat() {
        let (conn, _rx) = conn(4);
        assert!(!conn.is_logged_in());
        assert_eq!(conn.user_id(), UserId::NONE);

        conn.login(RoomId(7), UserId(3), T + 100);

        assert!(conn.is_logged_in());
        assert_eq!(conn.room_id(), RoomId(7));
        assert_eq!(conn.user_id(), UserId(3));
        assert_eq!(conn.login_time(), T + 100);
        assert_eq!(conn.heartbeat_time(), T + 100);
        assert_eq!(conn.first_time(), T);
        assert_eq!(conn.presence_key().as_str(), "7_3");

        conn.reset_login();
        assert!(!conn.is_logged_in());
        assert_eq!(conn.room_id(), RoomId(0));
    }

    #[test]
    fn test_send_raw_reports_full_without_blocking() {
        let (conn, mut rx) = conn(1);

        assert_eq!(conn.send_raw("a".to_string()), Ok(()));
        assert_eq!(conn.send_raw("b".to_string()), Err(SendError::Full));
        assert_eq!(rx.try_recv().unwrap(), "a");
    }

    #[test]
    fn test_send_after_close_outbound() {
        let (conn, _rx) = conn(4);
        conn.close_outbound();
        conn.close_outbound();

        assert!(conn.is_outbound_closed());
        assert_eq!(conn.send_raw("a".to_string()), Err(SendError::Closed));
    }

    #[test]
    fn test_send_message_encodes_push() {
        let (conn, mut rx) = conn(4);
        conn.send_message("connect", &serde_json::json!({"userId": 2}))
            .unwrap();

        let frame: OutboundFrame = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.cmd, "connect");
        assert_eq!(frame.code, 200);
        assert_eq!(frame.data["userId"], 2);
    }

    #[tokio::test]
    async fn test_close_transport_wakes_waiters() {
        let (conn, _rx) = conn(4);
        let conn = std::sync::Arc::new(conn);
        let waiter = {
            let conn = std::sync::Arc::clone(&conn);
            tokio::spawn(async move { conn.transport_closed().await })
        };

        conn.close_transport();
        waiter.await.unwrap();
        assert!(conn.is_transport_closed());
    }
}
