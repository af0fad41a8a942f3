//! Message router.
//!
//! Maps the `cmd` of each inbound frame to a handler and writes exactly one
//! reply frame back to the sender, whatever the handler does:
//!
//! | Outcome | Reply code |
//! |---------|------------|
//! | envelope does not parse | `ParameterIllegal` (empty `seq`/`cmd`) |
//! | no handler for `cmd` | `RoutingNotExist` |
//! | handler panics | `ServerError` |
//! | handler returns | the handler's code |
//!
//! Handlers run inline on the connection's inbound task, so frames from one
//! connection are handled in arrival order.

mod handlers;

use crate::context::AppContext;
use crate::errors::ResponseCode;
use crate::observability::metrics;
use crate::protocol::{InboundEnvelope, OutboundFrame};
use crate::session::Connection;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

/// Input to a handler.
pub struct HandlerRequest {
    pub ctx: Arc<AppContext>,
    pub conn: Arc<Connection>,
    pub seq: String,
    /// The envelope's `data`, re-encoded.
    pub payload: Vec<u8>,
}

impl HandlerRequest {
    /// Decode the payload. A missing `data` decodes as an empty object.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerReply> {
        let payload: &[u8] = if self.payload.as_slice() == b"null" {
            b"{}"
        } else {
            &self.payload
        };
        serde_json::from_slice(payload).map_err(|e| {
            debug!(target: "sig.router", seq = %self.seq, error = %e, "Malformed request data");
            HandlerReply::error(ResponseCode::ParameterIllegal)
        })
    }
}

/// Handler outcome, written back as the reply frame.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerReply {
    pub code: ResponseCode,
    pub msg: Option<String>,
    pub data: Value,
}

impl HandlerReply {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            code: ResponseCode::Ok,
            msg: None,
            data,
        }
    }

    #[must_use]
    pub fn error(code: ResponseCode) -> Self {
        Self {
            code,
            msg: None,
            data: Value::Null,
        }
    }
}

pub type Handler = fn(HandlerRequest) -> BoxFuture<'static, HandlerReply>;

/// Command table.
pub struct Router {
    handlers: RwLock<HashMap<&'static str, Handler>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Router with every built-in command registered.
    #[must_use]
    pub fn new() -> Self {
        let mut table = HashMap::new();
        handlers::register_defaults(&mut table);
        Self {
            handlers: RwLock::new(table),
        }
    }

    /// Router with no commands.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a command handler.
    pub async fn register(&self, cmd: &'static str, handler: Handler) {
        self.handlers.write().await.insert(cmd, handler);
    }

    pub async fn commands(&self) -> Vec<&'static str> {
        let mut cmds: Vec<_> = self.handlers.read().await.keys().copied().collect();
        cmds.sort_unstable();
        cmds
    }

    /// Handle one inbound text frame from `conn`.
    #[instrument(skip_all, name = "sig.router.dispatch", fields(connection_id = conn.id()))]
    pub async fn dispatch(&self, ctx: &Arc<AppContext>, conn: &Arc<Connection>, frame: &str) {
        let start = Instant::now();

        let envelope: InboundEnvelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(target: "sig.router", error = %e, "Malformed envelope");
                let reply = HandlerReply::error(ResponseCode::ParameterIllegal);
                respond(conn, "", "", reply.clone());
                metrics::record_dispatch("unknown", reply.code.as_label(), start.elapsed());
                return;
            }
        };

        let handler = self
            .handlers
            .read()
            .await
            .get_key_value(envelope.cmd.as_str())
            .map(|(cmd, handler)| (*cmd, *handler));

        let (cmd_label, reply) = match handler {
            None => ("unknown", HandlerReply::error(ResponseCode::RoutingNotExist)),
            Some((cmd, handler)) => {
                let reply = match serde_json::to_vec(&envelope.data) {
                    Ok(payload) => {
                        let request = HandlerRequest {
                            ctx: Arc::clone(ctx),
                            conn: Arc::clone(conn),
                            seq: envelope.seq.clone(),
                            payload,
                        };
                        run_guarded(cmd, handler(request)).await
                    }
                    Err(_) => HandlerReply::error(ResponseCode::ParameterIllegal),
                };
                (cmd, reply)
            }
        };

        let code = reply.code;
        respond(conn, &envelope.seq, &envelope.cmd, reply);

        debug!(
            target: "sig.router",
            addr = %conn.client_addr(),
            room_id = %conn.room_id(),
            user_id = %conn.user_id(),
            cmd = %envelope.cmd,
            code = code.as_u32(),
            "Dispatched"
        );
        metrics::record_dispatch(cmd_label, code.as_label(), start.elapsed());
    }
}

/// Await a handler future, converting a panic into `ServerError`.
async fn run_guarded(cmd: &'static str, fut: BoxFuture<'static, HandlerReply>) -> HandlerReply {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(reply) => reply,
        Err(_) => {
            error!(target: "sig.router", cmd = cmd, "Handler panicked");
            metrics::record_handler_panic(cmd);
            HandlerReply::error(ResponseCode::ServerError)
        }
    }
}

fn respond(conn: &Connection, seq: &str, cmd: &str, reply: HandlerReply) {
    let frame = OutboundFrame::reply(seq, cmd, reply.code, reply.msg, reply.data);
    if let Err(e) = conn.send_frame(&frame) {
        debug!(target: "sig.router", connection_id = conn.id(), error = %e, "Reply not enqueued");
    }
}
