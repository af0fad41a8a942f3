//! Inbound and outbound session tasks.

use super::{Connection, TransportError};
use crate::context::AppContext;
use crate::observability::metrics;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Upper bound on flushing a closing transport. A peer that stopped reading
/// must not hold up unregistration.
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Spawn the inbound and outbound tasks of a registered connection.
///
/// Returns the inbound and outbound join handles, in that order.
pub fn spawn_session<S, R>(
    ctx: Arc<AppContext>,
    conn: Arc<Connection>,
    outbound_rx: mpsc::Receiver<String>,
    sink: S,
    stream: R,
) -> (JoinHandle<()>, JoinHandle<()>)
where
    S: Sink<String> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<String, TransportError>> + Unpin + Send + 'static,
{
    let inbound = tokio::spawn(run_inbound(
        Arc::clone(&ctx),
        Arc::clone(&conn),
        stream,
    ));
    let outbound = tokio::spawn(run_outbound(ctx, conn, outbound_rx, sink));
    (inbound, outbound)
}

#[instrument(skip_all, name = "sig.session.inbound", fields(connection_id = conn.id(), client_addr = %conn.client_addr()))]
async fn run_inbound<R>(ctx: Arc<AppContext>, conn: Arc<Connection>, mut stream: R)
where
    R: Stream<Item = Result<String, TransportError>> + Unpin + Send,
{
    loop {
        tokio::select! {
            () = conn.transport_closed() => {
                debug!(target: "sig.session", "Transport closed by server");
                break;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(text)) => ctx.router.dispatch(&ctx, &conn, &text).await,
                    Some(Err(TransportError::ClosedByPeer)) | None => {
                        debug!(target: "sig.session", "Client closed transport");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(target: "sig.session", error = %e, "Transport receive failed");
                        break;
                    }
                }
            }
        }
    }

    // Teardown is driven by the outbound task once it sees the queue closed
    conn.close_outbound();
}

#[instrument(skip_all, name = "sig.session.outbound", fields(connection_id = conn.id(), client_addr = %conn.client_addr()))]
async fn run_outbound<S>(
    ctx: Arc<AppContext>,
    conn: Arc<Connection>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut sink: S,
) where
    S: Sink<String> + Unpin + Send,
    S::Error: Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = conn.outbound_closed() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        tokio::select! {
            () = conn.transport_closed() => break,
            () = conn.outbound_closed() => break,
            result = sink.send(frame) => {
                if let Err(e) = result {
                    debug!(target: "sig.session", error = %e, "Transport send failed");
                    break;
                }
            }
        }
    }

    conn.close_outbound();
    conn.close_transport();
    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(target: "sig.session", error = %e, "Transport close failed"),
        Err(_) => debug!(target: "sig.session", "Transport close timed out"),
    }

    if let Err(e) = ctx.registry.unregister(Arc::clone(&conn)).await {
        warn!(
            target: "sig.session",
            error = %e,
            "Failed to submit unregistration"
        );
    }
    metrics::record_connection_closed();
}
