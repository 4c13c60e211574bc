//! WebSocket session lifecycle: handles a single client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use jobbridge_rpc::{AuthFrame, ConnectedFrame};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, CloseReason, Outbound};
use super::heartbeat::{HeartbeatMonitor, HeartbeatResult};
use super::registry::ConnectionRegistry;
use crate::auth::{AuthError, Identity, TokenValidator};
use crate::metrics::{WS_AUTH_FAILURES_TOTAL, WS_HEARTBEAT_TIMEOUTS_TOTAL};
use crate::protocol::ProtocolHandler;

/// Upper bound on sending the final Close frame to a client.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs, shared by all sessions.
pub struct SessionContext {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Frame handler.
    pub protocol: Arc<ProtocolHandler>,
    /// Credential check.
    pub validator: Arc<TokenValidator>,
    /// Liveness policy.
    pub heartbeat: HeartbeatMonitor,
    /// Time allowed for a first-frame credential.
    pub handshake_timeout: Duration,
    /// Outbound frames buffered per connection.
    pub outbound_buffer_frames: usize,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Run a WebSocket session for an upgraded client.
///
/// 1. Authenticates (upgrade credential, or first `auth` frame)
/// 2. Registers the connection and sends the `connected` frame
/// 3. Runs the writer and heartbeat tasks
/// 4. Dispatches inbound text frames until the connection closes
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(ws: WebSocket, pre_token: Option<String>, ctx: Arc<SessionContext>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let identity = match authenticate(
        &mut ws_rx,
        pre_token.as_deref(),
        &ctx.validator,
        ctx.handshake_timeout,
    )
    .await
    {
        Ok(identity) => identity,
        Err(err) => {
            info!(error = %err, "authentication failed");
            counter!(WS_AUTH_FAILURES_TOTAL, "reason" => auth_failure_label(&err)).increment(1);
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: Utf8Bytes::from(err.to_string()),
            };
            let _ = tokio::time::timeout(
                CLOSE_SEND_TIMEOUT,
                ws_tx.send(Message::Close(Some(frame))),
            )
            .await;
            return;
        }
    };

    let (conn, out_rx) = ClientConnection::with_buffer(identity, ctx.outbound_buffer_frames);
    let _ = tracing::Span::current().record("conn_id", conn.id.as_str());
    ctx.registry.register(Arc::clone(&conn));
    let _ = ctx
        .registry
        .send(&conn.id, &ConnectedFrame::new(conn.id.as_str(), conn.identity().subject.as_str()));
    if ctx.shutdown.is_cancelled() {
        let _ = ctx.registry.close(&conn.id, CloseReason::ServerShutdown);
    }

    let writer = tokio::spawn(write_loop(ws_tx, out_rx, Arc::clone(&conn)));

    let heartbeat = tokio::spawn({
        let conn = Arc::clone(&conn);
        let registry = Arc::clone(&ctx.registry);
        let monitor = ctx.heartbeat;
        async move {
            let cancel = conn.close_token();
            if monitor.run(Arc::clone(&conn), cancel).await == HeartbeatResult::TimedOut {
                warn!(conn_id = %conn.id, "heartbeat timeout, closing connection");
                counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                let _ = registry.close(&conn.id, CloseReason::HeartbeatTimeout);
            }
        }
    });

    if let Some(reason) = read_loop(&mut ws_rx, &conn, &ctx.protocol).await {
        let _ = ctx.registry.close(&conn.id, reason);
    }

    let _ = writer.await;
    let _ = heartbeat.await;
    debug!(conn_id = %conn.id, reason = ?conn.close_reason(), "session ended");
}

/// Resolve the client's identity.
///
/// A credential presented on the upgrade request wins. Otherwise the first
/// text frame must be `{"type":"auth","token":"..."}` and arrive within
/// `timeout`.
pub async fn authenticate(
    ws_rx: &mut WsStream,
    pre_token: Option<&str>,
    validator: &TokenValidator,
    timeout: Duration,
) -> Result<Identity, AuthError> {
    if let Some(token) = pre_token {
        return validator.validate(token);
    }

    let first = tokio::time::timeout(timeout, async {
        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => return String::from_utf8(data.to_vec()).ok(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                _ => return None,
            }
        }
    })
    .await
    .map_err(|_| AuthError::Timeout)?;

    let frame = first
        .as_deref()
        .and_then(AuthFrame::parse)
        .ok_or(AuthError::Missing)?;
    validator.validate(&frame.token)
}

fn auth_failure_label(err: &AuthError) -> &'static str {
    match err {
        AuthError::Missing => "missing",
        AuthError::Expired => "expired",
        AuthError::Invalid(_) | AuthError::Signing(_) => "invalid",
        AuthError::Timeout => "timeout",
    }
}

/// Read frames until the client leaves or the connection is closed from
/// our side. Returns the reason when the client side ended the session.
async fn read_loop(
    ws_rx: &mut WsStream,
    conn: &Arc<ClientConnection>,
    protocol: &ProtocolHandler,
) -> Option<CloseReason> {
    let close_token = conn.close_token();
    loop {
        tokio::select! {
            biased;
            () = close_token.cancelled() => return None,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    conn.mark_alive();
                    protocol.handle_frame(conn, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    conn.mark_alive();
                    match std::str::from_utf8(&data) {
                        Ok(text) => protocol.handle_frame(conn, text).await,
                        Err(_) => protocol.reject_binary(conn),
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.mark_alive(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn_id = %conn.id, code = ?frame.map(|f| f.code), "client sent close frame");
                    return Some(CloseReason::ClientClosed);
                }
                None => return Some(CloseReason::ClientClosed),
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, error = %e, "websocket read failed");
                    return Some(CloseReason::TransportError);
                }
            },
        }
    }
}

/// Forward queued frames to the socket. Once the connection is closed,
/// flush what is already queued (unless it overflowed) and send the Close
/// frame carrying the reason's code.
async fn write_loop(mut ws_tx: WsSink, mut out_rx: mpsc::Receiver<Outbound>, conn: Arc<ClientConnection>) {
    let close_token = conn.close_token();
    loop {
        let frame = tokio::select! {
            biased;
            () = close_token.cancelled() => break,
            frame = out_rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let sent = tokio::select! {
            result = ws_tx.send(to_message(frame)) => result.is_ok(),
            () = close_token.cancelled() => break,
        };
        if !sent {
            return;
        }
    }

    let Some(reason) = conn.close_reason().cloned() else {
        return;
    };
    if !reason.sends_close_frame() {
        return;
    }
    let finish = async {
        if reason != CloseReason::Backpressure {
            while let Ok(frame) = out_rx.try_recv() {
                if ws_tx.send(to_message(frame)).await.is_err() {
                    return;
                }
            }
        }
        let frame = CloseFrame {
            code: reason.code(),
            reason: Utf8Bytes::from_static(reason.message()),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    };
    if tokio::time::timeout(CLOSE_SEND_TIMEOUT, finish).await.is_err() {
        debug!(conn_id = %conn.id, "timed out sending close frame");
    }
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(Utf8Bytes::from(String::clone(&text))),
        Outbound::Ping => Message::Ping(Vec::new().into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frames_keep_payload() {
        let msg = to_message(Outbound::Text(Arc::new(r#"{"a":1}"#.to_owned())));
        let Message::Text(text) = msg else {
            panic!("expected text message");
        };
        assert_eq!(text.as_str(), r#"{"a":1}"#);
    }

    #[test]
    fn ping_frames_are_empty() {
        assert!(matches!(to_message(Outbound::Ping), Message::Ping(p) if p.is_empty()));
    }

    #[test]
    fn auth_failure_labels() {
        assert_eq!(auth_failure_label(&AuthError::Missing), "missing");
        assert_eq!(auth_failure_label(&AuthError::Timeout), "timeout");
        assert_eq!(auth_failure_label(&AuthError::Expired), "expired");
    }
}
