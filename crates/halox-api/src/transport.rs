//! Full-duplex frame transport over the controller's WebSocket.
//!
//! Every payload is preceded by an 8-byte header frame ([`FrameHeader`]).
//! A background receive loop demultiplexes frames by type: control replies,
//! binary replies, and state broadcasts each get their own bounded channel.
//! Sends are serialised by a mutex so the supervisor, the keep-alive task,
//! and the request paths never interleave bytes on the wire.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::ApiError;
use crate::frame::{FrameHeader, FrameKind, FRAME_START};

const CONTROL_CHANNEL_CAPACITY: usize = 10;
const BINARY_CHANNEL_CAPACITY: usize = 2;
const STATE_CHANNEL_CAPACITY: usize = 10;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const OUT_OF_SERVICE_BACKOFF: Duration = Duration::from_secs(60);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ── Control replies ──────────────────────────────────────────────────

/// Control-channel reply: `{ "LL": { "Code", "Control", "Value" } }`.
/// The controller is inconsistent about field casing, hence the aliases.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "LL")]
    pub ll: ControlBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlBody {
    #[serde(rename = "Code", alias = "code", default)]
    pub code: String,
    #[serde(rename = "Control", alias = "control", default)]
    pub control: String,
    #[serde(rename = "Value", alias = "value", default)]
    pub value: serde_json::Value,
}

impl ControlResponse {
    /// Fail unless the controller answered 200.
    pub fn expect_ok(&self) -> Result<(), ApiError> {
        if self.ll.code == "200" {
            Ok(())
        } else {
            Err(ApiError::ControlStatus {
                code: self.ll.code.clone(),
                control: self.ll.control.clone(),
            })
        }
    }

    /// The value field as a string, or a shape error.
    pub fn value_str(&self) -> Result<&str, ApiError> {
        self.ll.value.as_str().ok_or(ApiError::ReplyShape {
            context: "string value expected",
        })
    }
}

// ── State broadcasts ─────────────────────────────────────────────────

/// A state broadcast (types 2, 3, 4, 7) with its raw payload.
#[derive(Debug, Clone)]
pub struct StateFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

// ── FrameTransport ───────────────────────────────────────────────────

/// Handle to an open transport.
///
/// Control and binary requests are single-in-flight by construction:
/// the receive loop queues replies in arrival order and callers must not
/// overlap requests of the same kind.
pub struct FrameTransport {
    sink: Arc<Mutex<WsSink>>,
    control_rx: Mutex<mpsc::Receiver<ControlResponse>>,
    binary_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    keepalive_stop: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FrameTransport {
    /// Connect to `ws://{addr}/ws/rfc6455` and spawn the receive loop.
    ///
    /// Returns the transport plus the state stream and the reconnect
    /// signal; the receive loop publishes exactly one value on the latter
    /// when it exits, however it exits.
    pub async fn open(
        addr: &str,
    ) -> Result<(Self, mpsc::Receiver<StateFrame>, mpsc::Receiver<()>), ApiError> {
        let url = format!("ws://{addr}/ws/rfc6455");
        info!(%url, "connecting to controller WebSocket");

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ApiError::Connect(e.to_string()))?;
        let (sink, source) = ws.split();

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (binary_tx, binary_rx) = mpsc::channel(BINARY_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(2);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        tokio::spawn(receive_loop(
            source,
            control_tx,
            binary_tx,
            state_tx,
            reconnect_tx,
            stop_tx,
        ));

        Ok((
            Self {
                sink: Arc::new(Mutex::new(sink)),
                control_rx: Mutex::new(control_rx),
                binary_rx: Mutex::new(binary_rx),
                keepalive_stop: std::sync::Mutex::new(Some(stop_rx)),
            },
            state_rx,
            reconnect_rx,
        ))
    }

    /// Send one text frame. The sink mutex keeps concurrent senders'
    /// payloads whole on the wire.
    pub async fn send_text(&self, cmd: &str) -> Result<(), ApiError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(cmd.to_string()))
            .await
            .map_err(|e| ApiError::Send(e.to_string()))
    }

    /// Send a command and await its control-channel reply.
    pub async fn request_control(&self, cmd: &str) -> Result<ControlResponse, ApiError> {
        debug!(command = cmd, "TX");
        self.send_text(cmd).await?;
        let mut rx = self.control_rx.lock().await;
        await_reply(&mut rx).await
    }

    /// Send a command and await its binary-channel reply.
    pub async fn request_binary(&self, cmd: &str) -> Result<Vec<u8>, ApiError> {
        debug!(command = cmd, "TX");
        self.send_text(cmd).await?;
        let mut rx = self.binary_rx.lock().await;
        await_reply(&mut rx).await
    }

    /// Start the 5-second keep-alive heartbeat. It runs until the send
    /// fails or the receive loop signals it to stop.
    pub fn start_keepalive(&self) {
        let stop_rx = self
            .keepalive_stop
            .lock()
            .expect("keep-alive state poisoned")
            .take();
        let Some(mut stop_rx) = stop_rx else {
            warn!("keep-alive already running");
            return;
        };

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            info!("keep-alive started");
            loop {
                {
                    let mut sink = sink.lock().await;
                    if let Err(e) = sink.send(Message::Text("keepalive".to_string())).await {
                        warn!(error = %e, "keep-alive send failed");
                        break;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
                    _ = stop_rx.recv() => {
                        debug!("keep-alive stop signalled");
                        break;
                    }
                }
            }
            info!("keep-alive stopped");
        });
    }

    /// Send a close frame. The receive loop notices the closure and fires
    /// the reconnect signal; tear the session down before dropping it if
    /// that signal should go unanswered.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

/// Await a demultiplexed reply with the per-request deadline. Expiry
/// fails the request, not the transport.
async fn await_reply<T>(rx: &mut mpsc::Receiver<T>) -> Result<T, ApiError> {
    match tokio::time::timeout(REQUEST_TIMEOUT, rx.recv()).await {
        Ok(Some(reply)) => Ok(reply),
        Ok(None) => Err(ApiError::TransportClosed),
        Err(_) => Err(ApiError::RequestTimeout {
            timeout_secs: REQUEST_TIMEOUT.as_secs(),
        }),
    }
}

// ── Receive loop ─────────────────────────────────────────────────────

/// Read frames until the stream dies, then publish exactly one reconnect
/// signal and one keep-alive stop. Both sends tolerate absent receivers.
async fn receive_loop(
    mut source: WsSource,
    control_tx: mpsc::Sender<ControlResponse>,
    binary_tx: mpsc::Sender<Vec<u8>>,
    state_tx: mpsc::Sender<StateFrame>,
    reconnect_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<()>,
) {
    debug!("receive loop started");
    loop {
        if let Err(e) = recv_frame(&mut source, &control_tx, &binary_tx, &state_tx).await {
            warn!(error = %e, "receive loop terminating");
            break;
        }
    }
    let _ = reconnect_tx.try_send(());
    let _ = stop_tx.try_send(());
    debug!("receive loop stopped");
}

/// Receive one header (and its payload, if the type carries one) and
/// route it. Any error is fatal for the transport.
async fn recv_frame(
    source: &mut WsSource,
    control_tx: &mpsc::Sender<ControlResponse>,
    binary_tx: &mpsc::Sender<Vec<u8>>,
    state_tx: &mpsc::Sender<StateFrame>,
) -> Result<(), ApiError> {
    let header = loop {
        let raw = next_message(source).await?;
        let header = FrameHeader::parse(&raw)?;
        if header.is_estimated() {
            trace!("estimated header, awaiting the definitive one");
            continue;
        }
        break header;
    };

    // Types 5 and 6 are acted on in the header alone.
    match header.kind() {
        Some(FrameKind::OutOfService) => {
            warn!("out-of-service detected, backing off one minute before reconnecting");
            tokio::time::sleep(OUT_OF_SERVICE_BACKOFF).await;
            return Err(ApiError::OutOfService);
        }
        Some(FrameKind::KeepaliveAck) => {
            trace!("keep-alive acknowledged");
            return Ok(());
        }
        _ => {}
    }

    trace!(
        kind = header.raw_kind(),
        len = header.payload_len(),
        "RX header"
    );

    let payload = next_message(source).await?;
    if payload.is_empty() {
        return Err(ApiError::EmptyPayload);
    }
    if payload[0] == FRAME_START {
        return Err(ApiError::Desynchronised);
    }

    match header.kind() {
        Some(FrameKind::TextResponse) => {
            let response: ControlResponse = serde_json::from_slice(&payload)?;
            trace!(code = %response.ll.code, control = %response.ll.control, "RX control");
            if control_tx.send(response).await.is_err() {
                return Err(ApiError::TransportClosed);
            }
        }
        Some(FrameKind::BinaryResponse) => {
            if binary_tx.send(payload).await.is_err() {
                return Err(ApiError::TransportClosed);
            }
        }
        Some(kind) if kind.is_state() => {
            if state_tx.send(StateFrame { kind, payload }).await.is_err() {
                return Err(ApiError::TransportClosed);
            }
        }
        _ => {
            debug!(kind = header.raw_kind(), "dropping frame of unhandled type");
        }
    }
    Ok(())
}

/// Next WebSocket message as raw bytes. Ping/pong is handled by
/// tungstenite itself; a close frame or stream end is a dead transport.
async fn next_message(source: &mut WsSource) -> Result<Vec<u8>, ApiError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "close frame received");
                return Err(ApiError::TransportClosed);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ApiError::Receive(e.to_string())),
            None => return Err(ApiError::TransportClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_response_accepts_capitalised_fields() {
        let raw = r#"{"LL":{"Code":"200","Control":"jdev/sys/getkey2/u","Value":{"key":"00"}}}"#;
        let response: ControlResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.ll.code, "200");
        assert_eq!(response.ll.control, "jdev/sys/getkey2/u");
        assert!(response.expect_ok().is_ok());
    }

    #[test]
    fn control_response_accepts_lowercase_fields() {
        let raw = r#"{"LL":{"code":"420","control":"x","value":"nope"}}"#;
        let response: ControlResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.ll.code, "420");
        assert_eq!(response.value_str().unwrap(), "nope");
        assert!(matches!(
            response.expect_ok(),
            Err(ApiError::ControlStatus { .. })
        ));
    }

    #[test]
    fn value_str_rejects_non_string_values() {
        let raw = r#"{"LL":{"Code":"200","Control":"c","Value":{"token":"T"}}}"#;
        let response: ControlResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            response.value_str(),
            Err(ApiError::ReplyShape { .. })
        ));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let raw = r#"{"LL":{}}"#;
        let response: ControlResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.ll.code, "");
        assert!(response.ll.value.is_null());
    }
}
