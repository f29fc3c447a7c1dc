//! Native WebSocket transport using tokio-tungstenite.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use imkit_core::{platform, ImResult};

use super::{Connection, Connector, TransportEvent};
use crate::protocol::Frame;

/// Connects with `tokio_tungstenite::connect_async` and speaks JSON text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, ImResult<Connection>> {
        let url = url.to_string();
        Box::pin(async move { connect_ws(&url).await })
    }
}

enum Outgoing {
    Frame(Frame),
    Pong(tokio_tungstenite::tungstenite::Bytes),
}

async fn connect_ws(ws_url: &str) -> ImResult<Connection> {
    debug!(url = %ws_url, "Connecting WebSocket");
    let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
    let (mut write, mut read) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();

    // Writer: frames from the session layer plus pongs from the reader.
    platform::spawn("ws-writer", async move {
        loop {
            let next = tokio::select! {
                frame = out_rx.recv() => frame.map(Outgoing::Frame),
                pong = pong_rx.recv() => pong.map(Outgoing::Pong),
            };
            let message = match next {
                Some(Outgoing::Frame(frame)) => match serde_json::to_string(&frame) {
                    Ok(text) => {
                        trace!(cmd = %frame.cmd, serial = ?frame.serial, "Sending frame");
                        Message::Text(text.into())
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                },
                Some(Outgoing::Pong(data)) => Message::Pong(data),
                None => break,
            };
            if let Err(e) = write.send(message).await {
                warn!(error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
        debug!("WebSocket writer finished");
    });

    platform::spawn("ws-reader", async move {
        let closed = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let event = decode_text(text.as_str());
                    if let TransportEvent::Frame(frame) = &event {
                        trace!(cmd = %frame.cmd, serial = ?frame.serial, "Received frame");
                    }
                    if in_tx.send(event).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = pong_tx.send(data);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by server");
                    break match frame {
                        Some(frame) => TransportEvent::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.to_string(),
                        },
                        None => TransportEvent::Closed {
                            code: None,
                            reason: "closed by server".to_string(),
                        },
                    };
                }
                Some(Ok(_)) => {} // Binary, Pong, Frame
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read error");
                    break TransportEvent::Closed {
                        code: None,
                        reason: e.to_string(),
                    };
                }
                None => {
                    debug!("WebSocket stream ended");
                    break TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    };
                }
            }
        };
        let _ = in_tx.send(closed);
    });

    Ok(Connection {
        outbound: out_tx,
        inbound: in_rx,
    })
}

/// Decode one text frame. A frame that is JSON but not a valid command still
/// surfaces its serial, so the request it answers can fail right away.
fn decode_text(text: &str) -> TransportEvent {
    let value = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Received non-JSON frame");
            return TransportEvent::Malformed {
                serial: None,
                reason: e.to_string(),
            };
        }
    };
    let serial = value.get("i").and_then(serde_json::Value::as_u64);
    match serde_json::from_value::<Frame>(value) {
        Ok(frame) => TransportEvent::Frame(frame),
        Err(e) => {
            warn!(error = %e, ?serial, "Failed to parse frame");
            TransportEvent::Malformed {
                serial,
                reason: e.to_string(),
            }
        }
    }
}
