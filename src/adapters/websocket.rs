//! WebSocket relay between an upgraded client socket and the upstream socket
//! the gateway connected to.
use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{
    Message as UpstreamMessage, protocol::CloseFrame as UpstreamCloseFrame,
};

use crate::{core::streaming::UpstreamWebSocket, metrics::ActiveStreamGuard};

/// Convert an upstream message for the client; raw frames are not relayed.
pub fn to_client(message: UpstreamMessage) -> Option<ClientMessage> {
    Some(match message {
        UpstreamMessage::Text(text) => ClientMessage::Text(text.as_str().into()),
        UpstreamMessage::Binary(data) => ClientMessage::Binary(data),
        UpstreamMessage::Ping(data) => ClientMessage::Ping(data),
        UpstreamMessage::Pong(data) => ClientMessage::Pong(data),
        UpstreamMessage::Close(frame) => ClientMessage::Close(frame.map(|f| ClientCloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
        UpstreamMessage::Frame(_) => return None,
    })
}

pub fn to_upstream(message: ClientMessage) -> UpstreamMessage {
    match message {
        ClientMessage::Text(text) => UpstreamMessage::Text(text.as_str().into()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
    }
}

/// Pump messages both ways until either side closes. When the client goes
/// away the upstream socket is closed with it.
pub async fn relay(client: WebSocket, upstream: UpstreamWebSocket, request_id: String) {
    let _active = ActiveStreamGuard::new();
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    {
        let downstream = async {
            while let Some(message) = upstream_rx.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(request_id = %request_id, "Upstream WebSocket error: {}", e);
                        break;
                    }
                };
                let closing = message.is_close();
                if let Some(message) = to_client(message) {
                    if client_tx.send(message).await.is_err() {
                        break;
                    }
                }
                if closing {
                    break;
                }
            }
        };

        let upstream_bound = async {
            while let Some(Ok(message)) = client_rx.next().await {
                let closing = matches!(message, ClientMessage::Close(_));
                if upstream_tx.send(to_upstream(message)).await.is_err() || closing {
                    break;
                }
            }
        };

        tokio::select! {
            _ = downstream => tracing::debug!(request_id = %request_id, "Upstream WebSocket finished"),
            _ = upstream_bound => tracing::debug!(request_id = %request_id, "Client WebSocket closed"),
        }
    }

    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_text_and_binary_conversion() {
        let text = to_client(UpstreamMessage::Text("{\"id\":1}".into())).unwrap();
        assert!(matches!(text, ClientMessage::Text(ref t) if t.as_str() == "{\"id\":1}"));

        let binary = to_upstream(ClientMessage::Binary(Bytes::from_static(b"\x01\x02")));
        assert!(matches!(binary, UpstreamMessage::Binary(ref b) if &b[..] == b"\x01\x02"));
    }

    #[test]
    fn test_close_frame_keeps_code() {
        let close = to_upstream(ClientMessage::Close(Some(ClientCloseFrame {
            code: 1000,
            reason: "bye".into(),
        })));
        match close {
            UpstreamMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
