//! JSON-over-WebSocket client link shared by the matching and signaling channels
//!
//! Each link owns one background task that connects, forwards queued
//! outbound messages to the socket and reports inbound traffic through a
//! callback. Dropping the link closes the socket.

use std::marker::PhantomData;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ChannelError;

/// Lifecycle and traffic reported by a link's background task
#[derive(Debug)]
pub enum WsUpdate<In> {
    /// Socket handshake completed
    Opened,
    Message(In),
    /// The socket never opened
    Failed(String),
    /// The remote side or the transport ended an open socket
    Closed(Option<String>),
}

/// Sending half of a JSON WebSocket link
#[derive(Debug)]
pub struct WsLink<Out> {
    outbound: mpsc::UnboundedSender<String>,
    /// Cancels a pending handshake when the link is dropped
    _closer: DropGuard,
    _out: PhantomData<fn(Out)>,
}

impl<Out> WsLink<Out>
where
    Out: Serialize + Send + 'static,
{
    /// Start connecting to `url` in the background.
    ///
    /// Messages passed to [`WsLink::send`] before the socket opens are held in
    /// order and written once it does.
    pub fn connect<In, F>(url: Url, on_update: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(WsUpdate<In>) + Send + Sync + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let closer = CancellationToken::new();
        tokio::spawn(run_link(url, rx, closer.clone(), on_update));
        Self::with_sender(outbound, closer)
    }

    fn with_sender(outbound: mpsc::UnboundedSender<String>, closer: CancellationToken) -> Self {
        Self {
            outbound,
            _closer: closer.drop_guard(),
            _out: PhantomData,
        }
    }

    /// Encode `message` and queue it for the socket
    pub fn send(&self, message: Out) -> Result<(), ChannelError> {
        let text = serde_json::to_string(&message)?;
        self.outbound.send(text).map_err(|_| ChannelError::Closed)
    }

    /// Close the socket; no further updates are reported
    pub fn close(self) {
        drop(self);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self::with_sender(outbound, CancellationToken::new()), rx)
    }
}

async fn run_link<In, F>(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<String>,
    closer: CancellationToken,
    on_update: F,
) where
    In: DeserializeOwned,
    F: Fn(WsUpdate<In>),
{
    let connected = tokio::select! {
        _ = closer.cancelled() => {
            debug!("WebSocket connect to {} abandoned", url);
            return;
        }
        connected = connect_async(url.as_str()) => connected,
    };
    let stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("WebSocket connect to {} failed: {}", url, e);
            on_update(WsUpdate::Failed(e.to_string()));
            return;
        }
    };

    info!("WebSocket connected: {}", url);
    on_update(WsUpdate::Opened);

    let (mut ws_tx, mut ws_rx) = stream.split();

    let reason = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        break Some(e.to_string());
                    }
                }
                None => {
                    // Link dropped locally
                    let _ = ws_tx.send(Message::Close(None)).await;
                    debug!("WebSocket closed locally: {}", url);
                    return;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch(&text, &url, &on_update),
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(text) = String::from_utf8(data) {
                        dispatch(&text, &url, &on_update);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            }
        }
    };

    info!("WebSocket closed: {} ({:?})", url, reason);
    on_update(WsUpdate::Closed(reason));
}

fn dispatch<In, F>(text: &str, url: &Url, on_update: &F)
where
    In: DeserializeOwned,
    F: Fn(WsUpdate<In>),
{
    match serde_json::from_str::<In>(text) {
        Ok(msg) => on_update(WsUpdate::Message(msg)),
        Err(e) => {
            warn!("Invalid JSON from {}: {} - {}", url, e, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalingEvent;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dropping_link_abandons_stalled_handshake() {
        // Accepts the TCP connection but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/ws/alice", listener.local_addr().unwrap())).unwrap();

        let link: WsLink<serde_json::Value> =
            WsLink::connect(url, |_: WsUpdate<SignalingEvent>| {});
        let (mut socket, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();

        link.close();

        let mut buf = [0u8; 1024];
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "client socket still open after drop");
    }

    #[test]
    fn send_encodes_before_queueing() {
        let (link, mut rx) = WsLink::<serde_json::Value>::detached();
        link.send(serde_json::json!({"event": "chat"})).unwrap();
        assert_eq!(rx.try_recv().unwrap(), r#"{"event":"chat"}"#);

        drop(rx);
        assert!(matches!(
            link.send(serde_json::json!({})),
            Err(ChannelError::Closed)
        ));
    }
}
