//! Push-channel transport seam.
//!
//! The event stream only needs "open a channel at this address, then yield
//! text frames until it closes". WebSocket framing, TLS and pings belong to
//! the embedder's [`EventTransport`]; the sync core sees an [`EventChannel`].

use async_trait::async_trait;
use futures::stream::LocalBoxStream;
use thiserror::Error;

/// Push-channel failures. Never surfaced to callers; they only drive the
/// reconnect state machine and the connectivity status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("channel error: {0}")]
    Io(String),
}

/// An open channel: a stream of text frames. End of stream = closed by peer.
pub type EventChannel = LocalBoxStream<'static, Result<String, ChannelError>>;

/// Opens push channels.
#[async_trait(?Send)]
pub trait EventTransport {
    async fn connect(&self, url: &str) -> Result<EventChannel, ChannelError>;
}

/// Transport for contexts with no push server. Every connect is refused, so
/// a channel opened on it only ever reports backoff.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledTransport;

#[async_trait(?Send)]
impl EventTransport for DisabledTransport {
    async fn connect(&self, url: &str) -> Result<EventChannel, ChannelError> {
        Err(ChannelError::Connect(format!("push disabled; not connecting to {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_transport_refuses() {
        let url = "ws://localhost:8000/ws/sheet/s1";
        let Err(ChannelError::Connect(reason)) = DisabledTransport.connect(url).await else {
            panic!("disabled transport connected");
        };
        assert!(reason.contains("/ws/sheet/s1"));
    }
}
