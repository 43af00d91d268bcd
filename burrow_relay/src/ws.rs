//! WebSocket relay transport.
//!
//! Each relay frame travels as one binary WebSocket message. Resume
//! parameters are carried in the URL query of the reconnect dial, and
//! WebSocket-level close frames surface as relay `Close` frames so the
//! connection state machine sees a single close taxonomy.

use crate::error::{RelayError, RelayErrorKind};
use crate::target::{RelayTarget, RelayTargetFactory};
use async_trait::async_trait;
use burrow_core::error::{CoreError, CoreErrorKind};
use burrow_core::frame::{CloseCode, RelayFrame, RelayFrameCodec};
use burrow_core::target::{CredentialSource, RelayEndpoint, TargetResolver, TunnelDestination};
use bytes::BytesMut;
use futures::{Sink, Stream};
use log::debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::{Decoder, Encoder};

fn scheme(endpoint: &RelayEndpoint) -> &'static str {
    if endpoint.secure { "wss" } else { "ws" }
}

fn connect_url(endpoint: &RelayEndpoint, destination: &TunnelDestination) -> String {
    format!(
        "{}://{}:{}/relay/v1/connect?project={}&zone={}&instance={}&port={}",
        scheme(endpoint),
        endpoint.host,
        endpoint.port,
        destination.project,
        destination.zone,
        destination.instance,
        destination.port
    )
}

fn reconnect_url(endpoint: &RelayEndpoint, sid: &str, next_expected: u32) -> String {
    format!(
        "{}://{}:{}/relay/v1/reconnect?sid={}&ack={}",
        scheme(endpoint),
        endpoint.host,
        endpoint.port,
        sid,
        next_expected
    )
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> CoreError {
    CoreError::new(CoreErrorKind::IoError, e.to_string().as_str())
}

/// Adapts a WebSocket into a [`FrameStream`](crate::target::FrameStream).
pub struct WsFrameStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: RelayFrameCodec,
}

impl WsFrameStream {
    fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            inner,
            codec: RelayFrameCodec::new(),
        }
    }
}

impl Stream for WsFrameStream {
    type Item = Result<RelayFrame, CoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Err(e)) => return Poll::Ready(Some(Err(ws_error(e)))),
                Some(Ok(Message::Binary(data))) => {
                    let mut buf = BytesMut::from(&data[..]);
                    let result = match this.codec.decode(&mut buf) {
                        Ok(Some(frame)) if buf.is_empty() => Ok(frame),
                        Ok(_) => Err(CoreError::new(
                            CoreErrorKind::MalformedFrame,
                            "websocket message does not carry exactly one relay frame",
                        )),
                        Err(e) => Err(e),
                    };
                    return Poll::Ready(Some(result));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u32::from(u16::from(frame.code)), frame.reason.to_string()),
                        None => (CloseCode::Normal.to_wire(), String::new()),
                    };
                    return Poll::Ready(Some(Ok(RelayFrame::Close {
                        code: CloseCode::from_wire(code),
                        reason,
                    })));
                }
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Some(Err(CoreError::new(
                        CoreErrorKind::MalformedFrame,
                        "unexpected text message on the relay stream",
                    ))));
                }
                // Ping/pong is handled by the protocol layer.
                Some(Ok(_)) => continue,
            }
        }
    }
}

impl Sink<RelayFrame> for WsFrameStream {
    type Error = CoreError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_ready(cx)
            .map_err(ws_error)
    }

    fn start_send(self: Pin<&mut Self>, frame: RelayFrame) -> Result<(), CoreError> {
        let this = self.get_mut();
        let mut buf = BytesMut::new();
        this.codec.encode(frame, &mut buf)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.freeze()))
            .map_err(ws_error)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(ws_error)
    }
}

/// WebSocket relay target for one destination. Resolves the endpoint
/// through the injected resolver on every dial.
pub struct WsRelayTarget {
    destination: TunnelDestination,
    resolver: Arc<dyn TargetResolver>,
    credentials: Arc<dyn CredentialSource>,
}

impl WsRelayTarget {
    pub fn new(
        destination: TunnelDestination,
        resolver: Arc<dyn TargetResolver>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            destination,
            resolver,
            credentials,
        }
    }
}

#[async_trait]
impl RelayTarget for WsRelayTarget {
    type Stream = WsFrameStream;

    fn describe(&self) -> String {
        self.destination.to_string()
    }

    async fn session_token(&self) -> Result<String, RelayError> {
        self.credentials.token().await.map_err(RelayError::from)
    }

    async fn open(&self) -> Result<WsFrameStream, RelayError> {
        let endpoint = self.resolver.resolve(&self.destination).await?;
        let url = connect_url(&endpoint, &self.destination);
        debug!("Opening relay stream to {endpoint} for {}", self.destination);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::new(RelayErrorKind::ConnectFailed, e.to_string().as_str()))?;
        Ok(WsFrameStream::new(stream))
    }

    async fn reopen(&self, sid: &str, next_expected: u32) -> Result<WsFrameStream, RelayError> {
        let endpoint = self.resolver.resolve(&self.destination).await?;
        let url = reconnect_url(&endpoint, sid, next_expected);
        debug!("Reopening relay stream to {endpoint} for {}", self.destination);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::new(RelayErrorKind::StreamError, e.to_string().as_str()))?;
        Ok(WsFrameStream::new(stream))
    }
}

/// Factory handed to the tunnel layer; mints one WebSocket target per
/// session.
pub struct WsRelayFactory {
    resolver: Arc<dyn TargetResolver>,
    credentials: Arc<dyn CredentialSource>,
}

impl WsRelayFactory {
    pub fn new(resolver: Arc<dyn TargetResolver>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            resolver,
            credentials,
        }
    }
}

impl RelayTargetFactory for WsRelayFactory {
    type Target = WsRelayTarget;

    fn target(&self, destination: &TunnelDestination) -> Result<WsRelayTarget, RelayError> {
        Ok(WsRelayTarget::new(
            destination.clone(),
            self.resolver.clone(),
            self.credentials.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_carry_destination_and_resume_parameters() {
        let endpoint = RelayEndpoint::new("relay.example.com", 443, true);
        let destination = TunnelDestination::new("proj", "zone-a", "vm-1", 22);

        let url = connect_url(&endpoint, &destination);
        assert_eq!(
            url,
            "wss://relay.example.com:443/relay/v1/connect?project=proj&zone=zone-a&instance=vm-1&port=22"
        );

        let url = reconnect_url(&endpoint, "sid-1", 17);
        assert_eq!(
            url,
            "wss://relay.example.com:443/relay/v1/reconnect?sid=sid-1&ack=17"
        );
    }

    #[test]
    fn insecure_endpoints_use_plain_websockets() {
        let endpoint = RelayEndpoint::new("localhost", 8080, false);
        let destination = TunnelDestination::new("p", "z", "vm", 22);
        assert!(connect_url(&endpoint, &destination).starts_with("ws://localhost:8080/"));
    }
}
