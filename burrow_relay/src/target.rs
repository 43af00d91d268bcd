use crate::error::RelayError;
use async_trait::async_trait;
use burrow_core::error::CoreError;
use burrow_core::frame::RelayFrame;
use burrow_core::target::TunnelDestination;
use futures::{Sink, Stream};

/// A duplex stream of relay frames. Implemented by the WebSocket transport
/// and, in tests, by `Framed` TCP or scripted streams.
pub trait FrameStream:
    Stream<Item = Result<RelayFrame, CoreError>> + Sink<RelayFrame, Error = CoreError> + Send + Unpin
{
}

impl<T> FrameStream for T where
    T: Stream<Item = Result<RelayFrame, CoreError>>
        + Sink<RelayFrame, Error = CoreError>
        + Send
        + Unpin
{
}

/// Dials relay streams for one destination. `open` starts a fresh session,
/// `reopen` resumes an interrupted one by presenting the session id issued
/// by the relay and the sequence number the client expects next.
#[async_trait]
pub trait RelayTarget: Send + Sync + 'static {
    type Stream: FrameStream;

    /// Human-readable identity for log lines.
    fn describe(&self) -> String;

    /// Fetches the bearer credential for the next handshake. Invoked once
    /// per `open` and once per `reopen` so refreshed credentials are
    /// picked up.
    async fn session_token(&self) -> Result<String, RelayError>;

    async fn open(&self) -> Result<Self::Stream, RelayError>;

    async fn reopen(&self, sid: &str, next_expected: u32) -> Result<Self::Stream, RelayError>;
}

/// Mints one `RelayTarget` per tunnel session.
pub trait RelayTargetFactory: Send + Sync + 'static {
    type Target: RelayTarget;

    fn target(&self, destination: &TunnelDestination) -> Result<Self::Target, RelayError>;
}
