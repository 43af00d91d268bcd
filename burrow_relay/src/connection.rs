//! Relay connection state machine.
//!
//! A `RelayConnection` owns one frame stream at a time. When the stream
//! fails with a transport error the connection resumes the same logical
//! session: it redials through the target with the session id and the next
//! expected sequence number, waits for the relay's resume acknowledgment,
//! and resends whatever the relay has not acknowledged. Sequence numbers
//! survive the resume, so the byte stream continues without loss or
//! duplication.

use crate::error::{RelayError, RelayErrorKind};
use crate::target::RelayTarget;
use burrow_core::error::{CoreError, CoreErrorKind};
use burrow_core::frame::{CloseCode, RelayFrame, seq_newer};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
    Failed,
}

/// Tunables of the relay protocol. The defaults mirror the relay service's
/// constants; deployments must validate them during integration testing.
#[derive(Debug, Clone)]
pub struct RelayLimits {
    /// Time allowed for the connect/resume handshake to complete.
    pub connect_timeout: Duration,
    /// Received bytes after which an ACK is sent even if the send side is
    /// idle.
    pub ack_window_bytes: u64,
    /// Ceiling on buffered unacknowledged outbound bytes; exceeding it is a
    /// fatal session error, not silent loss.
    pub max_inflight_bytes: usize,
    /// Resume attempts before the session is declared lost.
    pub max_reconnects: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ack_window_bytes: 1024 * 1024,
            max_inflight_bytes: 2 * 1024 * 1024,
            max_reconnects: 2,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

/// Outcome of feeding one transport item into [`RelayConnection::process`].
#[derive(Debug)]
pub enum Progress {
    /// An in-order data payload to hand to the local side.
    Payload(Bytes),
    /// Bookkeeping only; poll the next frame.
    Continue,
    /// The relay closed the session normally.
    Finished,
}

struct UnackedWrite {
    sequence: u32,
    payload: Bytes,
}

pub struct RelayConnection<T: RelayTarget> {
    target: T,
    limits: RelayLimits,
    stream: Option<T::Stream>,
    state: RelayConnectionState,
    sid: Option<String>,
    /// Sequence assigned to the next outbound DATA frame.
    next_send_seq: u32,
    /// Sequence the next in-order inbound DATA frame must carry.
    next_expected_seq: u32,
    /// Bytes received since the last ACK went out.
    bytes_unacked_in: u64,
    unacked_out: VecDeque<UnackedWrite>,
    inflight_bytes: usize,
}

impl<T: RelayTarget> std::fmt::Debug for RelayConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("limits", &self.limits)
            .field("state", &self.state)
            .field("sid", &self.sid)
            .field("next_send_seq", &self.next_send_seq)
            .field("next_expected_seq", &self.next_expected_seq)
            .field("bytes_unacked_in", &self.bytes_unacked_in)
            .field("has_stream", &self.stream.is_some())
            .field("unacked_out", &self.unacked_out.len())
            .field("inflight_bytes", &self.inflight_bytes)
            .finish()
    }
}

impl<T: RelayTarget> RelayConnection<T> {
    /// Opens a stream through the target and completes the connect
    /// handshake. An explicit denial by the relay is terminal; transport
    /// and timeout failures may be retried by the caller.
    pub async fn connect(target: T, limits: RelayLimits) -> Result<Self, RelayError> {
        let mut stream = target.open().await?;
        let token = target.session_token().await?;
        let hello = RelayFrame::connect(token.as_str())?;
        stream.send(hello).await.map_err(|e| {
            RelayError::new(RelayErrorKind::ConnectFailed, e.to_string().as_str())
        })?;

        let sid = timeout(limits.connect_timeout, await_connect_success::<T>(&mut stream))
            .await
            .map_err(|_| {
                RelayError::new(
                    RelayErrorKind::ConnectFailed,
                    "the relay did not complete the handshake in time",
                )
            })??;

        info!("Relay session established for {}", target.describe());
        Ok(Self {
            target,
            limits,
            stream: Some(stream),
            state: RelayConnectionState::Connected,
            sid: Some(sid),
            next_send_seq: 0,
            next_expected_seq: 0,
            bytes_unacked_in: 0,
            unacked_out: VecDeque::new(),
            inflight_bytes: 0,
        })
    }

    pub fn state(&self) -> RelayConnectionState {
        self.state
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    /// Sends one payload chunk of at most
    /// [`MAX_DATA_CHUNK`](burrow_core::frame::MAX_DATA_CHUNK) bytes. The
    /// chunk is buffered until the relay acknowledges it; a transport
    /// failure triggers a transparent resume and resend.
    pub async fn send_data(&mut self, payload: Bytes) -> Result<(), RelayError> {
        if !matches!(
            self.state,
            RelayConnectionState::Connected | RelayConnectionState::Reconnecting
        ) {
            return Err(RelayError::new(
                RelayErrorKind::ConnectionClosed,
                "cannot send on a closed relay connection",
            ));
        }

        let sequence = self.next_send_seq;
        let frame = RelayFrame::data(sequence, payload.clone())?;
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        self.inflight_bytes += payload.len();
        self.unacked_out.push_back(UnackedWrite { sequence, payload });
        if self.inflight_bytes > self.limits.max_inflight_bytes {
            self.state = RelayConnectionState::Failed;
            return Err(RelayError::new(
                RelayErrorKind::BufferOverflow,
                "unacknowledged data exceeded the inflight ceiling",
            ));
        }
        match self.stream_send(frame).await {
            Ok(()) => Ok(()),
            // recover() resends everything unacknowledged, this chunk included.
            Err(e) if e.is_recoverable() => self.recover().await,
            Err(e) => {
                self.state = RelayConnectionState::Failed;
                Err(e)
            }
        }
    }

    /// Waits for the next in-order inbound payload. `Ok(None)` means the
    /// relay closed the session normally.
    pub async fn receive(&mut self) -> Result<Option<Bytes>, RelayError> {
        loop {
            let item = self.next_frame().await;
            match self.process(item).await? {
                Progress::Payload(payload) => return Ok(Some(payload)),
                Progress::Continue => {}
                Progress::Finished => return Ok(None),
            }
        }
    }

    /// Polls the transport for the next raw frame. Cancel-safe: a dropped
    /// call loses no connection state, so it may race other futures in a
    /// `select!`.
    pub async fn next_frame(&mut self) -> Option<Result<RelayFrame, CoreError>> {
        match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => Some(Err(CoreError::new(
                CoreErrorKind::IoError,
                "no active relay stream",
            ))),
        }
    }

    /// Advances the connection with one transport item produced by
    /// [`next_frame`](Self::next_frame). Handles acknowledgment
    /// bookkeeping, replay suppression after a resume, close codes and
    /// transparent recovery from transport errors.
    pub async fn process(
        &mut self,
        item: Option<Result<RelayFrame, CoreError>>,
    ) -> Result<Progress, RelayError> {
        match item {
            Some(Ok(RelayFrame::Data { sequence, payload })) => {
                if sequence == self.next_expected_seq {
                    self.next_expected_seq = self.next_expected_seq.wrapping_add(1);
                    self.bytes_unacked_in += payload.len() as u64;
                    if self.bytes_unacked_in >= self.limits.ack_window_bytes {
                        self.send_ack().await?;
                    }
                    Ok(Progress::Payload(payload))
                } else if seq_newer(self.next_expected_seq, sequence) {
                    // Replay of a chunk delivered before the resume.
                    debug!("Dropping replayed DATA #{sequence}");
                    Ok(Progress::Continue)
                } else {
                    self.state = RelayConnectionState::Failed;
                    Err(RelayError::new(
                        RelayErrorKind::ProtocolViolation,
                        "the relay skipped ahead in the data stream",
                    ))
                }
            }
            Some(Ok(RelayFrame::Ack { sequence })) => {
                if seq_newer(sequence, self.next_send_seq) {
                    self.state = RelayConnectionState::Failed;
                    return Err(RelayError::new(
                        RelayErrorKind::ProtocolViolation,
                        "the relay acknowledged data that was never sent",
                    ));
                }
                self.prune_acked(sequence);
                Ok(Progress::Continue)
            }
            Some(Ok(RelayFrame::Close { code, reason })) => self.process_close(code, reason).await,
            Some(Ok(frame)) => {
                debug!("Ignoring unexpected {} frame", frame.name());
                Ok(Progress::Continue)
            }
            Some(Err(e)) if matches!(e.error_kind, CoreErrorKind::IoError) => {
                self.recover().await?;
                Ok(Progress::Continue)
            }
            Some(Err(e)) => {
                self.state = RelayConnectionState::Failed;
                Err(RelayError::new(
                    RelayErrorKind::ProtocolViolation,
                    e.to_string().as_str(),
                ))
            }
            None => {
                // The transport ended without a close frame; treat it as a
                // reset and try to resume the session.
                self.recover().await?;
                Ok(Progress::Continue)
            }
        }
    }

    async fn process_close(
        &mut self,
        code: CloseCode,
        reason: String,
    ) -> Result<Progress, RelayError> {
        match code {
            CloseCode::Normal => {
                self.state = RelayConnectionState::Closed;
                Ok(Progress::Finished)
            }
            CloseCode::NotAuthorized => {
                self.state = RelayConnectionState::Failed;
                Err(RelayError::new(
                    RelayErrorKind::AccessDenied,
                    reason.as_str(),
                ))
            }
            CloseCode::SidUnknown | CloseCode::SidInUse | CloseCode::FailedToRewind => {
                self.state = RelayConnectionState::Failed;
                Err(RelayError::new(
                    RelayErrorKind::ReconnectFailed,
                    reason.as_str(),
                ))
            }
            CloseCode::BackendConnectFailed | CloseCode::LookupFailed => {
                self.state = RelayConnectionState::Failed;
                Err(RelayError::new(
                    RelayErrorKind::ConnectFailed,
                    format!("{code}: {reason}").as_str(),
                ))
            }
            CloseCode::Other(_) => {
                warn!("Relay closed the stream ({code}: {reason}), attempting to resume");
                self.recover().await?;
                Ok(Progress::Continue)
            }
        }
    }

    /// Closes the stream, flushing a final ACK for any unacknowledged
    /// received bytes. Safe to call in any state.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if self.bytes_unacked_in > 0 {
                let _ = stream
                    .send(RelayFrame::Ack {
                        sequence: self.next_expected_seq,
                    })
                    .await;
            }
            let _ = stream.close().await;
        }
        if self.state != RelayConnectionState::Failed {
            self.state = RelayConnectionState::Closed;
        }
    }

    async fn stream_send(&mut self, frame: RelayFrame) -> Result<(), RelayError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(RelayError::new(
                RelayErrorKind::StreamError,
                "no active relay stream",
            ));
        };
        stream
            .send(frame)
            .await
            .map_err(|e| RelayError::new(RelayErrorKind::StreamError, e.to_string().as_str()))
    }

    async fn send_ack(&mut self) -> Result<(), RelayError> {
        let ack = RelayFrame::Ack {
            sequence: self.next_expected_seq,
        };
        match self.stream_send(ack).await {
            Ok(()) => {
                self.bytes_unacked_in = 0;
                Ok(())
            }
            // The resume dial carries our receive position, so a pending
            // ACK does not need to be replayed.
            Err(e) if e.is_recoverable() => self.recover().await,
            Err(e) => {
                self.state = RelayConnectionState::Failed;
                Err(e)
            }
        }
    }

    fn prune_acked(&mut self, ack: u32) {
        while let Some(front) = self.unacked_out.front() {
            if seq_newer(ack, front.sequence) {
                self.inflight_bytes -= front.payload.len();
                self.unacked_out.pop_front();
            } else {
                break;
            }
        }
    }

    /// Resumes the session after a transport failure: bounded redial with
    /// exponential backoff, resume handshake, resend of unacknowledged
    /// frames. Exhausting the budget, or the relay discarding the session,
    /// is terminal.
    async fn recover(&mut self) -> Result<(), RelayError> {
        let Some(sid) = self.sid.clone() else {
            self.state = RelayConnectionState::Failed;
            return Err(RelayError::new(
                RelayErrorKind::ReconnectFailed,
                "no session id to resume with",
            ));
        };
        self.stream = None;
        self.state = RelayConnectionState::Reconnecting;
        self.bytes_unacked_in = 0;

        let mut backoff = self.limits.backoff_base;
        for attempt in 1..=self.limits.max_reconnects {
            warn!(
                "Relay stream lost, resume attempt {attempt} of {}",
                self.limits.max_reconnects
            );
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.limits.backoff_cap);

            let mut stream = match self.target.reopen(sid.as_str(), self.next_expected_seq).await {
                Ok(stream) => stream,
                Err(e) if e.is_recoverable() => {
                    debug!("Resume dial failed: {e}");
                    continue;
                }
                Err(e) => {
                    self.state = RelayConnectionState::Failed;
                    return Err(e);
                }
            };

            let ack = match timeout(
                self.limits.connect_timeout,
                await_reconnect_ack::<T>(&mut stream),
            )
            .await
            {
                Ok(Ok(ack)) => ack,
                Ok(Err(e))
                    if matches!(
                        e.error_kind,
                        RelayErrorKind::AccessDenied
                            | RelayErrorKind::ReconnectFailed
                            | RelayErrorKind::ProtocolViolation
                    ) =>
                {
                    self.state = RelayConnectionState::Failed;
                    return Err(e);
                }
                Ok(Err(e)) => {
                    debug!("Resume handshake failed: {e}");
                    continue;
                }
                Err(_) => {
                    debug!("Resume handshake timed out");
                    continue;
                }
            };

            if seq_newer(ack, self.next_send_seq) {
                self.state = RelayConnectionState::Failed;
                return Err(RelayError::new(
                    RelayErrorKind::ProtocolViolation,
                    "the relay acknowledged data that was never sent",
                ));
            }
            self.prune_acked(ack);

            let mut resend_failed = false;
            for write in &self.unacked_out {
                let frame = RelayFrame::Data {
                    sequence: write.sequence,
                    payload: write.payload.clone(),
                };
                if let Err(e) = stream.send(frame).await {
                    debug!("Resend after resume failed: {e}");
                    resend_failed = true;
                    break;
                }
            }
            if resend_failed {
                continue;
            }

            self.stream = Some(stream);
            self.state = RelayConnectionState::Connected;
            info!(
                "Relay session resumed for {} ({} frames resent)",
                self.target.describe(),
                self.unacked_out.len()
            );
            return Ok(());
        }

        self.state = RelayConnectionState::Failed;
        Err(RelayError::new(
            RelayErrorKind::ReconnectFailed,
            "gave up resuming the relay session after repeated failures",
        ))
    }
}

async fn await_connect_success<T: RelayTarget>(stream: &mut T::Stream) -> Result<String, RelayError> {
    loop {
        match stream.next().await {
            None => {
                return Err(RelayError::new(
                    RelayErrorKind::ConnectFailed,
                    "the relay closed the stream during the handshake",
                ));
            }
            Some(Err(e)) => {
                return Err(RelayError::new(
                    RelayErrorKind::ConnectFailed,
                    e.to_string().as_str(),
                ));
            }
            Some(Ok(RelayFrame::ConnectSuccess { sid })) => return Ok(sid),
            Some(Ok(RelayFrame::Close { code, reason })) => {
                return Err(close_to_handshake_error(code, reason.as_str()));
            }
            Some(Ok(frame)) => {
                debug!("Ignoring {} before the handshake completed", frame.name());
            }
        }
    }
}

async fn await_reconnect_ack<T: RelayTarget>(stream: &mut T::Stream) -> Result<u32, RelayError> {
    loop {
        match stream.next().await {
            None => {
                return Err(RelayError::new(
                    RelayErrorKind::StreamError,
                    "the relay closed the stream during the resume handshake",
                ));
            }
            Some(Err(e)) => {
                return Err(RelayError::new(
                    RelayErrorKind::StreamError,
                    e.to_string().as_str(),
                ));
            }
            Some(Ok(RelayFrame::ReconnectSuccess { ack })) => return Ok(ack),
            Some(Ok(RelayFrame::ConnectSuccess { .. })) => {
                return Err(RelayError::new(
                    RelayErrorKind::ProtocolViolation,
                    "the relay answered a resume with a fresh session",
                ));
            }
            Some(Ok(RelayFrame::Close { code, reason })) => {
                return Err(close_to_handshake_error(code, reason.as_str()));
            }
            Some(Ok(frame)) => {
                debug!("Ignoring {} during the resume handshake", frame.name());
            }
        }
    }
}

fn close_to_handshake_error(code: CloseCode, reason: &str) -> RelayError {
    match code {
        CloseCode::NotAuthorized => RelayError::new(RelayErrorKind::AccessDenied, reason),
        CloseCode::SidUnknown | CloseCode::SidInUse | CloseCode::FailedToRewind => {
            RelayError::new(RelayErrorKind::ReconnectFailed, reason)
        }
        _ => RelayError::new(
            RelayErrorKind::ConnectFailed,
            format!("{code}: {reason}").as_str(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    struct ScriptedStream {
        incoming: VecDeque<Result<RelayFrame, CoreError>>,
        sent: Arc<Mutex<Vec<RelayFrame>>>,
    }

    impl ScriptedStream {
        fn new(
            incoming: Vec<Result<RelayFrame, CoreError>>,
        ) -> (Self, Arc<Mutex<Vec<RelayFrame>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    incoming: incoming.into(),
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    impl futures::Stream for ScriptedStream {
        type Item = Result<RelayFrame, CoreError>;

        fn poll_next(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Self::Item>> {
            Poll::Ready(self.incoming.pop_front())
        }
    }

    impl futures::Sink<RelayFrame> for ScriptedStream {
        type Error = CoreError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, frame: RelayFrame) -> Result<(), CoreError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
            Poll::Ready(Ok(()))
        }
    }

    struct ScriptedTarget {
        streams: Mutex<VecDeque<ScriptedStream>>,
        opens: AtomicUsize,
        reopens: AtomicUsize,
        resumes: Mutex<Vec<(String, u32)>>,
    }

    impl ScriptedTarget {
        fn new(streams: Vec<ScriptedStream>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
                opens: AtomicUsize::new(0),
                reopens: AtomicUsize::new(0),
                resumes: Mutex::new(Vec::new()),
            }
        }

        fn pop_stream(&self, kind: RelayErrorKind) -> Result<ScriptedStream, RelayError> {
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RelayError::new(kind, "scripted streams exhausted"))
        }
    }

    #[async_trait]
    impl RelayTarget for Arc<ScriptedTarget> {
        type Stream = ScriptedStream;

        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn session_token(&self) -> Result<String, RelayError> {
            Ok("test-token".to_string())
        }

        async fn open(&self) -> Result<ScriptedStream, RelayError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.pop_stream(RelayErrorKind::ConnectFailed)
        }

        async fn reopen(&self, sid: &str, next_expected: u32) -> Result<ScriptedStream, RelayError> {
            self.reopens.fetch_add(1, Ordering::SeqCst);
            self.resumes
                .lock()
                .unwrap()
                .push((sid.to_string(), next_expected));
            self.pop_stream(RelayErrorKind::StreamError)
        }
    }

    fn test_limits() -> RelayLimits {
        RelayLimits {
            connect_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            ..RelayLimits::default()
        }
    }

    fn connect_success() -> Result<RelayFrame, CoreError> {
        Ok(RelayFrame::ConnectSuccess {
            sid: "sid-1".to_string(),
        })
    }

    fn io_error() -> Result<RelayFrame, CoreError> {
        Err(CoreError::new(CoreErrorKind::IoError, "connection reset"))
    }

    fn data(sequence: u32, payload: &'static [u8]) -> Result<RelayFrame, CoreError> {
        Ok(RelayFrame::Data {
            sequence,
            payload: Bytes::from_static(payload),
        })
    }

    #[tokio::test]
    async fn connect_completes_the_handshake() {
        let (stream, sent) = ScriptedStream::new(vec![connect_success()]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));

        let connection = RelayConnection::connect(target.clone(), test_limits())
            .await
            .unwrap();

        assert_eq!(connection.state(), RelayConnectionState::Connected);
        assert_eq!(connection.sid(), Some("sid-1"));
        assert_eq!(target.opens.load(Ordering::SeqCst), 1);
        assert_eq!(*sent.lock().unwrap(), [RelayFrame::Connect {
            token: "test-token".to_string()
        }]);
    }

    #[tokio::test]
    async fn connect_denial_is_terminal() {
        let (stream, _sent) = ScriptedStream::new(vec![Ok(RelayFrame::Close {
            code: CloseCode::NotAuthorized,
            reason: "missing tunnel role".to_string(),
        })]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));

        let err = RelayConnection::connect(target.clone(), test_limits())
            .await
            .unwrap_err();

        assert!(matches!(err.error_kind, RelayErrorKind::AccessDenied));
        assert_eq!(target.opens.load(Ordering::SeqCst), 1);
        assert_eq!(target.reopens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn receive_yields_payloads_in_order_and_acks_after_the_window() {
        let (stream, sent) = ScriptedStream::new(vec![
            connect_success(),
            data(0, b"hello"),
            data(1, b"world"),
        ]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));
        let limits = RelayLimits {
            ack_window_bytes: 8,
            ..test_limits()
        };

        let mut connection = RelayConnection::connect(target, limits).await.unwrap();
        assert_eq!(
            connection.receive().await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(
            connection.receive().await.unwrap(),
            Some(Bytes::from_static(b"world"))
        );

        let sent = sent.lock().unwrap();
        assert!(
            sent.contains(&RelayFrame::Ack { sequence: 2 }),
            "no ACK sent after crossing the window: {sent:?}"
        );
        assert_eq!(connection.bytes_unacked_in, 0);
    }

    #[tokio::test]
    async fn acks_prune_the_unacked_queue() {
        let (stream, _sent) = ScriptedStream::new(vec![
            connect_success(),
            Ok(RelayFrame::Ack { sequence: 2 }),
            Ok(RelayFrame::Close {
                code: CloseCode::Normal,
                reason: String::new(),
            }),
        ]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));

        let mut connection = RelayConnection::connect(target, test_limits()).await.unwrap();
        for chunk in [&b"a"[..], b"b", b"c"] {
            connection.send_data(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        assert_eq!(connection.unacked_out.len(), 3);

        // Drains the scripted ACK, then the relay closes normally.
        assert_eq!(connection.receive().await.unwrap(), None);
        assert_eq!(connection.unacked_out.len(), 1);
        assert_eq!(connection.unacked_out.front().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn mismatched_ack_is_a_protocol_violation() {
        let (stream, _sent) =
            ScriptedStream::new(vec![connect_success(), Ok(RelayFrame::Ack { sequence: 5 })]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));

        let mut connection = RelayConnection::connect(target, test_limits()).await.unwrap();
        let err = connection.receive().await.unwrap_err();
        assert!(matches!(err.error_kind, RelayErrorKind::ProtocolViolation));
        assert_eq!(connection.state(), RelayConnectionState::Failed);
    }

    #[tokio::test]
    async fn resume_resends_only_unacknowledged_frames() {
        // First stream: handshake, relay acknowledges the first chunk, then
        // the transport resets.
        let (first, _first_sent) = ScriptedStream::new(vec![
            connect_success(),
            Ok(RelayFrame::Ack { sequence: 1 }),
            io_error(),
        ]);
        // Resumed stream: the relay reports it only received the first
        // chunk, then delivers a response.
        let (second, second_sent) = ScriptedStream::new(vec![
            Ok(RelayFrame::ReconnectSuccess { ack: 1 }),
            data(0, b"pong"),
        ]);
        let target = Arc::new(ScriptedTarget::new(vec![first, second]));

        let mut connection = RelayConnection::connect(target.clone(), test_limits())
            .await
            .unwrap();
        connection.send_data(Bytes::from_static(b"alpha")).await.unwrap();
        connection.send_data(Bytes::from_static(b"beta")).await.unwrap();

        // Consumes the ACK, hits the reset, resumes, then receives data on
        // the new stream.
        assert_eq!(
            connection.receive().await.unwrap(),
            Some(Bytes::from_static(b"pong"))
        );

        assert_eq!(connection.state(), RelayConnectionState::Connected);
        assert_eq!(target.reopens.load(Ordering::SeqCst), 1);
        assert_eq!(*target.resumes.lock().unwrap(), [("sid-1".to_string(), 0)]);
        // Only the unacknowledged second chunk went out again, with its
        // original sequence number.
        assert_eq!(*second_sent.lock().unwrap(), [RelayFrame::Data {
            sequence: 1,
            payload: Bytes::from_static(b"beta"),
        }]);
    }

    #[tokio::test]
    async fn resume_budget_exhaustion_is_terminal() {
        let (stream, _sent) = ScriptedStream::new(vec![connect_success(), io_error()]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));
        let limits = RelayLimits {
            max_reconnects: 2,
            ..test_limits()
        };

        let mut connection = RelayConnection::connect(target.clone(), limits).await.unwrap();
        let err = connection.receive().await.unwrap_err();

        assert!(matches!(err.error_kind, RelayErrorKind::ReconnectFailed));
        assert_eq!(connection.state(), RelayConnectionState::Failed);
        assert_eq!(target.reopens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn discarded_session_fails_without_further_attempts() {
        let (first, _first_sent) = ScriptedStream::new(vec![connect_success(), io_error()]);
        let (second, _second_sent) = ScriptedStream::new(vec![Ok(RelayFrame::Close {
            code: CloseCode::SidUnknown,
            reason: "session expired".to_string(),
        })]);
        let target = Arc::new(ScriptedTarget::new(vec![first, second]));
        let limits = RelayLimits {
            max_reconnects: 5,
            ..test_limits()
        };

        let mut connection = RelayConnection::connect(target.clone(), limits).await.unwrap();
        let err = connection.receive().await.unwrap_err();

        assert!(matches!(err.error_kind, RelayErrorKind::ReconnectFailed));
        assert_eq!(target.reopens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inflight_ceiling_is_a_fatal_buffer_overflow() {
        let (stream, _sent) = ScriptedStream::new(vec![connect_success()]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));
        let limits = RelayLimits {
            max_inflight_bytes: 8,
            ..test_limits()
        };

        let mut connection = RelayConnection::connect(target, limits).await.unwrap();
        connection.send_data(Bytes::from_static(b"12345")).await.unwrap();
        let err = connection
            .send_data(Bytes::from_static(b"67890"))
            .await
            .unwrap_err();

        assert!(matches!(err.error_kind, RelayErrorKind::BufferOverflow));
        assert_eq!(connection.state(), RelayConnectionState::Failed);
    }

    #[tokio::test]
    async fn normal_close_finishes_the_stream() {
        let (stream, _sent) = ScriptedStream::new(vec![
            connect_success(),
            Ok(RelayFrame::Close {
                code: CloseCode::Normal,
                reason: String::new(),
            }),
        ]);
        let target = Arc::new(ScriptedTarget::new(vec![stream]));

        let mut connection = RelayConnection::connect(target, test_limits()).await.unwrap();
        assert_eq!(connection.receive().await.unwrap(), None);
        assert_eq!(connection.state(), RelayConnectionState::Closed);
    }
}
