//! Top-level tunnel façade.
//!
//! The broker owns the table of active tunnels. One listener exists per
//! distinct `(destination, policy)` key; concurrent connect calls for the
//! same key share it. The table mutex covers the whole lookup-or-create,
//! so no duplicate listeners can race into existence.

use crate::error::{TunnelError, TunnelErrorKind};
use crate::listener::{TunnelEvent, TunnelListener};
use crate::session::TunnelStatistics;
use burrow_core::policy::RelayPolicy;
use burrow_core::target::TunnelDestination;
use burrow_relay::connection::{RelayConnection, RelayLimits};
use burrow_relay::error::RelayErrorKind;
use burrow_relay::target::RelayTargetFactory;
use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TunnelKey {
    destination: TunnelDestination,
    policy: String,
}

/// Reference to an active tunnel. Stays valid after session-level
/// failures; those are reported on the broker's event channel instead.
#[derive(Clone, Debug)]
pub struct TunnelHandle {
    key: TunnelKey,
    local_addr: SocketAddr,
    stats: Arc<TunnelStatistics>,
}

impl TunnelHandle {
    pub fn destination(&self) -> &TunnelDestination {
        &self.key.destination
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.stats.bytes_received()
    }
}

struct TunnelEntry {
    listener: TunnelListener,
    handle: TunnelHandle,
}

pub struct TunnelBroker<F: RelayTargetFactory> {
    factory: Arc<F>,
    limits: RelayLimits,
    tunnels: Mutex<HashMap<TunnelKey, TunnelEntry>>,
    events: mpsc::Sender<TunnelEvent>,
}

impl<F: RelayTargetFactory> TunnelBroker<F> {
    /// Returns the broker and the receiving end of its tunnel event
    /// channel.
    pub fn new(factory: F, limits: RelayLimits) -> (Self, mpsc::Receiver<TunnelEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                factory: Arc::new(factory),
                limits,
                tunnels: Mutex::new(HashMap::new()),
                events,
            },
            events_rx,
        )
    }

    /// Looks up or creates the tunnel for `(destination, policy)`. Creation
    /// probes relay connectivity first, bounded by `deadline`, so denied or
    /// unreachable targets fail here instead of on the first local
    /// connection. `local_port` 0 requests an ephemeral port; the port
    /// preference only applies when the call creates the tunnel.
    pub async fn connect(
        &self,
        destination: TunnelDestination,
        policy: Arc<dyn RelayPolicy>,
        local_port: u16,
        deadline: Duration,
    ) -> Result<TunnelHandle, TunnelError> {
        let key = TunnelKey {
            destination: destination.clone(),
            policy: policy.name().to_owned(),
        };

        let mut tunnels = self.tunnels.lock().await;
        if let Some(entry) = tunnels.get(&key) {
            debug!("Sharing existing tunnel for {destination}");
            return Ok(entry.handle.clone());
        }

        let target = self.factory.target(&destination)?;
        let mut probe = match timeout(deadline, RelayConnection::connect(target, self.limits.clone()))
            .await
        {
            Err(_) => {
                return Err(TunnelError::new(
                    TunnelErrorKind::TunnelTimeout,
                    format!("the relay did not answer for {destination} in time").as_str(),
                ));
            }
            Ok(Err(e)) if matches!(e.error_kind, RelayErrorKind::AccessDenied) => {
                return Err(TunnelError::from(e));
            }
            Ok(Err(e)) => {
                return Err(TunnelError::new(
                    TunnelErrorKind::TunnelConnectFailed(e),
                    destination.to_string().as_str(),
                ));
            }
            Ok(Ok(probe)) => probe,
        };
        probe.close().await;

        let stats = Arc::new(TunnelStatistics::default());
        let listener = TunnelListener::spawn(
            destination.clone(),
            policy,
            self.factory.clone(),
            self.limits.clone(),
            local_port,
            self.events.clone(),
            stats.clone(),
        )
        .await?;

        let handle = TunnelHandle {
            key: key.clone(),
            local_addr: listener.local_addr(),
            stats,
        };
        info!(
            "Tunnel to {destination} available on {}",
            handle.local_addr
        );
        tunnels.insert(key, TunnelEntry {
            listener,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Stops the tunnel behind the handle; existing sessions drain in the
    /// background. Idempotent.
    pub async fn disconnect(&self, handle: &TunnelHandle) {
        let entry = self.tunnels.lock().await.remove(&handle.key);
        match entry {
            Some(entry) => {
                entry.listener.stop(false).await;
                info!("Tunnel to {} disconnected", handle.key.destination);
            }
            None => debug!("Tunnel to {} already disconnected", handle.key.destination),
        }
    }

    /// Hard-stops every tunnel, cancelling all sessions.
    pub async fn shutdown(&self) {
        let entries: Vec<TunnelEntry> = {
            let mut tunnels = self.tunnels.lock().await;
            tunnels.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.listener.stop(true).await;
        }
    }

    pub async fn active_tunnels(&self) -> Vec<TunnelHandle> {
        self.tunnels
            .lock()
            .await
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use burrow_core::error::CoreError;
    use burrow_core::frame::RelayFrame;
    use burrow_core::policy::AllowAll;
    use burrow_relay::error::RelayError;
    use burrow_relay::target::RelayTarget;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct NeverStream;

    impl futures::Stream for NeverStream {
        type Item = Result<RelayFrame, CoreError>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Pending
        }
    }

    impl futures::Sink<RelayFrame> for NeverStream {
        type Error = CoreError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _frame: RelayFrame) -> Result<(), CoreError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), CoreError>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Target whose handshake never completes.
    struct HangingTarget;

    #[async_trait]
    impl RelayTarget for HangingTarget {
        type Stream = NeverStream;

        fn describe(&self) -> String {
            "hanging".to_string()
        }

        async fn session_token(&self) -> Result<String, RelayError> {
            Ok("token".to_string())
        }

        async fn open(&self) -> Result<NeverStream, RelayError> {
            Ok(NeverStream)
        }

        async fn reopen(&self, _sid: &str, _next_expected: u32) -> Result<NeverStream, RelayError> {
            Ok(NeverStream)
        }
    }

    struct HangingFactory;

    impl RelayTargetFactory for HangingFactory {
        type Target = HangingTarget;

        fn target(&self, _destination: &TunnelDestination) -> Result<HangingTarget, RelayError> {
            Ok(HangingTarget)
        }
    }

    #[tokio::test]
    async fn connect_times_out_when_the_relay_does_not_answer() {
        let (broker, _events) = TunnelBroker::new(HangingFactory, RelayLimits::default());
        let err = broker
            .connect(
                TunnelDestination::new("p", "z", "vm", 22),
                Arc::new(AllowAll),
                0,
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, TunnelErrorKind::TunnelTimeout));
        assert!(broker.active_tunnels().await.is_empty());
    }
}
