//! Loopback listener feeding tunnel sessions.

use crate::error::TunnelError;
use crate::session::{SessionEnd, TunnelSession, TunnelStatistics};
use burrow_core::policy::{CallerContext, PolicyDecision, RelayPolicy};
use burrow_core::target::TunnelDestination;
use burrow_relay::connection::{RelayConnection, RelayLimits};
use burrow_relay::target::{RelayTarget, RelayTargetFactory};
use log::{debug, error, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    LocalClosed,
    RemoteClosed,
    Cancelled,
    Failed(String),
}

/// Out-of-band notifications about the sessions of a tunnel. Session-level
/// failures are reported here, never by failing the listener or the
/// broker handle.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    SessionStarted { session: Uuid, peer: SocketAddr },
    SessionDenied { peer: SocketAddr, reason: String },
    SessionEnded { session: Uuid, outcome: SessionOutcome },
}

/// Accepts local connections for one destination and runs one session per
/// accepted connection. The policy is evaluated before any relay work; a
/// denied caller is disconnected without a single relay dial.
pub struct TunnelListener {
    local_addr: SocketAddr,
    accept_cancel: CancellationToken,
    session_cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelListener {
    pub async fn spawn<F: RelayTargetFactory>(
        destination: TunnelDestination,
        policy: Arc<dyn RelayPolicy>,
        factory: Arc<F>,
        limits: RelayLimits,
        local_port: u16,
        events: mpsc::Sender<TunnelEvent>,
        stats: Arc<TunnelStatistics>,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Tunnel to {destination} listening on {local_addr}");

        let accept_cancel = CancellationToken::new();
        let session_cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            destination,
            policy,
            factory,
            limits,
            events,
            stats,
            accept_cancel.clone(),
            session_cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            accept_cancel,
            session_cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. A hard stop also cancels every
    /// running session and waits for them; a soft stop lets sessions drain
    /// in the background.
    pub async fn stop(self, hard: bool) {
        self.accept_cancel.cancel();
        if hard {
            self.session_cancel.cancel();
            if let Err(e) = self.task.await {
                error!("Listener task failed: {e}");
            }
        } else {
            tokio::spawn(async move {
                if let Err(e) = self.task.await {
                    error!("Listener task failed: {e}");
                }
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop<F: RelayTargetFactory>(
    listener: TcpListener,
    destination: TunnelDestination,
    policy: Arc<dyn RelayPolicy>,
    factory: Arc<F>,
    limits: RelayLimits,
    events: mpsc::Sender<TunnelEvent>,
    stats: Arc<TunnelStatistics>,
    accept_cancel: CancellationToken,
    session_cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = accept_cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let caller = CallerContext::new(peer);
                    match policy.evaluate(&caller, &destination) {
                        PolicyDecision::Allow => {
                            let target = match factory.target(&destination) {
                                Ok(target) => target,
                                Err(e) => {
                                    error!("No relay target for {destination}: {e}");
                                    continue;
                                }
                            };
                            debug!("Connection from {peer} admitted to {destination}");
                            let session = TunnelSession::new(peer, stats.clone());
                            sessions.spawn(run_session(
                                socket,
                                session,
                                target,
                                limits.clone(),
                                session_cancel.child_token(),
                                events.clone(),
                            ));
                        }
                        PolicyDecision::Deny { reason } => {
                            warn!("Connection from {peer} to {destination} denied: {reason}");
                            let _ = events.try_send(TunnelEvent::SessionDenied { peer, reason });
                            drop(socket);
                        }
                    }
                }
                Err(e) => {
                    error!("Accept on {} failed: {e}", listener.local_addr().map(|a| a.to_string()).unwrap_or_default());
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!("Session task failed: {e}");
                }
            }
        }
    }

    // Drain the remaining sessions; with a hard stop they have already
    // been cancelled.
    while let Some(finished) = sessions.join_next().await {
        if let Err(e) = finished {
            error!("Session task failed: {e}");
        }
    }
    debug!("Listener for {destination} stopped");
}

async fn run_session<T: RelayTarget>(
    socket: TcpStream,
    session: TunnelSession,
    target: T,
    limits: RelayLimits,
    cancel: CancellationToken,
    events: mpsc::Sender<TunnelEvent>,
) {
    let id = session.id();
    let peer = session.peer();
    let _ = events
        .send(TunnelEvent::SessionStarted { session: id, peer })
        .await;

    let connection = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events.send(TunnelEvent::SessionEnded {
                session: id,
                outcome: SessionOutcome::Cancelled,
            }).await;
            return;
        }
        connection = RelayConnection::connect(target, limits) => connection,
    };

    let outcome = match connection {
        Ok(connection) => match session.run(socket, connection, cancel).await {
            Ok(SessionEnd::LocalClosed) => SessionOutcome::LocalClosed,
            Ok(SessionEnd::RemoteClosed) => SessionOutcome::RemoteClosed,
            Ok(SessionEnd::Cancelled) => SessionOutcome::Cancelled,
            Err(e) => {
                error!("Session {id} from {peer} failed: {e}");
                SessionOutcome::Failed(e.to_string())
            }
        },
        Err(e) => {
            // The local socket is dropped without ever having carried data.
            warn!("Relay connect for {peer} failed: {e}");
            SessionOutcome::Failed(e.to_string())
        }
    };

    let _ = events
        .send(TunnelEvent::SessionEnded {
            session: id,
            outcome,
        })
        .await;
}
