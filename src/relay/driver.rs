//! Per-forward accept loops.
//!
//! Client forwards listen inside the sandbox and dial out from the caller's
//! namespace; server forwards listen in the caller's namespace and dial into
//! the sandbox. Both run the same loop: which side needs a namespace switch
//! comes from the forward's scopes.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{datagram, pump};
use crate::error::Result;
use crate::forward::Forward;
use crate::netns::NamespaceGateway;
use crate::socket::{Connection, Listener, SocketFactory};

/// Pause after a failed accept so a persistent error (EMFILE) cannot spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Source of accepted connections for an accept loop.
pub(crate) trait Accept: Send {
    fn accept(&mut self) -> impl Future<Output = io::Result<(Connection, String)>> + Send;
}

impl Accept for Listener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(Connection, String)>> + Send {
        self.accept_connection()
    }
}

/// Everything a running forward's tasks share.
pub(crate) struct ForwardContext<G> {
    pub index: usize,
    pub forward: Arc<Forward>,
    pub factory: SocketFactory<G>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    pub relays: Arc<AtomicUsize>,
}

impl<G> Clone for ForwardContext<G> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            forward: self.forward.clone(),
            factory: self.factory.clone(),
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
            relays: self.relays.clone(),
        }
    }
}

impl<G: NamespaceGateway> ForwardContext<G> {
    /// Dial the forward's remote address from its dial scope.
    pub async fn dial(&self) -> Result<Connection> {
        self.factory
            .connect(self.forward.dial_scope(), self.forward.protocol, &self.forward.remote)
            .await
    }

    /// Count a relay as live until the guard drops.
    pub fn track_relay(&self) -> RelayGuard {
        self.relays.fetch_add(1, Ordering::SeqCst);
        RelayGuard {
            relays: self.relays.clone(),
        }
    }

    /// Short label for log lines.
    pub fn label(&self) -> String {
        format!(
            "#{} {} {} (pid {})",
            self.index,
            self.forward.direction,
            self.forward,
            self.factory.sandbox_pid()
        )
    }
}

pub(crate) struct RelayGuard {
    relays: Arc<AtomicUsize>,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.relays.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive a forward until its token is cancelled.
pub(crate) async fn run<G: NamespaceGateway>(listener: Listener, ctx: ForwardContext<G>) {
    match listener {
        Listener::Udp(socket) => datagram::serve_udp(socket, ctx).await,
        Listener::Unixgram(socket) => datagram::serve_unixgram(socket, ctx).await,
        stream => accept_loop(stream, ctx).await,
    }
}

pub(crate) async fn accept_loop<A, G>(mut acceptor: A, ctx: ForwardContext<G>)
where
    A: Accept,
    G: NamespaceGateway,
{
    loop {
        let accepted = tokio::select! {
            accepted = acceptor.accept() => accepted,
            _ = ctx.cancel.cancelled() => break,
        };

        match accepted {
            Ok((leg, peer)) => {
                let conn_ctx = ctx.clone();
                ctx.tracker.spawn(async move { bridge(leg, peer, conn_ctx).await });
            }
            Err(e) => {
                tracing::error!("Socket: {} (accept on forward {})", e, ctx.label());
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                    _ = ctx.cancel.cancelled() => break,
                }
            }
        }
    }

    tracing::debug!("Forward {} stopped accepting", ctx.label());
}

/// Dial the peer leg for one accepted connection and relay until done.
async fn bridge<G: NamespaceGateway>(leg: Connection, peer: String, ctx: ForwardContext<G>) {
    let remote = tokio::select! {
        remote = ctx.dial() => remote,
        _ = ctx.cancel.cancelled() => return,
    };
    let remote = match remote {
        Ok(remote) => remote,
        Err(e) => {
            tracing::error!(
                "Socket: {} (connecting {} for {} on forward {})",
                e,
                ctx.forward.remote,
                peer,
                ctx.label()
            );
            return;
        }
    };

    let _live = ctx.track_relay();
    tracing::debug!("Relay opened: {} <-> {}", peer, ctx.forward.remote);

    match pump::relay(leg, remote, &ctx.cancel).await {
        Ok(stats) => tracing::debug!(
            "Relay closed: {} <-> {} ({} bytes out, {} bytes back)",
            peer,
            ctx.forward.remote,
            stats.sent,
            stats.received
        ),
        Err(e) => tracing::debug!("Relay failed: {} <-> {}: {}", peer, ctx.forward.remote, e),
    }
}
