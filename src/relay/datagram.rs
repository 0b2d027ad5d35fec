//! Datagram forwarding.
//!
//! There is no accept step for datagram transports. The bound socket takes
//! the listener's place and a peer leg is dialed when traffic first arrives.
//! Datagrams are passed through as-is, one in, one out. Sessions have no
//! end-of-input signal, so they last until a read or write on a leg fails or
//! the forward is stopped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use nix::sys::socket::UnixAddr;
use parking_lot::Mutex;
use tokio::net::{UdpSocket, UnixDatagram};

use super::driver::ForwardContext;
use crate::netns::NamespaceGateway;
use crate::socket::{message, Connection};

/// Receive buffer for datagrams. Covers the largest UDP payload; unix
/// datagrams that exceed it grow the buffer instead.
const MAX_DATAGRAM: usize = 64 * 1024;

type UdpSessions = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>;

/// Serve a UDP forward: one dialed peer socket per source address.
pub(crate) async fn serve_udp<G: NamespaceGateway>(socket: UdpSocket, ctx: ForwardContext<G>) {
    let socket = Arc::new(socket);
    let sessions: UdpSessions = Arc::default();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = ctx.cancel.cancelled() => break,
        };
        let (n, source) = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::error!("Socket: {} (receive on forward {})", e, ctx.label());
                continue;
            }
        };

        let existing = sessions.lock().get(&source).cloned();
        let leg = match existing {
            Some(leg) => leg,
            None => match ctx.dial().await {
                Ok(Connection::Udp(leg)) => {
                    let leg = Arc::new(leg);
                    sessions.lock().insert(source, leg.clone());
                    let session = UdpSession {
                        source,
                        socket: socket.clone(),
                        leg: leg.clone(),
                        sessions: sessions.clone(),
                    };
                    let task_ctx = ctx.clone();
                    ctx.tracker.spawn(async move { session.pump_replies(task_ctx).await });
                    leg
                }
                Ok(other) => {
                    tracing::error!("Dialed a {} socket for a udp forward", other.protocol());
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        "Socket: {} (connecting {} for {} on forward {})",
                        e,
                        ctx.forward.remote,
                        source,
                        ctx.label()
                    );
                    continue;
                }
            },
        };

        if let Err(e) = leg.send(&buf[..n]).await {
            tracing::debug!("UDP session for {} ended: {}", source, e);
            remove_session(&sessions, source, &leg);
        }
    }

    sessions.lock().clear();
    tracing::debug!("Forward {} stopped receiving", ctx.label());
}

struct UdpSession {
    source: SocketAddr,
    socket: Arc<UdpSocket>,
    leg: Arc<UdpSocket>,
    sessions: UdpSessions,
}

impl UdpSession {
    /// Send everything the peer leg receives back to the original source.
    async fn pump_replies<G: NamespaceGateway>(self, ctx: ForwardContext<G>) {
        let _live = ctx.track_relay();
        tracing::debug!("UDP session opened: {} <-> {}", self.source, ctx.forward.remote);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let reason = loop {
            let received = tokio::select! {
                received = self.leg.recv(&mut buf) => received,
                _ = ctx.cancel.cancelled() => break "forward stopped".to_string(),
            };
            let n = match received {
                Ok(n) => n,
                Err(e) => break e.to_string(),
            };
            if let Err(e) = self.socket.send_to(&buf[..n], self.source).await {
                break e.to_string();
            }
        };

        remove_session(&self.sessions, self.source, &self.leg);
        tracing::debug!("UDP session closed: {} <-> {}: {}", self.source, ctx.forward.remote, reason);
    }
}

/// Remove `leg` for `source`, unless it has already been replaced.
fn remove_session(sessions: &UdpSessions, source: SocketAddr, leg: &Arc<UdpSocket>) {
    let mut sessions = sessions.lock();
    if sessions.get(&source).is_some_and(|current| Arc::ptr_eq(current, leg)) {
        sessions.remove(&source);
    }
}

/// Serve a unix datagram forward.
///
/// Unix datagram senders are often unnamed, so there is one peer leg per
/// forward. Replies go to the most recent sender bound to a name, pathname or
/// abstract, and are dropped when there is none.
pub(crate) async fn serve_unixgram<G: NamespaceGateway>(socket: UnixDatagram, ctx: ForwardContext<G>) {
    let socket = Arc::new(socket);
    let reply_to: Arc<Mutex<Option<UnixAddr>>> = Arc::default();
    let leg: Arc<Mutex<Option<Arc<UnixDatagram>>>> = Arc::default();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            received = message::recv_from(&socket, &mut buf) => received,
            _ = ctx.cancel.cancelled() => break,
        };
        let (n, source) = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::error!("Socket: {} (receive on forward {})", e, ctx.label());
                continue;
            }
        };
        if let Some(source) = source.filter(message::is_reachable) {
            *reply_to.lock() = Some(source);
        }

        let existing = leg.lock().clone();
        let current = match existing {
            Some(current) => current,
            None => match ctx.dial().await {
                Ok(Connection::Unixgram(dialed)) => {
                    let dialed = Arc::new(dialed);
                    *leg.lock() = Some(dialed.clone());
                    let task_ctx = ctx.clone();
                    let replies = UnixgramReplies {
                        socket: socket.clone(),
                        leg: dialed.clone(),
                        slot: leg.clone(),
                        reply_to: reply_to.clone(),
                    };
                    ctx.tracker.spawn(async move { replies.pump(task_ctx).await });
                    dialed
                }
                Ok(other) => {
                    tracing::error!("Dialed a {} socket for a unixgram forward", other.protocol());
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        "Socket: {} (connecting {} on forward {})",
                        e,
                        ctx.forward.remote,
                        ctx.label()
                    );
                    continue;
                }
            },
        };

        if let Err(e) = current.send(&buf[..n]).await {
            tracing::debug!("Unix datagram session ended: {}", e);
            clear_leg(&leg, &current);
        }
    }

    leg.lock().take();
    tracing::debug!("Forward {} stopped receiving", ctx.label());
}

struct UnixgramReplies {
    socket: Arc<UnixDatagram>,
    leg: Arc<UnixDatagram>,
    slot: Arc<Mutex<Option<Arc<UnixDatagram>>>>,
    reply_to: Arc<Mutex<Option<UnixAddr>>>,
}

impl UnixgramReplies {
    async fn pump<G: NamespaceGateway>(self, ctx: ForwardContext<G>) {
        let _live = ctx.track_relay();
        tracing::debug!("Unix datagram session opened to {}", ctx.forward.remote);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let reason = loop {
            let received = tokio::select! {
                received = message::recv(&self.leg, &mut buf) => received,
                _ = ctx.cancel.cancelled() => break "forward stopped".to_string(),
            };
            let n = match received {
                Ok(n) => n,
                Err(e) => break e.to_string(),
            };
            let target = *self.reply_to.lock();
            match target {
                Some(addr) => {
                    if let Err(e) = message::send_to(&self.socket, &buf[..n], &addr).await {
                        tracing::debug!("Dropped reply to {}: {}", addr, e);
                    }
                }
                None => tracing::debug!("Dropped reply: no named sender to return it to"),
            }
        };

        clear_leg(&self.slot, &self.leg);
        tracing::debug!("Unix datagram session to {} closed: {}", ctx.forward.remote, reason);
    }
}

fn clear_leg(slot: &Mutex<Option<Arc<UnixDatagram>>>, leg: &Arc<UnixDatagram>) {
    let mut slot = slot.lock();
    if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, leg)) {
        slot.take();
    }
}
