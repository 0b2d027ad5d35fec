//! Bidirectional byte pumps between two connected legs.
//!
//! Each direction copies until its source reports end-of-input, then
//! half-closes its destination so the peer sees the same end-of-input. An
//! error in either direction tears down both. Both legs are dropped, and so
//! closed, once both directions have finished.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::socket::{Connection, SeqpacketStream};

/// Initial receive buffer for seqpacket messages. Larger messages grow it.
const PACKET_BUFFER: usize = 64 * 1024;

/// Bytes moved in each direction once a relay has finished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// From the accepted leg to the dialed leg.
    pub sent: u64,
    /// From the dialed leg back to the accepted leg.
    pub received: u64,
}

/// Relay between two connected legs until both directions are done or
/// `stop` is cancelled.
pub async fn relay(local: Connection, peer: Connection, stop: &CancellationToken) -> io::Result<RelayStats> {
    match (local, peer) {
        (Connection::Seqpacket(a), Connection::Seqpacket(b)) => Ok(pump_packets(a, b, stop).await),
        (Connection::Tcp(a), Connection::Tcp(b)) => Ok(pump_streams(a, b, stop).await),
        (Connection::Unix(a), Connection::Unix(b)) => Ok(pump_streams(a, b, stop).await),
        (Connection::Tcp(a), Connection::Unix(b)) => Ok(pump_streams(a, b, stop).await),
        (Connection::Unix(a), Connection::Tcp(b)) => Ok(pump_streams(a, b, stop).await),
        (a, b) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot relay {} to {}", a.protocol(), b.protocol()),
        )),
    }
}

/// Pump two byte streams against each other.
pub async fn pump_streams<A, B>(a: A, b: B, stop: &CancellationToken) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let torn_down = stop.child_token();
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (sent, received) = tokio::join!(
        copy_half(&mut a_read, &mut b_write, &torn_down),
        copy_half(&mut b_read, &mut a_write, &torn_down),
    );

    RelayStats {
        sent: sent.unwrap_or(0),
        received: received.unwrap_or(0),
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, torn_down: &CancellationToken) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        result = tokio::io::copy(reader, writer) => result,
        _ = torn_down.cancelled() => Err(torn_down_error()),
    };

    match &result {
        Ok(_) => {
            let _ = writer.shutdown().await;
        }
        Err(e) => {
            tracing::trace!("Relay direction failed: {}", e);
            torn_down.cancel();
        }
    }
    result
}

/// Pump two seqpacket sockets against each other, one message at a time.
pub async fn pump_packets(a: SeqpacketStream, b: SeqpacketStream, stop: &CancellationToken) -> RelayStats {
    let torn_down = stop.child_token();

    let (sent, received) = tokio::join!(
        copy_packets(&a, &b, &torn_down),
        copy_packets(&b, &a, &torn_down),
    );

    RelayStats {
        sent: sent.unwrap_or(0),
        received: received.unwrap_or(0),
    }
}

async fn copy_packets(
    from: &SeqpacketStream,
    to: &SeqpacketStream,
    torn_down: &CancellationToken,
) -> io::Result<u64> {
    let mut buf = vec![0u8; PACKET_BUFFER];
    let mut total = 0u64;

    let result = loop {
        let received = tokio::select! {
            received = from.recv_message(&mut buf) => received,
            _ = torn_down.cancelled() => Err(torn_down_error()),
        };
        let n = match received {
            Ok(0) => {
                let _ = to.shutdown_write();
                break Ok(total);
            }
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        let sent = tokio::select! {
            sent = to.send(&buf[..n]) => sent,
            _ = torn_down.cancelled() => Err(torn_down_error()),
        };
        if let Err(e) = sent {
            break Err(e);
        }
        total += n as u64;
    };

    if result.is_err() {
        torn_down.cancel();
    }
    result
}

fn torn_down_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "relay torn down")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[tokio::test]
    async fn test_streams_relay_both_ways_in_order() {
        let (mut client, relay_a) = duplex(64);
        let (relay_b, mut server) = duplex(64);
        let stop = CancellationToken::new();

        let pump = tokio::spawn(async move { pump_streams(relay_a, relay_b, &stop).await });

        client.write_all(b"hello from inside").await.unwrap();
        let mut buf = [0u8; 17];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from inside");

        server.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // Client closes: server sees end-of-input, closes too, relay ends.
        drop(client);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(server);

        let stats = tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(stats, RelayStats { sent: 17, received: 5 });
    }

    #[tokio::test]
    async fn test_write_to_closed_leg_tears_down_both() {
        let (client, relay_a) = duplex(64);
        let (relay_b, mut server) = duplex(64);
        let stop = CancellationToken::new();

        let pump = tokio::spawn(async move { pump_streams(relay_a, relay_b, &stop).await });

        drop(client);
        // The server keeps talking to a leg that is gone.
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if server.write_all(b"still there?").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(outcome.is_ok(), "server leg was never closed");

        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("relay did not finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_idle_relay() {
        let (_client, relay_a) = duplex(64);
        let (relay_b, _server) = duplex(64);
        let stop = CancellationToken::new();
        let pump_stop = stop.clone();

        let pump = tokio::spawn(async move { pump_streams(relay_a, relay_b, &pump_stop).await });
        stop.cancel();

        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("relay ignored cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_packets_keep_boundaries() {
        let (client, relay_a) = SeqpacketStream::pair().unwrap();
        let (relay_b, server) = SeqpacketStream::pair().unwrap();
        let stop = CancellationToken::new();

        let pump = tokio::spawn(async move { pump_packets(relay_a, relay_b, &stop).await });

        client.send(b"one").await.unwrap();
        client.send(b"two!").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"one");
        assert_eq!(server.recv(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"two!");

        client.shutdown_write().unwrap();
        assert_eq!(server.recv(&mut buf).await.unwrap(), 0);
        server.shutdown_write().unwrap();
        assert_eq!(client.recv(&mut buf).await.unwrap(), 0);

        let stats = tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(stats.sent, 7);
        assert_eq!(stats.received, 0);
    }

    #[tokio::test]
    async fn test_packets_larger_than_buffer_arrive_whole() {
        let (client, relay_a) = SeqpacketStream::pair().unwrap();
        let (relay_b, server) = SeqpacketStream::pair().unwrap();
        let stop = CancellationToken::new();

        let pump = tokio::spawn(async move { pump_packets(relay_a, relay_b, &stop).await });

        let message: Vec<u8> = (0..100_000).map(|i| (i % 241) as u8).collect();
        assert_eq!(client.send(&message).await.unwrap(), message.len());

        let mut buf = Vec::new();
        let n = server.recv_message(&mut buf).await.unwrap();
        assert_eq!(n, message.len());
        assert_eq!(&buf[..n], &message[..]);

        client.shutdown_write().unwrap();
        server.shutdown_write().unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(stats.sent, 100_000);
    }

    #[tokio::test]
    async fn test_mismatched_legs_rejected() {
        let (a, _) = SeqpacketStream::pair().unwrap();
        let (b, _b_peer) = tokio::net::UnixStream::pair().unwrap();
        let stop = CancellationToken::new();
        let err = relay(Connection::Seqpacket(a), Connection::Unix(b), &stop)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
