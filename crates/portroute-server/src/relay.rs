//! Per-connection bidirectional byte relay.
//!
//! One relay owns exactly two connections: the accepted inbound stream and
//! the outbound stream it opens to the rule's destination. Each direction
//! runs as its own task with a read-chunk / write-chunk loop: the next read
//! is not issued until the previous write completed, so a slow consumer on
//! one side throttles the producer on the other and buffered data is bounded
//! to one in-flight chunk per direction.
//!
//! Teardown is symmetric: when either direction ends (EOF or I/O error) it
//! flushes and shuts down its write half, then signals the opposite
//! direction through a [`Notify`]. The signal only ever interrupts a pending
//! read — an in-flight write always runs to completion first, so no
//! already-read bytes are dropped on close.

use portroute_core::{RouteError, RouteResult, RouteRule};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

/// Read buffer size per direction. Also the backpressure bound: at most one
/// chunk of this size is in flight per direction.
const CHUNK_SIZE: usize = 8192;

/// Relay bytes between `inbound` and the rule's destination until both
/// sides are closed.
///
/// Connects to `destination_host:destination_port` with the given timeout;
/// until the connect resolves, inbound data stays in the kernel receive
/// buffer. The inbound stream is closed (dropped) if the connect fails.
///
/// # Errors
///
/// Returns [`RouteError::Connect`] when the outbound connection is refused,
/// unreachable, or times out. Connect failures are never retried here.
pub async fn run(
    inbound: TcpStream,
    rule: &RouteRule,
    connect_timeout: Duration,
) -> RouteResult<()> {
    let destination = rule.destination();

    let outbound = match tokio::time::timeout(connect_timeout, TcpStream::connect(&destination))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(RouteError::Connect {
                destination,
                source: e,
            })
        }
        Err(_) => {
            return Err(RouteError::Connect {
                destination,
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection after {connect_timeout:?}"),
                ),
            })
        }
    };

    let (client_rd, client_wr) = inbound.into_split();
    let (server_rd, server_wr) = outbound.into_split();

    let closing = Arc::new(Notify::new());
    let upstream = tokio::spawn(copy_direction(client_rd, server_wr, closing.clone()));
    let downstream = tokio::spawn(copy_direction(server_rd, client_wr, closing));

    let (sent, received) = tokio::join!(upstream, downstream);
    debug!(
        destination = %destination,
        bytes_up = sent.unwrap_or(0),
        bytes_down = received.unwrap_or(0),
        "relay ended"
    );

    Ok(())
}

/// Copy one direction until EOF, an I/O error, or a close signal from the
/// opposite direction. Returns the number of bytes copied.
///
/// Invariant: a write is never cancelled. The close signal is only polled
/// while waiting for the next read, so a chunk that was read is always
/// written (or the write itself fails) before the direction shuts down.
async fn copy_direction<R, W>(mut rd: R, mut wr: W, closing: Arc<Notify>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = closing.notified() => break,
            result = rd.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            },
        };

        if wr.write_all(&buf[..n]).await.is_err() {
            break;
        }
        copied += n as u64;
    }

    // Flush-then-FIN on our write half; any chunk we read has already been
    // written in full at this point.
    let _ = wr.shutdown().await;

    // notify_one stores a permit, so the opposite direction sees the signal
    // even if it is mid-write right now and only selects again later.
    closing.notify_one();

    copied
}
