//! Bidirectional byte copy between a client and a backend connection.
//!
//! Each direction is a pipe: read from one socket, write to the other.
//! Reads and writes on either side are bounded by that side's deadline.
//! When a pipe's source is finished (EOF, error or deadline) the pipe
//! moves to `HalfClosed`: it shuts down the write half of its destination,
//! which sends FIN while leaving the opposite direction free to flush the
//! rest of its data. Once the backend side has finished, the client pipe
//! is stopped as well, so an idle client cannot hold the connection open.
//! Both sockets are fully closed only after both pipes have finished.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::trace;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Read/write deadlines for each side of a proxied connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadlines {
    pub client: Option<Duration>,
    pub server: Option<Duration>,
}

/// Counters updated while bytes flow.
#[derive(Debug, Clone, Copy)]
pub struct Traffic<'a> {
    /// Bytes written to the backend.
    pub sent: &'a AtomicU64,
    /// Bytes written to the client.
    pub rcvd: &'a AtomicU64,
    /// I/O errors on either side.
    pub errors: &'a AtomicU64,
}

/// Lifecycle of one copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Copying.
    Streaming,
    /// Source finished; destination write half shut down.
    HalfClosed,
    /// The opposite direction finished first and this one was told to stop.
    Stopped,
}

/// How a pipe's source ended.
#[derive(Debug)]
pub struct PipeEnd {
    pub state: PipeState,
    pub bytes: u64,
    pub error: Option<io::Error>,
}

/// Run an I/O future against an optional deadline.
pub async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")),
        },
        None => fut.await,
    }
}

/// Copy from `src` to `dst` until the source ends or `stop` is notified,
/// then half-close `dst`.
pub async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    read_deadline: Option<Duration>,
    write_deadline: Option<Duration>,
    counter: &AtomicU64,
    stop: Option<&Notify>,
) -> PipeEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;
    let mut error = None;
    let mut state = PipeState::Streaming;

    while state == PipeState::Streaming {
        let read = with_deadline(read_deadline, src.read(&mut buf));
        let result = match stop {
            Some(stop) => tokio::select! {
                result = read => Some(result),
                _ = stop.notified() => None,
            },
            None => Some(read.await),
        };
        let Some(result) = result else {
            state = PipeState::Stopped;
            break;
        };
        match result {
            Ok(0) => state = PipeState::HalfClosed,
            Ok(n) => match with_deadline(write_deadline, dst.write_all(&buf[..n])).await {
                Ok(()) => {
                    bytes += n as u64;
                    counter.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    error = Some(e);
                    state = PipeState::HalfClosed;
                }
            },
            Err(e) => {
                error = Some(e);
                state = PipeState::HalfClosed;
            }
        }
    }

    // FIN to the peer; its reply can still travel the other direction.
    if let Err(e) = with_deadline(write_deadline, dst.shutdown()).await {
        trace!(error = %e, "half-close failed");
    }

    PipeEnd {
        state,
        bytes,
        error,
    }
}

/// Proxy a client connection to an already-dialed backend connection.
///
/// Returns `(bytes_to_backend, bytes_to_client)` once both directions are
/// done.
pub async fn splice(
    client: TcpStream,
    server: TcpStream,
    deadlines: Deadlines,
    traffic: Traffic<'_>,
) -> (u64, u64) {
    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();
    let server_done = Notify::new();

    // Client EOF keeps draining the backend; backend EOF stops the client side.
    let upstream = pipe(
        client_read,
        server_write,
        deadlines.client,
        deadlines.server,
        traffic.sent,
        Some(&server_done),
    );
    let downstream = async {
        let end = pipe(
            server_read,
            client_write,
            deadlines.server,
            deadlines.client,
            traffic.rcvd,
            None,
        )
        .await;
        server_done.notify_one();
        end
    };

    let (up, down) = tokio::join!(upstream, downstream);

    for end in [&up, &down] {
        if let Some(e) = &end.error {
            traffic.errors.fetch_add(1, Ordering::Relaxed);
            trace!(error = %e, "copy ended with error");
        }
    }

    (up.bytes, down.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pipe_copies_until_eof_and_half_closes() {
        let (mut writer, src) = duplex(64);
        let (dst, mut reader) = duplex(64);
        let counter = AtomicU64::new(0);

        writer.write_all(b"hello").await.unwrap();
        drop(writer);

        let end = pipe(src, dst, None, None, &counter, None).await;
        assert_eq!(end.state, PipeState::HalfClosed);
        assert_eq!(end.bytes, 5);
        assert!(end.error.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 5);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn pipe_read_deadline_ends_the_copy() {
        let (_writer, src) = duplex(64);
        let (dst, _reader) = duplex(64);
        let counter = AtomicU64::new(0);

        let end = pipe(src, dst, Some(Duration::from_millis(20)), None, &counter, None).await;
        let error = end.error.expect("deadline error");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert_eq!(end.bytes, 0);
    }

    #[tokio::test]
    async fn notified_pipe_stops_reading_an_idle_source() {
        let (_writer, src) = duplex(64);
        let (dst, mut reader) = duplex(64);
        let counter = AtomicU64::new(0);
        let stop = Notify::new();
        stop.notify_one();

        let end = tokio::time::timeout(
            Duration::from_secs(1),
            pipe(src, dst, None, None, &counter, Some(&stop)),
        )
        .await
        .expect("pipe ignored stop");
        assert_eq!(end.state, PipeState::Stopped);
        assert!(end.error.is_none());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn with_deadline_passes_through_results() {
        let ok = with_deadline(Some(Duration::from_secs(1)), async { Ok::<_, io::Error>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let none = with_deadline(None, async { Ok::<_, io::Error>(1) }).await;
        assert_eq!(none.unwrap(), 1);
    }
}
