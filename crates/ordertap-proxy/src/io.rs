//! Stream wrappers used by the connection handler.
//!
//! - [`TimedStream`] fails reads and writes once a connection has been idle
//!   for longer than its timeout. All streams of one connection share an
//!   [`IdleClock`], so traffic in either direction keeps the whole connection
//!   alive.
//! - [`tunnel`] relays raw bytes once a connection is no longer parsed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

// =============================================================================
// Idle Clock
// =============================================================================

/// Last-activity timestamp shared by the streams of one connection.
#[derive(Debug, Clone)]
pub struct IdleClock {
    timeout: Duration,
    base: Instant,
    /// Milliseconds since `base` of the last successful I/O.
    last_activity: Arc<AtomicU64>,
}

impl IdleClock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            base: Instant::now(),
            last_activity: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records activity now.
    pub fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// When the connection times out unless something happens first.
    pub fn deadline(&self) -> Instant {
        self.base + Duration::from_millis(self.last_activity.load(Ordering::Relaxed)) + self.timeout
    }

    /// Wraps a stream so it shares this clock.
    pub fn wrap<S>(&self, inner: S) -> TimedStream<S> {
        TimedStream::new(inner, self.clone())
    }
}

fn idle_timeout_error(timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connection idle for {}s", timeout.as_secs()),
    )
}

/// Polls `sleep` against the clock's current deadline.
///
/// Ready only once the connection has really been idle for the full timeout.
fn poll_idle(sleep: &mut Pin<Box<Sleep>>, clock: &IdleClock, cx: &mut Context<'_>) -> Poll<io::Error> {
    loop {
        let deadline = clock.deadline();
        if sleep.deadline() != deadline {
            sleep.as_mut().reset(deadline);
        }
        match sleep.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(()) if clock.deadline() > deadline => continue,
            Poll::Ready(()) => return Poll::Ready(idle_timeout_error(clock.timeout())),
        }
    }
}

// =============================================================================
// Timed Stream
// =============================================================================

/// Stream that errors with [`io::ErrorKind::TimedOut`] when its connection
/// goes idle.
pub struct TimedStream<S> {
    inner: S,
    clock: IdleClock,
    read_sleep: Pin<Box<Sleep>>,
    write_sleep: Pin<Box<Sleep>>,
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, clock: IdleClock) -> Self {
        clock.touch();
        let deadline = clock.deadline();
        Self {
            inner,
            read_sleep: Box::pin(tokio::time::sleep_until(deadline)),
            write_sleep: Box::pin(tokio::time::sleep_until(deadline)),
            clock,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.clock.touch();
                Poll::Ready(result)
            }
            Poll::Pending => poll_idle(&mut this.read_sleep, &this.clock, cx).map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.clock.touch();
                Poll::Ready(result)
            }
            Poll::Pending => poll_idle(&mut this.write_sleep, &this.clock, cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => poll_idle(&mut this.write_sleep, &this.clock, cx).map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => poll_idle(&mut this.write_sleep, &this.clock, cx).map(Err),
        }
    }
}

// =============================================================================
// Tunnel
// =============================================================================

/// Relays bytes in both directions until both sides close.
///
/// Bytes already buffered in a `BufReader` side are relayed first. Returns the
/// byte counts (client to origin, origin to client).
pub async fn tunnel<C, O>(client: &mut C, origin: &mut O) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    O: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy_bidirectional(client, origin).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out() {
        let (a, _b) = duplex(64);
        let clock = IdleClock::new(Duration::from_secs(30));
        let mut stream = clock.wrap(a);

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_on_shared_clock_keeps_stream_alive() {
        let (a, mut a_peer) = duplex(64);
        let (b, mut b_peer) = duplex(64);
        let clock = IdleClock::new(Duration::from_secs(30));
        let mut quiet = clock.wrap(a);
        let mut busy = clock.wrap(b);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = quiet.read(&mut buf).await?;
            Ok::<_, io::Error>(buf[..n].to_vec())
        });

        // traffic on the other stream every 20s for a minute
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            b_peer.write_all(b"x").await.unwrap();
            let mut one = [0u8; 1];
            busy.read_exact(&mut one).await.unwrap();
        }
        a_peer.write_all(b"done").await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), b"done");
    }

    #[tokio::test]
    async fn tunnel_relays_both_directions() {
        let (mut client, mut client_peer) = duplex(1024);
        let (mut origin, mut origin_peer) = duplex(1024);

        client_peer.write_all(b"early").await.unwrap();
        let mut client = BufReader::new(client);
        // The first bytes are already buffered when the tunnel starts.
        client.fill_buf().await.unwrap();

        let relay = tokio::spawn(async move { tunnel(&mut client, &mut origin).await });

        client_peer.write_all(b"-up").await.unwrap();
        client_peer.shutdown().await.unwrap();
        origin_peer.write_all(b"down").await.unwrap();
        origin_peer.shutdown().await.unwrap();

        let mut from_client = Vec::new();
        origin_peer.read_to_end(&mut from_client).await.unwrap();
        let mut from_origin = Vec::new();
        client_peer.read_to_end(&mut from_origin).await.unwrap();

        assert_eq!(from_client, b"early-up");
        assert_eq!(from_origin, b"down");
        assert_eq!(relay.await.unwrap().unwrap(), (8, 4));
    }
}
