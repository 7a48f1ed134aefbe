//! Idle-deadline enforcement for proxied streams.
//!
//! Wrapped streams carry a single deadline that is pushed out on every
//! successful read or write; a poll that stays pending past the deadline
//! fails with `TimedOut`. Used directly for HTTP-mode upstream
//! connections and the client side of tunnels, and embedded in the
//! tracker's instrumented connections.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

pub(crate) fn idle_timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

/// A resettable idle deadline.
pub(crate) struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(sleep(timeout)),
        }
    }

    /// Push the deadline out by the full idle timeout.
    pub(crate) fn touch(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }

    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}

/// A stream with an idle deadline refreshed on each read/write.
pub struct TimeoutConn<S> {
    inner: S,
    timer: IdleTimer,
}

impl<S> TimeoutConn<S> {
    pub fn new(inner: S, idle_timeout: Duration) -> Self {
        Self {
            inner,
            timer: IdleTimer::new(idle_timeout),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.timer.touch();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => match this.timer.poll_expired(cx) {
                Poll::Ready(()) => Poll::Ready(Err(idle_timeout_error())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.timer.touch();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => match this.timer.poll_expired(cx) {
                Poll::Ready(()) => Poll::Ready(Err(idle_timeout_error())),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_when_idle() {
        let (a, _b) = duplex(64);
        let mut conn = TimeoutConn::new(a, Duration::from_secs(5));
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_the_deadline() {
        let (a, mut b) = duplex(64);
        let mut conn = TimeoutConn::new(a, Duration::from_secs(10));
        let mut buf = [0u8; 4];

        // Half the idle budget passes, then a read succeeds.
        tokio::time::advance(Duration::from_secs(5)).await;
        b.write_all(b"ping").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();

        // Another six seconds is fine: the deadline was pushed out.
        tokio::time::advance(Duration::from_secs(6)).await;
        b.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // But a full idle period with no activity fails.
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_also_touch_the_deadline() {
        let (a, mut b) = duplex(64);
        let mut conn = TimeoutConn::new(a, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(8)).await;
        conn.write_all(b"data").await.unwrap();

        // Eight more seconds after the write is still within budget.
        tokio::time::advance(Duration::from_secs(8)).await;
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }
}
