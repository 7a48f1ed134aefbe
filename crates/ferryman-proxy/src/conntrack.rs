//! Tracking for established tunnels.
//!
//! Once a CONNECT request is hijacked into a raw byte pipe, the HTTP
//! layer can no longer see whether it is idle; the tracker's own
//! bookkeeping is the only source of truth for graceful shutdown. Every
//! tunnel socket is wrapped in an [`InstrumentedConn`] that counts bytes,
//! stamps last activity, enforces the idle deadline, and emits exactly
//! one close-telemetry entry.
//!
//! HTTP-mode sockets are deliberately not tracked: per-request
//! attribution of a pooled or reused socket to one role and trace id
//! would be wrong.

use crate::request::ProxyMode;
use crate::timeout::{idle_timeout_error, IdleTimer};
use ferryman::stats::StatsClient;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

/// Registry of live instrumented connections.
pub struct ConnTracker {
    idle_timeout: Duration,
    stats: Arc<dyn StatsClient>,
    shutting_down: Arc<AtomicBool>,
    conns: Mutex<HashMap<u64, Arc<ConnShared>>>,
    live: AtomicUsize,
    drained: Notify,
    next_id: AtomicU64,
}

impl ConnTracker {
    pub fn new(
        idle_timeout: Duration,
        stats: Arc<dyn StatsClient>,
        shutting_down: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            idle_timeout,
            stats,
            shutting_down,
            conns: Mutex::new(HashMap::new()),
            live: AtomicUsize::new(0),
            drained: Notify::new(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Wrap a tunnel socket in an instrumented connection.
    ///
    /// While the proxy is shutting down the connection still works but is
    /// not registered, so it cannot hold up the drain.
    pub fn instrument<S>(
        self: &Arc<Self>,
        inner: S,
        trace_id: &str,
        role: &str,
        outbound_host: &str,
        mode: ProxyMode,
    ) -> InstrumentedConn<S> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tracked = !self.shutting_down.load(Ordering::SeqCst);
        let shared = Arc::new(ConnShared {
            id,
            trace_id: trace_id.to_string(),
            role: role.to_string(),
            outbound_host: outbound_host.to_string(),
            mode,
            start: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            tracked,
            stats: self.stats.clone(),
            tracker: Arc::downgrade(self),
        });

        if tracked {
            self.conns.lock().unwrap().insert(id, shared.clone());
            self.live.fetch_add(1, Ordering::AcqRel);
        }

        InstrumentedConn {
            inner,
            shared,
            timer: IdleTimer::new(self.idle_timeout),
        }
    }

    /// Number of live tracked connections.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Snapshot of the live registry.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ConnShared>> {
        self.conns.lock().unwrap().values().cloned().collect()
    }

    /// Wait until every tracked connection has closed.
    pub async fn wait_for_drain(&self) {
        loop {
            if self.live_count() == 0 {
                return;
            }
            let drained = self.drained.notified();
            if self.live_count() == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Minimum time until the idle threshold may next be crossed across
    /// all live connections. Zero means every live connection is already
    /// idle (vacuously so when none are live).
    #[must_use]
    pub fn maybe_idle_in(&self) -> Duration {
        let now = Instant::now();
        let mut soonest: Option<Duration> = None;
        for shared in self.conns.lock().unwrap().values() {
            let idle_for = shared.idle_for(now);
            if idle_for >= self.idle_timeout {
                continue;
            }
            let remaining = self.idle_timeout - idle_for;
            soonest = Some(match soonest {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }
        soonest.unwrap_or(Duration::ZERO)
    }

    /// Close every remaining tracked connection so each emits its final
    /// telemetry.
    pub fn close_all(&self) {
        for shared in self.snapshot() {
            shared.finish("force_closed");
        }
    }

    fn deregister(&self, id: u64) {
        if self.conns.lock().unwrap().remove(&id).is_some()
            && self.live.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.drained.notify_waiters();
        }
    }
}

/// Shared state of one instrumented connection; survives in the registry
/// until close.
pub struct ConnShared {
    id: u64,
    trace_id: String,
    role: String,
    outbound_host: String,
    mode: ProxyMode,
    start: Instant,
    /// Milliseconds from `start` to the most recent read or write.
    last_activity_ms: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    closed: AtomicBool,
    tracked: bool,
    stats: Arc<dyn StatsClient>,
    tracker: Weak<ConnTracker>,
}

impl ConnShared {
    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Release);
    }

    /// How long this connection has gone without I/O as of `now`.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        let since_start = now.saturating_duration_since(self.start);
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        since_start.saturating_sub(last)
    }

    #[must_use]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Emit close telemetry and deregister. Idempotent: the first caller
    /// wins, whether that is the tunnel task dropping the connection or
    /// the shutdown supervisor force-closing it.
    pub fn finish(&self, cause: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let duration = self.start.elapsed();
        info!(
            target: "ferryman_proxy::audit",
            id = self.id,
            proxy_type = %self.mode,
            role = %self.role,
            outbound_host = %self.outbound_host,
            trace_id = %self.trace_id,
            bytes_in = self.bytes_in(),
            bytes_out = self.bytes_out(),
            duration_ms = duration.as_millis() as u64,
            cause = cause,
            "connection closed"
        );

        self.stats.incr("cn.close.total", &[]);
        self.stats.count("cn.bytes_in.total", self.bytes_in(), &[]);
        self.stats.count("cn.bytes_out.total", self.bytes_out(), &[]);

        if self.tracked {
            if let Some(tracker) = self.tracker.upgrade() {
                tracker.deregister(self.id);
            }
        }
    }
}

/// A tunnel socket wrapped with byte accounting, last-activity stamping,
/// and the idle deadline.
pub struct InstrumentedConn<S> {
    inner: S,
    shared: Arc<ConnShared>,
    timer: IdleTimer,
}

impl<S> InstrumentedConn<S> {
    /// Shared state handle, as registered with the tracker.
    #[must_use]
    pub fn shared(&self) -> Arc<ConnShared> {
        self.shared.clone()
    }
}

impl<S> Drop for InstrumentedConn<S> {
    fn drop(&mut self) {
        self.shared.finish("closed");
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.shared.bytes_in.fetch_add(n as u64, Ordering::AcqRel);
                this.shared.touch();
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

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.shared.bytes_out.fetch_add(n as u64, Ordering::AcqRel);
                this.shared.touch();
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
