//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! One task per accepted client. The first request line decides the mode:
//!
//! CONNECT method -> [`crate::connect`] (tunnel)
//! Other methods  -> [`crate::http`] (classic proxy forward)
//!
//! Shutdown: on SIGTERM/SIGHUP/SIGUSR2 (graceful) or the programmatic
//! quit channel (forced), the listener stops accepting and the
//! `shutting_down` flag flips. A graceful stop then waits, under a
//! single exit-timeout budget, for in-flight tasks to join while racing
//! "all tunnels closed" against "all tunnels idle". Whatever tunnels
//! remain are force-closed so each emits its final telemetry. Hijacked
//! tunnels are invisible to the HTTP layer, so the tracker's bookkeeping
//! is the only source of truth for their side of the race.

use crate::config::Config;
use crate::connect;
use crate::conntrack::ConnTracker;
use crate::error::{ProxyError, Result};
use crate::http;
use crate::request::{parse_request_line, read_head, RequestHead};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Deadline for in-flight work when shutdown was not graceful.
const FORCED_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handles for request handling.
#[derive(Clone)]
pub struct Proxy {
    pub config: Arc<Config>,
    pub tracker: Arc<ConnTracker>,
}

impl Proxy {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let tracker = ConnTracker::new(
            config.idle_timeout,
            config.stats.clone(),
            config.shutting_down.clone(),
        );
        Self { config, tracker }
    }

    /// Handle a single accepted client connection.
    pub async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let (line, headers, buffered) = match read_head(&mut reader).await {
            Ok(Some(parts)) => parts,
            Ok(None) => return Ok(()), // client disconnected
            Err(ProxyError::HttpParse(_)) => {
                let mut stream = reader.into_inner();
                stream
                    .write_all(b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n")
                    .await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let (method, target, version) = match parse_request_line(&line) {
            Ok(parts) => parts,
            Err(_) => {
                let mut stream = reader.into_inner();
                stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Ok(());
            }
        };

        let head = RequestHead {
            method,
            target,
            version,
            headers,
            peer,
            peer_identity: None,
        };
        let stream = reader.into_inner();

        if head.method.eq_ignore_ascii_case("CONNECT") {
            connect::handle_connect(&self.config, &self.tracker, head, stream).await
        } else {
            http::handle_http(&self.config, head, stream, buffered).await
        }
    }
}

/// Run the proxy until a shutdown signal or the quit channel fires, then
/// stop gracefully.
pub async fn serve(
    config: Arc<Config>,
    listener: TcpListener,
    mut quit: mpsc::Receiver<()>,
) -> Result<()> {
    let proxy = Proxy::new(config.clone());
    info!(addr = %listener.local_addr()?, "starting");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let mut tasks = JoinSet::new();
    let mut graceful = true;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        let proxy = proxy.clone();
                        tasks.spawn(async move {
                            if let Err(err) = proxy.handle_client(stream, peer).await {
                                debug!(peer = %peer, error = %err, "connection handler error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept error"),
                }
            }
            _ = sigterm.recv() => { info!("quitting gracefully"); break; }
            _ = sighup.recv() => { info!("quitting gracefully"); break; }
            _ = sigusr2.recv() => { info!("quitting gracefully"); break; }
            Some(()) = quit.recv() => {
                info!("quitting now");
                graceful = false;
                break;
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // Stop accepting, then let collaborators observe the stop.
    drop(listener);
    config.shutting_down.store(true, Ordering::SeqCst);

    let deadline = if graceful {
        config.exit_timeout
    } else {
        FORCED_EXIT_TIMEOUT
    };
    let join_in_flight = async {
        while tasks.join_next().await.is_some() {}
    };
    if graceful {
        // In-flight requests and the tunnel drain/idle race share one
        // exit budget. A busy tunnel's task only joins once its copy
        // ends, so the race must be able to end the wait on its own.
        tokio::select! {
            joined = timeout(deadline, join_in_flight) => {
                if joined.is_err() {
                    warn!(deadline = ?deadline, "in-flight requests outlived the shutdown deadline");
                }
            }
            () = wait_for_drain_or_idle(&proxy.tracker, config.exit_timeout) => {}
        }
    } else if timeout(deadline, join_in_flight).await.is_err() {
        warn!(deadline = ?deadline, "in-flight requests outlived the shutdown deadline");
    }

    // Whatever survived emits its final telemetry now.
    proxy.tracker.close_all();
    Ok(())
}

/// Race full drain against all-idle, bounded by the exit timeout.
pub(crate) async fn wait_for_drain_or_idle(tracker: &ConnTracker, exit_timeout: Duration) {
    let drain = async {
        info!("waiting for all connections to close");
        tracker.wait_for_drain().await;
        info!("all connections are closed, continuing with shutdown");
    };

    let idle = async {
        info!("waiting for all connections to become idle");
        let begin = Instant::now();
        loop {
            let check_again_in = tracker.maybe_idle_in();
            if check_again_in.is_zero() {
                info!("all connections are idle, continuing with shutdown");
                break;
            }
            if begin.elapsed() > exit_timeout {
                warn!(
                    timeout = ?exit_timeout,
                    "timed out waiting for open connections to become idle"
                );
                break;
            }
            debug!(
                check_again_in = ?check_again_in,
                "active connections remain, waiting before checking again"
            );
            sleep(check_again_in).await;
        }
    };

    tokio::select! {
        () = drain => {}
        () = idle => {}
    }
}
