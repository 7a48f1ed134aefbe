//! CONNECT tunnel front-end.
//!
//! The target is admitted before the connection is hijacked: the
//! canonical decision line is emitted exactly once per tunnel, at
//! decision time, before any bytes flow. Allowed tunnels get a raw
//! bidirectional copy between the client and an instrumented upstream
//! connection; both sides carry the idle deadline.

use crate::admission::admit;
use crate::config::Config;
use crate::conntrack::ConnTracker;
use crate::dial::dial_tunnel;
use crate::error::{ProxyError, Result};
use crate::log::{log_decision, unix_now, DecisionRecord};
use crate::reject::write_rejection;
use crate::request::{synthesize_outbound_host, ProxyMode, RequestHead, TRACE_HEADER};
use crate::timeout::TimeoutConn;
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Handle a `CONNECT host:port` request on an accepted socket.
pub async fn handle_connect(
    config: &Arc<Config>,
    tracker: &Arc<ConnTracker>,
    mut head: RequestHead,
    mut stream: TcpStream,
) -> Result<()> {
    let start_unix = unix_now();
    let requested_host = head.target.clone();
    debug!(
        remote = %head.peer,
        requested_host = %requested_host,
        trace_id = head.header(TRACE_HEADER).unwrap_or(""),
        "received CONNECT proxy request"
    );

    // Clients may omit the port; CONNECT defaults to 443.
    let outbound_host = synthesize_outbound_host(&requested_host, "https");

    let (mut decision, admit_err) = admit(config, &head, &outbound_host).await;
    let trace_id = head.remove_header(TRACE_HEADER).unwrap_or_default();

    log_decision(&DecisionRecord {
        mode: ProxyMode::Connect,
        head: &head,
        decision: &decision,
        requested_host: &requested_host,
        trace_id: &trace_id,
        start_unix,
        content_length: 0,
        error: admit_err.as_ref(),
    });

    if let Some(err) = admit_err {
        write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
        return Err(err);
    }
    if !decision.allow {
        let err = ProxyError::PolicyDenied(decision.reason.clone());
        write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
        return Err(err);
    }

    let mut upstream =
        match dial_tunnel(config, tracker, &mut decision, &trace_id, &outbound_host).await {
            Ok(conn) => conn,
            Err(err) => {
                write_rejection(&mut stream, config, &head, &requested_host, &err).await?;
                return Err(err);
            }
        };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    let mut client = TimeoutConn::new(stream, config.idle_timeout);
    let result = copy_bidirectional(&mut client, &mut upstream).await;
    debug!(requested_host = %requested_host, result = ?result, "CONNECT tunnel closed");
    Ok(())
}
