//! Synthesized rejection responses.
//!
//! Every denied or failed request is answered with the same shape: a 407
//! whose status text, error header, and body the fleet's clients and
//! alerting already understand. Denials carry the policy message; any
//! other failure gets a deliberately generic body.

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::request::{RequestHead, ERROR_HEADER};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

const DENY_STATUS_TEXT: &str = "Request Rejected by Proxy";

/// Human message for a rejection, before the body's trailing newline.
#[must_use]
pub fn rejection_message(config: &Config, host: &str, err: &ProxyError) -> String {
    let mut msg = if err.is_denial() {
        format!("Egress proxying is denied to host '{host}': {err}.")
    } else {
        warn!(error = %err, "rejection synthesized for unexpected error");
        "An unexpected error occurred.".to_string()
    };

    if !config.additional_error_message_on_deny.is_empty() {
        msg = format!("{msg}\n\n{}\n", config.additional_error_message_on_deny);
    }
    msg
}

/// Render the full rejection response for a request.
///
/// Returns the raw bytes and the body length (the `content_length` the
/// decision log records for a rejected HTTP-mode request).
#[must_use]
pub fn build_rejection(
    config: &Config,
    head: &RequestHead,
    host: &str,
    err: &ProxyError,
) -> (Vec<u8>, i64) {
    let msg = rejection_message(config, host, err);
    let body = format!("{msg}\n");
    // Header values cannot span lines; mirror only the first.
    let header_msg = msg.lines().next().unwrap_or_default();
    let (major, minor) = head.proto();

    let response = format!(
        "HTTP/{major}.{minor} 407 {DENY_STATUS_TEXT}\r\n\
         Content-Type: text/plain\r\n\
         {ERROR_HEADER}: {header_msg}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    (response.into_bytes(), body.len() as i64)
}

/// Write the rejection to the client, returning the body length.
pub async fn write_rejection<W: AsyncWrite + Unpin>(
    writer: &mut W,
    config: &Config,
    head: &RequestHead,
    host: &str,
    err: &ProxyError,
) -> Result<i64> {
    let (response, content_length) = build_rejection(config, head, host, err);
    writer.write_all(&response).await?;
    writer.flush().await?;
    Ok(content_length)
}
