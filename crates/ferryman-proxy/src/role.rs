//! Client role extraction.

use crate::config::{Config, RoleFromRequest};
use crate::error::{ProxyError, Result};
use crate::request::RequestHead;
use std::sync::Arc;
use tracing::error;

/// Extract the client's ACL role from the request using the configured
/// strategy.
///
/// An unconfigured strategy counts as a missing role. A missing role is
/// coerced to the empty role when `allow_missing_role` is set; every other
/// failure is surfaced and the caller rejects the request without
/// consulting the ACL.
pub fn get_role(config: &Config, req: &RequestHead) -> Result<String> {
    let extracted = match &config.role_from_request {
        Some(extract) => extract(req),
        None => Err(ProxyError::MissingRole(
            "role extraction is not configured".to_string(),
        )),
    };

    match extracted {
        Ok(role) => Ok(role),
        Err(err) if err.is_missing_role() && config.allow_missing_role => Ok(String::new()),
        Err(err) => {
            error!(
                error = %err,
                is_missing_role = err.is_missing_role(),
                allow_missing_role = config.allow_missing_role,
                "unable to determine role for request"
            );
            Err(err)
        }
    }
}

/// Strategy reading the role from a request header.
#[must_use]
pub fn role_from_header(name: &str) -> RoleFromRequest {
    let name = name.to_string();
    Arc::new(move |req: &RequestHead| match req.header(&name) {
        Some(role) if !role.is_empty() => Ok(role.to_string()),
        _ => Err(ProxyError::MissingRole(format!("no {name} header"))),
    })
}
