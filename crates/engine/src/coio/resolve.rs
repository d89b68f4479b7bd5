// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::net::{IpAddr, SocketAddr};

use aosl_core::error::record;
use aosl_core::{AoslError, Outcome, Result, Resume, Resumed, Slot};
use tokio_util::sync::CancellationToken;

use super::{fail, origin_queue, spawn_io, Completion};

/// Resolves `host` into `out`. The result is the number of addresses.
///
/// IP literals resolve inline (`Ready`); names go through the system resolver
/// on the I/O runtime (`Pending`).
///
/// # Errors
///
/// `InvalidArgument` for an empty host name; resolution failures arrive
/// through `resume`.
pub fn resolve_host(
    host: &str,
    port: u16,
    out: Slot<Vec<SocketAddr>>,
    resume: Option<Resume<usize>>,
) -> Result<Outcome> {
    let host = host.trim();
    if host.is_empty() {
        return fail(resume, AoslError::InvalidArgument("empty host name".to_string()));
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        out.set(vec![SocketAddr::new(ip, port)]);
        if let Some(resume) = resume {
            resume(Resumed::Complete(Ok(1)));
        }
        return Ok(Outcome::Ready);
    }

    let queue = match origin_queue() {
        Ok(queue) => queue,
        Err(err) => return fail(resume, err),
    };
    let done = Completion::new("co_resolve", queue, None, None, resume);
    let name = host.to_string();
    tracing::debug!(host = %name, port, queue = %queue, "resolving");

    spawn_io(CancellationToken::new(), done, async move {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), port)).await?.collect();
        if addrs.is_empty() {
            return record(Err(AoslError::Io {
                kind: std::io::ErrorKind::NotFound,
                message: format!("no addresses for {name}"),
            }));
        }
        let count = addrs.len();
        out.set(addrs);
        Ok(count)
    });
    Ok(Outcome::Pending)
}
