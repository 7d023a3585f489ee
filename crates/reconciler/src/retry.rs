//! Per-call timeout plus bounded retry of transient remote failures.

use std::future::Future;
use std::time::Duration;

use jobsync_core::{Operation, ResourceId};
use jobsync_kubehub::RemoteError;
use metrics::counter;
use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// A remote failure together with how many attempts were spent on it.
#[derive(Debug)]
pub(crate) struct Exhausted {
    pub error: RemoteError,
    pub attempts: u32,
}

/// Run `call` once, bounded by `timeout`. An elapsed timeout is transient:
/// the request may or may not have reached the server.
pub(crate) async fn bounded<T, Fut>(timeout: Duration, call: Fut) -> Result<T, RemoteError>
where
    Fut: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(res) => res,
        Err(_) => Err(RemoteError::Transient(format!("call timed out after {:?}", timeout))),
    }
}

/// Retry `call` while it fails transiently, up to `policy.attempts()`.
/// Non-transient errors return immediately.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    op: Operation,
    id: &ResourceId,
    mut call: F,
) -> Result<(T, u32), Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max = policy.attempts();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match bounded(timeout, call()).await {
            Ok(v) => return Ok((v, attempt)),
            Err(e) if e.is_transient() && attempt < max => {
                let delay = policy.backoff_for(attempt);
                counter!("remote_retry_total", 1u64, "op" => op.as_str());
                warn!(op = %op, id = %id, attempt, error = %e, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                debug!(op = %op, id = %id, attempt, error = %e, "giving up");
                return Err(Exhausted { error: e, attempts: attempt });
            }
        }
    }
}
