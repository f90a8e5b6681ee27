use std::fmt::Display;
use std::future::Future;

use tracing::{info, warn};

use crate::pipeline::RetryPolicy;

use super::{Shutdown, WorkerError};

/// Run `attempt` until it succeeds, sleeping `policy.delay_for_attempt(n)`
/// after the n-th failure.
///
/// Gives up with [`WorkerError::ConnectExhausted`] after
/// `policy.max_attempts` failures, or with [`WorkerError::Interrupted`] when
/// shutdown is triggered while waiting.
pub async fn connect_with_retry<F, Fut, E>(
    dependency: &'static str,
    policy: &RetryPolicy,
    shutdown: &mut Shutdown,
    mut attempt: F,
) -> Result<(), WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut failures = 0u32;
    loop {
        match attempt().await {
            Ok(()) => {
                info!(dependency, attempts = failures + 1, "connected");
                return Ok(());
            }
            Err(e) => {
                failures += 1;
                if !policy.should_retry(failures) {
                    return Err(WorkerError::ConnectExhausted {
                        dependency,
                        attempts: failures,
                        last_error: e.to_string(),
                    });
                }
                let delay = policy.delay_for_attempt(failures);
                warn!(
                    dependency,
                    attempt = failures,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "connection attempt failed, retrying"
                );
                if shutdown.sleep(delay).await {
                    return Err(WorkerError::Interrupted);
                }
            }
        }
    }
}
