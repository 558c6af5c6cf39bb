//! Background work of the CA leader.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use log::{debug, error, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::commons::CaEmptyResult;
use crate::config::CaPolicy;
use super::manager::{CaManager, CaState};


//------------ RetryLoop -----------------------------------------------------

/// Runs an operation over and over until cancelled. Cancelling also
/// abandons a run in progress.
///
/// Failures are retried with capped exponential backoff. After a success
/// the loop either stops, if `abort_on_success` is set, or waits for
/// `interval` before the next run.
#[derive(Clone, Debug)]
pub struct RetryLoop {
    name: String,
    min_backoff: Duration,
    max_backoff: Duration,
    interval: Duration,
    abort_on_success: bool,
}

impl RetryLoop {
    pub fn new(
        name: &str,
        min_backoff: Duration,
        max_backoff: Duration,
        interval: Duration,
        abort_on_success: bool,
    ) -> Self {
        RetryLoop {
            name: name.to_string(),
            min_backoff,
            max_backoff,
            interval,
            abort_on_success,
        }
    }

    /// A loop with the backoff of the given policy.
    pub fn for_policy(
        name: &str,
        policy: &CaPolicy,
        interval: Duration,
        abort_on_success: bool,
    ) -> Self {
        Self::new(
            name,
            policy.retry_min_backoff,
            policy.retry_max_backoff,
            interval,
            abort_on_success,
        )
    }

    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut op: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CaEmptyResult>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.min_backoff,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            // An operation cut short leaves the manager mid-transition, the
            // leader resets it after all tasks ended.
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = op() => res,
            };

            let wait = match res {
                Ok(()) => {
                    backoff.reset();
                    if self.abort_on_success {
                        debug!("Task '{}' succeeded, stopping", self.name);
                        break;
                    }
                    self.interval
                }
                Err(e) => {
                    let wait =
                        backoff.next_backoff().unwrap_or(self.max_backoff);
                    if e.is_retryable() {
                        warn!(
                            "Task '{}' failed, retrying in {}ms: {e}",
                            self.name,
                            wait.as_millis()
                        );
                    } else {
                        // Needs an operator, but a fixed configuration
                        // should still get picked up.
                        error!(
                            "Task '{}' failed, retrying in {}ms: {e}",
                            self.name,
                            wait.as_millis()
                        );
                    }
                    wait
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        trace!("Task '{}' ended", self.name);
    }
}


//------------ CA loops ------------------------------------------------------

/// Keeps trying to initialize the CA until it is active.
pub async fn initialize_loop(manager: Arc<CaManager>, cancel: CancellationToken) {
    let policy = &manager.config().policy;
    RetryLoop::for_policy("initialize CA", policy, Duration::ZERO, true)
        .run(cancel, || manager.initialize())
        .await
}

/// Periodically renews the intermediate. Also initializes a CA that is
/// not active, so that a failed setup keeps being retried.
pub async fn renewal_loop(manager: Arc<CaManager>, cancel: CancellationToken) {
    let policy = &manager.config().policy;
    RetryLoop::for_policy(
        "renew intermediate",
        policy,
        policy.intermediate_renew_interval,
        false,
    )
    .run(cancel, || async {
        match manager.state() {
            CaState::Uninitialized | CaState::Error => manager.initialize().await,
            _ => manager.renew_intermediate_if_needed().await.map(|_| ()),
        }
    })
    .await
}

/// Periodically removes roots that can no longer be needed.
pub async fn prune_loop(manager: Arc<CaManager>, cancel: CancellationToken) {
    let policy = &manager.config().policy;
    RetryLoop::for_policy("prune roots", policy, policy.root_prune_interval, false)
        .run(cancel, || async {
            manager.prune_expired_roots().await.map(|_| ())
        })
        .await
}

/// Follows the primary's roots with blocking queries. Secondary only.
pub async fn roots_watch_loop(
    manager: Arc<CaManager>,
    cancel: CancellationToken,
) {
    let index = AtomicU64::new(0);
    let policy = &manager.config().policy;
    RetryLoop::for_policy("watch primary roots", policy, Duration::ZERO, false)
        .run(cancel, || async {
            let min_index = index.load(Ordering::Relaxed);
            manager
                .watch_primary_roots_once(min_index)
                .await
                .map(|new_index| index.store(new_index, Ordering::Relaxed))
        })
        .await
}


//------------ Tests ---------------------------------------------------------
