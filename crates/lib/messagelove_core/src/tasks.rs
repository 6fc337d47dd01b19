//! Periodic background sweeps.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::AuthError;

/// Spawn a job that runs every `period` until `cancel` fires.
///
/// The job returns how many entries it removed. Failures are logged and the
/// loop keeps going.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<usize, AuthError>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = name, "sweep task stopped");
                    break;
                }
                _ = interval.tick() => {
                    match job().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(task = name, removed, "sweep removed entries"),
                        Err(e) => warn!(task = name, error = %e, "sweep failed"),
                    }
                }
            }
        }
    })
}
