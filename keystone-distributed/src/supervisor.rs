//! Panic-isolating task spawner.
//!
//! Background loops and reentered callbacks run through [`spawn_supervised`]:
//! the work runs on its own tokio task, and a supervisor task awaits it and
//! turns a panic into an `error!` log line instead of letting it escape.

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Spawn `future` under supervision.
///
/// The returned handle belongs to the supervisor and always completes with
/// `Ok(())` once the supervised work has finished, panicked or been cancelled.
pub fn spawn_supervised<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let work = tokio::spawn(future);

    tokio::spawn(async move {
        match work.await {
            Ok(()) => debug!(task = name, "Supervised task finished"),
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(task = name, panic = %message, "Supervised task panicked");
            }
            Err(_) => warn!(task = name, "Supervised task was cancelled"),
        }
    })
}
