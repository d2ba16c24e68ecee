//! Runs blocking backend calls off the async workers.

use crate::error::{VoiceError, VoiceResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Run `f` on the blocking pool, bounded by `timeout` and abandoned on `cancel`.
///
/// A timed-out or cancelled call keeps its blocking thread until the backend
/// returns; the result is discarded.
pub async fn call_blocking<T, F>(
    what: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    f: F,
) -> VoiceResult<T>
where
    F: FnOnce() -> VoiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    race(what, timeout, cancel, async move { Ok(tokio::task::spawn_blocking(f).await) }).await
}

async fn race<T, Fut>(
    what: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: Fut,
) -> VoiceResult<T>
where
    Fut: Future<Output = VoiceResult<Result<VoiceResult<T>, JoinError>>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(VoiceError::Worker(format!("{} cancelled by shutdown", what))),
        joined = tokio::time::timeout(timeout, call) => match joined {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => Err(VoiceError::Worker(format!("{} worker failed: {}", what, e))),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("⏱️ {} call exceeded {:?}", what, timeout);
                Err(VoiceError::Timeout { what, after: timeout })
            }
        },
    }
}

/// At most one call to a backend at a time, abandoned calls included.
///
/// The permit travels into the blocking closure, so a call that timed out
/// keeps the lane busy until the backend actually returns. Waiting for the
/// lane counts against the next call's timeout.
#[derive(Clone)]
pub struct SingleFlight {
    what: &'static str,
    permits: Arc<Semaphore>,
}

impl SingleFlight {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Whether a call, possibly an abandoned one, still holds the backend.
    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }

    pub async fn call<T, F>(&self, timeout: Duration, cancel: &CancellationToken, f: F) -> VoiceResult<T>
    where
        F: FnOnce() -> VoiceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let what = self.what;
        let permits = Arc::clone(&self.permits);
        race(what, timeout, cancel, async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(VoiceError::Worker(format!("{} lane closed", what))),
            };
            Ok(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                f()
            })
            .await)
        })
        .await
    }
}
