use crate::error::{RemoteError, RemoteResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancel signal for remote waits and sends.
///
/// Waits given no signal have no timeout and may never complete.
#[derive(Debug, Clone)]
pub struct Cancellation {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Completes once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn with_cancellation<F>(cancel: Option<&Cancellation>, fut: F) -> RemoteResult<F::Output>
where
    F: Future,
{
    match cancel {
        None => Ok(fut.await),
        Some(cancel) if cancel.is_cancelled() => Err(RemoteError::Cancelled),
        Some(cancel) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RemoteError::Cancelled),
            out = fut => Ok(out),
        },
    }
}
