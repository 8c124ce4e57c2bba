//! Background reclamation of idle connections.
//!
//! The task sleeps until woken by a re-armable deadline rather than sweeping
//! on a fixed period: `put` arms it when the pool becomes fully idle and `get`
//! disarms it, so it only fires after a full `idle_timeout` of quiescence.

use crate::Shared;
use std::future::pending;
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn run<C: Send + 'static>(shared: Arc<Shared<C>>, shutdown: CancellationToken) {
    loop {
        let deadline = shared.state.lock().reclaim_at;

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Idle reclamation stopped");
                return;
            }
            _ = shared.rearm.notified() => continue,
            _ = wait_until(deadline) => {
                if let Some(deadline) = deadline {
                    reclaim_expired(&shared, deadline);
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Close every idle connection if the deadline that woke us is still current.
fn reclaim_expired<C>(shared: &Shared<C>, deadline: Instant) {
    let drained: Vec<C> = {
        let mut state = shared.state.lock();
        if state.reclaim_at != Some(deadline) || state.leased > 0 || state.closed {
            return;
        }
        state.reclaim_at = None;
        state.idle.drain(..).collect()
    };

    if !drained.is_empty() {
        debug!(reclaimed = drained.len(), "Closed idle connections");
    }
}
