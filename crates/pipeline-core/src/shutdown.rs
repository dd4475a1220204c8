//! Graceful shutdown: stop intake, finish in-flight messages, then terminate

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
    intake: CancellationToken,
    terminated: CancellationToken,
    requested: AtomicBool,
    in_flight: AtomicUsize,
}

impl Inner {
    fn terminate_if_idle(&self) {
        if self.requested.load(Ordering::SeqCst) && self.in_flight.load(Ordering::SeqCst) == 0 {
            self.terminated.cancel();
        }
    }
}

/// Shared shutdown state
///
/// A [`ShutdownGuard`] is held while a message is between fetch and its
/// ack/nack decision. A shutdown request stops intake at once and terminates
/// as soon as no guard is held.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            info!("Shutdown requested, waiting for {} in-flight message(s)", in_flight);
        } else {
            info!("Shutdown requested");
        }
        self.inner.intake.cancel();
        self.inner.terminate_if_idle();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Mark a message as in flight until the guard drops
    pub fn guard(&self) -> ShutdownGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        ShutdownGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Cancelled when intake must stop; handed to broker listeners
    pub fn intake_token(&self) -> CancellationToken {
        self.inner.intake.clone()
    }

    /// Resolves once shutdown was requested and nothing is in flight
    pub async fn terminated(&self) {
        self.inner.terminated.cancelled().await;
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }
}

/// Do-not-interrupt marker for one message
#[derive(Debug)]
pub struct ShutdownGuard {
    inner: Arc<Inner>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.terminate_if_idle();
    }
}
