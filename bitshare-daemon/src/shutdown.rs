//! Process-wide stop flag polled by every listener loop between reads, and the interrupt
//! plumbing the binary uses to set it.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; callable from any thread.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
pub async fn interrupt() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

/// Run `on_first` at the first interrupt yielded by `wait`, then resolve at the second.
pub async fn on_interrupts<W, Fut>(mut wait: W, on_first: impl FnOnce()) -> io::Result<()>
where
    W: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    wait().await?;
    on_first();
    wait().await
}
