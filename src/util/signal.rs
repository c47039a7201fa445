//! Interruption of a run by SIGINT or SIGTERM.
//!
//! Signals never terminate the process directly: they set a [CancelToken]
//! which the pipeline polls, so the unwind (restarting services) always runs.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared flag signalling that the run should stop as soon as possible.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on SIGINT and SIGTERM.
///
/// The handlers are registered before this returns, so signals arriving
/// afterwards are never missed.
pub fn watch_signals(token: CancelToken) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    #[cfg(unix)]
    let (mut interrupt, mut terminate) = {
        use tokio::signal::unix::{signal, SignalKind};

        let _guard = runtime.enter();
        (
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
        )
    };

    thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    #[cfg(unix)]
                    tokio::select! {
                        _ = interrupt.recv() => log::warn!(target: "signal", "Received SIGINT"),
                        _ = terminate.recv() => log::warn!(target: "signal", "Received SIGTERM"),
                    }
                    #[cfg(not(unix))]
                    if tokio::signal::ctrl_c().await.is_ok() {
                        log::warn!(target: "signal", "Received Ctrl+C");
                    }

                    if !token.is_cancelled() {
                        log::warn!(target: "signal", "Interrupting the run, services will be restored first");
                    }
                    token.cancel();
                }
            })
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
