//! Signal-driven shutdown for the polling binary
//!
//! The first SIGINT/SIGTERM/SIGHUP/SIGQUIT asks the report loop to stop so the
//! registry can close its plugins; a second one exits immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Exit status used when a second signal forces the process down
const FORCED_EXIT_STATUS: i32 = 130;

/// Coordinates graceful shutdown across the application
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_requested: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> (Self, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(8);
        let coordinator = Self {
            shutdown_tx,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        };
        (coordinator, shutdown_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Run `future_fn` with signal handlers installed, handing it a receiver
    /// that fires on the first shutdown signal.
    pub async fn guard<F, Fut, R, E>(future_fn: F) -> Result<R, E>
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = Result<R, E>>,
    {
        let (coordinator, shutdown_rx) = Self::new();
        coordinator.install_signal_handlers();
        future_fn(shutdown_rx).await
    }

    fn install_signal_handlers(&self) {
        let signal_count = Arc::new(AtomicUsize::new(0));

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            // Restore default SIGPIPE so a closed stdout ends the process.
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            }

            for kind in [
                SignalKind::interrupt(),
                SignalKind::terminate(),
                SignalKind::hangup(),
                SignalKind::quit(),
            ] {
                let Ok(mut stream) = signal(kind) else {
                    log::warn!("could not install handler for signal {:?}", kind);
                    continue;
                };
                let tx = self.shutdown_tx.clone();
                let requested = self.shutdown_requested.clone();
                let counter = signal_count.clone();
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        on_signal(&tx, &requested, &counter);
                    }
                });
            }
        }

        #[cfg(not(unix))]
        {
            let tx = self.shutdown_tx.clone();
            let requested = self.shutdown_requested.clone();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    on_signal(&tx, &requested, &signal_count);
                }
            });
        }
    }
}

fn on_signal(tx: &broadcast::Sender<()>, requested: &AtomicBool, counter: &AtomicUsize) {
    let previous = counter.fetch_add(1, Ordering::AcqRel);
    requested.store(true, Ordering::Release);
    let _ = tx.send(());
    if previous >= 1 {
        log::warn!("second shutdown signal received; exiting");
        std::process::exit(FORCED_EXIT_STATUS);
    }
    log::info!("shutdown requested; closing plugins");
}
