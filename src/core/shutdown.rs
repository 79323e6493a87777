//! Shutdown Coordination
//!
//! Turns SIGINT/SIGTERM into a broadcast that the endpoint accept loop,
//! the command wait and the launcher all observe. A second signal exits
//! immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Exit code used when a second signal forces termination
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Clone)]
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

    /// Resolves once shutdown has been triggered, even if before the call
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutdown_requested() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Route process signals into this coordinator. Must run inside a runtime.
    pub fn install_signal_handlers(&self) {
        let counter = Arc::new(AtomicUsize::new(0));

        #[cfg(unix)]
        {
            // Restore default SIGPIPE so writes to a closed pipe terminate quietly
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            }

            use tokio::signal::unix::{signal, SignalKind};
            for kind in [
                SignalKind::interrupt(),
                SignalKind::terminate(),
                SignalKind::hangup(),
            ] {
                let coordinator = self.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(mut sig) = signal(kind) else {
                        log::warn!("Could not install handler for {:?}", kind);
                        return;
                    };
                    while sig.recv().await.is_some() {
                        coordinator.on_signal(&counter);
                    }
                });
            }
        }

        #[cfg(not(unix))]
        {
            let coordinator = self.clone();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    coordinator.on_signal(&counter);
                }
            });
        }
    }

    fn on_signal(&self, counter: &AtomicUsize) {
        let previous = counter.fetch_add(1, Ordering::AcqRel);
        if previous >= 1 {
            log::warn!("Second interrupt received; exiting");
            std::process::exit(FORCED_EXIT_CODE);
        }
        log::info!("Interrupt received; shutting down plugins");
        self.trigger_shutdown();
    }
}
