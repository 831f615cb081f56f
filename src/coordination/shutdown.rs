//! Graceful Shutdown Handler
//!
//! Stop requests are latched in a watch channel. Training loops poll their
//! token between episodes and never observe a request mid-episode.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Operator asked a single run to stop
    Requested,
    /// Normal daemon shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown: skip the final checkpoint
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Requested => write!(f, "requested"),
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Latching stop switch shared by a run and whoever may stop it
#[derive(Debug)]
pub struct GracefulShutdown {
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);
        Self { signal_tx }
    }

    /// Request shutdown; the first signal wins
    ///
    /// Returns false if a shutdown was already requested.
    pub fn request_shutdown(&self, signal: ShutdownSignal) -> bool {
        let accepted = self.signal_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
        if accepted {
            info!("Shutdown requested: {}", signal);
        } else {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
        }
        accepted
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_tx.borrow().is_some()
    }

    /// Create a token that observes this switch
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for checking shutdown status in async tasks
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    /// Current state of the switch
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.signal_rx.borrow()
    }

    /// Wait for a shutdown signal
    ///
    /// A dropped switch counts as a graceful shutdown.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                return self.signal().unwrap_or(ShutdownSignal::Graceful);
            }
        }
    }
}

/// Install OS signal handlers that trip the switch
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ];
        for (kind, name, kind_signal) in handlers {
            let mut stream = signal(kind)?;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    info!("Received {}", name);
                    shutdown.request_shutdown(kind_signal);
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
        });
    }

    Ok(())
}
