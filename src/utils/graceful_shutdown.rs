use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::{signal, sync::broadcast, time::timeout};

/// Why the gateway is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code (tests, embedding)
    Requested,
}

/// How the serve loop ended after a shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All in-flight requests finished
    Completed,
    /// The drain deadline passed with requests still running
    TimedOut,
}

/// Coordinates signal handling and the drain of in-flight requests.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Start shutdown. Returns false if it was already under way.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!("Shutdown initiated: {:?}", reason);
            // No receivers is fine: nobody is waiting yet.
            let _ = self.shutdown_tx.send(reason);
            true
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
            false
        }
    }

    /// Wait for SIGINT or SIGTERM and trigger shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Listening for SIGINT and SIGTERM");

        #[cfg(unix)]
        let reason = {
            use tokio::signal::unix::{SignalKind, signal as unix_signal};
            let mut sigterm = unix_signal(SignalKind::terminate())
                .wrap_err("Failed to register SIGTERM handler")?;
            tokio::select! {
                res = signal::ctrl_c() => {
                    res.wrap_err("Failed to listen for Ctrl+C")?;
                    ShutdownReason::Interrupt
                }
                _ = sigterm.recv() => ShutdownReason::Terminate,
            }
        };

        #[cfg(not(unix))]
        let reason = {
            signal::ctrl_c()
                .await
                .wrap_err("Failed to listen for Ctrl+C")?;
            ShutdownReason::Interrupt
        };

        self.trigger_shutdown(reason);
        Ok(())
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.shutdown_tx.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }

    /// Drive `server` to completion. Once shutdown starts, the server gets
    /// `drain_timeout` to finish its in-flight requests before it is dropped.
    pub async fn drain<F>(&self, server: F) -> Result<DrainOutcome>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        tokio::pin!(server);
        let mut token = self.shutdown_token();

        tokio::select! {
            res = &mut server => {
                res.wrap_err("Server terminated with an error")?;
                return Ok(DrainOutcome::Completed);
            }
            reason = token.wait_for_shutdown() => {
                tracing::info!(
                    "Draining in-flight requests ({:?}, up to {:?})",
                    reason,
                    self.drain_timeout
                );
            }
        }

        match timeout(self.drain_timeout, &mut server).await {
            Ok(res) => {
                res.wrap_err("Server terminated with an error")?;
                tracing::info!("All in-flight requests completed");
                Ok(DrainOutcome::Completed)
            }
            Err(_) => {
                tracing::warn!(
                    "Drain deadline of {:?} exceeded, dropping remaining connections",
                    self.drain_timeout
                );
                Ok(DrainOutcome::TimedOut)
            }
        }
    }
}

/// Clonable handle that resolves when shutdown starts.
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        match self.receiver.try_recv() {
            Ok(reason) => return reason,
            Err(_) if self.is_shutdown_initiated() => return ShutdownReason::Requested,
            Err(_) => {}
        }
        self.receiver
            .recv()
            .await
            .unwrap_or(ShutdownReason::Requested)
    }
}
