//! Graceful shutdown for background tickers
//!
//! Heartbeat monitoring and queue compaction run as spawned tasks. Each one
//! holds a receiver from this coordinator and leaves its loop on signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Fans a shutdown signal out to background tasks and waits for them
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// `timeout` bounds how long `shutdown` waits for tracked tasks
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Track a background task so `shutdown` can wait for it
    pub async fn track(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name.into(), handle));
    }

    /// Signal every subscriber, then wait up to the timeout for tracked tasks
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }

        info!("Initiating graceful shutdown");
        // No receivers is fine: nothing was started
        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for (name, handle) in tasks {
            match tokio::time::timeout(self.timeout, handle).await {
                Ok(Ok(())) => info!(task = %name, "background task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "background task panicked"),
                Err(_) => warn!(task = %name, "background task did not stop in time"),
            }
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    /// Signal and abort tracked tasks without waiting
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");
        *self.state.write().await = ShutdownState::Shutdown;
        let _ = self.shutdown_tx.send(ShutdownSignal::Immediate);

        for (_, handle) in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }
}
