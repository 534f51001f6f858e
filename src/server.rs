//! The per-user pipe server.
//!
//! Owns the listening endpoint and the accept loop. Every accepted
//! connection becomes a [`crate::session`] task carrying a fresh client
//! id; the ids are what backends key their replies on, so they are
//! pairwise distinct for the life of the process. A `quit` control
//! message from any client stops the loop, signals every backend
//! supervisor to terminate, and lets the process exit cleanly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info};
use tokio::sync::broadcast;

use crate::ipc::{EndpointPath, Listener};
use crate::registry::Registry;
use crate::session;

pub struct PipeServer {
    registry: Arc<Registry>,
    shutdown_tx: broadcast::Sender<()>,
    next_client_id: AtomicU64,
}

impl PipeServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry,
            shutdown_tx,
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Serve until a client sends `quit`. Returns only after every
    /// supervisor has been signalled to terminate; the terminations
    /// themselves are fire-and-forget.
    pub async fn run(self, path: &EndpointPath) -> Result<()> {
        let mut listener = Listener::bind(path)?;
        info!("listening on {path}");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(endpoint) => {
                            let client_id =
                                format!("c{}", self.next_client_id.fetch_add(1, Ordering::Relaxed));
                            debug!("accepted client '{client_id}'");
                            tokio::spawn(session::run(
                                endpoint,
                                client_id,
                                Arc::clone(&self.registry),
                                self.shutdown_tx.clone(),
                            ));
                        }
                        Err(err) => error!("accept failed: {err}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        self.registry.terminate_all().await;
        Ok(())
    }
}
