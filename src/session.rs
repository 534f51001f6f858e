//! Per-connection client session.
//!
//! One task per accepted client. The session owns its endpoint, reads
//! whole messages off it, and forwards them to its backend once the
//! init handshake has resolved one. A companion writer task drains the
//! session's reply channel back onto the pipe, so replies routed from a
//! backend's stdout never block the read loop.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};

use crate::backend::BackendSupervisor;
use crate::error::BrokerError;
use crate::ipc::Endpoint;
use crate::protocol::{self, ClientMessage, CLOSE_NOTIFICATION};
use crate::registry::Registry;

/// Drive one client connection until it closes or the broker quits.
pub async fn run(
    endpoint: Endpoint,
    client_id: String,
    registry: Arc<Registry>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let (mut reader, mut writer) = endpoint.split();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    registry.sessions().insert(&client_id, reply_tx).await;

    // Each reply buffer is owned by the channel message until this task
    // has finished writing it to the pipe.
    let writer_task = tokio::spawn({
        let client_id = client_id.clone();
        async move {
            while let Some(payload) = reply_rx.recv().await {
                if let Err(err) = writer.write_message(&payload).await {
                    debug!("writing to client '{}': {}", client_id, err);
                    break;
                }
            }
        }
    });

    // The binding, once made, holds for the session's lifetime even
    // across backend restarts.
    let mut backend: Option<Arc<BackendSupervisor>> = None;
    let mut quitting = false;

    loop {
        let message = match reader.next_message().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("client '{}' disconnected", client_id);
                break;
            }
            Err(err) => {
                debug!("reading from client '{}': {}", client_id, err);
                break;
            }
        };

        match protocol::classify(&message) {
            ClientMessage::Quit => {
                info!("client '{}' requested shutdown", client_id);
                let _ = shutdown_tx.send(());
                quitting = true;
                break;
            }
            ClientMessage::Init { profile_id } if backend.is_none() => {
                match registry.by_profile_id(&profile_id) {
                    Some(resolved) => {
                        info!(
                            "client '{}' bound to backend '{}' via profile {}",
                            client_id,
                            resolved.name(),
                            profile_id
                        );
                        resolved.dispatch(&client_id, &message).await;
                        backend = Some(resolved);
                    }
                    // Dropped without a response; the client may retry.
                    None => warn!(
                        "client '{}': {}",
                        client_id,
                        BrokerError::UnknownProfile(profile_id)
                    ),
                }
            }
            _ => match &backend {
                Some(backend) => backend.dispatch(&client_id, &message).await,
                None => debug!("dropping message from unbound client '{}'", client_id),
            },
        }
    }

    // Tell the backend the client is gone, unless the whole broker is
    // on its way out. Best-effort only.
    if !quitting {
        if let Some(backend) = &backend {
            backend.dispatch(&client_id, CLOSE_NOTIFICATION).await;
        }
    }

    registry.sessions().remove(&client_id).await;
    let _ = writer_task.await;
}
