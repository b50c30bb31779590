//! Replication Server
//!
//! TCP listener through which followers receive replicated writes.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message};
use crate::replication::ReplicaApplier;
use crate::error::{Error, Result};

/// Network server for inbound replication
pub struct ReplicationServer {
    /// Applies inbound writes
    applier: Arc<ReplicaApplier>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl ReplicationServer {
    /// Create a new replication server
    pub fn new(applier: Arc<ReplicaApplier>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            applier,
            shutdown,
        }
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Replication listener on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let applier = Arc::clone(&self.applier);

                            tokio::spawn(async move {
                                let served = handle_connection(socket, &peer_addr, applier).await;
                                if let Err(e) = served {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Replication listener stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve request/response pairs until the peer hangs up
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    applier: Arc<ReplicaApplier>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = applier.apply(message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
