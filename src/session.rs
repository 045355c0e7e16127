//! Session Keeper (C4): a periodic background task that refreshes the
//! Proxmox auth ticket.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::proxmox::SharedGateway;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running session keeper task, returned by [`spawn`].
pub struct SessionKeeper {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SessionKeeper {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.handle.await;
    }
}

/// Starts the session-ticket refresher. Every hour it reloads credentials
/// from disk and requests a fresh Proxmox ticket with a 5-second timeout.
/// All errors are logged and swallowed; a failed refresh never tears down
/// the provider.
pub fn spawn(gateway: SharedGateway, credentials_file_path: String) -> SessionKeeper {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                    refresh_once(&gateway, &credentials_file_path).await;
                }
            }
        }
    });

    SessionKeeper {
        shutdown: shutdown_tx,
        handle,
    }
}

async fn refresh_once(gateway: &SharedGateway, credentials_file_path: &str) {
    let credentials = match crate::proxmox::load_credentials(credentials_file_path) {
        Ok(credentials) => credentials,
        Err(e) => {
            error!(error = %e, "failed to refresh proxmox session, could not read credentials");
            return;
        }
    };

    let refresh = tokio::time::timeout(REFRESH_TIMEOUT, gateway.refresh_ticket(&credentials)).await;
    match refresh {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "failed to refresh proxmox session"),
        Err(_) => error!("timed out refreshing proxmox session"),
    }
}
