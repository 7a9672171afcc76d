use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, warn};

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio::{select, signal, spawn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::serve;
use crate::{Error, ServerConfig};

// Pause after a failed accept, e.g. when the process is out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listener that streams heartbeats to every client it accepts
pub struct HeartbeatServer {
    listener: TcpListener,
    config: ServerConfig,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl HeartbeatServer {
    /// Bind the listener. Nothing is accepted until [`run`](Self::run).
    pub async fn bind(config: ServerConfig) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.addr,
                source,
            })?;

        info!("Heartbeat server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            config,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token stops the accept loop and ends every open stream
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tracker of the per-connection tasks; `len()` counts clients still being served
    pub fn connections(&self) -> TaskTracker {
        self.connections.clone()
    }

    /// Accept clients until shutdown, one task per connection.
    ///
    /// Returns once the open connections have closed their streams, or after
    /// the configured shutdown timeout.
    pub async fn run(self) {
        let Self {
            listener,
            config,
            shutdown,
            connections,
        } = self;

        debug!("Starting accept loop");
        loop {
            let (stream, peer) = select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            debug!("Accepted connection from {peer}");
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle for {peer}: {e}");
            }

            let cancel = shutdown.clone();
            let interval = config.interval;
            let max_request_head = config.max_request_head;
            connections.spawn(async move {
                match serve(stream, interval, max_request_head, cancel).await {
                    Ok(end) => debug!("Connection from {peer} ended: {end:?}"),
                    Err(e) => debug!("Connection from {peer} failed: {e}"),
                }
            });
        }

        drop(listener);
        connections.close();
        info!(
            "Stopped accepting, waiting on {} open connections",
            connections.len()
        );

        if timeout(config.shutdown_timeout, connections.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connections still open after {:?}, leaving them behind",
                connections.len(),
                config.shutdown_timeout
            );
        }
    }

    /// [`run`](Self::run) until Ctrl+C, then shut down
    pub async fn run_with_signal(self) {
        let shutdown = self.shutdown_token();
        let mut run_handle = spawn(self.run());

        select! {
            res = signal::ctrl_c() => match res {
                Ok(()) => {
                    warn!("Ctrl+C received, shutting down heartbeat server...");
                    shutdown.cancel();
                }
                Err(e) => warn!("Unable to listen for Ctrl+C, running until killed: {e}"),
            },
            _ = &mut run_handle => return,
        }

        if let Err(e) = run_handle.await {
            warn!("Heartbeat server task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> ServerConfig {
        ServerConfig::default().with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let server = HeartbeatServer::bind(local()).await.unwrap();

        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn bind_to_taken_address_fails() {
        let first = HeartbeatServer::bind(local()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let err = HeartbeatServer::bind(local().with_addr(taken))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Bind { addr, .. } if addr == taken));
    }

    #[tokio::test]
    async fn run_returns_once_cancelled() {
        let server = HeartbeatServer::bind(local()).await.unwrap();
        let shutdown = server.shutdown_token();
        let handle = spawn(server.run());

        shutdown.cancel();

        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
