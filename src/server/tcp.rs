//! TCP echo server
//!
//! Accepts connections, hands each one to its own task, and writes back a
//! JSON description of what the caller sent. Shutdown is graceful: after
//! the signal the server keeps accepting for a configurable delay so load
//! balancers can take the backend out of rotation, then stops accepting
//! and waits for in-flight handlers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::response::build_response;
use crate::common::{EchoError, Result};
use crate::config::ServerConfig;

/// TCP echo server.
pub struct EchoServer {
    config: Arc<ServerConfig>,
}

impl EchoServer {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Bind the configured address and serve until ctrl-c or SIGTERM.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(EchoError::Io)?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve connections from `listener` until `shutdown` completes, then
    /// drain in-flight handlers.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let local_addr = listener.local_addr().map_err(EchoError::Io)?;
        info!("tcp server started on {}", local_addr);

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            // Reap finished handlers so the set does not grow unbounded.
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!("Task error: {}", e);
                }
            }

            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_handler(&mut tasks, stream, peer),
                    Err(e) => error!("Error accepting connection: {}", e),
                },
            }
        }

        // Keep accepting while load balancers drain traffic away.
        info!(
            "tcp server shutdown initiated (delay={:?})",
            self.config.shutdown_delay()
        );
        let drain_deadline = tokio::time::sleep(self.config.shutdown_delay());
        tokio::pin!(drain_deadline);
        loop {
            tokio::select! {
                _ = &mut drain_deadline => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_handler(&mut tasks, stream, peer),
                    Err(e) => error!("Error accepting connection: {}", e),
                },
            }
        }
        drop(listener);

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if timeout(self.config.graceful_timeout(), drain).await.is_err() {
            tasks.abort_all();
            return Err(EchoError::Server(format!(
                "shutdown timed out after {:?}",
                self.config.graceful_timeout()
            )));
        }

        info!("tcp server stopped");
        Ok(())
    }

    fn spawn_handler(&self, tasks: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        debug!("Accepted connection from {}", peer);
        let config = Arc::clone(&self.config);
        tasks.spawn(async move {
            if let Err(e) = handle_connection(stream, &config).await {
                warn!("Connection from {} failed: {}", peer, e);
            }
        });
    }
}

/// Handle one connection: read its payload, decode any PROXY protocol
/// header, and write the echo response back.
async fn handle_connection(mut stream: TcpStream, config: &ServerConfig) -> Result<()> {
    let peer = stream.peer_addr().ok();

    // One bounded read, like the original tool: whatever arrives in the
    // first segment is the request.
    let mut buffer = vec![0u8; config.max_buffer_size];
    let mut errors = Vec::new();
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            errors.push(e.to_string());
            0
        }
    };
    buffer.truncate(n);

    let response = build_response(config, peer, &buffer, errors).await;
    let mut body =
        serde_json::to_vec_pretty(&response).map_err(|e| EchoError::Other(e.to_string()))?;
    body.push(b'\n');

    stream.write_all(&body).await.map_err(EchoError::Io)?;
    stream.shutdown().await.map_err(EchoError::Io)?;

    Ok(())
}

/// Completes on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
            }
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    }
}
